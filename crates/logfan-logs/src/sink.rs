//! Serialized output for lines coming from many concurrent readers.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crossterm::style::{Color, Stylize};
use parking_lot::Mutex;
use serde::Serialize;

use logfan_types::{LogLine, OutputMode, SourceRef, StreamOptions};

use crate::error::{LogsError, LogsResult};
use crate::template::LineTemplate;

/// Source prefix colors, assigned round-robin on first sight
const PALETTE: [Color; 8] = [
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
    Color::Red,
    Color::DarkCyan,
    Color::DarkYellow,
];

/// JSON output record; field order is part of the format
#[derive(Serialize)]
struct JsonLine<'a> {
    source: &'a str,
    message: &'a str,
}

struct SinkState {
    out: Box<dyn Write + Send>,
    save: Option<File>,
    colors: HashMap<SourceRef, Color>,
}

/// Writes rendered lines to the terminal and, optionally, a save file
///
/// All state sits behind one lock, so lines from concurrent readers never
/// interleave and the save file sees lines in the same order as the output.
pub struct OutputSink {
    mode: OutputMode,
    template: Option<LineTemplate>,
    colors_enabled: bool,
    state: Mutex<SinkState>,
}

impl OutputSink {
    /// Sink writing to stdout
    pub fn stdout(options: &StreamOptions, colors: bool) -> LogsResult<Self> {
        Self::with_writer(Box::new(io::stdout()), options, colors)
    }

    /// Sink writing to an arbitrary writer
    ///
    /// Compiles the template and opens the save file (append/create).
    pub fn with_writer(
        out: Box<dyn Write + Send>,
        options: &StreamOptions,
        colors: bool,
    ) -> LogsResult<Self> {
        let template = match options.template.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(text) => Some(LineTemplate::compile(text)?),
            None => None,
        };
        let save = match &options.save {
            Some(path) => Some(open_save_file(path)?),
            None => None,
        };

        Ok(Self {
            mode: options.output,
            template,
            colors_enabled: colors,
            state: Mutex::new(SinkState {
                out,
                save,
                colors: HashMap::new(),
            }),
        })
    }

    /// Write one line; failures are logged and dropped
    pub fn write(&self, line: &LogLine) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (primary, saved) = self.render(&mut state.colors, line);

        if let Err(e) = writeln!(state.out, "{}", primary) {
            tracing::debug!(source = %line.source, error = %e, "failed to write log line");
        }
        if let Some(save) = state.save.as_mut() {
            if let Err(e) = writeln!(save, "{}", saved) {
                tracing::debug!(source = %line.source, error = %e, "failed to write save file");
            }
        }
    }

    /// Flush buffered output
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if let Err(e) = state.out.flush() {
            tracing::debug!(error = %e, "failed to flush output");
        }
    }

    /// Render the primary line and the plain save-file line
    fn render(&self, colors: &mut HashMap<SourceRef, Color>, line: &LogLine) -> (String, String) {
        if let Some(template) = &self.template {
            let rendered = template.render(line);
            return (rendered.clone(), rendered);
        }

        match self.mode {
            OutputMode::Raw => (line.message.clone(), line.message.clone()),
            OutputMode::Json => {
                let source = line.source.to_string();
                let record = JsonLine {
                    source: &source,
                    message: &line.message,
                };
                let json = serde_json::to_string(&record).unwrap_or_else(|_| line.message.clone());
                (json.clone(), json)
            }
            OutputMode::Default => {
                let source = line.source.to_string();
                let plain = format!("{} | {}", source, line.message);
                if !self.colors_enabled {
                    return (plain.clone(), plain);
                }

                let next = colors.len() % PALETTE.len();
                let color = *colors
                    .entry(line.source.clone())
                    .or_insert(PALETTE[next]);
                (format!("{} | {}", source.with(color), line.message), plain)
            }
        }
    }
}

fn open_save_file(path: &Path) -> LogsResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LogsError::SaveFile {
            path: path.to_path_buf(),
            source,
        })
}
