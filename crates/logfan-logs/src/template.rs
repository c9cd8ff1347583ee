//! `--template` line templates with `{{.Field}}` placeholders.

use chrono::SecondsFormat;

use logfan_types::LogLine;

use crate::error::{LogsError, LogsResult};

/// Fields available to a line template
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Namespace,
    PodName,
    ContainerName,
    Message,
    Timestamp,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "Namespace" => Some(Self::Namespace),
            "PodName" => Some(Self::PodName),
            "ContainerName" => Some(Self::ContainerName),
            "Message" => Some(Self::Message),
            "Timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A compiled line template
#[derive(Clone, Debug)]
pub struct LineTemplate {
    segments: Vec<Segment>,
}

impl LineTemplate {
    /// Compile a template such as `{{.PodName}}: {{.Message}}`
    ///
    /// Placeholders may carry whitespace inside the braces. Unknown fields,
    /// anything other than a field reference, and an unterminated `{{` are
    /// rejected.
    pub fn compile(text: &str) -> LogsResult<Self> {
        let mut segments = Vec::new();
        let mut rest = text;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open.find("}}").ok_or_else(|| {
                LogsError::InvalidTemplate(format!("unterminated \"{{{{\" in {:?}", text))
            })?;

            let action = after_open[..close].trim();
            let name = action.strip_prefix('.').ok_or_else(|| {
                LogsError::InvalidTemplate(format!("unsupported action \"{{{{{}}}}}\"", action))
            })?;
            let field = Field::parse(name).ok_or_else(|| {
                LogsError::InvalidTemplate(format!(
                    "unknown field \".{}\" (available: .Namespace, .PodName, .ContainerName, .Message, .Timestamp)",
                    name
                ))
            })?;
            segments.push(Segment::Field(field));
            rest = &after_open[close + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render one line
    pub fn render(&self, line: &LogLine) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(Field::Namespace) => out.push_str(&line.source.namespace),
                Segment::Field(Field::PodName) => out.push_str(&line.source.name),
                Segment::Field(Field::ContainerName) => {
                    out.push_str(line.container.as_deref().unwrap_or_default())
                }
                Segment::Field(Field::Message) => out.push_str(&line.message),
                Segment::Field(Field::Timestamp) => {
                    out.push_str(&line.rendered_at.to_rfc3339_opts(SecondsFormat::Secs, true))
                }
            }
        }
        out
    }
}
