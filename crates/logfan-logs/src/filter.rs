use regex::Regex;

use crate::error::{LogsError, LogsResult};

/// Compiled line filter shared by every reader
///
/// A line is accepted when it matches the include pattern (if any) and does
/// not match the exclude pattern (if any).
#[derive(Clone, Default)]
pub struct LineFilter {
    /// Lines must match this
    include: Option<Regex>,

    /// Lines must not match this
    exclude: Option<Regex>,
}

impl LineFilter {
    /// Compile `--grep` / `--grep-v` patterns; blank patterns mean no constraint
    pub fn compile(grep: Option<&str>, grep_v: Option<&str>) -> LogsResult<Self> {
        Ok(Self {
            include: compile_optional("--grep", grep)?,
            exclude: compile_optional("--grep-v", grep_v)?,
        })
    }

    /// Check if a line passes the filter
    pub fn accepts(&self, line: &str) -> bool {
        let included = match &self.include {
            Some(re) => re.is_match(line),
            None => true,
        };
        let excluded = match &self.exclude {
            Some(re) => re.is_match(line),
            None => false,
        };
        included && !excluded
    }

    /// Check if the filter accepts everything
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }
}

/// Compile a pattern when one was given, naming the flag in the error
pub(crate) fn compile_optional(flag: &'static str, pattern: Option<&str>) -> LogsResult<Option<Regex>> {
    match pattern.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|source| LogsError::InvalidRegex {
                flag,
                pattern: p.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

impl std::fmt::Debug for LineFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineFilter")
            .field("include", &self.include.as_ref().map(Regex::as_str))
            .field("exclude", &self.exclude.as_ref().map(Regex::as_str))
            .finish()
    }
}
