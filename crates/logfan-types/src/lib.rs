//! Shared types for logfan
//!
//! This crate contains data structures used across multiple logfan crates.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Source Types
// ============================================================================

/// Identity of one log-emitting pod
///
/// Ordering is by namespace, then name, which is the order sources are
/// reported in after resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub namespace: String,
    pub name: String,
}

impl SourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Tracking key in `namespace/name` form
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Container state used to narrow which pods are streamed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Waiting,
    Terminated,
}

impl ContainerState {
    /// Server-side field selector for this state, if the API can filter on it
    pub fn phase_selector(&self) -> Option<&'static str> {
        match self {
            Self::Running => Some("status.phase=Running"),
            Self::Waiting => Some("status.phase=Pending"),
            // No phase maps to a terminated container; we ask for the
            // previous instance's logs instead.
            Self::Terminated => None,
        }
    }

    /// Whether logs should come from the previous container instance
    pub fn wants_previous(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Terminated => "terminated",
        }
    }
}

impl FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!(
                "invalid container state '{}' (expected running, waiting or terminated)",
                other
            )),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Output format for emitted lines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Colour-prefixed `source | message`
    #[default]
    Default,
    /// Message only
    Raw,
    /// One `{"source":..,"message":..}` object per line
    Json,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Raw => "raw",
            Self::Json => "json",
        }
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "default" => Ok(Self::Default),
            "raw" => Ok(Self::Raw),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid output mode '{}' (expected default, raw or json)",
                other
            )),
        }
    }
}

/// Default interval between re-resolves in follow mode
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Immutable configuration snapshot for one streaming invocation
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Target expression (pod name, regex, selector, or kind/name)
    pub target: String,
    /// Stream every pod scheduled on this node
    pub node: Option<String>,
    /// Namespace scope; `None` means all namespaces
    pub namespace: Option<String>,
    /// Namespace of the active context; workload lookups fall back to it
    /// when streaming across all namespaces
    pub context_namespace: Option<String>,
    pub follow: bool,
    pub tail: Option<i64>,
    /// Relative since-window, already resolved against "now"
    pub since: Option<Duration>,
    pub timestamps: bool,
    pub container: Option<String>,
    pub container_state: Option<ContainerState>,
    /// Only emit lines matching this pattern
    pub grep: Option<String>,
    /// Suppress lines matching this pattern
    pub grep_v: Option<String>,
    /// Drop pods whose name matches this pattern
    pub exclude_pods: Option<String>,
    pub output: OutputMode,
    pub template: Option<String>,
    pub save: Option<PathBuf>,
    /// Admission cap; 0 is unlimited
    pub max_sources: usize,
    pub refresh_interval: Duration,
    /// Re-resolve the target while following
    pub follow_new_sources: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            target: String::new(),
            node: None,
            namespace: Some("default".to_string()),
            context_namespace: None,
            follow: false,
            tail: None,
            since: None,
            timestamps: false,
            container: None,
            container_state: None,
            grep: None,
            grep_v: None,
            exclude_pods: None,
            output: OutputMode::Default,
            template: None,
            save: None,
            max_sources: 0,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            follow_new_sources: true,
        }
    }
}

impl StreamOptions {
    /// Whether any of the options only make sense for a multi-pod fan-out
    ///
    /// A bare pod name is only accepted as a target when this is false.
    pub fn requests_multi_source(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        set(&self.node)
            || set(&self.grep)
            || set(&self.grep_v)
            || set(&self.exclude_pods)
            || set(&self.template)
            || self.save.is_some()
            || self.output != OutputMode::Default
    }
}

/// Per-connection parameters for one source's log stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogRequest {
    pub container: Option<String>,
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub timestamps: bool,
    /// Read the previous (terminated) container instance
    pub previous: bool,
}

impl LogRequest {
    pub fn from_options(options: &StreamOptions) -> Self {
        Self {
            container: options.container.clone(),
            follow: options.follow,
            tail_lines: options.tail,
            since_seconds: options
                .since
                .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX).max(1)),
            timestamps: options.timestamps,
            previous: options
                .container_state
                .is_some_and(|state| state.wants_previous()),
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// A single emitted log line
#[derive(Clone, Debug)]
pub struct LogLine {
    /// Source pod
    pub source: SourceRef,

    /// Container name, when one was requested
    pub container: Option<String>,

    /// Raw message text
    pub message: String,

    /// When the line was handed to the output
    pub rendered_at: DateTime<Local>,
}

impl LogLine {
    pub fn new(source: SourceRef, container: Option<String>, message: String) -> Self {
        Self {
            source,
            container,
            message,
            rendered_at: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ref_ordering() {
        let mut sources = vec![
            SourceRef::new("ops", "p2"),
            SourceRef::new("default", "z"),
            SourceRef::new("ops", "p1"),
        ];
        sources.sort();
        let keys: Vec<_> = sources.iter().map(SourceRef::key).collect();
        assert_eq!(keys, vec!["default/z", "ops/p1", "ops/p2"]);
    }

    #[test]
    fn test_source_ref_display_without_namespace() {
        assert_eq!(SourceRef::new("", "unknown").to_string(), "unknown");
    }

    #[test]
    fn test_container_state_parse() {
        assert_eq!("Running".parse::<ContainerState>(), Ok(ContainerState::Running));
        assert_eq!(
            ContainerState::Waiting.phase_selector(),
            Some("status.phase=Pending")
        );
        assert!(ContainerState::Terminated.phase_selector().is_none());
        assert!(ContainerState::Terminated.wants_previous());
        assert!("exited".parse::<ContainerState>().is_err());
    }

    #[test]
    fn test_output_mode_parse() {
        assert_eq!("".parse::<OutputMode>(), Ok(OutputMode::Default));
        assert_eq!("JSON".parse::<OutputMode>(), Ok(OutputMode::Json));
        assert!("yaml".parse::<OutputMode>().is_err());
    }

    #[test]
    fn test_multi_source_request() {
        let mut options = StreamOptions::default();
        assert!(!options.requests_multi_source());

        options.grep = Some("   ".to_string());
        assert!(!options.requests_multi_source());

        options.grep = Some("error".to_string());
        assert!(options.requests_multi_source());

        let options = StreamOptions {
            output: OutputMode::Raw,
            ..Default::default()
        };
        assert!(options.requests_multi_source());
    }

    #[test]
    fn test_log_request_from_options() {
        let options = StreamOptions {
            follow: true,
            tail: Some(50),
            since: Some(Duration::from_secs(90)),
            container: Some("app".to_string()),
            container_state: Some(ContainerState::Terminated),
            ..Default::default()
        };
        let request = LogRequest::from_options(&options);
        assert!(request.follow);
        assert!(request.previous);
        assert_eq!(request.tail_lines, Some(50));
        assert_eq!(request.since_seconds, Some(90));
        assert_eq!(request.container.as_deref(), Some("app"));
    }
}
