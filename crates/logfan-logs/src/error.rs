//! Error types for the streaming engine.

use std::path::PathBuf;

use thiserror::Error;

use logfan_k8s::K8sError;

/// Errors that fail a whole invocation.
///
/// Per-source streaming failures are not represented here as fatal; the
/// supervisor logs them and keeps the other sources running.
#[derive(Debug, Error)]
pub enum LogsError {
    #[error("invalid {flag} regex '{pattern}': {source}")]
    InvalidRegex {
        flag: &'static str,
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid --template: {0}")]
    InvalidTemplate(String),

    #[error("invalid --since '{0}': expected a duration like 5m or a time of day like 14:30")]
    InvalidSince(String),

    #[error("{0}")]
    UnsupportedTarget(String),

    #[error("no pods found on node \"{0}\"")]
    NoPodsOnNode(String),

    #[error("no pods match target \"{0}\"")]
    NoPodsMatch(String),

    #[error(transparent)]
    Cluster(#[from] K8sError),

    #[error("failed to open save file {path}: {source}")]
    SaveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Loki endpoint not configured. Set integrations.loki_endpoint in the config file or LOKI_ENDPOINT")]
    LokiNotConfigured,

    #[error("invalid Loki endpoint '{0}'")]
    LokiEndpoint(String),

    #[error("Loki request failed: {0}")]
    LokiRequest(#[from] reqwest::Error),

    #[error("Loki returned HTTP {status}: {body}")]
    LokiHttp { status: u16, body: String },

    #[error("Loki returned status \"{0}\"")]
    LokiStatus(String),
}

/// Convenience alias for engine results.
pub type LogsResult<T> = Result<T, LogsError>;
