//! Log streaming engine for logfan
//!
//! This crate resolves a target into pods, fans out one reader per pod,
//! filters lines and writes them through a shared sink. It also provides the
//! Loki batch path for historical queries.

mod error;
mod filter;
mod loki;
mod reader;
mod resolver;
mod since;
mod sink;
mod supervisor;
mod template;

pub use error::{LogsError, LogsResult};
pub use filter::LineFilter;
pub use loki::{
    LOKI_ENDPOINT_ENV, LokiClient, LokiEntry, Series, merge_series, resolve_endpoint, run_batch,
    source_label,
};
pub use reader::SourceReader;
pub use resolver::{SourceResolver, Target, exclude_sources, is_name_pattern, normalize};
pub use since::resolve_since;
pub use sink::OutputSink;
pub use supervisor::{ActiveSet, Admission, Backends, RunSummary, StreamSupervisor};
pub use template::LineTemplate;

// Re-export types used in our public API
pub use logfan_types::{LogLine, OutputMode, SourceRef, StreamOptions};
