//! Kubernetes collaborators for logfan
//!
//! This crate provides pod listing, workload selector lookup and per-pod log
//! connections, behind traits the streaming engine consumes. Backends are
//! kube-rs (listing, lookup and log streaming) and the `kubectl` binary (log
//! streaming only), plus in-memory mocks for tests.

mod client;
mod error;
pub mod mock;
mod source;
mod stream;

pub use client::{KubeClient, selector_string};
pub use error::{K8sError, K8sResult};
pub use source::{
    LineStream, LogConnection, LogStreamer, PodLister, PodQuery, WorkloadKind, WorkloadResolver,
};
pub use stream::{KubeLogStreamer, KubectlLogStreamer, line_stream};

// Re-export types that are used in our public API
pub use logfan_types::{LogRequest, SourceRef};
