//! Collaborator abstractions used by the streaming engine.
//!
//! The engine never talks to the cluster directly; it goes through these
//! traits so the kube-rs, kubectl and in-memory mock backends are
//! interchangeable.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use logfan_types::{LogRequest, SourceRef};

use crate::error::{K8sError, K8sResult};

/// Scope and selectors for one pod listing call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodQuery {
    /// Namespace scope; `None` lists across all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl PodQuery {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace,
            ..Default::default()
        }
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Add a field selector term, joining with any existing terms
    pub fn field(mut self, term: impl Into<String>) -> Self {
        let term = term.into();
        self.field_selector = Some(match self.field_selector.take() {
            Some(existing) => format!("{},{}", existing, term),
            None => term,
        });
        self
    }
}

/// Lists pods as (namespace, name) pairs.
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, query: &PodQuery) -> K8sResult<Vec<SourceRef>>;
}

/// Workload kinds whose selector can be resolved to a pod set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = K8sError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(Self::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(Self::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(Self::DaemonSet),
            other => Err(K8sError::UnsupportedKind(other.to_string())),
        }
    }
}

/// Resolves a workload reference to its label selector.
#[async_trait]
pub trait WorkloadResolver: Send + Sync {
    /// Returns the selector in `key=value[,key=value]` form
    async fn selector_for(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
    ) -> K8sResult<String>;
}

/// One stream of log lines
pub type LineStream = BoxStream<'static, std::io::Result<String>>;

/// An open log connection for a single source
///
/// `primary` carries the container output, `diagnostic` carries anything the
/// transport reports on the side (kubectl's stderr). `completion` resolves
/// once the upstream has finished and reports whether it ended cleanly. It
/// must be polled alongside both streams: for some backends it is what tears
/// the connection down when the cancellation token fires.
pub struct LogConnection {
    pub primary: LineStream,
    pub diagnostic: LineStream,
    pub completion: BoxFuture<'static, K8sResult<()>>,
}

/// Opens per-source log connections.
#[async_trait]
pub trait LogStreamer: Send + Sync {
    /// Open a connection for `source`
    ///
    /// The connection is bound to `cancel` for its whole lifetime; firing
    /// the token closes both streams promptly.
    async fn open(
        &self,
        source: &SourceRef,
        request: &LogRequest,
        cancel: CancellationToken,
    ) -> K8sResult<LogConnection>;
}
