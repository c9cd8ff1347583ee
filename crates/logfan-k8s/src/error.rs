//! Error types for the Kubernetes collaborators.

use thiserror::Error;

/// Errors raised while talking to the cluster or a log connection.
#[derive(Debug, Error)]
pub enum K8sError {
    #[error("failed to read kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to infer cluster config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported workload kind '{0}' (expected deployment, statefulset or daemonset)")]
    UnsupportedKind(String),

    #[error("{kind} '{name}' has no matchLabels selector")]
    NoSelector { kind: String, name: String },

    #[error("kubectl {0}")]
    Kubectl(String),

    #[error("log connection task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Mock(String),
}

/// Convenience alias for collaborator results.
pub type K8sResult<T> = Result<T, K8sError>;
