//! Configuration file support.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

/// Environment variable overriding the kubectl binary
pub const KUBECTL_PATH_ENV: &str = "LOGFAN_KUBECTL_PATH";

/// Upper bound accepted for `logs.max_pods`
pub const MAX_PODS_LIMIT: usize = 500;

/// How log connections are opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kubernetes API log streams
    #[default]
    Api,
    /// One `kubectl logs` process per pod
    Kubectl,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kube: KubeConfig,
    pub logs: LogsConfig,
    pub integrations: IntegrationsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// Kubeconfig context; the current context when unset
    pub context: Option<String>,
    pub backend: Backend,
    pub kubectl_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Maximum concurrent pod streams; 0 is unlimited
    pub max_pods: usize,
    /// Pick up new pods while following
    pub follow_new_pods: bool,
    pub refresh_interval_secs: u64,
    pub colors: bool,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            max_pods: 20,
            follow_new_pods: true,
            refresh_interval_secs: 2,
            colors: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    /// Base URL of the Loki HTTP API
    pub loki_endpoint: Option<String>,
}

impl Config {
    /// Load configuration
    ///
    /// An explicit path must exist. Without one, the default location is
    /// tried and a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (Self::default_path(), false),
        };

        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse and validate TOML
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/logfan/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("logfan").join("config.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.logs.max_pods > MAX_PODS_LIMIT {
            anyhow::bail!(
                "logs.max_pods must be between 0 and {} (got {})",
                MAX_PODS_LIMIT,
                self.logs.max_pods
            );
        }
        if self.logs.refresh_interval_secs == 0 {
            anyhow::bail!("logs.refresh_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// kubectl binary: environment override, then config, then `kubectl`
    pub fn kubectl_path(&self) -> String {
        resolve_kubectl_path(
            std::env::var(KUBECTL_PATH_ENV).ok(),
            self.kube.kubectl_path.as_deref(),
        )
    }
}

fn resolve_kubectl_path(env: Option<String>, configured: Option<&str>) -> String {
    env.filter(|p| !p.trim().is_empty())
        .or_else(|| {
            configured
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "kubectl".to_string())
}
