//! kube-rs backed pod listing and workload lookup

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};

use logfan_types::SourceRef;

use crate::error::{K8sError, K8sResult};
use crate::source::{PodLister, PodQuery, WorkloadKind, WorkloadResolver};

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    /// Connect using a named kubeconfig context, or the inferred
    /// configuration (current context or in-cluster) when none is given
    pub async fn connect(context: Option<&str>) -> K8sResult<Self> {
        let config = match context {
            Some(name) => {
                let kubeconfig = Kubeconfig::read()?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &KubeConfigOptions {
                        context: Some(name.to_string()),
                        ..Default::default()
                    },
                )
                .await?
            }
            None => kube::Config::infer().await?,
        };

        let client = kube::Client::try_from(config)?;
        tracing::debug!(
            namespace = client.default_namespace(),
            "connected to cluster"
        );
        Ok(Self { client })
    }

    /// Namespace of the active context
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// The underlying kube client
    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    fn pods_api(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl PodLister for KubeClient {
    async fn list_pods(&self, query: &PodQuery) -> K8sResult<Vec<SourceRef>> {
        let pods = self.pods_api(query.namespace.as_deref());

        let mut params = ListParams::default();
        if let Some(labels) = &query.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &query.field_selector {
            params = params.fields(fields);
        }

        let list = pods.list(&params).await?;
        tracing::trace!(count = list.items.len(), ?query, "listed pods");

        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let namespace = pod.metadata.namespace?;
                let name = pod.metadata.name?;
                Some(SourceRef::new(namespace, name))
            })
            .collect())
    }
}

#[async_trait]
impl WorkloadResolver for KubeClient {
    async fn selector_for(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
    ) -> K8sResult<String> {
        let labels = match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.get(name)
                    .await?
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.get(name)
                    .await?
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                api.get(name)
                    .await?
                    .spec
                    .and_then(|spec| spec.selector.match_labels)
            }
        };

        selector_string(labels.as_ref()).ok_or_else(|| K8sError::NoSelector {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}

/// Render `matchLabels` as a `key=value,key=value` selector
pub fn selector_string(labels: Option<&BTreeMap<String, String>>) -> Option<String> {
    let selector = labels?
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    if selector.is_empty() {
        None
    } else {
        Some(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_string() {
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "web".to_string());
        labels.insert("app".to_string(), "api".to_string());
        assert_eq!(
            selector_string(Some(&labels)).as_deref(),
            Some("app=api,tier=web")
        );
    }

    #[test]
    fn test_selector_string_empty() {
        assert!(selector_string(None).is_none());
        assert!(selector_string(Some(&BTreeMap::new())).is_none());
    }
}
