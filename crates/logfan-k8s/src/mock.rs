//! In-memory cluster for testing: pod listings, workload selectors and
//! scripted log connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use logfan_types::{LogRequest, SourceRef};

use crate::error::{K8sError, K8sResult};
use crate::source::{
    LineStream, LogConnection, LogStreamer, PodLister, PodQuery, WorkloadKind, WorkloadResolver,
};

/// A pod known to the mock cluster
#[derive(Clone, Debug)]
pub struct MockPod {
    pub source: SourceRef,
    pub labels: BTreeMap<String, String>,
    pub node: String,
    pub phase: String,
}

impl MockPod {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            source: SourceRef::new(namespace, name),
            labels: BTreeMap::new(),
            node: "node-1".to_string(),
            phase: "Running".to_string(),
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn on_node(mut self, node: &str) -> Self {
        self.node = node.to_string();
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    fn matches(&self, query: &PodQuery) -> bool {
        if let Some(ns) = &query.namespace {
            if &self.source.namespace != ns {
                return false;
            }
        }
        if let Some(selector) = &query.label_selector {
            let all = terms(selector).all(|(k, v)| self.labels.get(k).map(String::as_str) == Some(v));
            if !all {
                return false;
            }
        }
        if let Some(selector) = &query.field_selector {
            let all = terms(selector).all(|(k, v)| match k {
                "spec.nodeName" => self.node == v,
                "status.phase" => self.phase == v,
                "metadata.name" => self.source.name == v,
                "metadata.namespace" => self.source.namespace == v,
                _ => false,
            });
            if !all {
                return false;
            }
        }
        true
    }
}

fn terms(selector: &str) -> impl Iterator<Item = (&str, &str)> {
    selector
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.split_once('=').unwrap_or((t, "")))
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Mock cluster implementing pod listing and workload lookup
#[derive(Default)]
pub struct MockCluster {
    pods: Mutex<Vec<MockPod>>,
    selectors: Mutex<HashMap<(WorkloadKind, String, String), String>>,
    fail_listing: Mutex<bool>,
    queries: Mutex<Vec<PodQuery>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod (duplicates are kept, as a listing could return them)
    pub fn add_pod(&self, pod: MockPod) {
        self.pods.lock().push(pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .retain(|p| !(p.source.namespace == namespace && p.source.name == name));
    }

    pub fn add_workload(&self, kind: WorkloadKind, namespace: &str, name: &str, selector: &str) {
        self.selectors.lock().insert(
            (kind, namespace.to_string(), name.to_string()),
            selector.to_string(),
        );
    }

    /// Make subsequent listing calls fail
    pub fn set_fail_listing(&self, fail: bool) {
        *self.fail_listing.lock() = fail;
    }

    /// Every query received so far
    pub fn queries(&self) -> Vec<PodQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl PodLister for MockCluster {
    async fn list_pods(&self, query: &PodQuery) -> K8sResult<Vec<SourceRef>> {
        self.queries.lock().push(query.clone());
        if *self.fail_listing.lock() {
            return Err(K8sError::Mock("listing failed".to_string()));
        }
        Ok(self
            .pods
            .lock()
            .iter()
            .filter(|p| p.matches(query))
            .map(|p| p.source.clone())
            .collect())
    }
}

#[async_trait]
impl WorkloadResolver for MockCluster {
    async fn selector_for(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
    ) -> K8sResult<String> {
        self.selectors
            .lock()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| K8sError::Mock(format!("{} '{}' not found", kind, name)))
    }
}

/// Scripted output for one source
#[derive(Clone, Debug, Default)]
pub struct MockLog {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Keep the connection open after the scripted lines until cancelled
    pub hold_open: bool,
    /// Fail the open call itself
    pub fail_open: bool,
    /// Report an error from the connection's completion
    pub fail_completion: bool,
}

impl MockLog {
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    pub fn failing_completion(mut self) -> Self {
        self.fail_completion = true;
        self
    }
}

/// Log streamer serving scripted connections
///
/// Sources without a script produce an empty, immediately closed connection
/// (or a held-open one when `default_hold_open` is set).
#[derive(Default)]
pub struct MockLogStreamer {
    logs: Mutex<HashMap<SourceRef, MockLog>>,
    default_hold_open: bool,
    opened: Mutex<Vec<(SourceRef, LogRequest)>>,
    open_now: Arc<AtomicUsize>,
    peak_open: Arc<AtomicUsize>,
}

impl MockLogStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unscripted sources stay open until cancelled
    pub fn holding_open() -> Self {
        Self {
            default_hold_open: true,
            ..Default::default()
        }
    }

    pub fn set_log(&self, source: SourceRef, log: MockLog) {
        self.logs.lock().insert(source, log);
    }

    /// Sources opened so far, with the request each was opened with
    pub fn opened(&self) -> Vec<(SourceRef, LogRequest)> {
        self.opened.lock().clone()
    }

    /// Connections currently open
    pub fn open_count(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections
    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }
}

/// Decrements the open-connection gauge when the connection completes
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn scripted(lines: Vec<String>, hold: Option<CancellationToken>) -> LineStream {
    let scripted = futures::stream::iter(lines.into_iter().map(Ok));
    match hold {
        Some(cancel) => scripted
            .chain(
                futures::stream::once(async move { cancel.cancelled().await })
                    .filter_map(|_| async { None }),
            )
            .boxed(),
        None => scripted.boxed(),
    }
}

#[async_trait]
impl LogStreamer for MockLogStreamer {
    async fn open(
        &self,
        source: &SourceRef,
        request: &LogRequest,
        cancel: CancellationToken,
    ) -> K8sResult<LogConnection> {
        let log = self.logs.lock().get(source).cloned().unwrap_or(MockLog {
            hold_open: self.default_hold_open,
            ..Default::default()
        });
        self.opened.lock().push((source.clone(), request.clone()));

        if log.fail_open {
            return Err(K8sError::Mock(format!("cannot open logs for {}", source)));
        }

        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(now, Ordering::SeqCst);
        let guard = OpenGuard(Arc::clone(&self.open_now));

        let hold = log.hold_open.then(|| cancel.clone());
        let fail = log.fail_completion;
        let source = source.clone();
        let completion = async move {
            if let Some(cancel) = hold {
                cancel.cancelled().await;
            }
            drop(guard);
            if fail {
                Err(K8sError::Mock(format!("stream for {} broke", source)))
            } else {
                Ok(())
            }
        }
        .boxed();

        Ok(LogConnection {
            primary: scripted(log.stdout, log.hold_open.then(|| cancel.clone())),
            diagnostic: scripted(log.stderr, log.hold_open.then(|| cancel)),
            completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_mock_cluster_selectors() {
        let cluster = MockCluster::new();
        cluster.add_pod(MockPod::new("ops", "p1").label("app", "api"));
        cluster.add_pod(MockPod::new("ops", "p2").label("app", "web").on_node("node-2"));
        cluster.add_pod(MockPod::new("dev", "p3").label("app", "api").phase("Pending"));

        let api = cluster
            .list_pods(&PodQuery::new(None).labels("app=api"))
            .await
            .unwrap();
        assert_eq!(api.len(), 2);

        let on_node = cluster
            .list_pods(&PodQuery::new(Some("ops".into())).field("spec.nodeName=node-2"))
            .await
            .unwrap();
        assert_eq!(on_node, vec![SourceRef::new("ops", "p2")]);

        let pending = cluster
            .list_pods(&PodQuery::new(None).field("status.phase=Pending"))
            .await
            .unwrap();
        assert_eq!(pending, vec![SourceRef::new("dev", "p3")]);
    }

    #[tokio::test]
    async fn test_mock_streamer_held_connection_closes_on_cancel() {
        let streamer = MockLogStreamer::holding_open();
        let cancel = CancellationToken::new();
        let conn = streamer
            .open(&SourceRef::new("ops", "p1"), &LogRequest::default(), cancel.clone())
            .await
            .unwrap();
        assert_eq!(streamer.open_count(), 1);

        cancel.cancel();
        let (primary, _, done) = tokio::join!(
            conn.primary.try_collect::<Vec<_>>(),
            conn.diagnostic.try_collect::<Vec<_>>(),
            conn.completion,
        );
        assert!(primary.unwrap().is_empty());
        assert!(done.is_ok());
        assert_eq!(streamer.open_count(), 0);
        assert_eq!(streamer.peak_open(), 1);
    }
}
