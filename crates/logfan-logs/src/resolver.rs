use std::collections::BTreeSet;
use std::sync::Arc;

use regex::Regex;

use logfan_k8s::{PodLister, PodQuery, WorkloadKind, WorkloadResolver};
use logfan_types::{ContainerState, SourceRef, StreamOptions};

use crate::error::{LogsError, LogsResult};
use crate::filter::compile_optional;

/// Characters that cannot appear in a pod name but do appear in regexes
const REGEX_METACHARACTERS: &[char] = &[
    '*', '+', '?', '[', ']', '(', ')', '{', '}', '|', '^', '$', '\\',
];

/// Workload lookup namespace when neither a scope nor a context namespace is known
const FALLBACK_WORKLOAD_NAMESPACE: &str = "default";

/// A parsed log target
#[derive(Clone, Debug)]
pub enum Target {
    /// Every pod scheduled on a node
    Node(String),
    /// `key=value[,key=value]` label selector
    Selector(String),
    /// Pods selected by a workload's `matchLabels`
    Workload { kind: WorkloadKind, name: String },
    /// Pods whose name matches a regex
    NamePattern(Regex),
    /// A single pod by name
    Pod(String),
}

impl Target {
    /// Parse the target expression, in precedence order: node constraint,
    /// label selector, workload reference, name regex, bare pod name
    pub fn parse(options: &StreamOptions) -> LogsResult<Self> {
        if let Some(node) = options.node.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Ok(Self::Node(node.to_string()));
        }

        let target = options.target.trim();
        if target.contains('=') {
            return Ok(Self::Selector(target.to_string()));
        }

        if let Some((kind, name)) = target.split_once('/') {
            let name = name.trim();
            if matches!(kind.to_lowercase().as_str(), "pod" | "pods" | "po") {
                return Self::bare(name, options);
            }
            if let Ok(kind) = kind.parse::<WorkloadKind>() {
                if name.is_empty() {
                    return Err(LogsError::UnsupportedTarget(format!(
                        "invalid {} target \"{}\"",
                        kind, target
                    )));
                }
                return Ok(Self::Workload {
                    kind,
                    name: name.to_string(),
                });
            }
        }

        if is_name_pattern(target) {
            let re = compile_optional("pod name", Some(target))?;
            if let Some(re) = re {
                return Ok(Self::NamePattern(re));
            }
        }

        Self::bare(target, options)
    }

    fn bare(name: &str, options: &StreamOptions) -> LogsResult<Self> {
        if name.is_empty() {
            return Err(LogsError::UnsupportedTarget(
                "a logs target is required (pod name, pod name regex, key=value selector, deployment/name, or --node)"
                    .to_string(),
            ));
        }
        if options.requests_multi_source() {
            return Err(LogsError::UnsupportedTarget(format!(
                "unsupported logs target \"{}\"; use selector key=value, deployment/name, or pod name regex",
                name
            )));
        }
        Ok(Self::Pod(name.to_string()))
    }
}

/// Check if a target contains regex metacharacters not valid in pod names
pub fn is_name_pattern(target: &str) -> bool {
    target.contains(REGEX_METACHARACTERS)
}

/// Resolves a target into the current set of matching pods
pub struct SourceResolver {
    target: Target,

    /// Target text as given, for error messages
    expression: String,

    /// Namespace scope; `None` is all namespaces
    namespace: Option<String>,

    /// Workload lookups use this when `namespace` is `None`
    context_namespace: Option<String>,

    container_state: Option<ContainerState>,

    /// Pods whose name matches this are dropped
    exclude: Option<Regex>,

    pods: Arc<dyn PodLister>,
    workloads: Arc<dyn WorkloadResolver>,
}

impl SourceResolver {
    /// Parse and validate the target and exclude pattern up front
    pub fn new(
        options: &StreamOptions,
        pods: Arc<dyn PodLister>,
        workloads: Arc<dyn WorkloadResolver>,
    ) -> LogsResult<Self> {
        Ok(Self {
            target: Target::parse(options)?,
            expression: options.target.trim().to_string(),
            namespace: options.namespace.clone(),
            context_namespace: options
                .context_namespace
                .clone()
                .filter(|ns| !ns.trim().is_empty()),
            container_state: options.container_state,
            exclude: compile_optional("--exclude", options.exclude_pods.as_deref())?,
            pods,
            workloads,
        })
    }

    /// List matching pods, deduplicated and sorted by (namespace, name)
    pub async fn resolve(&self) -> LogsResult<Vec<SourceRef>> {
        let listed = match &self.target {
            Target::Node(node) => {
                let query = self.query(Some(format!("spec.nodeName={}", node)));
                self.pods.list_pods(&query).await?
            }
            Target::Selector(selector) => {
                let query = self.query(None).labels(selector.clone());
                self.pods.list_pods(&query).await?
            }
            Target::Workload { kind, name } => {
                let namespace = self
                    .namespace
                    .as_deref()
                    .or(self.context_namespace.as_deref())
                    .unwrap_or(FALLBACK_WORKLOAD_NAMESPACE);
                let selector = self.workloads.selector_for(*kind, name, namespace).await?;
                tracing::trace!(%kind, %name, %selector, "resolved workload selector");
                let query = self.query(None).labels(selector);
                self.pods.list_pods(&query).await?
            }
            Target::NamePattern(re) => self
                .pods
                .list_pods(&self.query(None))
                .await?
                .into_iter()
                .filter(|source| re.is_match(&source.name))
                .collect(),
            Target::Pod(name) => {
                let query = self.query(Some(format!("metadata.name={}", name)));
                self.pods.list_pods(&query).await?
            }
        };

        Ok(exclude_sources(normalize(listed), self.exclude.as_ref()))
    }

    /// The error reported when the target matched nothing
    pub fn no_sources_error(&self) -> LogsError {
        match &self.target {
            Target::Node(node) => LogsError::NoPodsOnNode(node.clone()),
            _ => LogsError::NoPodsMatch(self.expression.clone()),
        }
    }

    fn query(&self, field: Option<String>) -> PodQuery {
        let mut query = PodQuery::new(self.namespace.clone());
        if let Some(field) = field {
            query = query.field(field);
        }
        if let Some(phase) = self.container_state.and_then(|s| s.phase_selector()) {
            query = query.field(phase);
        }
        query
    }
}

/// Deduplicate and sort by (namespace, name)
pub fn normalize(sources: Vec<SourceRef>) -> Vec<SourceRef> {
    sources
        .into_iter()
        .filter(|s| !s.namespace.is_empty() && !s.name.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Drop every source whose name matches `pattern`
pub fn exclude_sources(sources: Vec<SourceRef>, pattern: Option<&Regex>) -> Vec<SourceRef> {
    match pattern {
        Some(re) => sources.into_iter().filter(|s| !re.is_match(&s.name)).collect(),
        None => sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logfan_k8s::mock::{MockCluster, MockPod};

    fn options(target: &str) -> StreamOptions {
        StreamOptions {
            target: target.to_string(),
            namespace: Some("ops".to_string()),
            ..Default::default()
        }
    }

    fn resolver(cluster: &Arc<MockCluster>, options: &StreamOptions) -> SourceResolver {
        SourceResolver::new(options, cluster.clone(), cluster.clone()).unwrap()
    }

    fn names(sources: &[SourceRef]) -> Vec<String> {
        sources.iter().map(SourceRef::key).collect()
    }

    fn cluster() -> Arc<MockCluster> {
        let cluster = MockCluster::new();
        cluster.add_pod(MockPod::new("ops", "api-7d9f-b").label("app", "api"));
        cluster.add_pod(MockPod::new("ops", "api-7d9f-a").label("app", "api"));
        cluster.add_pod(MockPod::new("ops", "web-1").label("app", "web").on_node("node-2"));
        cluster.add_pod(
            MockPod::new("ops", "worker-1")
                .label("app", "worker")
                .phase("Pending"),
        );
        cluster.add_pod(MockPod::new("dev", "api-0").label("app", "api").on_node("node-2"));
        Arc::new(cluster)
    }

    #[test]
    fn test_target_precedence() {
        let mut opts = options("app=api");
        opts.node = Some("node-2".to_string());
        assert!(matches!(Target::parse(&opts).unwrap(), Target::Node(n) if n == "node-2"));

        assert!(matches!(
            Target::parse(&options("app=api,tier=web")).unwrap(),
            Target::Selector(_)
        ));
        assert!(matches!(
            Target::parse(&options("deploy/api")).unwrap(),
            Target::Workload { kind: WorkloadKind::Deployment, .. }
        ));
        assert!(matches!(
            Target::parse(&options("sts/db")).unwrap(),
            Target::Workload { kind: WorkloadKind::StatefulSet, .. }
        ));
        assert!(matches!(
            Target::parse(&options("api-.*")).unwrap(),
            Target::NamePattern(_)
        ));
        assert!(matches!(
            Target::parse(&options("api-7d9f-a")).unwrap(),
            Target::Pod(_)
        ));
        assert!(matches!(
            Target::parse(&options("pod/api-7d9f-a")).unwrap(),
            Target::Pod(name) if name == "api-7d9f-a"
        ));
    }

    #[test]
    fn test_bare_name_rejected_for_multi_source() {
        let mut opts = options("api-7d9f-a");
        opts.grep = Some("error".to_string());
        assert!(matches!(
            Target::parse(&opts),
            Err(LogsError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_empty_target_rejected() {
        assert!(matches!(
            Target::parse(&options("  ")),
            Err(LogsError::UnsupportedTarget(_))
        ));
        assert!(matches!(
            Target::parse(&options("deployment/")),
            Err(LogsError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_is_name_pattern() {
        assert!(!is_name_pattern(""));
        assert!(!is_name_pattern("api-7d9f-a"));
        assert!(!is_name_pattern("my.pod-1"));
        for pattern in ["api-.*", "api-[0-9]", "a|b", "^api", "api$", "a+", "a\\d"] {
            assert!(is_name_pattern(pattern), "{}", pattern);
        }
    }

    #[test]
    fn test_invalid_patterns_fail_at_construction() {
        let cluster = cluster();
        let err = SourceResolver::new(&options("api-(.*"), cluster.clone(), cluster.clone());
        assert!(matches!(err, Err(LogsError::InvalidRegex { flag: "pod name", .. })));

        let mut opts = options("app=api");
        opts.exclude_pods = Some("[".to_string());
        let err = SourceResolver::new(&opts, cluster.clone(), cluster.clone());
        assert!(matches!(err, Err(LogsError::InvalidRegex { flag: "--exclude", .. })));
    }

    #[tokio::test]
    async fn test_selector_sorted_and_deduplicated() {
        let cluster = cluster();
        cluster.add_pod(MockPod::new("ops", "api-7d9f-a").label("app", "api"));

        let sources = resolver(&cluster, &options("app=api")).resolve().await.unwrap();
        assert_eq!(names(&sources), vec!["ops/api-7d9f-a", "ops/api-7d9f-b"]);
    }

    #[tokio::test]
    async fn test_all_namespaces_sorted_by_namespace_first() {
        let cluster = cluster();
        let mut opts = options("app=api");
        opts.namespace = None;

        let sources = resolver(&cluster, &opts).resolve().await.unwrap();
        assert_eq!(
            names(&sources),
            vec!["dev/api-0", "ops/api-7d9f-a", "ops/api-7d9f-b"]
        );
    }

    #[tokio::test]
    async fn test_node_target() {
        let cluster = cluster();
        let mut opts = options("");
        opts.node = Some("node-2".to_string());
        opts.namespace = None;

        let sources = resolver(&cluster, &opts).resolve().await.unwrap();
        assert_eq!(names(&sources), vec!["dev/api-0", "ops/web-1"]);
        assert_eq!(
            cluster.queries()[0].field_selector.as_deref(),
            Some("spec.nodeName=node-2")
        );
    }

    #[tokio::test]
    async fn test_workload_target() {
        let cluster = cluster();
        cluster.add_workload(WorkloadKind::Deployment, "ops", "api", "app=api");

        let sources = resolver(&cluster, &options("deployment/api"))
            .resolve()
            .await
            .unwrap();
        assert_eq!(names(&sources), vec!["ops/api-7d9f-a", "ops/api-7d9f-b"]);
    }

    #[tokio::test]
    async fn test_workload_across_namespaces_uses_context_namespace() {
        let cluster = cluster();
        cluster.add_workload(WorkloadKind::Deployment, "ops", "api", "app=api");

        let mut opts = options("deploy/api");
        opts.namespace = None;
        opts.context_namespace = Some("ops".to_string());
        let sources = resolver(&cluster, &opts).resolve().await.unwrap();
        // The selector comes from ops, the listing spans every namespace
        assert_eq!(
            names(&sources),
            vec!["dev/api-0", "ops/api-7d9f-a", "ops/api-7d9f-b"]
        );

        opts.context_namespace = None;
        let result = resolver(&cluster, &opts).resolve().await;
        assert!(matches!(result, Err(LogsError::Cluster(_))));
    }

    #[tokio::test]
    async fn test_workload_lookup_failure_surfaces() {
        let cluster = cluster();
        let result = resolver(&cluster, &options("deploy/missing")).resolve().await;
        assert!(matches!(result, Err(LogsError::Cluster(_))));
    }

    #[tokio::test]
    async fn test_name_pattern_target() {
        let cluster = cluster();
        let sources = resolver(&cluster, &options("^(web|worker)-"))
            .resolve()
            .await
            .unwrap();
        assert_eq!(names(&sources), vec!["ops/web-1", "ops/worker-1"]);
    }

    #[tokio::test]
    async fn test_container_state_narrows_listing() {
        let cluster = cluster();
        let mut opts = options("^(web|worker)-");
        opts.container_state = Some(ContainerState::Waiting);

        let sources = resolver(&cluster, &opts).resolve().await.unwrap();
        assert_eq!(names(&sources), vec!["ops/worker-1"]);

        // Terminated cannot be filtered server-side
        opts.container_state = Some(ContainerState::Terminated);
        let sources = resolver(&cluster, &opts).resolve().await.unwrap();
        assert_eq!(sources.len(), 2);
    }

    #[tokio::test]
    async fn test_exclude_pattern_applied_last() {
        let cluster = cluster();
        let mut opts = options("app=api");
        opts.exclude_pods = Some("-b$".to_string());

        let sources = resolver(&cluster, &opts).resolve().await.unwrap();
        assert_eq!(names(&sources), vec!["ops/api-7d9f-a"]);
    }

    #[tokio::test]
    async fn test_single_pod_target() {
        let cluster = cluster();
        let sources = resolver(&cluster, &options("web-1")).resolve().await.unwrap();
        assert_eq!(names(&sources), vec!["ops/web-1"]);

        let sources = resolver(&cluster, &options("gone-0")).resolve().await.unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_surfaces() {
        let cluster = cluster();
        cluster.set_fail_listing(true);
        let result = resolver(&cluster, &options("app=api")).resolve().await;
        assert!(matches!(result, Err(LogsError::Cluster(_))));
    }

    #[test]
    fn test_no_sources_error_messages() {
        let cluster = cluster();
        let mut opts = options("");
        opts.node = Some("node-9".to_string());
        let err = resolver(&cluster, &opts).no_sources_error();
        assert_eq!(err.to_string(), "no pods found on node \"node-9\"");

        let err = resolver(&cluster, &options("app=none")).no_sources_error();
        assert_eq!(err.to_string(), "no pods match target \"app=none\"");
    }

    #[test]
    fn test_exclude_sources_identity_and_subtraction() {
        let sources = vec![
            SourceRef::new("ops", "api-1"),
            SourceRef::new("ops", "canary-1"),
            SourceRef::new("ops", "web-1"),
        ];
        assert_eq!(exclude_sources(sources.clone(), None), sources);

        let re = Regex::new("canary").unwrap();
        let kept = exclude_sources(sources.clone(), Some(&re));
        assert_eq!(names(&kept), vec!["ops/api-1", "ops/web-1"]);
        assert!(kept.iter().all(|s| !re.is_match(&s.name)));
        assert_eq!(kept.len() + 1, sources.len());
    }

    #[test]
    fn test_normalize_drops_incomplete_refs() {
        let sources = normalize(vec![
            SourceRef::new("b", "x"),
            SourceRef::new("", "x"),
            SourceRef::new("a", "y"),
            SourceRef::new("b", "x"),
        ]);
        assert_eq!(names(&sources), vec!["a/y", "b/x"]);
    }
}
