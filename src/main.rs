mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;

use logfan_k8s::{KubeClient, KubeLogStreamer, KubectlLogStreamer, LogStreamer};
use logfan_logs::{
    Backends, LokiClient, OutputSink, StreamSupervisor, resolve_endpoint, resolve_since, run_batch,
};
use logfan_types::{ContainerState, OutputMode, StreamOptions};

use crate::config::{Backend, Config};

/// logfan - Stream logs from many Kubernetes pods at once
///
/// TARGET can be a pod name, a pod name regex (`api-.*`), a label selector
/// (`app=api`), a workload (`deployment/api`, `sts/db`, `ds/agent`), or
/// omitted when `--node` is given.
#[derive(Parser, Debug)]
#[command(name = "logfan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pod name, pod name regex, label selector, or kind/name
    #[arg(value_name = "TARGET")]
    target: Option<String>,

    /// Keep streaming and pick up new pods
    #[arg(short, long)]
    follow: bool,

    /// Look for pods in every namespace
    #[arg(short = 'A', long, conflicts_with = "namespace")]
    all_namespaces: bool,

    /// Namespace (defaults to the context's namespace)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Container to read from
    #[arg(short, long)]
    container: Option<String>,

    /// Only pods in this state: running, waiting or terminated
    #[arg(long, value_name = "STATE")]
    container_state: Option<ContainerState>,

    /// Lines of recent output to show per pod
    #[arg(long, value_name = "N")]
    tail: Option<i64>,

    /// Only output newer than a duration (5m, 1h30m) or a time of day (14:30)
    #[arg(long, value_name = "DURATION|HH:MM")]
    since: Option<String>,

    /// Include timestamps on each line
    #[arg(long)]
    timestamps: bool,

    /// Only show lines matching this regex
    #[arg(long, value_name = "PATTERN")]
    grep: Option<String>,

    /// Hide lines matching this regex
    #[arg(long = "grep-v", value_name = "PATTERN")]
    grep_v: Option<String>,

    /// Skip pods whose name matches this regex
    #[arg(long, value_name = "PATTERN")]
    exclude: Option<String>,

    /// Also append plain lines to this file
    #[arg(long, value_name = "PATH")]
    save: Option<PathBuf>,

    /// Output format: default, raw or json
    #[arg(long, default_value = "default")]
    output: OutputMode,

    /// Line template, e.g. '{{.PodName}} {{.Message}}'
    #[arg(long)]
    template: Option<String>,

    /// Maximum concurrent pod streams (0 keeps the config value)
    #[arg(long, value_name = "N")]
    max_log_requests: Option<usize>,

    /// Stream every pod on this node
    #[arg(long)]
    node: Option<String>,

    /// Run a LogQL query against Loki instead of tailing pods
    #[arg(long, value_name = "QUERY")]
    loki: Option<String>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Config file (defaults to <config dir>/logfan/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// How log connections are opened
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref())?;
    let since = args
        .since
        .as_deref()
        .map(|s| resolve_since(s, &Local::now()))
        .transpose()?;
    let colors = colors_enabled(&config);

    if let Some(query) = args.loki.clone() {
        let endpoint = resolve_endpoint(config.integrations.loki_endpoint.as_deref())?;
        let options = stream_options(&args, &config, since, None);
        let sink = OutputSink::stdout(&options, colors)?;
        let client = LokiClient::new(endpoint)?;

        let written = run_batch(&client, &query, &options, &sink).await?;
        tracing::debug!(written, endpoint = client.endpoint(), "Loki query finished");
        return Ok(());
    }

    let context = args.context.clone().or_else(|| config.kube.context.clone());
    let client = KubeClient::connect(context.as_deref())
        .await
        .context("failed to connect to the cluster")?;

    let namespace = if args.all_namespaces {
        None
    } else {
        Some(
            args.namespace
                .clone()
                .unwrap_or_else(|| client.default_namespace().to_string()),
        )
    };
    let options = StreamOptions {
        context_namespace: Some(client.default_namespace().to_string()),
        ..stream_options(&args, &config, since, namespace)
    };

    let backend = args.backend.unwrap_or(config.kube.backend);
    let streamer: Arc<dyn LogStreamer> = match backend {
        Backend::Api => Arc::new(KubeLogStreamer::new(client.client())),
        Backend::Kubectl => Arc::new(
            KubectlLogStreamer::new(config.kubectl_path()).with_context(context.as_deref()),
        ),
    };
    tracing::debug!(?backend, target = %options.target, "starting log streams");

    let client = Arc::new(client);
    let backends = Backends {
        pods: client.clone(),
        workloads: client,
        streamer,
    };
    let sink = Arc::new(OutputSink::stdout(&options, colors)?);
    let supervisor = StreamSupervisor::new(&options, backends, Arc::clone(&sink))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupt received, stopping streams");
                shutdown.cancel();
            }
        }
    });

    let summary = supervisor.run(shutdown).await?;
    sink.flush();
    if summary.skipped > 0 {
        tracing::warn!(
            skipped = summary.skipped,
            "some pods were not streamed; raise --max-log-requests to include them"
        );
    }
    Ok(())
}

/// Build the per-invocation options; CLI flags win over config values
fn stream_options(
    args: &Args,
    config: &Config,
    since: Option<Duration>,
    namespace: Option<String>,
) -> StreamOptions {
    StreamOptions {
        target: args.target.clone().unwrap_or_default(),
        node: args.node.clone(),
        namespace,
        context_namespace: None,
        follow: args.follow,
        tail: args.tail,
        since,
        timestamps: args.timestamps,
        container: args.container.clone(),
        container_state: args.container_state,
        grep: args.grep.clone(),
        grep_v: args.grep_v.clone(),
        exclude_pods: args.exclude.clone(),
        output: args.output,
        template: args.template.clone(),
        save: args.save.clone(),
        max_sources: args
            .max_log_requests
            .filter(|n| *n > 0)
            .unwrap_or(config.logs.max_pods),
        refresh_interval: Duration::from_secs(config.logs.refresh_interval_secs),
        follow_new_sources: config.logs.follow_new_pods,
    }
}

/// Colors need the config switch, no `NO_COLOR`, and a terminal on stdout
fn colors_enabled(config: &Config) -> bool {
    config.logs.colors && std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("logfan").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_full_command_line() {
        let args = parse(&[
            "app=api",
            "-f",
            "-n",
            "ops",
            "--container-state",
            "terminated",
            "--tail",
            "20",
            "--grep",
            "error",
            "--grep-v",
            "healthz",
            "--output",
            "json",
            "--max-log-requests",
            "5",
            "--backend",
            "kubectl",
        ]);
        assert_eq!(args.target.as_deref(), Some("app=api"));
        assert!(args.follow);
        assert_eq!(args.namespace.as_deref(), Some("ops"));
        assert_eq!(args.container_state, Some(ContainerState::Terminated));
        assert_eq!(args.output, OutputMode::Json);
        assert_eq!(args.backend, Some(Backend::Kubectl));
    }

    #[test]
    fn test_invalid_flag_values_rejected() {
        let bad = [
            vec!["logfan", "x", "--output", "yaml"],
            vec!["logfan", "x", "--container-state", "exited"],
            vec!["logfan", "x", "-A", "-n", "ops"],
        ];
        for argv in bad {
            assert!(Args::try_parse_from(argv.iter().copied()).is_err(), "{:?}", argv);
        }
    }

    #[test]
    fn test_stream_options_prefer_flags_over_config() {
        let config = Config::from_toml("[logs]\nmax_pods = 7\nfollow_new_pods = false\n").unwrap();

        let options = stream_options(&parse(&["app=api"]), &config, None, Some("ops".into()));
        assert_eq!(options.max_sources, 7);
        assert!(!options.follow_new_sources);
        assert_eq!(options.namespace.as_deref(), Some("ops"));

        let args = parse(&["app=api", "--max-log-requests", "3"]);
        let options = stream_options(&args, &config, Some(Duration::from_secs(60)), None);
        assert_eq!(options.max_sources, 3);
        assert_eq!(options.since, Some(Duration::from_secs(60)));
        assert!(options.namespace.is_none());
    }

    #[test]
    fn test_zero_max_log_requests_keeps_config_value() {
        let config = Config::from_toml("[logs]\nmax_pods = 7\n").unwrap();
        let args = parse(&["app=api", "--max-log-requests", "0"]);
        assert_eq!(stream_options(&args, &config, None, None).max_sources, 7);

        // An unlimited config stays unlimited
        let config = Config::from_toml("[logs]\nmax_pods = 0\n").unwrap();
        assert_eq!(stream_options(&args, &config, None, None).max_sources, 0);
    }

    #[test]
    fn test_node_without_target() {
        let options = stream_options(
            &parse(&["--node", "node-1"]),
            &Config::default(),
            None,
            None,
        );
        assert!(options.target.is_empty());
        assert_eq!(options.node.as_deref(), Some("node-1"));
        assert!(options.requests_multi_source());
    }
}
