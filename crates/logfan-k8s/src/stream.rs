use std::process::Stdio;

use async_trait::async_trait;
use futures::{AsyncBufReadExt as _, FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use logfan_types::{LogRequest, SourceRef};

use crate::error::{K8sError, K8sResult};
use crate::source::{LineStream, LogConnection, LogStreamer};

/// Streams pod logs through the Kubernetes API
///
/// The API only exposes a single byte stream per pod, so the diagnostic
/// stream of these connections is always empty.
#[derive(Clone)]
pub struct KubeLogStreamer {
    client: kube::Client,
}

impl KubeLogStreamer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

fn log_params(request: &LogRequest) -> LogParams {
    LogParams {
        container: request.container.clone(),
        follow: request.follow,
        tail_lines: request.tail_lines,
        since_seconds: request.since_seconds,
        timestamps: request.timestamps,
        previous: request.previous,
        ..Default::default()
    }
}

#[async_trait]
impl LogStreamer for KubeLogStreamer {
    async fn open(
        &self,
        source: &SourceRef,
        request: &LogRequest,
        cancel: CancellationToken,
    ) -> K8sResult<LogConnection> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &source.namespace);
        let params = log_params(request);
        let pod_name = source.name.clone();

        let (ready_tx, ready_rx) = oneshot::channel::<K8sResult<()>>();
        // Capacity 1: the pump stays at most one line ahead of the reader
        let (line_tx, line_rx) = mpsc::channel::<std::io::Result<String>>(1);

        // The log reader borrows the Api, so both live in the pump task.
        let pump = tokio::spawn(async move {
            let stream = match api.log_stream(&pod_name, &params).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return Ok(());
                }
            };

            let mut lines = stream.lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    _ = line_tx.closed() => break,

                    result = lines.try_next() => {
                        match result {
                            Ok(Some(line)) => {
                                if line_tx.send(Ok(line)).await.is_err() {
                                    break;
                                }
                            }
                            // Stream ended (pod terminated or not following)
                            Ok(None) => break,
                            Err(e) => return Err(K8sError::Io(e)),
                        }
                    }
                }
            }
            Ok::<(), K8sError>(())
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(K8sError::Task(
                    "log stream task exited before the connection opened".to_string(),
                ));
            }
        }

        let primary = futures::stream::unfold(line_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        let completion = async move {
            match pump.await {
                Ok(result) => result,
                Err(e) => Err(K8sError::Task(e.to_string())),
            }
        }
        .boxed();

        Ok(LogConnection {
            primary,
            diagnostic: futures::stream::empty().boxed(),
            completion,
        })
    }
}

/// Streams pod logs by running `kubectl logs` per source
///
/// stdout is the primary stream and stderr the diagnostic stream. The child
/// is killed when the connection's cancellation token fires.
#[derive(Clone, Debug)]
pub struct KubectlLogStreamer {
    program: String,
    base_args: Vec<String>,
}

impl KubectlLogStreamer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Pin every invocation to a kubeconfig context
    pub fn with_context(mut self, context: Option<&str>) -> Self {
        if let Some(context) = context {
            self.base_args.push("--context".to_string());
            self.base_args.push(context.to_string());
        }
        self
    }

    /// Arguments placed before the `logs` subcommand
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full argument list for one source
    pub fn log_args(&self, source: &SourceRef, request: &LogRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("logs".to_string());
        if request.follow {
            args.push("-f".to_string());
        }
        if request.previous {
            args.push("--previous".to_string());
        }
        args.push(source.name.clone());
        args.push("-n".to_string());
        args.push(source.namespace.clone());
        if let Some(container) = &request.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        if let Some(tail) = request.tail_lines {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if let Some(since) = request.since_seconds {
            args.push("--since".to_string());
            args.push(format!("{}s", since));
        }
        if request.timestamps {
            args.push("--timestamps".to_string());
        }
        args
    }
}

#[async_trait]
impl LogStreamer for KubectlLogStreamer {
    async fn open(
        &self,
        source: &SourceRef,
        request: &LogRequest,
        cancel: CancellationToken,
    ) -> K8sResult<LogConnection> {
        let mut child = Command::new(&self.program)
            .args(self.log_args(source, request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| K8sError::Kubectl("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| K8sError::Kubectl("stderr was not captured".to_string()))?;

        let completion = async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            };

            match status {
                Some(Ok(status)) if status.success() => Ok(()),
                Some(Ok(status)) => Err(K8sError::Kubectl(format!("logs exited with {}", status))),
                Some(Err(e)) => Err(K8sError::Io(e)),
                None => {
                    // Closing the pipes ends both line streams
                    let _ = child.kill().await;
                    Ok(())
                }
            }
        }
        .boxed();

        Ok(LogConnection {
            primary: line_stream(stdout),
            diagnostic: line_stream(stderr),
            completion,
        })
    }
}

/// Split an async byte stream into lines, ending after the first error
pub fn line_stream<R>(reader: R) -> LineStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let lines = BufReader::new(reader).lines();
    futures::stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}
