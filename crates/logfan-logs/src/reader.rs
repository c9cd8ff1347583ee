use std::sync::Arc;

use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use logfan_k8s::{K8sError, LineStream, LogConnection, LogStreamer};
use logfan_types::{LogLine, LogRequest, SourceRef};

use crate::error::LogsResult;
use crate::filter::LineFilter;
use crate::sink::OutputSink;

/// Streams one source's log connection through the filter into the sink
///
/// The request, filter and sink are fixed at construction and shared by
/// every source the supervisor admits.
pub struct SourceReader {
    streamer: Arc<dyn LogStreamer>,
    request: LogRequest,
    filter: Arc<LineFilter>,
    sink: Arc<OutputSink>,
}

impl SourceReader {
    pub fn new(
        streamer: Arc<dyn LogStreamer>,
        request: LogRequest,
        filter: Arc<LineFilter>,
        sink: Arc<OutputSink>,
    ) -> Self {
        Self {
            streamer,
            request,
            filter,
            sink,
        }
    }

    /// Stream `source` until the upstream closes or `cancel` fires
    ///
    /// Both line streams are drained and the connection's completion is
    /// awaited before returning. Cancellation is not an error.
    pub async fn run(&self, source: &SourceRef, cancel: CancellationToken) -> LogsResult<()> {
        let open = self.streamer.open(source, &self.request, cancel.clone());
        let connection = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connection = open => connection?,
        };

        let LogConnection {
            primary,
            diagnostic,
            completion,
        } = connection;

        let (primary, diagnostic, completion) = tokio::join!(
            self.forward(source, primary),
            self.forward(source, diagnostic),
            completion,
        );

        completion?;
        let emitted = primary.map_err(K8sError::from)? + diagnostic.map_err(K8sError::from)?;
        tracing::trace!(source = %source, emitted, "log stream closed");
        Ok(())
    }

    /// Forward accepted lines, returning how many were emitted
    async fn forward(&self, source: &SourceRef, mut lines: LineStream) -> std::io::Result<usize> {
        let mut emitted = 0;
        while let Some(message) = lines.try_next().await? {
            if !self.filter.accepts(&message) {
                continue;
            }
            self.sink.write(&LogLine::new(
                source.clone(),
                self.request.container.clone(),
                message,
            ));
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogsError;
    use crate::sink::tests::SharedBuffer;
    use logfan_k8s::mock::{MockLog, MockLogStreamer};
    use logfan_types::StreamOptions;
    use std::time::Duration;

    fn reader(
        streamer: Arc<MockLogStreamer>,
        request: LogRequest,
        filter: LineFilter,
    ) -> (SourceReader, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let sink = OutputSink::with_writer(Box::new(buffer.clone()), &StreamOptions::default(), false)
            .unwrap();
        let reader = SourceReader::new(streamer, request, Arc::new(filter), Arc::new(sink));
        (reader, buffer)
    }

    #[tokio::test]
    async fn test_reader_forwards_both_streams_through_filter() {
        let streamer = Arc::new(MockLogStreamer::new());
        let source = SourceRef::new("ops", "p1");
        streamer.set_log(
            source.clone(),
            MockLog::lines(&["GET /api", "GET /healthz", "POST /api"]).stderr(&["GET /warn"]),
        );
        let filter = LineFilter::compile(Some("GET"), Some("healthz")).unwrap();
        let (reader, buffer) = reader(streamer, LogRequest::default(), filter);

        reader.run(&source, CancellationToken::new()).await.unwrap();

        let mut lines = buffer.lines();
        lines.sort();
        assert_eq!(lines, vec!["ops/p1 | GET /api", "ops/p1 | GET /warn"]);
    }

    #[tokio::test]
    async fn test_reader_passes_request_through() {
        let streamer = Arc::new(MockLogStreamer::new());
        let request = LogRequest {
            container: Some("app".to_string()),
            follow: true,
            tail_lines: Some(5),
            since_seconds: Some(60),
            timestamps: true,
            previous: true,
        };
        let (reader, _) = reader(streamer.clone(), request.clone(), LineFilter::default());

        reader
            .run(&SourceRef::new("ops", "p1"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(streamer.opened(), vec![(SourceRef::new("ops", "p1"), request)]);
    }

    #[tokio::test]
    async fn test_reader_returns_after_cancel() {
        let streamer = Arc::new(MockLogStreamer::holding_open());
        let source = SourceRef::new("ops", "p1");
        streamer.set_log(source.clone(), MockLog::lines(&["first"]).held_open());
        let (reader, buffer) = reader(streamer.clone(), LogRequest::default(), LineFilter::default());

        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };
        let (result, _) = tokio::join!(reader.run(&source, cancel), stopper);

        assert!(result.is_ok());
        assert_eq!(buffer.lines(), vec!["ops/p1 | first"]);
        assert_eq!(streamer.open_count(), 0);
    }

    #[tokio::test]
    async fn test_reader_reports_open_failure() {
        let streamer = Arc::new(MockLogStreamer::new());
        let source = SourceRef::new("ops", "p1");
        streamer.set_log(source.clone(), MockLog::failing_open());
        let (reader, _) = reader(streamer, LogRequest::default(), LineFilter::default());

        let result = reader.run(&source, CancellationToken::new()).await;
        assert!(matches!(result, Err(LogsError::Cluster(_))));
    }

    #[tokio::test]
    async fn test_reader_reports_completion_failure_after_draining() {
        let streamer = Arc::new(MockLogStreamer::new());
        let source = SourceRef::new("ops", "p1");
        streamer.set_log(
            source.clone(),
            MockLog::lines(&["a", "b"]).failing_completion(),
        );
        let (reader, buffer) = reader(streamer, LogRequest::default(), LineFilter::default());

        let result = reader.run(&source, CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(buffer.lines(), vec!["ops/p1 | a", "ops/p1 | b"]);
    }
}
