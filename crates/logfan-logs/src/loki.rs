//! Historical queries against Loki's `query_range` API.
//!
//! This is the batch alternative to live tailing: one request, every series
//! merged into a single timestamp-ordered sequence, then filtered and written
//! through the same sink as live streams.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::Deserialize;

use logfan_types::{LogLine, SourceRef, StreamOptions};

use crate::error::{LogsError, LogsResult};
use crate::filter::LineFilter;
use crate::sink::OutputSink;

/// Environment variable consulted when no endpoint is configured
pub const LOKI_ENDPOINT_ENV: &str = "LOKI_ENDPOINT";

const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);
const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: QueryData,
}

#[derive(Debug, Default, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

/// One labelled stream from a query result
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub stream: HashMap<String, String>,

    /// `[unix_nanos, line]` pairs
    #[serde(default)]
    pub values: Vec<(String, String)>,
}

/// A log entry taken from a series
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LokiEntry {
    pub timestamp_ns: i64,
    pub source: SourceRef,
    pub line: String,
}

/// Pick the endpoint from configuration, then `LOKI_ENDPOINT`
pub fn resolve_endpoint(configured: Option<&str>) -> LogsResult<String> {
    endpoint_from(configured, std::env::var(LOKI_ENDPOINT_ENV).ok())
}

fn endpoint_from(configured: Option<&str>, env: Option<String>) -> LogsResult<String> {
    let raw = configured
        .map(str::to_string)
        .filter(|e| !e.trim().is_empty())
        .or(env.filter(|e| !e.trim().is_empty()))
        .ok_or(LogsError::LokiNotConfigured)?;

    let endpoint = raw.trim().trim_end_matches('/').to_string();
    reqwest::Url::parse(&endpoint).map_err(|_| LogsError::LokiEndpoint(endpoint.clone()))?;
    Ok(endpoint)
}

/// Source label for a series: `namespace/pod`, or the job, or `unknown`
pub fn source_label(labels: &HashMap<String, String>) -> SourceRef {
    let label = |key: &str| labels.get(key).map(String::as_str).filter(|v| !v.is_empty());

    let pod = label("pod")
        .or_else(|| label("pod_name"))
        .or_else(|| label("instance"));

    match pod {
        Some(pod) => SourceRef::new(label("namespace").unwrap_or_default(), pod),
        None => SourceRef::new("", label("job").unwrap_or("unknown")),
    }
}

/// Merge every series into one sequence ordered by timestamp
///
/// Entries with equal timestamps keep series order. Entries whose timestamp
/// does not parse are dropped.
pub fn merge_series(series: Vec<Series>) -> Vec<LokiEntry> {
    let sorted: Vec<Vec<LokiEntry>> = series
        .into_iter()
        .map(|series| {
            let source = source_label(&series.stream);
            let mut entries: Vec<_> = series
                .values
                .into_iter()
                .filter_map(|(ts, line)| match ts.trim().parse::<i64>() {
                    Ok(timestamp_ns) => Some(LokiEntry {
                        timestamp_ns,
                        source: source.clone(),
                        line,
                    }),
                    Err(_) => {
                        tracing::debug!(source = %source, timestamp = %ts, "skipping entry with invalid timestamp");
                        None
                    }
                })
                .collect();
            entries.sort_by_key(|e| e.timestamp_ns);
            entries
        })
        .collect();

    let total = sorted.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    let mut cursors: Vec<_> = sorted
        .into_iter()
        .map(|entries| entries.into_iter().peekable())
        .collect();

    // (timestamp, series index) min-heap holding each series' next entry
    let mut heap = BinaryHeap::new();
    for (index, cursor) in cursors.iter_mut().enumerate() {
        if let Some(first) = cursor.peek() {
            heap.push(Reverse((first.timestamp_ns, index)));
        }
    }

    while let Some(Reverse((_, index))) = heap.pop() {
        if let Some(entry) = cursors[index].next() {
            merged.push(entry);
        }
        if let Some(next) = cursors[index].peek() {
            heap.push(Reverse((next.timestamp_ns, index)));
        }
    }

    merged
}

/// HTTP client for one Loki endpoint
pub struct LokiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl LokiClient {
    pub fn new(endpoint: impl Into<String>) -> LogsResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run a range query over `[end - window, end]`
    pub async fn query_range(
        &self,
        query: &str,
        window: Duration,
        limit: i64,
        end: DateTime<Utc>,
    ) -> LogsResult<Vec<Series>> {
        let start = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| end.checked_sub_signed(window))
            .unwrap_or_default();
        let nanos = |t: DateTime<Utc>| t.timestamp_nanos_opt().unwrap_or_default().to_string();

        let url = format!("{}{}", self.endpoint, QUERY_RANGE_PATH);
        tracing::debug!(%url, query, limit, "querying Loki");

        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", nanos(start)),
                ("end", nanos(end)),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LogsError::LokiHttp {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            return Err(LogsError::LokiStatus(body.status));
        }
        Ok(body.data.result)
    }
}

/// Query Loki once and write the merged result through `sink`
///
/// The window is `options.since` (default one hour) and the limit is
/// `options.tail` when positive (default 100). Returns the number of lines
/// written.
pub async fn run_batch(
    client: &LokiClient,
    query: &str,
    options: &StreamOptions,
    sink: &OutputSink,
) -> LogsResult<usize> {
    let filter = LineFilter::compile(options.grep.as_deref(), options.grep_v.as_deref())?;
    let window = options.since.unwrap_or(DEFAULT_WINDOW);
    let limit = options.tail.filter(|n| *n > 0).unwrap_or(DEFAULT_LIMIT);

    let series = client.query_range(query, window, limit, Utc::now()).await?;
    let entries = merge_series(series);

    let mut written = 0;
    for entry in entries {
        let line = if options.timestamps {
            format!("{} {}", format_timestamp(entry.timestamp_ns), entry.line)
        } else {
            entry.line
        };
        if !filter.accepts(&line) {
            continue;
        }
        sink.write(&LogLine::new(entry.source, None, line));
        written += 1;
    }
    sink.flush();
    Ok(written)
}

fn format_timestamp(timestamp_ns: i64) -> String {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    let secs = timestamp_ns.div_euclid(NANOS_PER_SEC);
    let nanos = timestamp_ns.rem_euclid(NANOS_PER_SEC) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(t) => t
            .with_timezone(&Local)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => timestamp_ns.to_string(),
    }
}
