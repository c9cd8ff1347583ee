//! Fan-out supervisor: admits sources, runs one reader task per source and
//! tears everything down on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use logfan_k8s::{LogStreamer, PodLister, WorkloadResolver};
use logfan_types::{LogRequest, SourceRef, StreamOptions};

use crate::error::LogsResult;
use crate::filter::LineFilter;
use crate::reader::SourceReader;
use crate::resolver::SourceResolver;
use crate::sink::OutputSink;

/// Outcome of one admission attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Started,
    AlreadyActive,
    CapacityReached,
}

/// Sources with a running reader, each with the token that stops it
#[derive(Default)]
pub struct ActiveSet {
    readers: Mutex<HashMap<SourceRef, CancellationToken>>,
}

impl ActiveSet {
    /// Insert `source` unless it is already active or `max` readers are
    /// running (0 is unlimited)
    fn try_insert(&self, source: &SourceRef, max: usize, token: CancellationToken) -> Admission {
        let mut readers = self.readers.lock();
        if readers.contains_key(source) {
            return Admission::AlreadyActive;
        }
        if max > 0 && readers.len() >= max {
            return Admission::CapacityReached;
        }
        readers.insert(source.clone(), token);
        Admission::Started
    }

    fn remove(&self, source: &SourceRef) {
        self.readers.lock().remove(source);
    }

    /// Fire every reader's token
    fn cancel_all(&self) {
        let tokens: Vec<_> = self.readers.lock().values().cloned().collect();
        for token in tokens {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.lock().is_empty()
    }

    pub fn contains(&self, source: &SourceRef) -> bool {
        self.readers.lock().contains_key(source)
    }
}

/// Counters reported when a run ends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Sources a reader was started for
    pub admitted: usize,
    /// Distinct sources skipped because the admission cap was reached
    pub skipped: usize,
    /// Readers that ended with an error
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicUsize,
    skipped: Mutex<HashSet<SourceRef>>,
    failed: AtomicUsize,
}

impl Counters {
    /// Record a capped-out source; true the first time it is seen
    fn record_skip(&self, source: &SourceRef) -> bool {
        self.skipped.lock().insert(source.clone())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            admitted: self.admitted.load(Ordering::Relaxed),
            skipped: self.skipped.lock().len(),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators the supervisor streams through
#[derive(Clone)]
pub struct Backends {
    pub pods: Arc<dyn PodLister>,
    pub workloads: Arc<dyn WorkloadResolver>,
    pub streamer: Arc<dyn LogStreamer>,
}

/// Drives one streaming invocation
///
/// Priming resolves the target and admits every source. In follow mode the
/// target is re-resolved on an interval and new sources are admitted until
/// the shutdown token fires; otherwise the run ends once every reader has
/// exited. Each reader gets a child of the shutdown token.
pub struct StreamSupervisor {
    resolver: SourceResolver,
    reader: Arc<SourceReader>,
    active: Arc<ActiveSet>,
    tracker: TaskTracker,
    counters: Arc<Counters>,

    /// Admission cap; 0 is unlimited
    max_sources: usize,

    follow: bool,
    follow_new_sources: bool,
    refresh_interval: Duration,
}

impl StreamSupervisor {
    /// Validate the options and wire up the resolver and reader
    pub fn new(
        options: &StreamOptions,
        backends: Backends,
        sink: Arc<OutputSink>,
    ) -> LogsResult<Self> {
        let filter = LineFilter::compile(options.grep.as_deref(), options.grep_v.as_deref())?;
        let resolver = SourceResolver::new(options, backends.pods, backends.workloads)?;
        let reader = SourceReader::new(
            backends.streamer,
            LogRequest::from_options(options),
            Arc::new(filter),
            sink,
        );

        Ok(Self {
            resolver,
            reader: Arc::new(reader),
            active: Arc::new(ActiveSet::default()),
            tracker: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
            max_sources: options.max_sources,
            follow: options.follow,
            follow_new_sources: options.follow_new_sources,
            refresh_interval: options.refresh_interval,
        })
    }

    /// Sources currently being streamed
    pub fn active(&self) -> Arc<ActiveSet> {
        Arc::clone(&self.active)
    }

    /// Run until done (one-shot) or until `shutdown` fires (follow)
    ///
    /// A supervisor is meant to be run once.
    pub async fn run(&self, shutdown: CancellationToken) -> LogsResult<RunSummary> {
        let sources = self.resolver.resolve().await?;
        if sources.is_empty() {
            return Err(self.resolver.no_sources_error());
        }
        tracing::debug!(count = sources.len(), "resolved log sources");

        for source in &sources {
            self.admit(source, &shutdown);
        }

        if self.follow {
            self.follow_loop(&shutdown).await;
        } else {
            self.tracker.close();
            tokio::select! {
                _ = self.tracker.wait() => {}
                _ = shutdown.cancelled() => {}
            }
        }

        self.drain().await;

        let summary = self.counters.summary();
        tracing::debug!(?summary, "log streaming finished");
        Ok(summary)
    }

    /// Try to start a reader for `source`
    fn admit(&self, source: &SourceRef, shutdown: &CancellationToken) -> Admission {
        let token = shutdown.child_token();
        let admission = self
            .active
            .try_insert(source, self.max_sources, token.clone());

        match admission {
            Admission::Started => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(source = %source, "streaming logs");

                let reader = Arc::clone(&self.reader);
                let active = Arc::clone(&self.active);
                let counters = Arc::clone(&self.counters);
                let source = source.clone();
                self.tracker.spawn(async move {
                    if let Err(e) = reader.run(&source, token).await {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(source = %source, error = %e, "log stream failed");
                    }
                    active.remove(&source);
                });
            }
            Admission::AlreadyActive => {}
            Admission::CapacityReached => {
                if self.counters.record_skip(source) {
                    tracing::warn!(
                        source = %source,
                        max = self.max_sources,
                        "max concurrent log streams reached, skipping pod"
                    );
                }
            }
        }
        admission
    }

    async fn follow_loop(&self, shutdown: &CancellationToken) {
        if !self.follow_new_sources {
            shutdown.cancelled().await;
            return;
        }

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; priming already resolved
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,

                        result = self.resolver.resolve() => match result {
                            Ok(sources) => {
                                for source in &sources {
                                    self.admit(source, shutdown);
                                }
                            }
                            Err(e) => tracing::debug!(error = %e, "re-resolving log sources failed"),
                        },
                    }
                }
            }
        }
    }

    /// Stop every reader and wait for all of them to exit
    async fn drain(&self) {
        self.active.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
