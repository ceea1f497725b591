//! Stage wiring: parser → aggregator → resolver over unbounded channels.
//!
//! Every stage is its own tokio task with one inbound and one outbound channel.
//! A stage suspends only on its inbound `recv`, racing it against the shared
//! [`ShutdownListener`]. Two ways to stop:
//!
//! - **Cancellation** ([`Pipeline::shutdown`]): every task leaves its loop at the next
//!   suspension point. Whatever is still queued is discarded.
//! - **Closed input** ([`Pipeline::close_input`] then [`Pipeline::join`]): the first
//!   channel stops accepting lines, queued items drain through all stages and each
//!   stage exits once its inbound channel is empty and closed. Draining is not
//!   time-limited; only cancelled tasks are aborted after the shutdown timeout.
//!
//! Anomaly reports leave through a caller-supplied sink channel; nothing else is
//! shared with the outside.

use crate::aggregator::WindowAggregator;
use crate::config::LogwatchConfig;
use crate::core::{AnomalyReport, ParsedRecord, StageStats, WindowSnapshot};
use crate::emitter::LogEmitter;
use crate::error::AppResult;
use crate::parser::{MatchMode, RecordParser};
use crate::resolver::AnomalyResolver;
use crate::shutdown::{Shutdown, ShutdownListener};
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long [`Pipeline::join`] waits for a cancelled task, or an emitter, before aborting it.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stage settings that do not come from the channel topology.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Record grammar mode for the parser stage.
    pub match_mode: MatchMode,
    /// Forget keys idle for longer than this.
    pub idle_key_ttl: Option<Duration>,
}

impl PipelineOptions {
    /// Options taken from the `pipeline` config section.
    pub fn from_config(config: &LogwatchConfig) -> Self {
        Self {
            match_mode: config.match_mode(),
            idle_key_ttl: config.pipeline.idle_key_ttl,
        }
    }
}

/// Per-stage counters collected once every task has exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    /// Lines sent by all emitters together.
    pub emitted: u64,
    /// Parser stage counters.
    pub parser: StageStats,
    /// Aggregator stage counters.
    pub aggregator: StageStats,
    /// Resolver stage counters.
    pub resolver: StageStats,
}

/// Parse raw lines, dropping the ones that fail the grammar.
pub async fn parser_stage(
    mut inbound: UnboundedReceiver<String>,
    outbound: UnboundedSender<ParsedRecord>,
    parser: RecordParser,
    mut shutdown: ShutdownListener,
) -> StageStats {
    info!(mode = ?parser.mode(), "Collector started");
    let mut stats = StageStats::default();

    loop {
        let raw = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            raw = inbound.recv() => raw,
        };
        let Some(raw) = raw else { break };
        stats.received += 1;
        trace!(%raw, "Collector received");

        match parser.parse(&raw) {
            Ok(record) => {
                if outbound.send(record).is_err() {
                    break;
                }
                stats.forwarded += 1;
            }
            Err(err) => {
                warn!(error = %err, "Bad log, dropping");
                stats.dropped += 1;
            }
        }
    }

    info!(%stats, "Collector stopped");
    stats
}

/// Keep the per-key windows and forward a snapshot for every full window.
///
/// The aggregator is moved into the task; nothing else can reach its table.
pub async fn aggregator_stage(
    mut inbound: UnboundedReceiver<ParsedRecord>,
    outbound: UnboundedSender<WindowSnapshot>,
    mut aggregator: WindowAggregator,
    mut shutdown: ShutdownListener,
) -> StageStats {
    info!(idle_key_ttl = ?aggregator.idle_ttl(), "Aggregator started");
    let mut stats = StageStats::default();

    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            record = inbound.recv() => record,
        };
        let Some(record) = record else { break };
        stats.received += 1;

        if let Some(snapshot) = aggregator.update(&record.key, record.value) {
            debug!(key = %snapshot.key, values = ?snapshot.values, "Window full");
            if outbound.send(snapshot).is_err() {
                break;
            }
            stats.forwarded += 1;
        }
    }

    info!(%stats, keys = aggregator.key_count(), "Aggregator stopped");
    stats
}

/// Check every snapshot and push anomaly reports into the sink.
pub async fn resolver_stage(
    mut inbound: UnboundedReceiver<WindowSnapshot>,
    sink: UnboundedSender<AnomalyReport>,
    resolver: AnomalyResolver,
    mut shutdown: ShutdownListener,
) -> StageStats {
    info!("Resolver started");
    let mut stats = StageStats::default();

    loop {
        let snapshot = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            snapshot = inbound.recv() => snapshot,
        };
        let Some(snapshot) = snapshot else { break };
        stats.received += 1;

        match resolver.try_check(&snapshot) {
            Ok(Some(report)) => {
                debug!(key = %report.key, values = ?report.values, "Source is broken");
                // A closed sink only means nobody listens any more.
                if sink.send(report).is_ok() {
                    stats.forwarded += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "Got bad snapshot, skipping");
                stats.dropped += 1;
            }
        }
    }

    info!(%stats, "Resolver stopped");
    stats
}

/// A running parser → aggregator → resolver chain plus any emitters feeding it.
pub struct Pipeline {
    input: Option<UnboundedSender<String>>,
    shutdown: Shutdown,
    parser: JoinHandle<StageStats>,
    aggregator: JoinHandle<StageStats>,
    resolver: JoinHandle<StageStats>,
    emitters: Vec<JoinHandle<u64>>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Spawn the three stages. Reports are sent into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(options: PipelineOptions, sink: UnboundedSender<AnomalyReport>) -> Self {
        let shutdown = Shutdown::new();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

        let aggregator = match options.idle_key_ttl {
            Some(ttl) => WindowAggregator::with_idle_ttl(ttl),
            None => WindowAggregator::new(),
        };

        let parser = tokio::spawn(parser_stage(
            raw_rx,
            record_tx,
            RecordParser::new(options.match_mode),
            shutdown.subscribe(),
        ));
        let aggregator = tokio::spawn(aggregator_stage(
            record_rx,
            snapshot_tx,
            aggregator,
            shutdown.subscribe(),
        ));
        let resolver = tokio::spawn(resolver_stage(
            snapshot_rx,
            sink,
            AnomalyResolver::new(),
            shutdown.subscribe(),
        ));

        Self {
            input: Some(raw_tx),
            shutdown,
            parser,
            aggregator,
            resolver,
            emitters: Vec::new(),
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    /// Override [`SHUTDOWN_TIMEOUT`] for this pipeline.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sender for raw lines, or `None` once input is closed.
    pub fn input(&self) -> Option<UnboundedSender<String>> {
        self.input.clone()
    }

    /// Start one task per emitter, all writing into the input channel.
    pub fn spawn_emitters(&mut self, emitters: impl IntoIterator<Item = LogEmitter>) {
        let Some(input) = self.input.as_ref() else {
            warn!("Input already closed, emitters not started");
            return;
        };
        for emitter in emitters {
            let handle = tokio::spawn(emitter.run(input.clone(), self.shutdown.subscribe()));
            self.emitters.push(handle);
        }
    }

    /// Forward lines from `reader` until the sentinel line or EOF, then close input.
    ///
    /// A line that is not valid UTF-8 is logged and skipped. Input is closed even
    /// when reading fails, so whatever was forwarded still drains on [`join`](Self::join).
    ///
    /// Returns the number of lines forwarded.
    pub async fn feed_until_sentinel<R>(&mut self, mut reader: R, sentinel: &str) -> AppResult<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let fed = self.forward_lines(&mut reader, sentinel).await;
        self.close_input();
        fed
    }

    async fn forward_lines<R>(&self, reader: &mut R, sentinel: &str) -> AppResult<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some(input) = self.input.as_ref() else {
            return Ok(0);
        };
        let mut buf = Vec::new();
        let mut fed = 0u64;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                debug!("Input reached EOF");
                break;
            }

            let line = match std::str::from_utf8(strip_line_ending(&buf)) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "Line is not valid UTF-8, dropping");
                    continue;
                }
            };
            if line == sentinel {
                debug!("Sentinel received, closing input");
                break;
            }
            if input.send(line.to_string()).is_err() {
                break;
            }
            fed += 1;
        }

        Ok(fed)
    }

    /// Stop accepting new lines. Stages drain what is queued, then exit.
    ///
    /// Emitters still hold their own senders; stop them with [`shutdown`](Self::shutdown).
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Signal cancellation without waiting.
    pub fn cancel(&self) {
        self.shutdown.trigger();
    }

    /// Cancel every task and wait for it to exit. Queued items are discarded.
    pub async fn shutdown(self) -> PipelineSummary {
        self.shutdown.trigger();
        self.join().await
    }

    /// Run for `duration`, then shut down.
    pub async fn run_for(self, duration: Duration) -> PipelineSummary {
        tokio::time::sleep(duration).await;
        info!(?duration, "Run duration elapsed, shutting down");
        self.shutdown().await
    }

    /// Wait for every task to exit.
    ///
    /// Emitters get [`SHUTDOWN_TIMEOUT`] before they are aborted. Stages are only
    /// bounded after cancellation; with a closed input they run until drained.
    pub async fn join(mut self) -> PipelineSummary {
        self.input = None;
        let timeout = self.shutdown_timeout;

        let emitted: u64 = join_all(
            self.emitters
                .into_iter()
                .map(|handle| join_task("emitter", handle, Some(timeout))),
        )
        .await
        .into_iter()
        .sum();

        let stage_timeout = self.shutdown.is_triggered().then_some(timeout);
        let parser = join_task("collector", self.parser, stage_timeout).await;
        let aggregator = join_task("aggregator", self.aggregator, stage_timeout).await;
        let resolver = join_task("resolver", self.resolver, stage_timeout).await;

        // Keep the signal alive until every listener has returned.
        drop(self.shutdown);

        PipelineSummary {
            emitted,
            parser,
            aggregator,
            resolver,
        }
    }
}

async fn join_task<T: Default>(
    name: &str,
    mut handle: JoinHandle<T>,
    timeout: Option<Duration>,
) -> T {
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                error!(task = name, timeout = ?limit, "Task did not stop in time, aborting");
                handle.abort();
                return T::default();
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(value) => value,
        Err(err) => {
            error!(task = name, error = %err, "Task failed");
            T::default()
        }
    }
}

/// Line content without its trailing `\n` or `\r\n`.
fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Build the configured emitters: names `{prefix}{i}`, seeds `seed + i`.
pub fn emitters_from_config(config: &LogwatchConfig) -> Vec<LogEmitter> {
    let sources = &config.sources;
    (0..sources.count)
        .map(|i| {
            LogEmitter::new(format!("{}{}", sources.key_prefix, i), config.emitter_seed(i))
                .with_interval(sources.interval)
                .with_interval_jitter(sources.interval_jitter)
                .with_value_max(sources.value_max)
                .with_malformed_rate(sources.malformed_rate)
        })
        .collect()
}

/// Run emitters and stages for the configured duration.
pub async fn run_timed(
    config: &LogwatchConfig,
    sink: UnboundedSender<AnomalyReport>,
) -> PipelineSummary {
    let mut pipeline = Pipeline::spawn(PipelineOptions::from_config(config), sink);
    pipeline.spawn_emitters(emitters_from_config(config));
    info!(
        sources = config.sources.count,
        duration = ?config.pipeline.run_duration,
        "Pipeline running"
    );
    pipeline.run_for(config.pipeline.run_duration).await
}

/// Feed lines from `reader` until the configured sentinel, then drain and join.
pub async fn run_interactive<R>(
    config: &LogwatchConfig,
    reader: R,
    sink: UnboundedSender<AnomalyReport>,
) -> AppResult<PipelineSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut pipeline = Pipeline::spawn(PipelineOptions::from_config(config), sink);
    let fed = pipeline
        .feed_until_sentinel(reader, &config.pipeline.sentinel)
        .await;
    match fed {
        Ok(fed) => {
            info!(fed, "Input closed, draining");
            Ok(pipeline.join().await)
        }
        Err(err) => {
            error!(error = %err, "Reading input failed, draining queued lines");
            pipeline.join().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: UnboundedReceiver<AnomalyReport>) -> Vec<AnomalyReport> {
        let mut reports = Vec::new();
        while let Some(report) = rx.recv().await {
            reports.push(report);
        }
        reports
    }

    #[tokio::test]
    async fn parser_stage_forwards_valid_and_drops_malformed() {
        let shutdown = Shutdown::new();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        for line in ["p0:1", "garbage", "p1:22", "p2:"] {
            raw_tx.send(line.to_string()).unwrap();
        }
        drop(raw_tx);

        let stats = parser_stage(raw_rx, out_tx, RecordParser::default(), shutdown.subscribe()).await;
        assert_eq!(
            stats,
            StageStats {
                received: 4,
                forwarded: 2,
                dropped: 2
            }
        );
        assert_eq!(out_rx.recv().await, Some(ParsedRecord::new("p0", 1)));
        assert_eq!(out_rx.recv().await, Some(ParsedRecord::new("p1", 22)));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn resolver_stage_counts_bad_snapshots() {
        let shutdown = Shutdown::new();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();

        in_tx
            .send(WindowSnapshot {
                key: "p0".into(),
                values: vec![1, 1],
            })
            .unwrap();
        in_tx
            .send(WindowSnapshot {
                key: "p0".into(),
                values: vec![2, 2, 2],
            })
            .unwrap();
        drop(in_tx);

        let stats = resolver_stage(in_rx, sink_tx, AnomalyResolver::new(), shutdown.subscribe()).await;
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.forwarded, 1);

        let reports = collect(sink_rx).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].values, [2, 2, 2]);
    }

    #[tokio::test]
    async fn stage_exits_on_shutdown_with_open_input() {
        let shutdown = Shutdown::new();
        let (_raw_tx, raw_rx) = mpsc::unbounded_channel::<String>();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(parser_stage(
            raw_rx,
            out_tx,
            RecordParser::default(),
            shutdown.subscribe(),
        ));

        shutdown.trigger();
        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("stage did not stop")
            .unwrap();
        assert_eq!(stats, StageStats::default());
    }

    #[tokio::test]
    async fn closed_input_drains_through_all_stages() {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::spawn(PipelineOptions::default(), sink_tx);
        let input = pipeline.input().unwrap();
        for line in ["p0:5", "p0:5", "bad", "p0:5", "p0:2"] {
            input.send(line.to_string()).unwrap();
        }
        drop(input);
        pipeline.close_input();
        assert!(pipeline.input().is_none());

        let summary = pipeline.join().await;
        assert_eq!(summary.parser.received, 5);
        assert_eq!(summary.parser.dropped, 1);
        assert_eq!(summary.aggregator.forwarded, 2);
        assert_eq!(summary.resolver.forwarded, 1);

        let reports = collect(sink_rx).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key, "p0");
        assert_eq!(reports[0].values, [5, 5, 5]);
    }

    #[tokio::test]
    async fn feed_stops_at_sentinel() {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::spawn(PipelineOptions::default(), sink_tx);
        let input: &[u8] = b"a:1\na:1\na:1\nX\na:2\na:2\na:2\n";

        let fed = pipeline.feed_until_sentinel(input, "X").await.unwrap();
        assert_eq!(fed, 3);
        assert!(pipeline.input().is_none());

        let summary = pipeline.join().await;
        assert_eq!(summary.parser.received, 3);
        let reports = collect(sink_rx).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].values, [1, 1, 1]);
    }

    #[tokio::test]
    async fn strict_mode_drops_trailing_garbage() {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let options = PipelineOptions {
            match_mode: MatchMode::FullLine,
            idle_key_ttl: None,
        };
        let mut pipeline = Pipeline::spawn(options, sink_tx);
        let input: &[u8] = b"a:1x\na:1\na:1\na:1\n";
        pipeline.feed_until_sentinel(input, "X").await.unwrap();

        let summary = pipeline.join().await;
        assert_eq!(summary.parser.dropped, 1);
        assert_eq!(collect(sink_rx).await.len(), 1);
    }

    #[tokio::test]
    async fn feed_skips_invalid_utf8_and_strips_crlf() {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::spawn(PipelineOptions::default(), sink_tx);
        let input: &[u8] = b"a:4\r\n\xff\xfe\na:4\r\na:4\nX\r\na:5\n";

        let fed = pipeline.feed_until_sentinel(input, "X").await.unwrap();
        assert_eq!(fed, 3);

        let summary = pipeline.join().await;
        assert_eq!(summary.parser.received, 3);
        assert_eq!(summary.parser.dropped, 0);
        let reports = collect(sink_rx).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].values, [4, 4, 4]);
    }

    #[tokio::test]
    async fn closed_input_drain_is_not_time_limited() {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let mut pipeline =
            Pipeline::spawn(PipelineOptions::default(), sink_tx).with_shutdown_timeout(Duration::ZERO);
        let input = pipeline.input().unwrap();
        for i in 0..3000 {
            input.send(format!("p{}:7", i % 10)).unwrap();
        }
        drop(input);
        pipeline.close_input();

        let summary = pipeline.join().await;
        assert_eq!(summary.parser.received, 3000);
        assert_eq!(summary.aggregator.forwarded, 2980);
        assert_eq!(summary.resolver.forwarded, 2980);
        assert_eq!(collect(sink_rx).await.len(), 2980);
    }

    #[tokio::test]
    async fn cancelled_join_respects_timeout() {
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::spawn(PipelineOptions::default(), sink_tx)
            .with_shutdown_timeout(Duration::from_millis(200));
        let _input = pipeline.input().unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), pipeline.shutdown())
            .await
            .expect("shutdown did not finish");
        assert_eq!(summary.parser, StageStats::default());
    }

    #[test]
    fn line_endings_are_stripped() {
        assert_eq!(strip_line_ending(b"a:1\r\n"), b"a:1");
        assert_eq!(strip_line_ending(b"a:1\n"), b"a:1");
        assert_eq!(strip_line_ending(b"a:1"), b"a:1");
        assert_eq!(strip_line_ending(b"\r"), b"");
    }

    #[test]
    fn emitters_follow_config() {
        let mut config = LogwatchConfig::default();
        config.sources.count = 3;
        config.sources.key_prefix = "node".to_string();
        config.sources.seed = Some(10);

        let emitters = emitters_from_config(&config);
        let names: Vec<_> = emitters.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["node0", "node1", "node2"]);

        let mut a = emitters_from_config(&config);
        let mut b = emitters_from_config(&config);
        for (ea, eb) in a.iter_mut().zip(b.iter_mut()) {
            assert_eq!(ea.next_line(), eb.next_line());
        }
    }
}
