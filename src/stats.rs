//! Aggregation of worker samples into the live report and the final summary.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use hdrhistogram::Histogram;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::configuration::WorkerCounts;
use crate::report::ReportSink;
use crate::sample::{new_latency_histogram, OpKind, OperationSample};

/// Operations per second achieved by `workers` workers of the same kind,
/// given the operations they completed and the time they spent on them.
pub fn throughput(workers: u64, op_count: u64, elapsed_micros: u64) -> u64 {
    if elapsed_micros == 0 {
        return 0;
    }
    ((workers * op_count) as f64 / (elapsed_micros as f64 / 1_000_000.0)) as u64
}

/// Average latency of an operation in microseconds.
pub fn avg_latency_micros(op_count: u64, elapsed_micros: u64) -> u64 {
    if op_count == 0 {
        return 0;
    }
    elapsed_micros / op_count
}

/// Counts occurrences of each distinct error message.
pub fn group_errors<'a>(errors: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, u64> {
    let mut grouped = BTreeMap::new();
    count_errors(&mut grouped, errors);
    grouped
}

/// Adds the occurrences of each error message to `counts`.
fn count_errors<'a>(
    counts: &mut BTreeMap<String, u64>,
    errors: impl IntoIterator<Item = &'a str>,
) {
    for error in errors {
        *counts.entry(error.to_string()).or_insert(0) += 1;
    }
}

/// One row of the live report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportRow {
    pub kind: OpKind,
    pub per_second: u64,
    pub avg_latency_micros: u64,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
struct WindowCounters {
    op_count: u64,
    elapsed_micros: u64,
    errors: BTreeMap<String, u64>,
}

/// Per-kind totals since the beginning of the current report window.
pub struct WindowedStats {
    workers: WorkerCounts,
    window: Duration,
    window_start: Instant,
    counters: BTreeMap<OpKind, WindowCounters>,
}

impl WindowedStats {
    pub fn new(workers: WorkerCounts, window: Duration, now: Instant) -> Self {
        Self {
            workers,
            window,
            window_start: now,
            counters: BTreeMap::new(),
        }
    }

    pub fn absorb(&mut self, sample: &OperationSample) {
        let counters = self.counters.entry(sample.kind).or_default();
        counters.op_count += sample.op_count;
        counters.elapsed_micros += sample.elapsed_micros;
        count_errors(&mut counters.errors, sample.errors.iter().map(String::as_str));
    }

    /// Whether the window has lasted longer than configured.
    pub fn window_elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) > self.window
    }

    /// Forgets everything and starts a new window at `now`.
    pub fn roll(&mut self, now: Instant) {
        self.counters.clear();
        self.window_start = now;
    }

    /// Rows of the report, one per kind of operation.
    pub fn rows(&self) -> Vec<ReportRow> {
        OpKind::iter()
            .map(|kind| {
                let counters = self.counters.get(&kind).cloned().unwrap_or_default();
                ReportRow {
                    kind,
                    per_second: throughput(
                        self.workers.get(kind),
                        counters.op_count,
                        counters.elapsed_micros,
                    ),
                    avg_latency_micros: avg_latency_micros(
                        counters.op_count,
                        counters.elapsed_micros,
                    ),
                    errors: counters.errors,
                }
            })
            .collect()
    }
}

struct KindTotals {
    op_count: u64,
    error_count: u64,
    errors: BTreeMap<String, u64>,
    latencies: Histogram<u64>,
}

impl Default for KindTotals {
    fn default() -> Self {
        Self {
            op_count: 0,
            error_count: 0,
            errors: BTreeMap::new(),
            latencies: new_latency_histogram(),
        }
    }
}

/// Cumulative totals of the whole run.
#[derive(Default)]
pub struct RunTotals {
    kinds: BTreeMap<OpKind, KindTotals>,
}

impl RunTotals {
    pub fn absorb(&mut self, sample: &OperationSample) {
        let totals = self.kinds.entry(sample.kind).or_default();
        totals.op_count += sample.op_count;
        totals.error_count += sample.errors.len() as u64;
        count_errors(&mut totals.errors, sample.errors.iter().map(String::as_str));
        // Both histograms have the same configuration, so this cannot fail
        let _ = totals.latencies.add(&sample.latencies);
    }

    /// Summarizes the kinds which had workers configured.
    pub fn summary(&self, workers: &WorkerCounts, elapsed: Duration) -> RunSummary {
        let empty = KindTotals::default();
        let kinds = OpKind::iter()
            .filter(|kind| workers.get(*kind) > 0)
            .map(|kind| {
                let totals = self.kinds.get(&kind).unwrap_or(&empty);
                let ops_per_second = if elapsed.is_zero() {
                    0.0
                } else {
                    totals.op_count as f64 / elapsed.as_secs_f64()
                };
                KindSummary {
                    kind,
                    op_count: totals.op_count,
                    ops_per_second,
                    error_count: totals.error_count,
                    errors: totals.errors.clone(),
                    mean: Duration::from_micros(totals.latencies.mean() as u64),
                    p50: Duration::from_micros(totals.latencies.value_at_quantile(0.5)),
                    p99: Duration::from_micros(totals.latencies.value_at_quantile(0.99)),
                    max: Duration::from_micros(totals.latencies.max()),
                }
            })
            .collect();
        RunSummary { elapsed, kinds }
    }
}

/// The results of a whole run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub kinds: Vec<KindSummary>,
}

impl RunSummary {
    pub fn kind(&self, kind: OpKind) -> Option<&KindSummary> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

#[derive(Clone, Debug)]
pub struct KindSummary {
    pub kind: OpKind,
    pub op_count: u64,
    pub ops_per_second: f64,
    pub error_count: u64,
    pub errors: BTreeMap<String, u64>,
    pub mean: Duration,
    pub p50: Duration,
    pub p99: Duration,
    pub max: Duration,
}

/// Consumes the samples of all workers and keeps the report up to date.
pub struct StatAggregator {
    samples: mpsc::Receiver<OperationSample>,
    workers: WorkerCounts,
    tick_interval: Duration,
    report_window: Duration,
    sink: Box<dyn ReportSink>,
}

impl StatAggregator {
    pub fn new(
        samples: mpsc::Receiver<OperationSample>,
        workers: WorkerCounts,
        tick_interval: Duration,
        report_window: Duration,
        sink: Box<dyn ReportSink>,
    ) -> Self {
        Self {
            samples,
            workers,
            tick_interval,
            report_window,
            sink,
        }
    }

    /// Runs until every sample sender is gone, then reports and returns
    /// the summary of the run.
    ///
    /// Samples are buffered as they arrive and folded into the statistics
    /// on the next render tick.
    pub async fn run(mut self) -> Result<RunSummary> {
        let start_time = Instant::now();
        let mut window = WindowedStats::new(self.workers, self.report_window, start_time);
        let mut totals = RunTotals::default();
        let mut pending: Vec<OperationSample> = Vec::new();

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                sample = self.samples.recv() => match sample {
                    Some(sample) => pending.push(sample),
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if window.window_elapsed(now) {
                        window.roll(now);
                        self.sink.new_frame()?;
                    }
                    if !pending.is_empty() {
                        for sample in pending.drain(..) {
                            window.absorb(&sample);
                            totals.absorb(&sample);
                        }
                        self.sink.render(&window.rows())?;
                    }
                }
            }
        }

        // Final flushes of the workers
        if !pending.is_empty() {
            for sample in pending.drain(..) {
                window.absorb(&sample);
                totals.absorb(&sample);
            }
            self.sink.render(&window.rows())?;
        }

        let summary = totals.summary(&self.workers, start_time.elapsed());
        self.sink.summary(&summary)?;
        Ok(summary)
    }
}
