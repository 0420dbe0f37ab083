use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use strum_macros::{AsRefStr, EnumIter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

// This cannot panic since 1 <= sigfig <= 5.
const LATENCY_SIG_FIG: u8 = 3;

/// The kind of operation a worker generates.
///
/// Iteration order is the order of rows in the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum OpKind {
    Insert,
    ReadByKey,
    SecondaryRead,
    Aggregate,
    Update,
}

impl OpKind {
    /// Human-readable name used in the report.
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Insert => "Insert",
            OpKind::ReadByKey => "Reads by _id",
            OpKind::SecondaryRead => "Secondary Reads",
            OpKind::Aggregate => "Aggregations",
            OpKind::Update => "Updates",
        }
    }
}

pub fn new_latency_histogram() -> Histogram<u64> {
    Histogram::new(LATENCY_SIG_FIG).unwrap()
}

/// Counters accumulated by one worker during one reporting tick.
#[derive(Debug)]
pub struct OperationSample {
    pub kind: OpKind,

    /// Number of operations which succeeded.
    pub op_count: u64,

    /// Total time spent in the successful operations.
    pub elapsed_micros: u64,

    /// Descriptions of the operations which failed.
    pub errors: Vec<String>,

    /// Latencies of the successful operations, in microseconds.
    pub latencies: Histogram<u64>,
}

impl OperationSample {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            op_count: 0,
            elapsed_micros: 0,
            errors: Vec::new(),
            latencies: new_latency_histogram(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.op_count == 0 && self.errors.is_empty()
    }

    pub fn record_success(&mut self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.op_count += 1;
        self.elapsed_micros += micros;
        let _ = self.latencies.record(micros);
    }

    pub fn record_error(&mut self, description: String) {
        self.errors.push(description);
    }

    /// Returns the accumulated sample and starts a new, empty one.
    pub fn take(&mut self) -> OperationSample {
        let kind = self.kind;
        std::mem::replace(self, OperationSample::new(kind))
    }
}

/// The sending half of the channel between workers and the aggregator.
///
/// Sending never waits: if the aggregator does not keep up and the channel
/// is full, the sample is dropped. The first drop is logged.
#[derive(Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<OperationSample>,
    dropped: Arc<DropCounter>,
}

#[derive(Default)]
struct DropCounter {
    count: AtomicU64,
    reported: AtomicBool,
}

impl SampleSender {
    pub fn channel(capacity: usize) -> (SampleSender, mpsc::Receiver<OperationSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sender = SampleSender {
            tx,
            dropped: Arc::new(DropCounter::default()),
        };
        (sender, rx)
    }

    pub fn send(&self, sample: OperationSample) {
        match self.tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(sample)) => {
                self.dropped.count.fetch_add(1, Ordering::Relaxed);
                if !self.dropped.reported.swap(true, Ordering::Relaxed) {
                    warn!(
                        kind = sample.kind.as_ref(),
                        "stat aggregator is falling behind, dropping samples",
                    );
                }
            }
            // The aggregator is gone, nobody is interested anymore
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Number of samples dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_resets_counters() {
        let mut sample = OperationSample::new(OpKind::Update);
        sample.record_success(Duration::from_micros(120));
        sample.record_success(Duration::from_micros(80));
        sample.record_error("timeout".to_string());

        let taken = sample.take();
        assert_eq!(taken.kind, OpKind::Update);
        assert_eq!(taken.op_count, 2);
        assert_eq!(taken.elapsed_micros, 200);
        assert_eq!(taken.errors, vec!["timeout".to_string()]);
        assert_eq!(taken.latencies.len(), 2);

        assert!(sample.is_empty());
        assert_eq!(sample.kind, OpKind::Update);
        assert_eq!(sample.elapsed_micros, 0);
        assert_eq!(sample.latencies.len(), 0);
    }

    #[test]
    fn test_send_drops_when_full() {
        let (sender, mut rx) = SampleSender::channel(2);
        for _ in 0..5 {
            sender.send(OperationSample::new(OpKind::Insert));
        }
        assert_eq!(sender.dropped(), 3);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // There is room again
        sender.send(OperationSample::new(OpKind::Insert));
        assert!(rx.try_recv().is_ok());
        assert_eq!(sender.dropped(), 3);
    }

    #[test]
    fn test_send_after_close_is_ignored() {
        let (sender, rx) = SampleSender::channel(2);
        drop(rx);
        sender.send(OperationSample::new(OpKind::Insert));
        assert_eq!(sender.dropped(), 0);
    }

    #[test]
    fn test_labels() {
        assert_eq!(OpKind::ReadByKey.as_ref(), "read_by_key");
        assert_eq!(OpKind::SecondaryRead.label(), "Secondary Reads");
    }
}
