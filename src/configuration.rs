use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::time::Instant;

pub use worker_macro::Worker;

use crate::run::WorkerSession;
use crate::sample::OpKind;
use crate::store::StoreError;

/// How often workers flush their counters and the report is redrawn,
/// unless configured otherwise.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Length of the rolling report window. After it elapses the aggregated
/// statistics are reset and the report starts a fresh frame.
pub const DEFAULT_REPORT_WINDOW: Duration = Duration::from_secs(10);

/// Capacity of the channel carrying samples from workers to the aggregator.
pub const DEFAULT_SAMPLE_BUFFER: usize = 1024;

/// Connection strings of the stores used by a harness instance.
#[derive(Clone, Debug, Default)]
pub struct StoreUris {
    /// The store under test.
    pub primary: String,

    /// A secondary node of the store under test. Empty disables
    /// secondary reads.
    pub secondary: String,

    /// The store which keeps coordination records and insert worker state.
    pub metadata: String,
}

impl StoreUris {
    pub fn secondary(&self) -> Option<&str> {
        (!self.secondary.is_empty()).then_some(self.secondary.as_str())
    }
}

/// Number of workers to spawn for each kind of operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub insert: u64,
    pub read_by_key: u64,
    pub secondary_read: u64,
    pub update: u64,
    pub aggregate: u64,
}

impl WorkerCounts {
    pub fn get(&self, kind: OpKind) -> u64 {
        match kind {
            OpKind::Insert => self.insert,
            OpKind::ReadByKey => self.read_by_key,
            OpKind::SecondaryRead => self.secondary_read,
            OpKind::Update => self.update,
            OpKind::Aggregate => self.aggregate,
        }
    }

    /// Number of workers which pick their keys from insert workers' ranges.
    pub fn key_readers(&self) -> u64 {
        self.read_by_key + self.secondary_read + self.update
    }
}

/// Defines the benchmark run performed by a harness instance.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub workers: WorkerCounts,

    /// Interval at which every worker hands its accumulated counters
    /// to the aggregator, and at which the report is redrawn.
    pub tick_interval: Duration,

    /// See [`DEFAULT_REPORT_WINDOW`].
    pub report_window: Duration,

    /// The fixed wall-clock budget of the run.
    pub run_duration: Duration,

    /// Capacity of the sample channel. When the aggregator falls behind
    /// and the channel is full, new samples are dropped.
    pub sample_buffer: usize,

    /// Drop all benchmark data before the election.
    pub reset: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCounts::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            report_window: DEFAULT_REPORT_WINDOW,
            run_duration: Duration::from_secs(600),
            sample_buffer: DEFAULT_SAMPLE_BUFFER,
            reset: false,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.tick_interval > Duration::ZERO,
            "The stat tick interval must be positive",
        );
        anyhow::ensure!(
            self.run_duration > Duration::ZERO,
            "The run duration must be positive",
        );
        anyhow::ensure!(self.sample_buffer > 0, "The sample buffer must not be empty");
        anyhow::ensure!(
            self.workers.insert > 0 || self.workers.key_readers() == 0,
            "Read and update workers need at least one insert worker to pick keys from",
        );
        Ok(())
    }
}

/// Defines the set of workers spawned by the run controller.
pub struct Configuration {
    /// The maximum duration of the run. Workers are asked to stop once
    /// it elapses.
    pub max_duration: Duration,

    /// See [`HarnessConfig::tick_interval`].
    pub tick_interval: Duration,

    pub groups: Vec<WorkerGroup>,
}

/// A number of workers of the same kind, all created by one factory.
pub struct WorkerGroup {
    pub kind: OpKind,
    pub count: u64,
    pub factory: Arc<dyn WorkerFactory>,
}

/// Contains all necessary context needed to execute an operation.
pub struct OperationContext {
    /// Sequential number of the operation within its worker.
    pub operation_id: u64,

    /// The moment just before the operation was started.
    pub start_time: Instant,
}

/// The result of a single successful worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation was performed and should be accounted.
    Completed,

    /// There was nothing to operate on yet. The worker backs off
    /// before trying again.
    NotReady,
}

/// The failure of a single worker step.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The store call failed. Recoverable, reported in the sample.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store contradicts the key partitioning, e.g. a key inside
    /// an insert worker's published range is missing. Stops the run.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

/// Represents a loop which repeatedly performs one kind of operation.
///
/// Usually implemented with `#[derive(Worker)]`.
#[async_trait]
pub trait Worker: Send {
    /// Runs the worker until the session says it should stop.
    ///
    /// Returns an error only if the run must be aborted.
    async fn run(&mut self, session: WorkerSession) -> Result<()>;
}

/// Creates workers of a single kind.
pub trait WorkerFactory: Send + Sync {
    /// Creates the worker with given index within its group.
    fn create(&self, worker_index: u64) -> Box<dyn Worker>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let mut config = HarnessConfig {
            workers: WorkerCounts {
                insert: 2,
                read_by_key: 2,
                ..WorkerCounts::default()
            },
            ..HarnessConfig::default()
        };
        config.validate().unwrap();

        config.workers.insert = 0;
        assert!(config.validate().is_err());

        config.workers.read_by_key = 0;
        config.workers.aggregate = 3;
        config.validate().unwrap();

        config.tick_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secondary_uri() {
        let mut uris = StoreUris {
            primary: "mongodb://a".to_string(),
            secondary: String::new(),
            metadata: "mongodb://b".to_string(),
        };
        assert_eq!(uris.secondary(), None);
        uris.secondary = "mongodb://c".to_string();
        assert_eq!(uris.secondary(), Some("mongodb://c"));
    }
}
