use std::sync::Arc;

use tracing::trace;

use crate::configuration::{OperationContext, Outcome, Worker, WorkerError, WorkerFactory};
use crate::store::WorkloadStore;

/// Creates workers which repeatedly total the workload per category.
pub struct AggregationWorkerFactory {
    store: Arc<dyn WorkloadStore>,
}

impl AggregationWorkerFactory {
    pub fn new(store: Arc<dyn WorkloadStore>) -> Self {
        Self { store }
    }
}

impl WorkerFactory for AggregationWorkerFactory {
    fn create(&self, _worker_index: u64) -> Box<dyn Worker> {
        Box::new(AggregationWorker {
            store: Arc::clone(&self.store),
        })
    }
}

#[derive(Worker)]
struct AggregationWorker {
    store: Arc<dyn WorkloadStore>,
}

impl AggregationWorker {
    async fn execute(&mut self, ctx: &OperationContext) -> Result<Outcome, WorkerError> {
        let totals = self.store.aggregate_by_category().await?;
        trace!(
            operation_id = ctx.operation_id,
            groups = totals.len(),
            "aggregated",
        );
        Ok(Outcome::Completed)
    }
}
