use std::sync::Arc;

use crate::configuration::{OperationContext, Outcome, Worker, WorkerError, WorkerFactory};
use crate::partition::KeyPicker;
use crate::record::random_amount;
use crate::store::WorkloadStore;
use crate::workers::{missing_key, new_rng, RngGen};

/// Creates workers which set a new random amount on existing documents.
pub struct UpdateWorkerFactory {
    store: Arc<dyn WorkloadStore>,
    picker: KeyPicker,
}

impl UpdateWorkerFactory {
    pub fn new(store: Arc<dyn WorkloadStore>, picker: KeyPicker) -> Self {
        Self { store, picker }
    }
}

impl WorkerFactory for UpdateWorkerFactory {
    fn create(&self, _worker_index: u64) -> Box<dyn Worker> {
        Box::new(UpdateWorker {
            store: Arc::clone(&self.store),
            picker: self.picker.clone(),
            gen: new_rng(),
        })
    }
}

#[derive(Worker)]
struct UpdateWorker {
    store: Arc<dyn WorkloadStore>,
    picker: KeyPicker,
    gen: RngGen,
}

impl UpdateWorker {
    async fn execute(&mut self, _ctx: &OperationContext) -> Result<Outcome, WorkerError> {
        let picked = match self.picker.pick(&mut self.gen) {
            Some(picked) => picked,
            None => return Ok(Outcome::NotReady),
        };

        let amount = random_amount(&mut self.gen);
        if self.store.update_amount(picked.key, amount).await? {
            Ok(Outcome::Completed)
        } else {
            Err(missing_key("update", &picked))
        }
    }
}
