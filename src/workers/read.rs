use std::sync::Arc;

use crate::configuration::{OperationContext, Outcome, Worker, WorkerError, WorkerFactory};
use crate::partition::KeyPicker;
use crate::store::WorkloadStore;
use crate::workers::{missing_key, new_rng, RngGen};

/// Creates workers which read documents by key. The same factory serves
/// reads from the primary and from a secondary node, depending on the store
/// it is given.
pub struct ReadWorkerFactory {
    store: Arc<dyn WorkloadStore>,
    picker: KeyPicker,
    node: &'static str,
}

impl ReadWorkerFactory {
    pub fn primary(store: Arc<dyn WorkloadStore>, picker: KeyPicker) -> Self {
        Self {
            store,
            picker,
            node: "primary",
        }
    }

    pub fn secondary(store: Arc<dyn WorkloadStore>, picker: KeyPicker) -> Self {
        Self {
            store,
            picker,
            node: "secondary",
        }
    }
}

impl WorkerFactory for ReadWorkerFactory {
    fn create(&self, _worker_index: u64) -> Box<dyn Worker> {
        Box::new(ReadWorker {
            store: Arc::clone(&self.store),
            picker: self.picker.clone(),
            node: self.node,
            gen: new_rng(),
        })
    }
}

#[derive(Worker)]
struct ReadWorker {
    store: Arc<dyn WorkloadStore>,
    picker: KeyPicker,
    node: &'static str,
    gen: RngGen,
}

impl ReadWorker {
    async fn execute(&mut self, _ctx: &OperationContext) -> Result<Outcome, WorkerError> {
        let picked = match self.picker.pick(&mut self.gen) {
            Some(picked) => picked,
            None => return Ok(Outcome::NotReady),
        };

        match self.store.find_by_key(picked.key).await? {
            Some(_) => Ok(Outcome::Completed),
            None => Err(missing_key(&format!("read on {}", self.node), &picked)),
        }
    }
}
