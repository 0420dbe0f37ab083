use std::sync::Arc;

use tracing::debug;

use crate::configuration::{OperationContext, Outcome, Worker, WorkerError, WorkerFactory};
use crate::partition::{KeyAllocator, KeySpace};
use crate::record::DocumentRecord;
use crate::store::WorkloadStore;
use crate::workers::{new_rng, RngGen};

/// Creates insert workers. The worker with local index `i` writes
/// the key range of the `i`-th worker of the key space.
pub struct InsertWorkerFactory {
    store: Arc<dyn WorkloadStore>,
    key_space: Arc<KeySpace>,
}

impl InsertWorkerFactory {
    pub fn new(store: Arc<dyn WorkloadStore>, key_space: Arc<KeySpace>) -> Self {
        Self { store, key_space }
    }
}

impl WorkerFactory for InsertWorkerFactory {
    fn create(&self, worker_index: u64) -> Box<dyn Worker> {
        let state = self.key_space.worker(worker_index as usize);
        Box::new(InsertWorker {
            store: Arc::clone(&self.store),
            keys: KeyAllocator::new(Arc::clone(state)),
            gen: new_rng(),
        })
    }
}

#[derive(Worker)]
struct InsertWorker {
    store: Arc<dyn WorkloadStore>,
    keys: KeyAllocator,
    gen: RngGen,
}

impl InsertWorker {
    async fn execute(&mut self, _ctx: &OperationContext) -> Result<Outcome, WorkerError> {
        let key = self.keys.next_key().ok_or_else(|| {
            WorkerError::InvariantViolation(format!(
                "insert worker {} has exhausted its key range",
                self.keys.state().worker_index(),
            ))
        })?;

        let record = DocumentRecord::generate(key, &mut self.gen);
        // On failure the key is not committed and the next attempt reuses it
        match self.store.insert(&record).await {
            Ok(()) => {}
            // Nobody else writes this range, so a previous attempt was
            // applied even though it reported an error
            Err(err) if err.is_duplicate_key() => {
                debug!(key, "document of a failed insert is present, moving on");
            }
            Err(err) => return Err(err.into()),
        }
        self.keys.commit(key);
        Ok(Outcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::WorkerSession;
    use crate::sample::OpKind;
    use crate::store::memory::MemoryWorkloadStore;
    use crate::test_util::{finish_session, test_session};

    async fn steps(worker: &mut InsertWorker, session: &mut WorkerSession, count: usize) {
        for _ in 0..count {
            let ctx = session.start().unwrap();
            let result = worker.execute(&ctx).await;
            session.end(&ctx, result).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_inserts_dense_keys() {
        let store = Arc::new(MemoryWorkloadStore::new());
        let key_space = Arc::new(KeySpace::new([4, 9]));
        let mut worker = InsertWorker {
            store: Arc::clone(&store) as Arc<dyn WorkloadStore>,
            keys: KeyAllocator::new(Arc::clone(key_space.worker(1))),
            gen: new_rng(),
        };
        let (mut session, stop, mut samples) = test_session(OpKind::Insert);

        steps(&mut worker, &mut session, 5).await;
        store.fail_next(2, "connection reset");
        steps(&mut worker, &mut session, 3).await;

        // Failed inserts did not burn keys
        let base = 9 * crate::partition::KEYS_PER_WORKER;
        assert_eq!(store.keys(), (base + 1..=base + 6).collect::<Vec<_>>());
        assert_eq!(key_space.worker(1).highest_key_produced(), 6);
        assert_eq!(key_space.worker(0).highest_key_produced(), 0);

        let sample = finish_session(&mut session, &stop, &mut samples);
        assert_eq!(sample.op_count, 6);
        assert_eq!(sample.errors, vec!["connection reset"; 2]);
    }

    #[tokio::test]
    async fn test_moves_past_insert_applied_despite_error() {
        let store = Arc::new(MemoryWorkloadStore::new());
        let key_space = Arc::new(KeySpace::new([3]));
        let mut worker = InsertWorker {
            store: Arc::clone(&store) as Arc<dyn WorkloadStore>,
            keys: KeyAllocator::new(Arc::clone(key_space.worker(0))),
            gen: new_rng(),
        };
        let (mut session, stop, mut samples) = test_session(OpKind::Insert);

        steps(&mut worker, &mut session, 2).await;
        store.lose_next_acks(1, "socket closed");
        steps(&mut worker, &mut session, 1).await;

        // The third document landed, but the worker does not know yet
        let base = 3 * crate::partition::KEYS_PER_WORKER;
        assert_eq!(store.keys(), vec![base + 1, base + 2, base + 3]);
        assert_eq!(key_space.worker(0).highest_key_produced(), 2);

        // The retry finds it and publishes it instead of failing forever
        steps(&mut worker, &mut session, 3).await;
        assert_eq!(store.keys(), (base + 1..=base + 5).collect::<Vec<_>>());
        assert_eq!(key_space.worker(0).highest_key_produced(), 5);

        let sample = finish_session(&mut session, &stop, &mut samples);
        assert_eq!(sample.op_count, 5);
        assert_eq!(sample.errors, vec!["socket closed"]);
    }

    #[tokio::test]
    async fn test_factory_uses_local_index() {
        let store = Arc::new(MemoryWorkloadStore::new());
        let key_space = Arc::new(KeySpace::new([2, 3]));
        let factory = InsertWorkerFactory::new(
            Arc::clone(&store) as Arc<dyn WorkloadStore>,
            Arc::clone(&key_space),
        );

        let (session, stop, _samples) = test_session(OpKind::Insert);
        let mut worker = factory.create(1);
        let run = tokio::spawn(async move { worker.run(session).await });
        while key_space.worker(1).highest_key_produced() < 10 {
            tokio::task::yield_now().await;
        }
        stop.send_replace(true);
        run.await.unwrap().unwrap();

        assert!(store.keys().iter().all(|k| key_space.worker(1).owns(*k)));
        assert_eq!(
            store.len() as u64,
            key_space.worker(1).highest_key_produced()
        );
    }
}
