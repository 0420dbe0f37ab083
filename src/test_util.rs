use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use tokio::sync::{mpsc, watch};

use crate::partition::{KeyAllocator, KeySpace};
use crate::record::DocumentRecord;
use crate::run::{StopSignal, WorkerSession};
use crate::sample::{OpKind, OperationSample, SampleSender};
use crate::store::memory::MemoryWorkloadStore;
use crate::store::WorkloadStore;
use crate::workers::RngGen;

/// A session which only flushes when stopped, together with the handle
/// which stops it and the receiver of its samples.
pub fn test_session(
    kind: OpKind,
) -> (
    WorkerSession,
    watch::Sender<bool>,
    mpsc::Receiver<OperationSample>,
) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (sender, samples) = SampleSender::channel(64);
    let session = WorkerSession::new(
        kind,
        Duration::from_secs(3600),
        StopSignal::new(stop_rx),
        sender,
    );
    (session, stop_tx, samples)
}

pub fn seeded_rng(seed: u64) -> RngGen {
    RngGen::seed_from_u64(seed)
}

/// Inserts `count` documents on behalf of the local insert worker
/// `local_index` and publishes them.
pub async fn populate(
    store: &MemoryWorkloadStore,
    key_space: &KeySpace,
    local_index: usize,
    count: usize,
) -> Vec<i64> {
    let mut gen = seeded_rng(local_index as u64);
    let mut alloc = KeyAllocator::new(Arc::clone(key_space.worker(local_index)));
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        let key = alloc.next_key().unwrap();
        store
            .insert(&DocumentRecord::generate(key, &mut gen))
            .await
            .unwrap();
        alloc.commit(key);
        keys.push(key);
    }
    keys
}

/// Stops the session and returns the final sample it flushed.
pub fn finish_session(
    session: &mut WorkerSession,
    stop: &watch::Sender<bool>,
    samples: &mut mpsc::Receiver<OperationSample>,
) -> OperationSample {
    stop.send_replace(true);
    assert!(session.start().is_none());
    samples.try_recv().unwrap()
}
