//! In-process stores.
//!
//! They keep the guarantees the harness relies on in the real backend:
//! unique keys, a single primary record and unique insert worker indexes.
//! Every call yields to the scheduler first, as a network round trip would,
//! and failures can be injected.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::{Mutex, MutexGuard};

use super::{MetadataStore, StoreError, WorkloadStore};
use crate::record::{
    CategoryTotal, CoordinatorRecord, DocumentRecord, InstanceId, WorkerStateRecord,
};

/// Index created on the workload collection.
pub const WORKLOAD_INDEX: &str = "createdAt_-1_category_1";

#[derive(Default)]
struct FaultInjector {
    pending: Mutex<VecDeque<String>>,
}

impl FaultInjector {
    fn fail_next(&self, count: usize, message: &str) {
        let mut pending = self.pending.lock();
        pending.extend(std::iter::repeat(message.to_string()).take(count));
    }

    fn check(&self) -> Result<(), StoreError> {
        match self.pending.lock().pop_front() {
            Some(message) => Err(StoreError::Other(message)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct WorkloadState {
    records: BTreeMap<i64, DocumentRecord>,
    lost_acks: VecDeque<String>,
    indexes: Vec<&'static str>,
    recreations: u64,
    database_drops: u64,
    closed: bool,
}

/// An in-process workload store.
#[derive(Default)]
pub struct MemoryWorkloadStore {
    state: Mutex<WorkloadState>,
    faults: FaultInjector,
}

impl MemoryWorkloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail with `message`.
    pub fn fail_next(&self, count: usize, message: &str) {
        self.faults.fail_next(count, message);
    }

    /// Makes the next `count` inserts fail with `message` after the
    /// document was stored, as when the acknowledgement is lost.
    pub fn lose_next_acks(&self, count: usize, message: &str) {
        let mut state = self.state.lock();
        state
            .lost_acks
            .extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Removes a document behind the harness' back.
    pub fn forget(&self, key: i64) -> Option<DocumentRecord> {
        self.state.lock().records.remove(&key)
    }

    pub fn get(&self, key: i64) -> Option<DocumentRecord> {
        self.state.lock().records.get(&key).cloned()
    }

    pub fn keys(&self) -> Vec<i64> {
        self.state.lock().records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indexes(&self) -> Vec<&'static str> {
        self.state.lock().indexes.clone()
    }

    /// How many times the collection was dropped and recreated.
    pub fn recreations(&self) -> u64 {
        self.state.lock().recreations
    }

    pub fn database_drops(&self) -> u64 {
        self.state.lock().database_drops
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn call(&self) -> Result<MutexGuard<'_, WorkloadState>, StoreError> {
        tokio::task::yield_now().await;
        self.faults.check()?;
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Other("store is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl WorkloadStore for MemoryWorkloadStore {
    async fn insert(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        if state.records.contains_key(&record.key) {
            return Err(StoreError::DuplicateKey(format!("_id: {}", record.key)));
        }
        state.records.insert(record.key, record.clone());
        match state.lost_acks.pop_front() {
            Some(message) => Err(StoreError::Other(message)),
            None => Ok(()),
        }
    }

    async fn find_by_key(&self, key: i64) -> Result<Option<DocumentRecord>, StoreError> {
        let state = self.call().await?;
        Ok(state.records.get(&key).cloned())
    }

    async fn update_amount(&self, key: i64, amount: i64) -> Result<bool, StoreError> {
        let mut state = self.call().await?;
        match state.records.get_mut(&key) {
            Some(record) => {
                record.amount = amount;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn aggregate_by_category(&self) -> Result<Vec<CategoryTotal>, StoreError> {
        let state = self.call().await?;
        let mut totals: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
        for record in state.records.values() {
            let entry = totals.entry(record.category.as_ref()).or_default();
            entry.0 += 1;
            entry.1 += record.amount;
        }
        Ok(totals
            .into_iter()
            .map(|(category, (count, amount))| CategoryTotal {
                category: category.to_string(),
                count,
                amount,
            })
            .collect())
    }

    async fn recreate_collection(&self) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        state.records.clear();
        state.indexes = vec![WORKLOAD_INDEX];
        state.recreations += 1;
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        state.records.clear();
        state.indexes.clear();
        state.database_drops += 1;
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[derive(Default)]
struct MetadataState {
    primary: Option<InstanceId>,
    setup_done: bool,
    instances: Vec<CoordinatorRecord>,
    workers: BTreeMap<i64, WorkerStateRecord>,
    worker_resets: u64,
    database_drops: u64,
    closed: bool,
}

/// An in-process metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MetadataState>,
    faults: FaultInjector,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail with `message`.
    pub fn fail_next(&self, count: usize, message: &str) {
        self.faults.fail_next(count, message);
    }

    pub fn primary(&self) -> Option<InstanceId> {
        self.state.lock().primary.clone()
    }

    pub fn instances(&self) -> Vec<CoordinatorRecord> {
        self.state.lock().instances.clone()
    }

    pub fn workers(&self) -> Vec<WorkerStateRecord> {
        self.state.lock().workers.values().cloned().collect()
    }

    /// How many times the insert worker states were reset.
    pub fn worker_resets(&self) -> u64 {
        self.state.lock().worker_resets
    }

    pub fn database_drops(&self) -> u64 {
        self.state.lock().database_drops
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn call(&self) -> Result<MutexGuard<'_, MetadataState>, StoreError> {
        tokio::task::yield_now().await;
        self.faults.check()?;
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::Other("store is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_primary_record(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        if let Some(primary) = &state.primary {
            return Err(StoreError::DuplicateKey(format!(
                "isPrimary: true (held by {primary})"
            )));
        }
        state.primary = Some(instance_id.clone());
        state.instances.push(CoordinatorRecord {
            instance_id: instance_id.clone(),
            is_primary: true,
            setup_done: false,
        });
        Ok(())
    }

    async fn insert_instance(&self, record: &CoordinatorRecord) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        if state
            .instances
            .iter()
            .any(|r| r.instance_id == record.instance_id)
        {
            return Err(StoreError::DuplicateKey(format!(
                "_id: {}",
                record.instance_id
            )));
        }
        state.instances.push(record.clone());
        Ok(())
    }

    async fn mark_setup_done(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        if state.primary.as_ref() != Some(instance_id) {
            return Err(StoreError::Other(format!(
                "{instance_id} holds no primary record"
            )));
        }
        state.setup_done = true;
        for record in state.instances.iter_mut() {
            if &record.instance_id == instance_id {
                record.setup_done = true;
            }
        }
        Ok(())
    }

    async fn is_setup_done(&self) -> Result<bool, StoreError> {
        Ok(self.call().await?.setup_done)
    }

    async fn reset_worker_states(&self) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        state.workers.clear();
        state.worker_resets += 1;
        Ok(())
    }

    async fn register_worker(&self, record: &WorkerStateRecord) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        if state.workers.contains_key(&record.worker_index) {
            return Err(StoreError::DuplicateKey(format!(
                "workerIndex: {}",
                record.worker_index
            )));
        }
        state.workers.insert(record.worker_index, record.clone());
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), StoreError> {
        let mut state = self.call().await?;
        let database_drops = state.database_drops + 1;
        *state = MetadataState {
            database_drops,
            ..MetadataState::default()
        };
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::record::Category;

    fn doc(key: i64, category: Category, amount: i64) -> DocumentRecord {
        DocumentRecord {
            key,
            amount,
            category,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_workload_operations() {
        let store = MemoryWorkloadStore::new();
        store.insert(&doc(1, Category::Refund, 10)).await.unwrap();
        store.insert(&doc(2, Category::Refund, 5)).await.unwrap();
        store.insert(&doc(3, Category::Promotion, 7)).await.unwrap();

        let err = store.insert(&doc(1, Category::Refund, 1)).await.unwrap_err();
        assert!(err.is_duplicate_key());

        assert_eq!(store.find_by_key(2).await.unwrap().unwrap().amount, 5);
        assert!(store.find_by_key(4).await.unwrap().is_none());

        assert!(store.update_amount(2, 50).await.unwrap());
        assert!(!store.update_amount(4, 50).await.unwrap());

        let totals = store.aggregate_by_category().await.unwrap();
        assert_eq!(
            totals,
            vec![
                CategoryTotal {
                    category: "promotion".to_string(),
                    count: 1,
                    amount: 7,
                },
                CategoryTotal {
                    category: "refund".to_string(),
                    count: 2,
                    amount: 60,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryWorkloadStore::new();
        store.fail_next(2, "operation timed out");
        for _ in 0..2 {
            let err = store.find_by_key(1).await.unwrap_err();
            assert_eq!(err.to_string(), "operation timed out");
        }
        assert!(store.find_by_key(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = MemoryMetadataStore::new();
        store.close().await;
        assert!(store.is_closed());
        assert!(store
            .create_primary_record(&InstanceId::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_single_primary_record() {
        let store = MemoryMetadataStore::new();
        let first = InstanceId::new();
        store.create_primary_record(&first).await.unwrap();
        let err = store
            .create_primary_record(&InstanceId::new())
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(store.primary(), Some(first));
    }

    #[tokio::test]
    async fn test_setup_done_flag() {
        let store = MemoryMetadataStore::new();
        let primary = InstanceId::new();
        assert!(!store.is_setup_done().await.unwrap());

        // Only the primary may flag the setup as done
        assert!(store.mark_setup_done(&primary).await.is_err());
        store.create_primary_record(&primary).await.unwrap();
        assert!(store.mark_setup_done(&InstanceId::new()).await.is_err());
        assert!(!store.is_setup_done().await.unwrap());

        store.mark_setup_done(&primary).await.unwrap();
        assert!(store.is_setup_done().await.unwrap());
        assert!(store.instances()[0].setup_done);

        store.drop_database().await.unwrap();
        assert!(!store.is_setup_done().await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_index_is_unique() {
        let store = MemoryMetadataStore::new();
        let record = WorkerStateRecord {
            worker_index: 0,
            highest_key_produced: 0,
        };
        store.register_worker(&record).await.unwrap();
        assert!(store
            .register_worker(&record)
            .await
            .unwrap_err()
            .is_duplicate_key());

        store.reset_worker_states().await.unwrap();
        store.register_worker(&record).await.unwrap();
        assert_eq!(store.worker_resets(), 1);
    }
}
