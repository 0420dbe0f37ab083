//! Interfaces of the stores the harness talks to.
//!
//! The harness only needs a handful of primitives from the store under test
//! and from the metadata store. Backends: MongoDB (`mongo`) and an in-process
//! store (`memory`) with fault injection.

pub mod memory;
pub mod mongo;

use thiserror::Error;

use crate::record::{
    CategoryTotal, CoordinatorRecord, DocumentRecord, InstanceId, WorkerStateRecord,
};

/// Errors returned by store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The MongoDB driver reported an error.
    #[error("MongoDB error: {0}")]
    MongoDB(mongodb::error::Error),

    /// A stored document could not be decoded.
    #[error("malformed document: {0}")]
    Malformed(String),

    /// Any other failure of the backend.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

/// The store under test, holding the workload collection.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn insert(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    async fn find_by_key(&self, key: i64) -> Result<Option<DocumentRecord>, StoreError>;

    /// Sets the amount of the document. Returns `false` if no document
    /// has the key.
    async fn update_amount(&self, key: i64, amount: i64) -> Result<bool, StoreError>;

    /// Counts and sums the amount of documents per category.
    async fn aggregate_by_category(&self) -> Result<Vec<CategoryTotal>, StoreError>;

    /// Drops the workload collection and creates it again with its
    /// `(createdAt desc, category asc)` index.
    async fn recreate_collection(&self) -> Result<(), StoreError>;

    /// Drops the whole workload database.
    async fn drop_database(&self) -> Result<(), StoreError>;

    /// Releases the connection. The store must not be used afterwards.
    async fn close(&self);
}

/// The store which coordinates harness instances.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Atomically creates the single primary record for `instance_id`.
    /// Fails with [`StoreError::DuplicateKey`] if a primary record exists.
    async fn create_primary_record(&self, instance_id: &InstanceId) -> Result<(), StoreError>;

    /// Records an instance which did not become the primary.
    async fn insert_instance(&self, record: &CoordinatorRecord) -> Result<(), StoreError>;

    /// Flags the record of the primary `instance_id` as done with the setup.
    async fn mark_setup_done(&self, instance_id: &InstanceId) -> Result<(), StoreError>;

    /// Whether there is a primary which finished the setup.
    async fn is_setup_done(&self) -> Result<bool, StoreError>;

    /// Drops the insert worker states and recreates the unique index on
    /// `workerIndex`.
    async fn reset_worker_states(&self) -> Result<(), StoreError>;

    /// Persists a new insert worker state. Fails with
    /// [`StoreError::DuplicateKey`] if the worker index is already taken.
    async fn register_worker(&self, record: &WorkerStateRecord) -> Result<(), StoreError>;

    /// Drops the whole metadata database. The uniqueness constraints
    /// stay in force for the instances which start afterwards.
    async fn drop_database(&self) -> Result<(), StoreError>;

    /// Releases the connection. The store must not be used afterwards.
    async fn close(&self);
}
