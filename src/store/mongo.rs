//! MongoDB backends of the stores.

use std::time::Duration;

use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{Acknowledgment, ClientOptions, IndexOptions, WriteConcern};
use mongodb::{Client, Collection, Database, IndexModel};

use super::{MetadataStore, StoreError, WorkloadStore};
use crate::record::{
    CategoryTotal, CoordinatorRecord, DocumentRecord, InstanceId, WorkerStateRecord,
};

pub const WORKLOAD_DATABASE: &str = "mongo_bench";
pub const WORKLOAD_COLLECTION: &str = "transactions";
pub const METADATA_DATABASE: &str = "bench_metadata";
pub const INSTANCES_COLLECTION: &str = "bencher_instances";
pub const WORKER_STATES_COLLECTION: &str = "insert_workers";

const DUPLICATE_KEY_CODE: i32 = 11000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY_CODE => {
                StoreError::DuplicateKey(e.message.clone())
            }
            ErrorKind::Command(e) if e.code == DUPLICATE_KEY_CODE => {
                StoreError::DuplicateKey(e.message.clone())
            }
            _ => StoreError::MongoDB(err),
        }
    }
}

async fn connect(uri: &str) -> Result<Client, StoreError> {
    let mut options = ClientOptions::parse(uri).await?;
    options.connect_timeout = Some(CONNECT_TIMEOUT);
    options.server_selection_timeout = Some(CONNECT_TIMEOUT);
    options.write_concern = Some(
        WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .build(),
    );
    let client = Client::with_options(options)?;

    // The driver connects lazily, make sure the server is there
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await?;
    Ok(client)
}

/// The workload collection on a MongoDB deployment.
pub struct MongoWorkloadStore {
    client: Client,
    database: Database,
    collection: Collection<DocumentRecord>,
}

impl MongoWorkloadStore {
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = connect(uri).await?;
        let database = client.database(WORKLOAD_DATABASE);
        let collection = database.collection(WORKLOAD_COLLECTION);
        tracing::debug!(uri, "connected to workload store");
        Ok(Self {
            client,
            database,
            collection,
        })
    }
}

#[async_trait]
impl WorkloadStore for MongoWorkloadStore {
    async fn insert(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        self.collection.insert_one(record).await?;
        Ok(())
    }

    async fn find_by_key(&self, key: i64) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.collection.find_one(doc! { "_id": key }).await?)
    }

    async fn update_amount(&self, key: i64, amount: i64) -> Result<bool, StoreError> {
        let result = self
            .collection
            .update_one(doc! { "_id": key }, doc! { "$set": { "amount": amount } })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn aggregate_by_category(&self) -> Result<Vec<CategoryTotal>, StoreError> {
        let pipeline = [doc! {
            "$group": {
                "_id": "$category",
                "count": { "$sum": 1 },
                "amount": { "$sum": "$amount" },
            }
        }];
        let mut cursor = self.collection.aggregate(pipeline).await?;
        let mut totals = Vec::new();
        while let Some(group) = cursor.try_next().await? {
            totals.push(category_total(&group)?);
        }
        Ok(totals)
    }

    async fn recreate_collection(&self) -> Result<(), StoreError> {
        self.collection.drop().await?;
        self.database.create_collection(WORKLOAD_COLLECTION).await?;
        let index = IndexModel::builder()
            .keys(doc! { "createdAt": -1, "category": 1 })
            .build();
        self.collection.create_index(index).await?;
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), StoreError> {
        self.database.drop().await?;
        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

fn category_total(group: &Document) -> Result<CategoryTotal, StoreError> {
    let category = group
        .get_str("_id")
        .map_err(|e| StoreError::Malformed(format!("{e}: {group}")))?;
    Ok(CategoryTotal {
        category: category.to_string(),
        count: number(group, "count")?,
        amount: number(group, "amount")?,
    })
}

// $sum yields an int32 or an int64 depending on the magnitude
fn number(group: &Document, field: &str) -> Result<i64, StoreError> {
    match group.get(field) {
        Some(mongodb::bson::Bson::Int32(n)) => Ok(*n as i64),
        Some(mongodb::bson::Bson::Int64(n)) => Ok(*n),
        other => Err(StoreError::Malformed(format!(
            "unexpected {field} in aggregation result: {other:?}"
        ))),
    }
}

/// The coordination collections on a MongoDB deployment.
pub struct MongoMetadataStore {
    client: Client,
    database: Database,
    instances: Collection<CoordinatorRecord>,
    worker_states: Collection<WorkerStateRecord>,
}

impl MongoMetadataStore {
    /// Connects and makes sure the unique indexes which coordinate
    /// instances exist.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = connect(uri).await?;
        let database = client.database(METADATA_DATABASE);
        let store = Self {
            instances: database.collection(INSTANCES_COLLECTION),
            worker_states: database.collection(WORKER_STATES_COLLECTION),
            client,
            database,
        };

        store.create_indexes().await?;
        tracing::debug!(uri, "connected to metadata store");
        Ok(store)
    }

    async fn create_indexes(&self) -> Result<(), StoreError> {
        let primary_index = IndexModel::builder()
            .keys(doc! { "isPrimary": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(doc! { "isPrimary": true })
                    .build(),
            )
            .build();
        self.instances.create_index(primary_index).await?;
        self.create_worker_index().await
    }

    async fn create_worker_index(&self) -> Result<(), StoreError> {
        let index = IndexModel::builder()
            .keys(doc! { "workerIndex": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.worker_states.create_index(index).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MongoMetadataStore {
    async fn create_primary_record(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        let record = CoordinatorRecord {
            instance_id: instance_id.clone(),
            is_primary: true,
            setup_done: false,
        };
        self.instances.insert_one(record).await?;
        Ok(())
    }

    async fn insert_instance(&self, record: &CoordinatorRecord) -> Result<(), StoreError> {
        self.instances.insert_one(record).await?;
        Ok(())
    }

    async fn mark_setup_done(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        let result = self
            .instances
            .update_one(
                doc! { "_id": instance_id.as_str(), "isPrimary": true },
                doc! { "$set": { "setupDone": true } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::Other(format!(
                "{instance_id} holds no primary record"
            )));
        }
        Ok(())
    }

    async fn is_setup_done(&self) -> Result<bool, StoreError> {
        let done = self
            .instances
            .find_one(doc! { "isPrimary": true, "setupDone": true })
            .await?;
        Ok(done.is_some())
    }

    async fn reset_worker_states(&self) -> Result<(), StoreError> {
        self.worker_states.drop().await?;
        self.create_worker_index().await
    }

    async fn register_worker(&self, record: &WorkerStateRecord) -> Result<(), StoreError> {
        self.worker_states.insert_one(record).await?;
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), StoreError> {
        self.database.drop().await?;
        self.create_indexes().await
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_total_accepts_both_integer_widths() {
        let group = doc! { "_id": "refund", "count": 3_i32, "amount": 12_000_000_000_i64 };
        assert_eq!(
            category_total(&group).unwrap(),
            CategoryTotal {
                category: "refund".to_string(),
                count: 3,
                amount: 12_000_000_000,
            }
        );
    }

    #[test]
    fn test_category_total_rejects_malformed_group() {
        let group = doc! { "_id": 5, "count": 1, "amount": 1 };
        assert!(matches!(
            category_total(&group),
            Err(StoreError::Malformed(_))
        ));

        let group = doc! { "_id": "refund", "count": "many", "amount": 1 };
        assert!(matches!(
            category_total(&group),
            Err(StoreError::Malformed(_))
        ));
    }
}
