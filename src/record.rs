//! Documents written to the store under test and to the metadata store.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use crate::workers::RngGen;

/// The category of a workload document, used by the aggregation workers
/// as the grouping key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    FirstSale,
    Refund,
    Promotion,
}

const CATEGORIES: [Category; 3] = [Category::FirstSale, Category::Refund, Category::Promotion];

impl Category {
    pub fn random(gen: &mut RngGen) -> Self {
        CATEGORIES[gen.gen_range(0..CATEGORIES.len())]
    }
}

/// A document of the workload collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(rename = "_id")]
    pub key: i64,
    pub amount: i64,
    pub category: Category,
    #[serde(
        rename = "createdAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Generates a document with random contents for the given key.
    pub fn generate(key: i64, gen: &mut RngGen) -> Self {
        Self {
            key,
            amount: random_amount(gen),
            category: Category::random(gen),
            created_at: Utc::now(),
        }
    }
}

pub fn random_amount(gen: &mut RngGen) -> i64 {
    gen.gen_range(1..=10_000)
}

/// Totals of a single category, as returned by the aggregation query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryTotal {
    pub category: String,
    pub count: i64,
    pub amount: i64,
}

/// Identifies a harness instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Records the role of a harness instance in the metadata store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    #[serde(rename = "_id")]
    pub instance_id: InstanceId,
    #[serde(rename = "isPrimary")]
    pub is_primary: bool,
    /// Set on the primary's record once the environment is prepared.
    #[serde(rename = "setupDone", default)]
    pub setup_done: bool,
}

/// Persisted state of an insert worker. The metadata store keeps
/// `worker_index` unique, which is how instances claim disjoint key ranges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStateRecord {
    pub worker_index: i64,
    pub highest_key_produced: i64,
}
