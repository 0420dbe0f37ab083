//! Election of the single instance which prepares the environment.
//!
//! The election is a one-shot compare-and-set on the metadata store: the
//! instance which manages to create the primary record wins. There is no
//! lease and no failover; the role holds for the whole run.

use anyhow::{Context, Result};
use tracing::info;

use crate::record::{CoordinatorRecord, InstanceId};
use crate::store::MetadataStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Follower,
}

/// Tries to become the primary instance. Instances which lose record
/// themselves as non-primary.
pub async fn elect(store: &dyn MetadataStore, instance_id: &InstanceId) -> Result<Role> {
    match store.create_primary_record(instance_id).await {
        Ok(()) => {
            info!(instance_id = %instance_id, "this instance is the primary");
            Ok(Role::Primary)
        }
        Err(err) if err.is_duplicate_key() => {
            info!(instance_id = %instance_id, "another instance is the primary");
            let record = CoordinatorRecord {
                instance_id: instance_id.clone(),
                is_primary: false,
                setup_done: false,
            };
            store
                .insert_instance(&record)
                .await
                .context("Failed to record this instance in the metadata store")?;
            Ok(Role::Follower)
        }
        Err(err) => Err(err).context("Failed to create the primary record"),
    }
}
