//! A harness instance: owns the store connections and drives the lifecycle
//! of a benchmark run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::configuration::{Configuration, HarnessConfig, StoreUris, WorkerGroup};
use crate::election::{elect, Role};
use crate::partition::{KeySpace, MAX_WORKER_INDEX};
use crate::record::{InstanceId, WorkerStateRecord};
use crate::report::ReportSink;
use crate::run::{self, RunController};
use crate::sample::{OpKind, SampleSender};
use crate::stats::{RunSummary, StatAggregator};
use crate::store::mongo::{MongoMetadataStore, MongoWorkloadStore};
use crate::store::{MetadataStore, WorkloadStore};
use crate::workers::aggregation::AggregationWorkerFactory;
use crate::workers::insert::InsertWorkerFactory;
use crate::workers::read::ReadWorkerFactory;
use crate::workers::update::UpdateWorkerFactory;

/// How often a follower checks whether the primary finished the setup.
pub const SETUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a follower waits for the primary to finish the setup.
pub const SETUP_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// The stores a harness instance works with.
#[derive(Clone)]
pub struct Stores {
    pub primary: Arc<dyn WorkloadStore>,
    pub secondary: Option<Arc<dyn WorkloadStore>>,
    pub metadata: Arc<dyn MetadataStore>,
}

pub struct Harness {
    instance_id: InstanceId,
    stores: Stores,
    role: Option<Role>,
    closed: bool,
}

impl Harness {
    /// Connects to the MongoDB deployments. The secondary is skipped
    /// when its URI is empty.
    pub async fn connect(uris: &StoreUris) -> Result<Self> {
        let primary = MongoWorkloadStore::connect(&uris.primary)
            .await
            .with_context(|| format!("Failed to connect to the primary at {}", uris.primary))?;
        let secondary = match uris.secondary() {
            Some(uri) => {
                let store = MongoWorkloadStore::connect(uri)
                    .await
                    .with_context(|| format!("Failed to connect to the secondary at {uri}"))?;
                Some(Arc::new(store) as Arc<dyn WorkloadStore>)
            }
            None => None,
        };
        let metadata = MongoMetadataStore::connect(&uris.metadata)
            .await
            .with_context(|| {
                format!("Failed to connect to the metadata store at {}", uris.metadata)
            })?;

        Ok(Self::from_stores(Stores {
            primary: Arc::new(primary),
            secondary,
            metadata: Arc::new(metadata),
        }))
    }

    pub fn from_stores(stores: Stores) -> Self {
        Self {
            instance_id: InstanceId::new(),
            stores,
            role: None,
            closed: false,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// The role won in the election, if it took place already.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Drops every benchmark database: the workload on the primary and the
    /// secondary and the whole metadata store.
    pub async fn reset(&self) -> Result<()> {
        info!("dropping all benchmark data");
        self.stores
            .metadata
            .drop_database()
            .await
            .context("Failed to drop the metadata database")?;
        self.stores
            .primary
            .drop_database()
            .await
            .context("Failed to drop the workload database on the primary")?;
        if let Some(secondary) = &self.stores.secondary {
            secondary
                .drop_database()
                .await
                .context("Failed to drop the workload database on the secondary")?;
        }
        Ok(())
    }

    /// Runs the election. The primary prepares the environment for all
    /// instances: fresh workload collections and no insert worker states.
    /// Followers return once the primary has flagged the setup as done,
    /// so nothing they write is wiped by it.
    pub async fn elect_and_setup(&mut self) -> Result<Role> {
        let role = elect(self.stores.metadata.as_ref(), &self.instance_id).await?;
        self.role = Some(role);
        if role == Role::Follower {
            self.wait_for_setup().await?;
            return Ok(role);
        }

        info!("setting up the workload collection on the primary");
        self.stores
            .primary
            .recreate_collection()
            .await
            .context("Failed to set up the workload collection on the primary")?;
        if let Some(secondary) = &self.stores.secondary {
            info!("setting up the workload collection on the secondary");
            secondary
                .recreate_collection()
                .await
                .context("Failed to set up the workload collection on the secondary")?;
        }
        self.stores
            .metadata
            .reset_worker_states()
            .await
            .context("Failed to clear the insert worker states")?;
        self.stores
            .metadata
            .mark_setup_done(&self.instance_id)
            .await
            .context("Failed to flag the setup as done")?;
        info!("setup done");
        Ok(role)
    }

    async fn wait_for_setup(&self) -> Result<()> {
        let deadline = Instant::now() + SETUP_WAIT_TIMEOUT;
        loop {
            let done = self
                .stores
                .metadata
                .is_setup_done()
                .await
                .context("Failed to check whether the primary finished the setup")?;
            if done {
                return Ok(());
            }
            anyhow::ensure!(
                Instant::now() < deadline,
                "The primary did not finish the setup within {SETUP_WAIT_TIMEOUT:?}, \
                 a previous run may have been interrupted (use -reset)",
            );
            debug!("waiting for the primary to finish the setup");
            tokio::time::sleep(SETUP_POLL_INTERVAL).await;
        }
    }

    /// Registers `count` insert workers, each under the lowest worker index
    /// which no instance has taken yet. Returns the claimed indexes.
    async fn claim_worker_indexes(&self, count: u64) -> Result<Vec<u64>> {
        let mut claimed = Vec::new();
        let mut candidate = 0;
        while (claimed.len() as u64) < count {
            anyhow::ensure!(
                candidate <= MAX_WORKER_INDEX,
                "No free insert worker index left",
            );
            let record = WorkerStateRecord {
                worker_index: candidate as i64,
                highest_key_produced: 0,
            };
            match self.stores.metadata.register_worker(&record).await {
                Ok(()) => claimed.push(candidate),
                Err(err) if err.is_duplicate_key() => {}
                Err(err) => return Err(err).context("Failed to register an insert worker"),
            }
            candidate += 1;
        }
        Ok(claimed)
    }

    /// Spawns the workers and the stat aggregator, and waits until the run
    /// is over. `on_launch` receives the controller of the run as soon as
    /// the workers are started.
    pub async fn start(
        &mut self,
        config: &HarnessConfig,
        sink: Box<dyn ReportSink>,
        on_launch: impl FnOnce(Arc<RunController>),
    ) -> Result<RunSummary> {
        config.validate()?;

        let mut workers = config.workers;
        if workers.secondary_read > 0 && self.stores.secondary.is_none() {
            warn!(
                workers = workers.secondary_read,
                "no secondary configured, secondary read workers will not be started",
            );
            workers.secondary_read = 0;
        }

        let worker_indexes = self.claim_worker_indexes(workers.insert).await?;
        info!(indexes = ?worker_indexes, "claimed insert worker indexes");
        let key_space = Arc::new(KeySpace::new(worker_indexes));

        let primary = &self.stores.primary;
        let mut groups = vec![WorkerGroup {
            kind: OpKind::Insert,
            count: workers.insert,
            factory: Arc::new(InsertWorkerFactory::new(
                Arc::clone(primary),
                Arc::clone(&key_space),
            )),
        }];
        if let Some(picker) = key_space.picker() {
            groups.push(WorkerGroup {
                kind: OpKind::ReadByKey,
                count: workers.read_by_key,
                factory: Arc::new(ReadWorkerFactory::primary(
                    Arc::clone(primary),
                    picker.clone(),
                )),
            });
            if let Some(secondary) = &self.stores.secondary {
                groups.push(WorkerGroup {
                    kind: OpKind::SecondaryRead,
                    count: workers.secondary_read,
                    factory: Arc::new(ReadWorkerFactory::secondary(
                        Arc::clone(secondary),
                        picker.clone(),
                    )),
                });
            }
            groups.push(WorkerGroup {
                kind: OpKind::Update,
                count: workers.update,
                factory: Arc::new(UpdateWorkerFactory::new(Arc::clone(primary), picker)),
            });
        }
        groups.push(WorkerGroup {
            kind: OpKind::Aggregate,
            count: workers.aggregate,
            factory: Arc::new(AggregationWorkerFactory::new(Arc::clone(primary))),
        });
        groups.retain(|group| group.count > 0);

        let (sender, samples) = SampleSender::channel(config.sample_buffer);
        let aggregator = StatAggregator::new(
            samples,
            workers,
            config.tick_interval,
            config.report_window,
            sink,
        );
        let aggregator = tokio::task::spawn(aggregator.run());

        let run_config = Configuration {
            max_duration: config.run_duration,
            tick_interval: config.tick_interval,
            groups,
        };
        let (ctrl, run_finished) = run::run(run_config, sender.clone());
        on_launch(Arc::clone(&ctrl));
        info!(
            instance_id = %self.instance_id,
            duration = ?config.run_duration,
            "workers started",
        );

        let run_result = run_finished.await;
        let dropped = sender.dropped();
        drop(sender);
        if dropped > 0 {
            warn!(dropped, "samples were dropped because the aggregator fell behind");
        }

        let summary = aggregator.await.context("The stat aggregator panicked")?;
        run_result.context("An error occurred during the benchmark")?;
        summary.context("Failed to report the statistics")
    }

    /// Releases all connections. Calling it again has no effect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stores.primary.close().await;
        if let Some(secondary) = &self.stores.secondary {
            secondary.close().await;
        }
        self.stores.metadata.close().await;
        info!("connections closed");
    }

    /// Performs the whole lifecycle of the instance: the optional reset, the
    /// election and the run. Connections are released on every exit path.
    pub async fn execute(
        mut self,
        config: &HarnessConfig,
        sink: Box<dyn ReportSink>,
        on_launch: impl FnOnce(Arc<RunController>),
    ) -> Result<RunSummary> {
        let result = self.run_lifecycle(config, sink, on_launch).await;
        self.close().await;
        result
    }

    async fn run_lifecycle(
        &mut self,
        config: &HarnessConfig,
        sink: Box<dyn ReportSink>,
        on_launch: impl FnOnce(Arc<RunController>),
    ) -> Result<RunSummary> {
        if config.reset {
            self.reset().await?;
        }
        self.elect_and_setup().await?;
        self.start(config, sink, on_launch).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join;

    use super::*;
    use crate::configuration::WorkerCounts;
    use crate::record::{CategoryTotal, DocumentRecord};
    use crate::report::TerminalReport;
    use crate::store::memory::{MemoryMetadataStore, MemoryWorkloadStore};
    use crate::store::StoreError;

    struct TestStores {
        primary: Arc<MemoryWorkloadStore>,
        metadata: Arc<MemoryMetadataStore>,
    }

    impl TestStores {
        fn new() -> Self {
            Self {
                primary: Arc::new(MemoryWorkloadStore::new()),
                metadata: Arc::new(MemoryMetadataStore::new()),
            }
        }

        // The secondary replicates perfectly, it is the same store
        fn stores(&self, with_secondary: bool) -> Stores {
            let primary = Arc::clone(&self.primary) as Arc<dyn WorkloadStore>;
            Stores {
                secondary: with_secondary.then(|| Arc::clone(&primary)),
                primary,
                metadata: Arc::clone(&self.metadata) as Arc<dyn MetadataStore>,
            }
        }
    }

    fn null_sink() -> Box<dyn ReportSink> {
        Box::new(TerminalReport::new(std::io::sink()))
    }

    fn short_run(workers: WorkerCounts) -> HarnessConfig {
        HarnessConfig {
            workers,
            tick_interval: Duration::from_millis(20),
            report_window: Duration::from_millis(100),
            run_duration: Duration::from_millis(300),
            ..HarnessConfig::default()
        }
    }

    #[tokio::test]
    async fn test_two_instances_elect_one_primary() {
        let shared = TestStores::new();
        let mut first = Harness::from_stores(shared.stores(false));
        let mut second = Harness::from_stores(shared.stores(false));

        let (r1, r2) = join(first.elect_and_setup(), second.elect_and_setup()).await;
        let roles = [r1.unwrap(), r2.unwrap()];
        assert!(roles.contains(&Role::Primary));
        assert!(roles.contains(&Role::Follower));

        // Only the primary prepared the environment
        assert_eq!(shared.primary.recreations(), 1);
        assert_eq!(shared.metadata.worker_resets(), 1);
        assert_eq!(shared.metadata.instances().len(), 2);
    }

    #[tokio::test]
    async fn test_instances_claim_disjoint_worker_indexes() {
        let shared = TestStores::new();
        let first = Harness::from_stores(shared.stores(false));
        let second = Harness::from_stores(shared.stores(false));

        let (a, b) = join(
            first.claim_worker_indexes(3),
            second.claim_worker_indexes(2),
        )
        .await;
        let mut all = a.unwrap();
        all.extend(b.unwrap());
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
        assert_eq!(shared.metadata.workers().len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_run() {
        let shared = TestStores::new();
        let harness = Harness::from_stores(shared.stores(true));
        let config = short_run(WorkerCounts {
            insert: 2,
            read_by_key: 2,
            secondary_read: 1,
            update: 1,
            aggregate: 1,
        });

        let mut launched = false;
        let summary = harness
            .execute(&config, null_sink(), |_| launched = true)
            .await
            .unwrap();
        assert!(launched);

        let inserts = summary.kind(OpKind::Insert).unwrap();
        assert!(inserts.op_count > 0);
        assert_eq!(inserts.error_count, 0);
        assert_eq!(shared.primary.len() as u64, inserts.op_count);
        assert_eq!(summary.kinds.len(), 5);
        assert!(summary.kinds.iter().all(|k| k.error_count == 0));

        // Keys of both insert workers are dense
        let mut keys = shared.primary.keys();
        keys.sort_unstable();
        let first_worker: Vec<i64> = keys
            .iter()
            .copied()
            .filter(|k| *k < crate::partition::KEYS_PER_WORKER)
            .collect();
        assert_eq!(first_worker, (1..=first_worker.len() as i64).collect::<Vec<_>>());

        assert!(shared.primary.is_closed());
        assert!(shared.metadata.is_closed());
    }

    #[tokio::test]
    async fn test_secondary_reads_need_a_secondary() {
        let shared = TestStores::new();
        let harness = Harness::from_stores(shared.stores(false));
        let config = short_run(WorkerCounts {
            insert: 1,
            secondary_read: 3,
            ..WorkerCounts::default()
        });

        let summary = harness.execute(&config, null_sink(), |_| {}).await.unwrap();
        assert!(summary.kind(OpKind::SecondaryRead).is_none());
        assert!(summary.kind(OpKind::Insert).is_some());
    }

    #[tokio::test]
    async fn test_reset_drops_everything() {
        let shared = TestStores::new();
        let mut harness = Harness::from_stores(shared.stores(true));
        harness.elect_and_setup().await.unwrap();
        harness.claim_worker_indexes(2).await.unwrap();

        let config = HarnessConfig {
            reset: true,
            ..short_run(WorkerCounts {
                aggregate: 1,
                ..WorkerCounts::default()
            })
        };
        let second = Harness::from_stores(shared.stores(true));
        let second_id = second.instance_id().clone();
        second.execute(&config, null_sink(), |_| {}).await.unwrap();

        // Once for the primary, once for the secondary which is the same store
        assert_eq!(shared.primary.database_drops(), 2);
        assert_eq!(shared.metadata.database_drops(), 1);

        // The reset removed the old primary record, so the new instance won
        assert_eq!(shared.metadata.primary(), Some(second_id));
        assert!(shared.metadata.workers().is_empty());
    }

    #[tokio::test]
    async fn test_setup_failure_still_closes() {
        let shared = TestStores::new();
        shared.metadata.fail_next(1, "connection refused");
        let harness = Harness::from_stores(shared.stores(false));
        let config = short_run(WorkerCounts {
            insert: 1,
            ..WorkerCounts::default()
        });

        let err = harness
            .execute(&config, null_sink(), |_| panic!("must not launch"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        assert!(shared.primary.is_closed());
        assert!(shared.metadata.is_closed());
    }

    // Wraps the in-memory store to misbehave in the ways real servers do
    #[derive(Default)]
    struct FlakyStore {
        inner: Arc<MemoryWorkloadStore>,
        // Loses every document right after acknowledging it
        forget: bool,
        recreate_delay: Duration,
        hang_aggregations: bool,
    }

    #[async_trait]
    impl WorkloadStore for FlakyStore {
        async fn insert(&self, record: &DocumentRecord) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }

        async fn find_by_key(&self, key: i64) -> Result<Option<DocumentRecord>, StoreError> {
            if self.forget {
                return Ok(None);
            }
            self.inner.find_by_key(key).await
        }

        async fn update_amount(&self, key: i64, amount: i64) -> Result<bool, StoreError> {
            if self.forget {
                return Ok(false);
            }
            self.inner.update_amount(key, amount).await
        }

        async fn aggregate_by_category(&self) -> Result<Vec<CategoryTotal>, StoreError> {
            if self.hang_aggregations {
                std::future::pending::<()>().await;
            }
            self.inner.aggregate_by_category().await
        }

        async fn recreate_collection(&self) -> Result<(), StoreError> {
            tokio::time::sleep(self.recreate_delay).await;
            self.inner.recreate_collection().await
        }

        async fn drop_database(&self) -> Result<(), StoreError> {
            self.inner.drop_database().await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_instances_use_disjoint_partitions() {
        let documents = Arc::new(MemoryWorkloadStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let instance = || {
            Harness::from_stores(Stores {
                primary: Arc::new(FlakyStore {
                    inner: Arc::clone(&documents),
                    recreate_delay: Duration::from_millis(100),
                    ..FlakyStore::default()
                }),
                secondary: None,
                metadata: Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            })
        };
        let config = short_run(WorkerCounts {
            insert: 2,
            read_by_key: 2,
            update: 1,
            ..WorkerCounts::default()
        });

        let (a, b) = join(
            instance().execute(&config, null_sink(), |_| {}),
            instance().execute(&config, null_sink(), |_| {}),
        )
        .await;
        let summaries = [a.unwrap(), b.unwrap()];

        for summary in &summaries {
            for kind in &summary.kinds {
                assert_eq!(kind.error_count, 0, "{:?} failed: {:?}", kind.kind, kind.errors);
            }
        }

        let mut indexes: Vec<i64> = metadata.workers().iter().map(|w| w.worker_index).collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![0, 1, 2, 3]);

        let inserted: u64 = summaries
            .iter()
            .map(|s| s.kind(OpKind::Insert).unwrap().op_count)
            .sum();
        assert_eq!(documents.len() as u64, inserted);
        assert_eq!(documents.recreations(), 1);
    }

    #[tokio::test]
    async fn test_stuck_store_call_does_not_block_the_run() {
        let primary = Arc::new(FlakyStore {
            hang_aggregations: true,
            ..FlakyStore::default()
        });
        let metadata = Arc::new(MemoryMetadataStore::new());
        let harness = Harness::from_stores(Stores {
            primary: Arc::clone(&primary) as Arc<dyn WorkloadStore>,
            secondary: None,
            metadata: Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        });
        let config = HarnessConfig {
            run_duration: Duration::from_millis(200),
            ..short_run(WorkerCounts {
                insert: 1,
                aggregate: 1,
                ..WorkerCounts::default()
            })
        };

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            harness.execute(&config, null_sink(), |_| {}),
        )
        .await
        .expect("the run must end shortly after its budget")
        .unwrap();

        assert_eq!(summary.kind(OpKind::Aggregate).unwrap().op_count, 0);
        assert!(summary.kind(OpKind::Insert).unwrap().op_count > 0);
        assert!(primary.inner.is_closed());
        assert!(metadata.is_closed());
    }

    #[tokio::test]
    async fn test_invariant_violation_fails_the_run() {
        let primary = Arc::new(FlakyStore {
            forget: true,
            ..FlakyStore::default()
        });
        let metadata = Arc::new(MemoryMetadataStore::new());
        let harness = Harness::from_stores(Stores {
            primary: Arc::clone(&primary) as Arc<dyn WorkloadStore>,
            secondary: None,
            metadata: Arc::clone(&metadata) as Arc<dyn MetadataStore>,
        });
        let config = HarnessConfig {
            run_duration: Duration::from_secs(3600),
            ..short_run(WorkerCounts {
                insert: 1,
                read_by_key: 1,
                ..WorkerCounts::default()
            })
        };

        let err = harness
            .execute(&config, null_sink(), |_| {})
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invariant violated"));
        assert!(primary.inner.is_closed());
        assert!(metadata.is_closed());
    }
}
