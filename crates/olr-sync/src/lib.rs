//! Ledger sync orchestration: lookups, dispatch queue, monthly
//! reconciliation of order and settlement ledgers, and run reports.

pub mod backfill;
pub mod dispatch;
pub mod keys;
pub mod lookups;
pub mod normalize;
pub mod partition;
pub mod persist;
pub mod plan;
pub mod report;
pub mod schema;
pub mod translate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use olr_adapters::{feed_from_settings, ChangeScan, CommerceApiConfig, FeedBatch, FeedSettings, OrderFeed};
use olr_core::{OrderDetail, Table, TableNaming};
use olr_storage::{CsvTableStore, HttpClientConfig, TableStore};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use backfill::{backfill_review_labels, BackfillOutcome};
pub use dispatch::{sync_dispatch_queue, DispatchOutcome};
pub use keys::{key_for_record, key_for_row, LedgerKey};
pub use lookups::{CostBook, ReviewColumns, ReviewLabels};
pub use normalize::{RecordError, RowNormalizer};
pub use partition::{partition_by_month, route_partitions, MonthlyPartitions, TableReport};
pub use persist::{LedgerReconciler, PassContext, ReconcileError, TableOutcome};
pub use plan::{ExclusionSet, PlanStats, UpsertPlan, UpsertPlanner};
pub use report::{report_recent_runs, write_run_reports, RunSummary};
pub use schema::{HeaderMigration, LedgerField, LedgerSchema, SchemaError};

pub const CRATE_NAME: &str = "olr-sync";
pub const RULES_FILE: &str = "ledger.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Fixture,
    CommerceApi,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub prefix: String,
    pub ledger_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub feed: FeedKind,
    pub fixture_path: PathBuf,
    pub api_base: String,
    pub access_token: String,
    pub lookback_days: u32,
    pub dispatch_lookback_hours: u32,
    pub utc_offset_hours: i32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            prefix: std::env::var("OLR_PREFIX").unwrap_or_else(|_| "shop".to_string()),
            ledger_dir: std::env::var("OLR_LEDGER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./ledger")),
            workspace_root: std::env::var("OLR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            feed: match std::env::var("OLR_FEED").as_deref() {
                Ok("api") => FeedKind::CommerceApi,
                _ => FeedKind::Fixture,
            },
            fixture_path: std::env::var("OLR_FIXTURE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fixtures/orders/sample.json")),
            api_base: std::env::var("COMMERCE_API_BASE")
                .unwrap_or_else(|_| "https://api.commerce.naver.com/external".to_string()),
            access_token: std::env::var("COMMERCE_ACCESS_TOKEN").unwrap_or_default(),
            lookback_days: env_parse("OLR_LOOKBACK_DAYS", 90),
            dispatch_lookback_hours: env_parse("OLR_DISPATCH_LOOKBACK_HOURS", 24),
            utc_offset_hours: env_parse("OLR_UTC_OFFSET_HOURS", 9),
            http_timeout_secs: env_parse("OLR_HTTP_TIMEOUT_SECS", 20),
            user_agent: std::env::var("OLR_USER_AGENT")
                .unwrap_or_else(|_| "olr-bot/0.1".to_string()),
            scheduler_enabled: std::env::var("OLR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 0 18 * * *".to_string()),
        }
    }

    pub fn feed_settings(&self) -> FeedSettings {
        match self.feed {
            FeedKind::Fixture => FeedSettings::Fixture {
                path: self.workspace_root.join(&self.fixture_path),
            },
            FeedKind::CommerceApi => FeedSettings::CommerceApi {
                api: CommerceApiConfig {
                    base_url: self.api_base.clone(),
                    access_token: self.access_token.clone(),
                },
                http: HttpClientConfig {
                    timeout: Duration::from_secs(self.http_timeout_secs),
                    user_agent: Some(self.user_agent.clone()),
                    ..Default::default()
                },
            },
        }
    }

    /// Wall-clock stamp for the collected-at column, in the configured zone.
    pub fn local_stamp(&self, now: DateTime<Utc>) -> String {
        let offset = FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        now.with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

/// Ledger conventions that vary per shop; read from `ledger.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerRules {
    pub settlement_marker: String,
    pub cost_table_suffix: String,
    pub dispatch_table_suffix: String,
    pub review_table_suffix: String,
    pub review_columns: ReviewColumns,
    pub exclusion_tokens: Vec<String>,
    pub dispatch_limit_count: u32,
}

impl Default for LedgerRules {
    fn default() -> Self {
        Self {
            settlement_marker: "정산".to_string(),
            cost_table_suffix: "상품원가".to_string(),
            dispatch_table_suffix: "배송준비".to_string(),
            review_table_suffix: "리뷰".to_string(),
            review_columns: ReviewColumns::default(),
            exclusion_tokens: ExclusionSet::default().tokens().to_vec(),
            dispatch_limit_count: 300,
        }
    }
}

impl LedgerRules {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(RULES_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn exclusions(&self) -> ExclusionSet {
        ExclusionSet::new(&self.exclusion_tokens)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    rules: LedgerRules,
    store: Arc<dyn TableStore>,
    feed: Box<dyn OrderFeed>,
    orders: LedgerSchema,
    settlements: LedgerSchema,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        rules: LedgerRules,
        store: Arc<dyn TableStore>,
        feed: Box<dyn OrderFeed>,
    ) -> Self {
        Self {
            config,
            rules,
            store,
            feed,
            orders: LedgerSchema::orders(),
            settlements: LedgerSchema::settlements(),
        }
    }

    /// CSV-backed store under `ledger_dir` and the configured feed.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let rules = LedgerRules::load(&config.workspace_root)?;
        let store: Arc<dyn TableStore> = Arc::new(CsvTableStore::new(config.ledger_dir.clone()));
        let feed = feed_from_settings(config.feed_settings()).context("building order feed")?;
        Ok(Self::new(config, rules, store, feed))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn naming(&self) -> TableNaming {
        TableNaming::new(self.config.prefix.clone(), self.rules.settlement_marker.clone())
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_once_at(Utc::now()).await
    }

    /// One full pass with `now` as the scan anchor and collected-at stamp.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let naming = self.naming();
        info!(%run_id, feed = self.feed.feed_id(), "sync run started");

        let reviews = self.load_reviews().await;

        let dispatch_table = naming.suffixed(&self.rules.dispatch_table_suffix);
        let dispatch = match sync_dispatch_queue(
            self.store.as_ref(),
            self.feed.as_ref(),
            &dispatch_table,
            now,
            self.config.dispatch_lookback_hours,
            self.rules.dispatch_limit_count,
        )
        .await
        {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(table = %dispatch_table, error = %err, "dispatch queue sync failed");
                None
            }
        };

        let FeedBatch {
            orders,
            requests,
            failed_requests,
        } = self
            .feed
            .changed_orders(&ChangeScan::daily(now, self.config.lookback_days))
            .await
            .context("scanning order archive")?;
        let fetched_orders = orders.len();

        let (costs, cost_rows_registered) = self.sync_cost_book(&orders).await;

        let collected_at = self.config.local_stamp(now);
        let exclusions = self.rules.exclusions();
        let partitions = partition_by_month(orders);
        let reconciler = LedgerReconciler::new(
            self.store.as_ref(),
            PassContext {
                costs: &costs,
                reviews: &reviews,
                exclusions: &exclusions,
                collected_at: &collected_at,
            },
        );
        let tables = route_partitions(
            &reconciler,
            &naming,
            &[&self.orders, &self.settlements],
            &partitions,
        )
        .await;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feed_id: self.feed.feed_id().to_string(),
            fetched_orders,
            feed_requests: requests,
            failed_requests,
            undated_orders: partitions.undated,
            review_labels: reviews.len(),
            cost_rows_registered,
            dispatch,
            tables,
            reports_dir: None,
            parquet_manifest: None,
        };
        write_run_reports(&self.config.workspace_root, &mut summary).await?;
        info!(
            %run_id,
            tables = summary.tables.len(),
            written = summary.written_tables(),
            failed = summary.failed_tables(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Rewrite the review-label column of every order ledger of `year`.
    pub async fn backfill_reviews(&self, year: i32) -> Result<Vec<BackfillOutcome>> {
        let reviews = self.load_reviews().await;
        backfill_review_labels(self.store.as_ref(), &self.naming(), &self.orders, &reviews, year).await
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            failed = summary.failed_tables(),
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    async fn load_reviews(&self) -> ReviewLabels {
        let table = self.naming().suffixed(&self.rules.review_table_suffix);
        match self.store.read_all_rows(&table).await {
            Ok(rows) => {
                let (labels, skipped) =
                    ReviewLabels::from_table(&Table::from_rows(rows), self.rules.review_columns);
                if skipped > 0 {
                    warn!(table = %table, skipped, "review rows too short to label");
                }
                labels
            }
            Err(err) => {
                warn!(table = %table, error = %err, "review labels unavailable");
                ReviewLabels::default()
            }
        }
    }

    /// Load unit costs and append rows for newly seen (product, option)
    /// pairs. An unreadable cost table yields an empty book and no appends.
    async fn sync_cost_book(&self, records: &[OrderDetail]) -> (CostBook, usize) {
        let table_name = self.naming().suffixed(&self.rules.cost_table_suffix);
        let mut table = match self.store.read_all_rows(&table_name).await {
            Ok(rows) => Table::from_rows(rows),
            Err(err) => {
                warn!(table = %table_name, error = %err, "cost table unavailable");
                return (CostBook::default(), 0);
            }
        };
        if schema::migrate_header(&mut table, &CostBook::header()).is_change() {
            if let Err(err) = self
                .store
                .write_all_rows(&table_name, &table.header, &table.rows)
                .await
            {
                warn!(table = %table_name, error = %err, "cost header write failed");
                return (CostBook::from_table(&table), 0);
            }
        }

        let mut book = CostBook::from_table(&table);
        let fresh = book.unregistered_rows(records);
        if fresh.is_empty() {
            return (book, 0);
        }
        match self.store.append_rows(&table_name, &fresh).await {
            Ok(()) => {
                info!(table = %table_name, added = fresh.len(), "registered new cost rows");
                (book, fresh.len())
            }
            Err(err) => {
                warn!(table = %table_name, error = %err, "cost row append failed");
                (book, 0)
            }
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    SyncPipeline::from_config(SyncConfig::from_env())?.run_once().await
}
