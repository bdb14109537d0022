//! Order feed contracts + fixture-first and commerce-API implementations.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use olr_core::{lenient, OrderDetail};
use olr_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "olr-adapters";

pub const LAST_CHANGED_PATH: &str = "/v1/pay-order/seller/product-orders/last-changed-statuses";
pub const DETAIL_QUERY_PATH: &str = "/v1/pay-order/seller/product-orders/query";
pub const DETAIL_CHUNK_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading fixture {}: {source}", path.display())]
    FixtureRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fixture {}: {source}", path.display())]
    FixtureParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("all {attempted} feed requests failed; last error: {last}")]
    Exhausted {
        attempted: usize,
        #[source]
        last: FetchError,
    },
}

/// Which slice of the change log to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeScan {
    pub now: DateTime<Utc>,
    pub lookback: Duration,
    pub step: Duration,
    pub limit_count: Option<u32>,
}

impl ChangeScan {
    /// Day-by-day scan over the last `days` days.
    pub fn daily(now: DateTime<Utc>, days: u32) -> Self {
        Self {
            now,
            lookback: Duration::days(i64::from(days)),
            step: Duration::days(1),
            limit_count: None,
        }
    }

    /// One request covering the last `hours` hours.
    pub fn recent(now: DateTime<Utc>, hours: u32, limit_count: u32) -> Self {
        let lookback = Duration::hours(i64::from(hours));
        Self {
            now,
            lookback,
            step: lookback,
            limit_count: Some(limit_count),
        }
    }

    /// `lastChangedFrom` values, oldest first, strictly before `now`.
    pub fn window_starts(&self) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        if self.step <= Duration::zero() {
            return starts;
        }
        let mut cursor = self.now - self.lookback;
        while cursor < self.now {
            starts.push(cursor);
            cursor += self.step;
        }
        starts
    }
}

/// Records returned by one feed call plus request accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedBatch {
    pub orders: Vec<OrderDetail>,
    pub requests: usize,
    pub failed_requests: usize,
}

impl FeedBatch {
    fn absorb(&mut self, other: FeedBatch) {
        self.orders.extend(other.orders);
        self.requests += other.requests;
        self.failed_requests += other.failed_requests;
    }
}

#[async_trait]
pub trait OrderFeed: Send + Sync {
    fn feed_id(&self) -> &str;

    /// Order details for every line item whose status changed inside the scan.
    async fn changed_orders(&self, scan: &ChangeScan) -> Result<FeedBatch, FeedError>;

    /// Current details for specific line items.
    async fn order_details(&self, product_order_ids: &[String]) -> Result<FeedBatch, FeedError>;
}

/// `data` of a detail query: either a bare list or a paged wrapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DetailData {
    List(Vec<OrderDetail>),
    Paged {
        #[serde(default)]
        contents: Vec<OrderDetail>,
    },
}

impl DetailData {
    fn into_orders(self) -> Vec<OrderDetail> {
        match self {
            Self::List(orders) => orders,
            Self::Paged { contents } => contents,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DetailEnvelope {
    Bare(Vec<OrderDetail>),
    Wrapped {
        #[serde(default)]
        data: Option<DetailData>,
    },
}

impl DetailEnvelope {
    fn into_orders(self) -> Vec<OrderDetail> {
        match self {
            Self::Bare(orders) => orders,
            Self::Wrapped { data } => data.map(DetailData::into_orders).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LastChangedResponse {
    data: Option<LastChangedData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LastChangedData {
    last_change_statuses: Vec<LastChangedStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LastChangedStatus {
    #[serde(deserialize_with = "lenient::opt_string")]
    product_order_id: Option<String>,
}

/// Reads order details from a JSON file captured from the feed.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    path: PathBuf,
}

impl FixtureFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn load_fixture_orders(path: impl AsRef<Path>) -> Result<Vec<OrderDetail>, FeedError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| FeedError::FixtureRead {
        path: path.to_path_buf(),
        source,
    })?;
    let envelope: DetailEnvelope =
        serde_json::from_str(&data).map_err(|source| FeedError::FixtureParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(envelope.into_orders())
}

#[async_trait]
impl OrderFeed for FixtureFeed {
    fn feed_id(&self) -> &str {
        "fixture"
    }

    async fn changed_orders(&self, _scan: &ChangeScan) -> Result<FeedBatch, FeedError> {
        let orders = load_fixture_orders(&self.path)?;
        Ok(FeedBatch {
            orders,
            requests: 1,
            failed_requests: 0,
        })
    }

    async fn order_details(&self, product_order_ids: &[String]) -> Result<FeedBatch, FeedError> {
        let wanted: HashSet<&str> = product_order_ids.iter().map(String::as_str).collect();
        let orders = load_fixture_orders(&self.path)?
            .into_iter()
            .filter(|o| o.product_order_id().is_some_and(|id| wanted.contains(id)))
            .collect();
        Ok(FeedBatch {
            orders,
            requests: 1,
            failed_requests: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommerceApiConfig {
    pub base_url: String,
    pub access_token: String,
}

/// Commerce API client: changed-status scan followed by chunked detail queries.
#[derive(Debug)]
pub struct CommerceApiFeed {
    http: HttpFetcher,
    config: CommerceApiConfig,
}

impl CommerceApiFeed {
    pub fn new(config: CommerceApiConfig, http: HttpFetcher) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn changed_ids(&self, scan: &ChangeScan) -> Result<(Vec<String>, FeedBatch), FeedError> {
        let url = self.url(LAST_CHANGED_PATH);
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut batch = FeedBatch::default();
        let mut last_error = None;

        for start in scan.window_starts() {
            let mut query = vec![(
                "lastChangedFrom",
                start.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            )];
            if let Some(limit) = scan.limit_count {
                query.push(("limitCount", limit.to_string()));
            }

            batch.requests += 1;
            match self
                .http
                .get_json::<LastChangedResponse>(&url, &self.config.access_token, &query)
                .await
            {
                Ok(resp) => {
                    let statuses = resp.data.unwrap_or_default().last_change_statuses;
                    for id in statuses.into_iter().filter_map(|s| s.product_order_id) {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                }
                Err(err) if err.is_auth_failure() => return Err(err.into()),
                Err(err) => {
                    warn!(window_start = %start, error = %err, "change scan request failed");
                    batch.failed_requests += 1;
                    last_error = Some(err);
                }
            }
        }

        if let Some(last) = last_error {
            if batch.failed_requests == batch.requests {
                return Err(FeedError::Exhausted {
                    attempted: batch.requests,
                    last,
                });
            }
        }
        Ok((ids, batch))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetailQuery<'a> {
    product_order_ids: &'a [String],
}

#[async_trait]
impl OrderFeed for CommerceApiFeed {
    fn feed_id(&self) -> &str {
        "commerce-api"
    }

    async fn changed_orders(&self, scan: &ChangeScan) -> Result<FeedBatch, FeedError> {
        let (ids, mut batch) = self.changed_ids(scan).await?;
        info!(
            changed = ids.len(),
            windows = batch.requests,
            "collected changed line items"
        );
        if !ids.is_empty() {
            batch.absorb(self.order_details(&ids).await?);
        }
        Ok(batch)
    }

    async fn order_details(&self, product_order_ids: &[String]) -> Result<FeedBatch, FeedError> {
        let url = self.url(DETAIL_QUERY_PATH);
        let mut batch = FeedBatch::default();
        let mut last_error = None;

        for chunk in product_order_ids.chunks(DETAIL_CHUNK_SIZE) {
            batch.requests += 1;
            let payload = DetailQuery {
                product_order_ids: chunk,
            };
            match self
                .http
                .post_json::<_, DetailEnvelope>(&url, &self.config.access_token, &payload)
                .await
            {
                Ok(envelope) => batch.orders.extend(envelope.into_orders()),
                Err(err) if err.is_auth_failure() => return Err(err.into()),
                Err(err) => {
                    warn!(chunk = chunk.len(), error = %err, "detail query failed");
                    batch.failed_requests += 1;
                    last_error = Some(err);
                }
            }
        }

        if let Some(last) = last_error {
            if batch.failed_requests == batch.requests {
                return Err(FeedError::Exhausted {
                    attempted: batch.requests,
                    last,
                });
            }
        }
        Ok(batch)
    }
}

/// Feed selection resolved from configuration.
#[derive(Debug, Clone)]
pub enum FeedSettings {
    Fixture {
        path: PathBuf,
    },
    CommerceApi {
        api: CommerceApiConfig,
        http: HttpClientConfig,
    },
}

pub fn feed_from_settings(settings: FeedSettings) -> anyhow::Result<Box<dyn OrderFeed>> {
    match settings {
        FeedSettings::Fixture { path } => Ok(Box::new(FixtureFeed::new(path))),
        FeedSettings::CommerceApi { api, http } => {
            if api.access_token.trim().is_empty() {
                anyhow::bail!("commerce api feed requires an access token");
            }
            let http = HttpFetcher::new(http).context("building commerce api client")?;
            Ok(Box::new(CommerceApiFeed::new(api, http)))
        }
    }
}
