//! Daily analytics rollups.
//!
//! One record per calendar day, unique on the date. The rollup is
//! idempotent: re-running it for a day that already has a record returns
//! that record untouched.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::affiliate::ClickStore;
use crate::billing::store::SubscriptionStore;
use crate::billing::subscription::BillingOutcome;
use crate::cache::{Cache, CacheExt, ttl};
use crate::content::{PostPerformance, PostStore};
use crate::error::{ApiError, Result};
use crate::store::{InMemoryRepository, Pagination, Record, Repository};
use async_trait::async_trait;

const TOP_POSTS_LIMIT: usize = 10;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Unix-seconds bounds of one calendar day (UTC).
fn day_bounds(date: NaiveDate) -> (u64, u64) {
    let start = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp().max(0) as u64)
        .unwrap_or(0);
    (start, start + 86_400)
}

/// Revenue by source, in currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RevenueMetrics {
    pub total: f64,
    pub affiliate: f64,
    pub subscriptions: f64,
    pub sponsored: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrafficMetrics {
    pub page_views: u64,
    pub unique_visitors: u64,
    pub average_session_duration: f64,
    pub bounce_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversionMetrics {
    pub affiliate_clicks: u64,
    pub affiliate_conversions: u64,
    pub subscription_signups: u64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContentMetrics {
    pub total_posts: usize,
    pub premium_posts: usize,
    pub top_performing_posts: Vec<PostPerformance>,
}

/// One day's aggregated metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub id: Uuid,
    pub date: NaiveDate,
    pub revenue: RevenueMetrics,
    pub traffic: TrafficMetrics,
    pub conversions: ConversionMetrics,
    pub content: ContentMetrics,
    pub created_at: u64,
}

impl Record for DailyMetrics {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }
}

/// Store for daily rollup records.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn find_by_date(&self, date: NaiveDate) -> Result<Option<DailyMetrics>>;

    /// Insert a rollup record. Fails if the date is already recorded.
    async fn insert(&self, metrics: DailyMetrics) -> Result<DailyMetrics>;

    /// Records in `[start, end]`, oldest first.
    async fn range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyMetrics>>;
}

/// In-memory analytics store.
#[derive(Clone, Default)]
pub struct InMemoryAnalyticsStore {
    repo: InMemoryRepository<DailyMetrics>,
}

impl InMemoryAnalyticsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn find_by_date(&self, date: NaiveDate) -> Result<Option<DailyMetrics>> {
        self.repo
            .find_one(&move |m: &DailyMetrics| m.date == date)
            .await
    }

    async fn insert(&self, metrics: DailyMetrics) -> Result<DailyMetrics> {
        let date = metrics.date;
        if self
            .repo
            .exists(&move |m: &DailyMetrics| m.date == date)
            .await?
        {
            return Err(ApiError::validation("Metrics already recorded for date"));
        }
        self.repo.create(metrics).await
    }

    async fn range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyMetrics>> {
        let page = self
            .repo
            .find(
                &move |m: &DailyMetrics| m.date >= start && m.date <= end,
                Pagination::all(),
            )
            .await?;
        let mut data = page.data;
        data.sort_by_key(|m| m.date);
        Ok(data)
    }
}

/// Daily rollup service.
pub struct AnalyticsService<A, P, S, C, K>
where
    A: AnalyticsStore,
    P: PostStore,
    S: SubscriptionStore,
    C: ClickStore,
    K: Cache,
{
    store: A,
    posts: P,
    subscriptions: S,
    clicks: C,
    cache: K,
}

impl<A, P, S, C, K> AnalyticsService<A, P, S, C, K>
where
    A: AnalyticsStore,
    P: PostStore,
    S: SubscriptionStore,
    C: ClickStore,
    K: Cache,
{
    #[must_use]
    pub fn new(store: A, posts: P, subscriptions: S, clicks: C, cache: K) -> Self {
        Self {
            store,
            posts,
            subscriptions,
            clicks,
            cache,
        }
    }

    /// Compute and persist the rollup for one calendar day.
    ///
    /// Idempotent per day: an existing record is returned as-is and nothing
    /// is recomputed.
    pub async fn record_daily_metrics(&self, date: NaiveDate) -> Result<DailyMetrics> {
        if let Some(existing) = self.store.find_by_date(date).await? {
            return Ok(existing);
        }

        let (day_start, day_end) = day_bounds(date);

        let revenue = self.revenue_metrics(day_start, day_end).await?;
        let traffic = self.traffic_metrics(day_start, day_end).await?;
        let conversions = self.conversion_metrics(day_start, day_end).await?;
        let content = self.content_metrics().await?;

        let metrics = DailyMetrics {
            id: Uuid::new_v4(),
            date,
            revenue,
            traffic,
            conversions,
            content,
            created_at: current_timestamp(),
        };
        let metrics = self.store.insert(metrics).await?;

        self.cache.delete_prefix("analytics:").await?;

        tracing::info!(
            target: "pressbill::analytics",
            date = %date,
            revenue = metrics.revenue.total,
            page_views = metrics.traffic.page_views,
            "daily metrics recorded"
        );

        Ok(metrics)
    }

    /// Rollups for a date range, memoized for 24 hours.
    pub async fn metrics_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyMetrics>> {
        let cache_key = format!("analytics:metrics:{start}:{end}");
        if let Some(cached) = self.cache.get::<Vec<DailyMetrics>>(&cache_key).await? {
            return Ok(cached);
        }

        let metrics = self.store.range(start, end).await?;
        self.cache
            .set(&cache_key, &metrics, Some(ttl::LONG))
            .await?;
        Ok(metrics)
    }

    async fn revenue_metrics(&self, since: u64, until: u64) -> Result<RevenueMetrics> {
        let affiliate: f64 = self
            .clicks
            .converted_between(since, until)
            .await?
            .iter()
            .filter_map(|c| c.commission_earned)
            .sum();

        // Billing history is authoritative for subscription revenue; count
        // the charges that succeeded inside the window.
        let mut subscription_cents: i64 = 0;
        for sub in self.subscriptions.list_all().await? {
            subscription_cents += sub
                .billing_history
                .iter()
                .filter(|entry| {
                    entry.outcome == BillingOutcome::Succeeded
                        && entry.timestamp >= since
                        && entry.timestamp < until
                })
                .map(|entry| entry.amount_cents)
                .sum::<i64>();
        }
        let subscriptions = subscription_cents as f64 / 100.0;

        // No sponsored-content source is wired up yet.
        let sponsored = 0.0;

        Ok(RevenueMetrics {
            total: affiliate + subscriptions + sponsored,
            affiliate,
            subscriptions,
            sponsored,
        })
    }

    async fn traffic_metrics(&self, since: u64, until: u64) -> Result<TrafficMetrics> {
        let posts = self.posts.updated_between(since, until).await?;

        let mut page_views = 0u64;
        let mut unique_visitors = 0u64;
        let mut total_session_duration = 0.0;
        let mut bounces = 0u64;
        for post in &posts {
            page_views += post.analytics.views;
            unique_visitors += post.analytics.unique_visitors;
            total_session_duration +=
                post.analytics.views as f64 * post.analytics.average_time_on_page;
            bounces += post.analytics.bounces;
        }

        Ok(TrafficMetrics {
            page_views,
            unique_visitors,
            average_session_duration: if page_views > 0 {
                total_session_duration / page_views as f64
            } else {
                0.0
            },
            bounce_rate: if page_views > 0 {
                bounces as f64 / page_views as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    async fn conversion_metrics(&self, since: u64, until: u64) -> Result<ConversionMetrics> {
        let affiliate_clicks = self.clicks.clicked_between(since, until).await?.len() as u64;
        let affiliate_conversions = self.clicks.converted_between(since, until).await?.len() as u64;
        let subscription_signups = self
            .subscriptions
            .created_between(since, until)
            .await? as u64;

        Ok(ConversionMetrics {
            affiliate_clicks,
            affiliate_conversions,
            subscription_signups,
            conversion_rate: if affiliate_clicks > 0 {
                affiliate_conversions as f64 / affiliate_clicks as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    async fn content_metrics(&self) -> Result<ContentMetrics> {
        Ok(ContentMetrics {
            total_posts: self.posts.count_published().await?,
            premium_posts: self.posts.count_premium().await?,
            top_performing_posts: self.posts.top_performing(TOP_POSTS_LIMIT).await?,
        })
    }
}
