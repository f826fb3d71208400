//! Affiliate click tracking and conversion counters.
//!
//! The same consistency pattern as billing on a smaller scale: a primary
//! record (the click) plus denormalized counters on the owning post and
//! user, with cached aggregates invalidated wholesale on every mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::cache::{Cache, CacheExt, ttl};
use crate::content::PostStore;
use crate::error::{ApiError, Result};
use crate::store::{InMemoryRepository, Pagination, Record, Repository};
use crate::users::{AffiliateDelta, UserStore};
use async_trait::async_trait;

/// Clicks from the same (ip, tool) pair within this window collapse into
/// the original record.
const DEDUP_WINDOW_SECONDS: u64 = 24 * 60 * 60;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Request metadata captured with a click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingData {
    pub ip: String,
    pub user_agent: String,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
}

/// One recorded click on an affiliate link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateClick {
    pub id: Uuid,
    /// Owner of the post the click came from; their counters move.
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub tool_name: String,
    pub network: String,
    pub tracking: TrackingData,
    /// Commission rate in percent, copied from the affiliate product.
    pub commission_rate: f64,
    pub converted: bool,
    pub conversion_value: Option<f64>,
    pub commission_earned: Option<f64>,
    pub clicked_at: u64,
    pub converted_at: Option<u64>,
}

impl Record for AffiliateClick {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> u64 {
        self.clicked_at
    }
}

/// Input for [`AffiliateService::track_click`].
#[derive(Debug, Clone)]
pub struct TrackClickRequest {
    pub post_id: Uuid,
    pub tool_name: String,
    pub network: String,
    pub tracking: TrackingData,
}

/// Aggregated affiliate statistics for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateStats {
    pub clicks: usize,
    pub conversions: usize,
    pub revenue: f64,
    pub conversion_rate: f64,
    pub average_order_value: f64,
}

/// Per-tool rollup for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPerformance {
    pub tool_name: String,
    pub clicks: usize,
    pub conversions: usize,
    pub revenue: f64,
    pub conversion_rate: f64,
}

/// Store for affiliate click records.
#[async_trait]
pub trait ClickStore: Send + Sync {
    async fn insert(&self, click: AffiliateClick) -> Result<AffiliateClick>;

    async fn get(&self, id: Uuid) -> Result<Option<AffiliateClick>>;

    /// Most recent click from this (ip, tool) pair at or after `since`.
    async fn recent_click(
        &self,
        ip: &str,
        tool_name: &str,
        since: u64,
    ) -> Result<Option<AffiliateClick>>;

    /// One-way conversion flip, guarded atomically: a click that is already
    /// converted fails with `AlreadyConverted` and stays untouched.
    async fn mark_converted(
        &self,
        id: Uuid,
        conversion_value: f64,
        commission_earned: f64,
        converted_at: u64,
    ) -> Result<AffiliateClick>;

    /// Every click owned by a user, newest first.
    async fn for_user(&self, user_id: Uuid) -> Result<Vec<AffiliateClick>>;

    /// Clicks recorded in `[since, until)`.
    async fn clicked_between(&self, since: u64, until: u64) -> Result<Vec<AffiliateClick>>;

    /// Conversions recorded in `[since, until)`.
    async fn converted_between(&self, since: u64, until: u64) -> Result<Vec<AffiliateClick>>;
}

/// In-memory click store.
#[derive(Clone, Default)]
pub struct InMemoryClickStore {
    repo: InMemoryRepository<AffiliateClick>,
}

impl InMemoryClickStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClickStore for InMemoryClickStore {
    async fn insert(&self, click: AffiliateClick) -> Result<AffiliateClick> {
        self.repo.create(click).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AffiliateClick>> {
        self.repo.get(id).await
    }

    async fn recent_click(
        &self,
        ip: &str,
        tool_name: &str,
        since: u64,
    ) -> Result<Option<AffiliateClick>> {
        let ip = ip.to_string();
        let tool_name = tool_name.to_string();
        self.repo
            .find_one(&move |c: &AffiliateClick| {
                c.tracking.ip == ip && c.tool_name == tool_name && c.clicked_at >= since
            })
            .await
    }

    async fn mark_converted(
        &self,
        id: Uuid,
        conversion_value: f64,
        commission_earned: f64,
        converted_at: u64,
    ) -> Result<AffiliateClick> {
        self.repo
            .update_with(
                id,
                Box::new(move |click| {
                    if click.converted {
                        return Err(ApiError::AlreadyConverted);
                    }
                    click.converted = true;
                    click.conversion_value = Some(conversion_value);
                    click.commission_earned = Some(commission_earned);
                    click.converted_at = Some(converted_at);
                    Ok(())
                }),
            )
            .await
    }

    async fn for_user(&self, user_id: Uuid) -> Result<Vec<AffiliateClick>> {
        let page = self
            .repo
            .find(
                &move |c: &AffiliateClick| c.user_id == user_id,
                Pagination::all(),
            )
            .await?;
        Ok(page.data)
    }

    async fn clicked_between(&self, since: u64, until: u64) -> Result<Vec<AffiliateClick>> {
        let page = self
            .repo
            .find(
                &move |c: &AffiliateClick| c.clicked_at >= since && c.clicked_at < until,
                Pagination::all(),
            )
            .await?;
        Ok(page.data)
    }

    async fn converted_between(&self, since: u64, until: u64) -> Result<Vec<AffiliateClick>> {
        let page = self
            .repo
            .find(
                &move |c: &AffiliateClick| {
                    c.converted
                        && c.converted_at
                            .map_or(false, |at| at >= since && at < until)
                },
                Pagination::all(),
            )
            .await?;
        Ok(page.data)
    }
}

/// Affiliate click/conversion service.
pub struct AffiliateService<C, P, U, K>
where
    C: ClickStore,
    P: PostStore,
    U: UserStore,
    K: Cache,
{
    clicks: C,
    posts: P,
    users: U,
    cache: K,
}

impl<C, P, U, K> AffiliateService<C, P, U, K>
where
    C: ClickStore,
    P: PostStore,
    U: UserStore,
    K: Cache,
{
    #[must_use]
    pub fn new(clicks: C, posts: P, users: U, cache: K) -> Self {
        Self {
            clicks,
            posts,
            users,
            cache,
        }
    }

    /// Record a click on an affiliate link.
    ///
    /// A repeat click from the same (ip, tool) pair inside the 24h window
    /// returns the existing record unchanged; counters only move for new
    /// clicks.
    pub async fn track_click(&self, request: TrackClickRequest) -> Result<AffiliateClick> {
        let post = self
            .posts
            .get(request.post_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Blog post not found"))?;

        let product = post
            .affiliate_product(&request.tool_name, &request.network)
            .ok_or_else(|| ApiError::validation("Invalid affiliate product"))?;

        let now = current_timestamp();
        let since = now.saturating_sub(DEDUP_WINDOW_SECONDS);
        if let Some(existing) = self
            .clicks
            .recent_click(&request.tracking.ip, &request.tool_name, since)
            .await?
        {
            tracing::debug!(
                target: "pressbill::affiliate",
                ip = %request.tracking.ip,
                tool = %request.tool_name,
                "duplicate click collapsed"
            );
            return Ok(existing);
        }

        let click = AffiliateClick {
            id: Uuid::new_v4(),
            user_id: post.user_id,
            post_id: post.id,
            tool_name: request.tool_name,
            network: request.network,
            tracking: request.tracking,
            commission_rate: product.commission,
            converted: false,
            conversion_value: None,
            commission_earned: None,
            clicked_at: now,
            converted_at: None,
        };
        let click = self.clicks.insert(click).await?;

        self.posts.record_affiliate_click(post.id).await?;
        self.users
            .apply_affiliate_delta(
                post.user_id,
                AffiliateDelta {
                    clicks: 1,
                    ..AffiliateDelta::default()
                },
            )
            .await?;

        self.invalidate_stats_cache(post.user_id).await?;

        Ok(click)
    }

    /// Mark a click as converted with a monetary value.
    ///
    /// One-way: converting an already-converted click fails and leaves
    /// every counter unchanged. The commission is derived from the rate
    /// captured at click time.
    pub async fn record_conversion(
        &self,
        click_id: Uuid,
        conversion_value: f64,
    ) -> Result<AffiliateClick> {
        let click = self
            .clicks
            .get(click_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Click not found"))?;

        if click.converted {
            return Err(ApiError::AlreadyConverted);
        }

        let commission_earned = conversion_value * click.commission_rate / 100.0;
        let now = current_timestamp();

        // The store guards the flip atomically; a racing conversion loses
        // here before any counter moves.
        let updated = self
            .clicks
            .mark_converted(click_id, conversion_value, commission_earned, now)
            .await?;

        self.posts
            .record_conversion(click.post_id, commission_earned)
            .await?;
        self.users
            .apply_affiliate_delta(
                click.user_id,
                AffiliateDelta {
                    conversions: 1,
                    earnings: commission_earned,
                    ..AffiliateDelta::default()
                },
            )
            .await?;

        self.invalidate_stats_cache(click.user_id).await?;

        tracing::info!(
            target: "pressbill::affiliate",
            click_id = %click_id,
            value = conversion_value,
            commission = commission_earned,
            "conversion recorded"
        );

        Ok(updated)
    }

    /// Aggregated stats for a user, memoized for 30 minutes.
    pub async fn stats(
        &self,
        user_id: Uuid,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<AffiliateStats> {
        let cache_key = format!(
            "affiliate:stats:{user_id}:{}:{}",
            start.map_or("all".to_string(), |t| t.to_string()),
            end.map_or("all".to_string(), |t| t.to_string()),
        );
        if let Some(cached) = self.cache.get::<AffiliateStats>(&cache_key).await? {
            return Ok(cached);
        }

        let in_range = |at: u64| start.map_or(true, |s| at >= s) && end.map_or(true, |e| at <= e);
        let all = self.clicks.for_user(user_id).await?;

        let clicks = all.iter().filter(|c| in_range(c.clicked_at)).count();
        let conversions: Vec<_> = all
            .iter()
            .filter(|c| c.converted && c.converted_at.map_or(false, in_range))
            .collect();
        let revenue: f64 = conversions
            .iter()
            .filter_map(|c| c.commission_earned)
            .sum();

        let stats = AffiliateStats {
            clicks,
            conversions: conversions.len(),
            revenue,
            conversion_rate: if clicks > 0 {
                conversions.len() as f64 / clicks as f64 * 100.0
            } else {
                0.0
            },
            average_order_value: if conversions.is_empty() {
                0.0
            } else {
                revenue / conversions.len() as f64
            },
        };

        self.cache
            .set(&cache_key, &stats, Some(ttl::MEDIUM))
            .await?;
        Ok(stats)
    }

    /// Best-earning tools for a user, memoized for 30 minutes.
    pub async fn top_tools(&self, user_id: Uuid, limit: usize) -> Result<Vec<ToolPerformance>> {
        let cache_key = format!("affiliate:top-tools:{user_id}:{limit}");
        if let Some(cached) = self.cache.get::<Vec<ToolPerformance>>(&cache_key).await? {
            return Ok(cached);
        }

        let mut by_tool: HashMap<String, ToolPerformance> = HashMap::new();
        for click in self.clicks.for_user(user_id).await? {
            let entry = by_tool
                .entry(click.tool_name.clone())
                .or_insert_with(|| ToolPerformance {
                    tool_name: click.tool_name.clone(),
                    clicks: 0,
                    conversions: 0,
                    revenue: 0.0,
                    conversion_rate: 0.0,
                });
            entry.clicks += 1;
            if click.converted {
                entry.conversions += 1;
                entry.revenue += click.commission_earned.unwrap_or(0.0);
            }
        }

        let mut tools: Vec<ToolPerformance> = by_tool
            .into_values()
            .map(|mut tool| {
                tool.conversion_rate = if tool.clicks > 0 {
                    tool.conversions as f64 / tool.clicks as f64 * 100.0
                } else {
                    0.0
                };
                tool
            })
            .collect();
        tools.sort_by(|a, b| {
            b.revenue
                .partial_cmp(&a.revenue)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        tools.truncate(limit);

        self.cache
            .set(&cache_key, &tools, Some(ttl::MEDIUM))
            .await?;
        Ok(tools)
    }

    /// Cached aggregates are dropped whole on every mutation, never patched.
    async fn invalidate_stats_cache(&self, user_id: Uuid) -> Result<()> {
        self.cache
            .delete_prefix(&format!("affiliate:stats:{user_id}:"))
            .await?;
        self.cache
            .delete_prefix(&format!("affiliate:top-tools:{user_id}:"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::content::{AffiliateProduct, InMemoryPostStore, Post, PostStatus};
    use crate::users::{InMemoryUserStore, User};

    type Service = AffiliateService<
        InMemoryClickStore,
        InMemoryPostStore,
        InMemoryUserStore,
        InMemoryCache,
    >;

    struct Fixture {
        service: Service,
        clicks: InMemoryClickStore,
        posts: InMemoryPostStore,
        users: InMemoryUserStore,
        owner: User,
        post: Post,
    }

    async fn fixture() -> Fixture {
        let clicks = InMemoryClickStore::new();
        let posts = InMemoryPostStore::new();
        let users = InMemoryUserStore::new();
        let cache = InMemoryCache::new(1_000);

        let owner = users
            .insert(User::new("author@example.com", "Author"))
            .await
            .unwrap();

        let mut post = Post::new(owner.id, "Ten AI tools compared");
        post.status = PostStatus::Published;
        post.affiliate_products.push(AffiliateProduct {
            tool_name: "CodeGen".into(),
            network: "impact".into(),
            affiliate_id: "aff_1".into(),
            commission: 10.0,
        });
        post.affiliate_products.push(AffiliateProduct {
            tool_name: "ImageForge".into(),
            network: "impact".into(),
            affiliate_id: "aff_2".into(),
            commission: 20.0,
        });
        let post = posts.insert(post).await.unwrap();

        Fixture {
            service: AffiliateService::new(clicks.clone(), posts.clone(), users.clone(), cache),
            clicks,
            posts,
            users,
            owner,
            post,
        }
    }

    fn request(fx: &Fixture, ip: &str, tool: &str) -> TrackClickRequest {
        TrackClickRequest {
            post_id: fx.post.id,
            tool_name: tool.to_string(),
            network: "impact".to_string(),
            tracking: TrackingData {
                ip: ip.to_string(),
                user_agent: "Mozilla/5.0".to_string(),
                referrer: None,
                utm_source: None,
                utm_medium: None,
                utm_campaign: None,
            },
        }
    }

    #[tokio::test]
    async fn duplicate_click_within_window_returns_original() {
        let fx = fixture().await;

        let first = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "CodeGen"))
            .await
            .unwrap();
        let second = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "CodeGen"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        // Counters moved once.
        let owner = fx.users.get(fx.owner.id).await.unwrap().unwrap();
        assert_eq!(owner.affiliate.clicks, 1);
        let post = fx.posts.get(fx.post.id).await.unwrap().unwrap();
        assert_eq!(post.analytics.affiliate_clicks, 1);

        // Same IP, different tool is a distinct click.
        let other = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "ImageForge"))
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn click_after_window_creates_new_record() {
        let fx = fixture().await;
        let now = current_timestamp();

        // A click from 25 hours ago, seeded directly.
        fx.clicks
            .insert(AffiliateClick {
                id: Uuid::new_v4(),
                user_id: fx.owner.id,
                post_id: fx.post.id,
                tool_name: "CodeGen".into(),
                network: "impact".into(),
                tracking: request(&fx, "1.2.3.4", "CodeGen").tracking,
                commission_rate: 10.0,
                converted: false,
                conversion_value: None,
                commission_earned: None,
                clicked_at: now - 25 * 60 * 60,
                converted_at: None,
            })
            .await
            .unwrap();

        let fresh = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "CodeGen"))
            .await
            .unwrap();
        assert!(fresh.clicked_at >= now);

        let all = fx.clicks.for_user(fx.owner.id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn unknown_post_or_product_rejected() {
        let fx = fixture().await;

        let mut bad_post = request(&fx, "1.2.3.4", "CodeGen");
        bad_post.post_id = Uuid::new_v4();
        let err = fx.service.track_click(bad_post).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let err = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "UnlistedTool"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn conversion_math_and_one_way_guard() {
        let fx = fixture().await;

        let click = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "CodeGen"))
            .await
            .unwrap();

        let converted = fx
            .service
            .record_conversion(click.id, 100.0)
            .await
            .unwrap();
        assert!(converted.converted);
        assert_eq!(converted.conversion_value, Some(100.0));
        assert_eq!(converted.commission_earned, Some(10.0));

        let owner = fx.users.get(fx.owner.id).await.unwrap().unwrap();
        assert!((owner.affiliate.earnings - 10.0).abs() < f64::EPSILON);
        assert_eq!(owner.affiliate.conversions, 1);

        let post = fx.posts.get(fx.post.id).await.unwrap().unwrap();
        assert!((post.analytics.revenue - 10.0).abs() < f64::EPSILON);

        // Second conversion fails and moves nothing.
        let err = fx
            .service
            .record_conversion(click.id, 500.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_CONVERTED");

        let owner = fx.users.get(fx.owner.id).await.unwrap().unwrap();
        assert!((owner.affiliate.earnings - 10.0).abs() < f64::EPSILON);
        assert_eq!(owner.affiliate.conversions, 1);
    }

    #[tokio::test]
    async fn stats_are_cached_and_invalidated_on_writes() {
        let fx = fixture().await;

        let click = fx
            .service
            .track_click(request(&fx, "1.2.3.4", "CodeGen"))
            .await
            .unwrap();

        let stats = fx.service.stats(fx.owner.id, None, None).await.unwrap();
        assert_eq!(stats.clicks, 1);
        assert_eq!(stats.conversions, 0);

        fx.service.record_conversion(click.id, 80.0).await.unwrap();

        // The write invalidated the cached aggregate.
        let stats = fx.service.stats(fx.owner.id, None, None).await.unwrap();
        assert_eq!(stats.conversions, 1);
        assert!((stats.revenue - 8.0).abs() < f64::EPSILON);
        assert!((stats.conversion_rate - 100.0).abs() < f64::EPSILON);
        assert!((stats.average_order_value - 8.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn top_tools_sorted_by_revenue() {
        let fx = fixture().await;

        let codegen = fx
            .service
            .track_click(request(&fx, "1.1.1.1", "CodeGen"))
            .await
            .unwrap();
        let imageforge = fx
            .service
            .track_click(request(&fx, "2.2.2.2", "ImageForge"))
            .await
            .unwrap();

        fx.service.record_conversion(codegen.id, 50.0).await.unwrap(); // 5.0
        fx.service
            .record_conversion(imageforge.id, 100.0)
            .await
            .unwrap(); // 20.0

        let tools = fx.service.top_tools(fx.owner.id, 5).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_name, "ImageForge");
        assert!((tools[0].revenue - 20.0).abs() < f64::EPSILON);
        assert_eq!(tools[1].tool_name, "CodeGen");

        let top_one = fx.service.top_tools(fx.owner.id, 1).await.unwrap();
        assert_eq!(top_one.len(), 1);
    }
}
