//! Post records at the content interface boundary.
//!
//! The blog content model itself (bodies, search, editorial CRUD) lives
//! outside this crate. What lives here is the slice the monetization side
//! needs: which affiliate products a post carries and the denormalized
//! counters that click/conversion tracking and the daily rollup mutate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{InMemoryRepository, Pagination, Record, Repository};
use async_trait::async_trait;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Publication status of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    #[default]
    Draft,
    Published,
}

/// An affiliate product embedded in a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliateProduct {
    pub tool_name: String,
    pub network: String,
    pub affiliate_id: String,
    /// Commission rate in percent.
    pub commission: f64,
}

/// Denormalized per-post counters.
///
/// Traffic counters (views, visitors, session time, bounces) are written by
/// the content layer; click/conversion/revenue counters by the affiliate
/// service. The rollup only ever reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PostCounters {
    pub views: u64,
    pub unique_visitors: u64,
    pub average_time_on_page: f64,
    pub bounces: u64,
    pub affiliate_clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
    /// When any counter last changed (unix seconds).
    pub last_updated: u64,
}

/// A blog post (the monetization-relevant subset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub status: PostStatus,
    pub is_premium: bool,
    pub affiliate_products: Vec<AffiliateProduct>,
    pub analytics: PostCounters,
    pub created_at: u64,
}

impl Post {
    #[must_use]
    pub fn new(user_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            status: PostStatus::default(),
            is_premium: false,
            affiliate_products: Vec::new(),
            analytics: PostCounters::default(),
            created_at: current_timestamp(),
        }
    }

    /// Find the affiliate product matching a tool/network pair.
    #[must_use]
    pub fn affiliate_product(&self, tool_name: &str, network: &str) -> Option<&AffiliateProduct> {
        self.affiliate_products
            .iter()
            .find(|p| p.tool_name == tool_name && p.network == network)
    }
}

impl Record for Post {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }
}

/// Per-post performance row for the daily rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostPerformance {
    pub post_id: Uuid,
    pub views: u64,
    pub revenue: f64,
}

/// Store for post records.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Post>>;

    async fn insert(&self, post: Post) -> Result<Post>;

    /// Bump the post's affiliate click counter.
    async fn record_affiliate_click(&self, id: Uuid) -> Result<()>;

    /// Bump the post's conversion counter and add to its revenue.
    async fn record_conversion(&self, id: Uuid, revenue: f64) -> Result<()>;

    async fn count_published(&self) -> Result<usize>;

    async fn count_premium(&self) -> Result<usize>;

    /// Published posts whose counters changed in `[since, until)`.
    async fn updated_between(&self, since: u64, until: u64) -> Result<Vec<Post>>;

    /// Top published posts by revenue.
    async fn top_performing(&self, limit: usize) -> Result<Vec<PostPerformance>>;
}

/// In-memory post store.
#[derive(Clone, Default)]
pub struct InMemoryPostStore {
    repo: InMemoryRepository<Post>,
}

impl InMemoryPostStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostStore for InMemoryPostStore {
    async fn get(&self, id: Uuid) -> Result<Option<Post>> {
        self.repo.get(id).await
    }

    async fn insert(&self, post: Post) -> Result<Post> {
        self.repo.create(post).await
    }

    async fn record_affiliate_click(&self, id: Uuid) -> Result<()> {
        self.repo
            .update_with(
                id,
                Box::new(|post| {
                    post.analytics.affiliate_clicks += 1;
                    post.analytics.last_updated = current_timestamp();
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn record_conversion(&self, id: Uuid, revenue: f64) -> Result<()> {
        self.repo
            .update_with(
                id,
                Box::new(move |post| {
                    post.analytics.conversions += 1;
                    post.analytics.revenue += revenue;
                    post.analytics.last_updated = current_timestamp();
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn count_published(&self) -> Result<usize> {
        self.repo
            .count(&|p: &Post| p.status == PostStatus::Published)
            .await
    }

    async fn count_premium(&self) -> Result<usize> {
        self.repo
            .count(&|p: &Post| p.status == PostStatus::Published && p.is_premium)
            .await
    }

    async fn updated_between(&self, since: u64, until: u64) -> Result<Vec<Post>> {
        let page = self
            .repo
            .find(
                &move |p: &Post| {
                    p.status == PostStatus::Published
                        && p.analytics.last_updated >= since
                        && p.analytics.last_updated < until
                },
                Pagination::all(),
            )
            .await?;
        Ok(page.data)
    }

    async fn top_performing(&self, limit: usize) -> Result<Vec<PostPerformance>> {
        let page = self
            .repo
            .find(
                &|p: &Post| p.status == PostStatus::Published,
                Pagination::all(),
            )
            .await?;

        let mut posts = page.data;
        posts.sort_by(|a, b| {
            b.analytics
                .revenue
                .partial_cmp(&a.analytics.revenue)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(posts
            .into_iter()
            .take(limit)
            .map(|p| PostPerformance {
                post_id: p.id,
                views: p.analytics.views,
                revenue: p.analytics.revenue,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published_post(user_id: Uuid, title: &str, revenue: f64) -> Post {
        let mut post = Post::new(user_id, title);
        post.status = PostStatus::Published;
        post.analytics.revenue = revenue;
        post
    }

    #[tokio::test]
    async fn affiliate_product_lookup() {
        let mut post = Post::new(Uuid::new_v4(), "Review");
        post.affiliate_products.push(AffiliateProduct {
            tool_name: "CodeGen".into(),
            network: "impact".into(),
            affiliate_id: "aff_1".into(),
            commission: 10.0,
        });

        assert!(post.affiliate_product("CodeGen", "impact").is_some());
        assert!(post.affiliate_product("CodeGen", "clickbank").is_none());
        assert!(post.affiliate_product("Other", "impact").is_none());
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let store = InMemoryPostStore::new();
        let post = store.insert(Post::new(Uuid::new_v4(), "p")).await.unwrap();

        store.record_affiliate_click(post.id).await.unwrap();
        store.record_affiliate_click(post.id).await.unwrap();
        store.record_conversion(post.id, 9.5).await.unwrap();

        let post = store.get(post.id).await.unwrap().unwrap();
        assert_eq!(post.analytics.affiliate_clicks, 2);
        assert_eq!(post.analytics.conversions, 1);
        assert!((post.analytics.revenue - 9.5).abs() < f64::EPSILON);
        assert!(post.analytics.last_updated > 0);
    }

    #[tokio::test]
    async fn published_and_premium_counts() {
        let store = InMemoryPostStore::new();
        let user = Uuid::new_v4();

        store.insert(Post::new(user, "draft")).await.unwrap();
        store
            .insert(published_post(user, "free", 0.0))
            .await
            .unwrap();
        let mut premium = published_post(user, "premium", 0.0);
        premium.is_premium = true;
        store.insert(premium).await.unwrap();

        assert_eq!(store.count_published().await.unwrap(), 2);
        assert_eq!(store.count_premium().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn top_performing_sorted_by_revenue() {
        let store = InMemoryPostStore::new();
        let user = Uuid::new_v4();

        store.insert(published_post(user, "low", 5.0)).await.unwrap();
        let top = store
            .insert(published_post(user, "high", 50.0))
            .await
            .unwrap();
        store
            .insert(published_post(user, "mid", 20.0))
            .await
            .unwrap();

        let performing = store.top_performing(2).await.unwrap();
        assert_eq!(performing.len(), 2);
        assert_eq!(performing[0].post_id, top.id);
    }
}
