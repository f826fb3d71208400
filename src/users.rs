//! User records and the entitlement mirror.
//!
//! The user record carries a denormalized mirror of subscription entitlement
//! for fast authorization checks. The mirror is a cache — the Subscription
//! record is authoritative — and converges after every reconciliation event.
//! Updates go through explicit per-field operations on [`UserStore`]; there
//! is no merge-arbitrary-fields path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::plans::Plan;
use crate::billing::subscription::SubscriptionStatus;
use crate::error::{ApiError, Result};
use crate::providers::ProviderKind;
use crate::store::{InMemoryRepository, Record, Repository};
use async_trait::async_trait;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Role of a platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Subscriber,
    #[default]
    Guest,
}

/// Denormalized subscription entitlement on the user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubscriptionMirror {
    pub is_active: bool,
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<Plan>,
    /// Expiry of the current entitlement (unix seconds).
    pub expires_at: Option<u64>,
    pub canceled_at: Option<u64>,
}

/// Running affiliate counters on the user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AffiliateTotals {
    pub clicks: u64,
    pub conversions: u64,
    pub earnings: f64,
}

/// Increment applied to a user's affiliate counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffiliateDelta {
    pub clicks: u64,
    pub conversions: u64,
    pub earnings: f64,
}

/// A platform user (the subset this crate owns).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    /// Provider-side customer ids, cached so repeat subscriptions reuse them.
    pub stripe_customer_id: Option<String>,
    pub paddle_customer_id: Option<String>,
    pub subscription: SubscriptionMirror,
    pub affiliate: AffiliateTotals,
    pub created_at: u64,
}

impl User {
    #[must_use]
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name: name.into(),
            role: Role::default(),
            stripe_customer_id: None,
            paddle_customer_id: None,
            subscription: SubscriptionMirror::default(),
            affiliate: AffiliateTotals::default(),
            created_at: current_timestamp(),
        }
    }

    /// Cached provider customer reference, if one has been created.
    #[must_use]
    pub fn customer_ref(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Stripe => self.stripe_customer_id.as_deref(),
            ProviderKind::Paddle => self.paddle_customer_id.as_deref(),
        }
    }

    /// Whether the mirror says the user is entitled right now.
    #[must_use]
    pub fn has_active_subscription(&self, now: u64) -> bool {
        self.subscription.is_active
            && self.subscription.expires_at.map_or(false, |at| at > now)
    }
}

impl Record for User {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }
}

/// Store for user records with explicit per-field update operations.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<User>>;

    async fn insert(&self, user: User) -> Result<User>;

    /// Cache a provider customer reference on the user.
    async fn set_provider_customer(
        &self,
        id: Uuid,
        provider: ProviderKind,
        customer_ref: &str,
    ) -> Result<()>;

    /// Overwrite the entitlement mirror (write-through after reconciliation).
    async fn set_entitlement(&self, id: Uuid, mirror: SubscriptionMirror) -> Result<()>;

    /// Drop the active entitlement, stamping the cancellation time. Plan and
    /// expiry are left in place as historical data.
    async fn clear_entitlement(&self, id: Uuid, canceled_at: u64) -> Result<()>;

    /// Apply increments to the affiliate counters.
    async fn apply_affiliate_delta(&self, id: Uuid, delta: AffiliateDelta) -> Result<()>;
}

/// In-memory user store.
#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    repo: InMemoryRepository<User>,
}

impl InMemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        self.repo.get(id).await
    }

    async fn insert(&self, user: User) -> Result<User> {
        let email = user.email.clone();
        if self
            .repo
            .exists(&move |u: &User| u.email == email)
            .await?
        {
            return Err(ApiError::validation("Email already registered"));
        }
        self.repo.create(user).await
    }

    async fn set_provider_customer(
        &self,
        id: Uuid,
        provider: ProviderKind,
        customer_ref: &str,
    ) -> Result<()> {
        let customer_ref = customer_ref.to_string();
        self.repo
            .update_with(
                id,
                Box::new(move |user| {
                    match provider {
                        ProviderKind::Stripe => user.stripe_customer_id = Some(customer_ref),
                        ProviderKind::Paddle => user.paddle_customer_id = Some(customer_ref),
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn set_entitlement(&self, id: Uuid, mirror: SubscriptionMirror) -> Result<()> {
        self.repo
            .update_with(
                id,
                Box::new(move |user| {
                    user.subscription = mirror;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn clear_entitlement(&self, id: Uuid, canceled_at: u64) -> Result<()> {
        self.repo
            .update_with(
                id,
                Box::new(move |user| {
                    user.subscription.is_active = false;
                    user.subscription.status = Some(SubscriptionStatus::Canceled);
                    user.subscription.canceled_at = Some(canceled_at);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn apply_affiliate_delta(&self, id: Uuid, delta: AffiliateDelta) -> Result<()> {
        self.repo
            .update_with(
                id,
                Box::new(move |user| {
                    user.affiliate.clicks += delta.clicks;
                    user.affiliate.conversions += delta.conversions;
                    user.affiliate.earnings += delta.earnings;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_rejects_duplicate_email() {
        let store = InMemoryUserStore::new();
        store
            .insert(User::new("a@example.com", "A"))
            .await
            .unwrap();

        let err = store
            .insert(User::new("a@example.com", "A2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn entitlement_mirror_roundtrip() {
        let store = InMemoryUserStore::new();
        let user = store.insert(User::new("a@example.com", "A")).await.unwrap();

        let now = current_timestamp();
        store
            .set_entitlement(
                user.id,
                SubscriptionMirror {
                    is_active: true,
                    status: Some(SubscriptionStatus::Active),
                    plan: Some(Plan::Pro),
                    expires_at: Some(now + 86_400),
                    canceled_at: None,
                },
            )
            .await
            .unwrap();

        let user = store.get(user.id).await.unwrap().unwrap();
        assert!(user.has_active_subscription(now));
        assert_eq!(user.subscription.plan, Some(Plan::Pro));

        store.clear_entitlement(user.id, now).await.unwrap();
        let user = store.get(user.id).await.unwrap().unwrap();
        assert!(!user.has_active_subscription(now));
        assert_eq!(user.subscription.canceled_at, Some(now));
        // Historical plan survives the clear.
        assert_eq!(user.subscription.plan, Some(Plan::Pro));
    }

    #[tokio::test]
    async fn expired_mirror_is_not_active() {
        let store = InMemoryUserStore::new();
        let user = store.insert(User::new("a@example.com", "A")).await.unwrap();
        let now = current_timestamp();

        store
            .set_entitlement(
                user.id,
                SubscriptionMirror {
                    is_active: true,
                    status: Some(SubscriptionStatus::Active),
                    plan: Some(Plan::Basic),
                    expires_at: Some(now - 1),
                    canceled_at: None,
                },
            )
            .await
            .unwrap();

        let user = store.get(user.id).await.unwrap().unwrap();
        assert!(!user.has_active_subscription(now));
    }

    #[tokio::test]
    async fn affiliate_deltas_accumulate() {
        let store = InMemoryUserStore::new();
        let user = store.insert(User::new("a@example.com", "A")).await.unwrap();

        store
            .apply_affiliate_delta(
                user.id,
                AffiliateDelta {
                    clicks: 1,
                    ..AffiliateDelta::default()
                },
            )
            .await
            .unwrap();
        store
            .apply_affiliate_delta(
                user.id,
                AffiliateDelta {
                    conversions: 1,
                    earnings: 12.5,
                    ..AffiliateDelta::default()
                },
            )
            .await
            .unwrap();

        let user = store.get(user.id).await.unwrap().unwrap();
        assert_eq!(user.affiliate.clicks, 1);
        assert_eq!(user.affiliate.conversions, 1);
        assert!((user.affiliate.earnings - 12.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn provider_customer_refs() {
        let store = InMemoryUserStore::new();
        let user = store.insert(User::new("a@example.com", "A")).await.unwrap();

        store
            .set_provider_customer(user.id, ProviderKind::Stripe, "cus_123")
            .await
            .unwrap();

        let user = store.get(user.id).await.unwrap().unwrap();
        assert_eq!(user.customer_ref(ProviderKind::Stripe), Some("cus_123"));
        assert_eq!(user.customer_ref(ProviderKind::Paddle), None);
    }
}
