//! Storage trait for subscription records and webhook idempotency.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use super::subscription::{Subscription, SubscriptionStatus};
use crate::error::{ApiError, Result};
use crate::store::{InMemoryRepository, Pagination, Repository};

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Store for subscription records.
///
/// `compare_and_save` is the per-externalId serialization point: concurrent
/// reconciliations for the same subscription race on the version counter and
/// the loser redelivers. Production implementations must make it an atomic
/// conditional write (`UPDATE ... WHERE version = $expected`).
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a new subscription. Fails if the externalId is already taken.
    async fn insert(&self, subscription: Subscription) -> Result<Subscription>;

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>>;

    /// Resolve by the provider's subscription id (the reconciliation join key).
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Subscription>>;

    /// The user's subscription with status=active, if any.
    async fn active_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    /// The user's most recent subscription regardless of status.
    async fn latest_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    /// Save only if the stored version still equals `expected_version`.
    ///
    /// On success the stored record carries `expected_version + 1`.
    /// Returns `Ok(false)` on a version mismatch.
    async fn compare_and_save(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> Result<bool>;

    /// Every subscription record (rollups iterate billing history).
    async fn list_all(&self) -> Result<Vec<Subscription>>;

    /// Number of subscriptions created in `[since, until)`.
    async fn created_between(&self, since: u64, until: u64) -> Result<usize>;

    // Webhook idempotency

    async fn is_event_processed(&self, event_key: &str) -> Result<bool>;

    async fn mark_event_processed(&self, event_key: &str) -> Result<()>;
}

/// In-memory subscription store.
#[derive(Clone, Default)]
pub struct InMemorySubscriptionStore {
    repo: InMemoryRepository<Subscription>,
    processed_events: Arc<RwLock<HashMap<String, u64>>>,
}

impl InMemorySubscriptionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Processed event keys (for test assertions).
    #[must_use]
    pub fn processed_events(&self) -> Vec<String> {
        self.processed_events
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, subscription: Subscription) -> Result<Subscription> {
        let external_id = subscription.external_id.clone();
        if self
            .repo
            .exists(&move |s: &Subscription| s.external_id == external_id)
            .await?
        {
            return Err(ApiError::validation(
                "Subscription externalId already exists",
            ));
        }
        self.repo.create(subscription).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>> {
        self.repo.get(id).await
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Subscription>> {
        let external_id = external_id.to_string();
        self.repo
            .find_one(&move |s: &Subscription| s.external_id == external_id)
            .await
    }

    async fn active_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.repo
            .find_one(&move |s: &Subscription| {
                s.user_id == user_id && s.status == SubscriptionStatus::Active
            })
            .await
    }

    async fn latest_for_user(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.repo
            .find_one(&move |s: &Subscription| s.user_id == user_id)
            .await
    }

    async fn compare_and_save(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> Result<bool> {
        let mut updated = subscription.clone();
        let result = self
            .repo
            .update_with(
                subscription.id,
                Box::new(move |stored| {
                    if stored.version != expected_version {
                        return Err(ApiError::conflict(stored.external_id.clone()));
                    }
                    updated.version = expected_version + 1;
                    updated.updated_at = current_timestamp();
                    *stored = updated;
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(ApiError::Conflict(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_all(&self) -> Result<Vec<Subscription>> {
        let page = self
            .repo
            .find(&|_: &Subscription| true, Pagination::all())
            .await?;
        Ok(page.data)
    }

    async fn created_between(&self, since: u64, until: u64) -> Result<usize> {
        self.repo
            .count(&move |s: &Subscription| s.created_at >= since && s.created_at < until)
            .await
    }

    async fn is_event_processed(&self, event_key: &str) -> Result<bool> {
        Ok(self
            .processed_events
            .read()
            .unwrap()
            .contains_key(event_key))
    }

    async fn mark_event_processed(&self, event_key: &str) -> Result<()> {
        self.processed_events
            .write()
            .unwrap()
            .insert(event_key.to_string(), current_timestamp());
        Ok(())
    }
}
