//! Subscription lifecycle operations.
//!
//! Every multi-step procedure follows the same commit order: external call
//! first, local record second, user mirror third. A provider failure or
//! timeout therefore never leaves a local record behind; the only possible
//! leak is an external subscription with no local counterpart, which later
//! webhooks discard as unknown until a reconciliation sweep picks it up.

use std::str::FromStr;
use uuid::Uuid;

use super::plans::{Plan, Plans};
use super::store::SubscriptionStore;
use super::subscription::{PlanFeature, Subscription, SubscriptionStatus};
use crate::error::{ApiError, Result};
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::users::UserStore;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Subscription lifecycle manager.
pub struct SubscriptionManager<S: SubscriptionStore, U: UserStore> {
    store: S,
    users: U,
    providers: ProviderRegistry,
    plans: Plans,
}

impl<S: SubscriptionStore, U: UserStore> SubscriptionManager<S, U> {
    #[must_use]
    pub fn new(store: S, users: U, providers: ProviderRegistry, plans: Plans) -> Self {
        Self {
            store,
            users,
            providers,
            plans,
        }
    }

    pub async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        self.store.get(id).await
    }

    /// Create a subscription for a user.
    ///
    /// Preconditions run before any external call: the user exists, holds no
    /// active subscription, the plan parses, and card-on-file providers get
    /// a payment method reference.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        plan: &str,
        provider: ProviderKind,
        payment_method: Option<&str>,
    ) -> Result<Subscription> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| ApiError::not_found("User not found"))?;

        if self.store.active_for_user(user_id).await?.is_some() {
            return Err(ApiError::AlreadySubscribed);
        }

        let plan = Plan::from_str(plan)?;
        let config = self.plans.require(plan)?;
        let adapter = self.providers.get(provider)?;

        if adapter.requires_payment_method() && payment_method.is_none() {
            return Err(ApiError::MissingPaymentMethod);
        }

        // Resolve or create the provider-side customer; the reference is
        // cached on the user so repeat subscriptions reuse it.
        let customer_ref = match user.customer_ref(provider) {
            Some(existing) => existing.to_string(),
            None => {
                let created = adapter.create_customer(&user.email, user.id).await?;
                self.users
                    .set_provider_customer(user.id, provider, &created)
                    .await?;
                created
            }
        };

        let external = adapter
            .create_subscription(&customer_ref, config.provider_ref(provider), payment_method)
            .await?;

        let subscription = Subscription::from_provider(user_id, config, provider, &external);
        let subscription = self.store.insert(subscription).await?;

        self.users
            .set_entitlement(user_id, subscription.entitlement_mirror())
            .await?;

        tracing::info!(
            target: "pressbill::billing",
            user_id = %user_id,
            plan = %plan,
            provider = %provider,
            external_id = %subscription.external_id,
            status = %subscription.status,
            "subscription created"
        );

        Ok(subscription)
    }

    /// Move a subscription to a different plan.
    ///
    /// The adapter works from the provider's current record (the provider is
    /// authoritative for what is being replaced), then the local plan fields
    /// and user mirror follow.
    pub async fn change_plan(&self, subscription_id: Uuid, new_plan: &str) -> Result<Subscription> {
        let subscription = self
            .store
            .get(subscription_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Subscription not found"))?;

        let plan = Plan::from_str(new_plan)?;
        let config = self.plans.require(plan)?;
        let adapter = self.providers.get(subscription.provider)?;

        let external = adapter
            .update_subscription(
                &subscription.external_id,
                config.provider_ref(subscription.provider),
            )
            .await?;

        let mut updated = subscription.clone();
        updated.plan = plan;
        updated.price_cents = config.price_cents;
        updated.currency = config.currency.clone();
        updated.features = config
            .features
            .iter()
            .map(|name| PlanFeature {
                name: name.clone(),
                enabled: true,
            })
            .collect();
        if updated.status.can_transition_to(external.status) {
            updated.status = external.status;
        }
        if let Some(period_end) = external.current_period_end {
            if period_end > updated.current_period_end {
                updated.current_period_end = period_end;
            }
        }

        if !self
            .store
            .compare_and_save(&updated, subscription.version)
            .await?
        {
            return Err(ApiError::conflict(subscription.external_id.clone()));
        }
        updated.version = subscription.version + 1;

        self.users
            .set_entitlement(updated.user_id, updated.entitlement_mirror())
            .await?;

        tracing::info!(
            target: "pressbill::billing",
            subscription_id = %subscription_id,
            plan = %plan,
            "subscription plan changed"
        );

        Ok(updated)
    }

    /// Cancel a subscription.
    ///
    /// The provider-side cancel is idempotent; the local record transitions
    /// to canceled (retained for billing audit) and the user's active
    /// entitlement is cleared.
    pub async fn cancel_subscription(&self, subscription_id: Uuid) -> Result<Subscription> {
        let subscription = self
            .store
            .get(subscription_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Subscription not found"))?;

        if subscription.status != SubscriptionStatus::Active {
            return Err(ApiError::NotActive);
        }

        let adapter = self.providers.get(subscription.provider)?;
        adapter
            .cancel_subscription(&subscription.external_id)
            .await?;

        let now = current_timestamp();
        let mut updated = subscription.clone();
        updated.status = SubscriptionStatus::Canceled;
        updated.canceled_at = Some(now);

        if !self
            .store
            .compare_and_save(&updated, subscription.version)
            .await?
        {
            return Err(ApiError::conflict(subscription.external_id.clone()));
        }
        updated.version = subscription.version + 1;

        self.users
            .clear_entitlement(updated.user_id, now)
            .await?;

        tracing::info!(
            target: "pressbill::billing",
            subscription_id = %subscription_id,
            external_id = %updated.external_id,
            "subscription canceled"
        );

        Ok(updated)
    }

    /// Re-sync one subscription from the provider's current state.
    ///
    /// Use after an ambiguous webhook, or from a periodic sweep that heals
    /// records whose deliveries were lost. Status follows the state machine
    /// and the period end only moves forward, exactly as in webhook
    /// reconciliation.
    pub async fn refresh_from_provider(&self, subscription_id: Uuid) -> Result<Subscription> {
        let subscription = self
            .store
            .get(subscription_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Subscription not found"))?;

        let adapter = self.providers.get(subscription.provider)?;
        let external = adapter
            .retrieve_subscription(&subscription.external_id)
            .await?;

        let mut updated = subscription.clone();
        if updated.status.can_transition_to(external.status) {
            updated.status = external.status;
        }
        if updated.status == SubscriptionStatus::Canceled && updated.canceled_at.is_none() {
            updated.canceled_at = Some(current_timestamp());
        }
        if let Some(period_end) = external.current_period_end {
            if period_end > updated.current_period_end {
                updated.current_period_end = period_end;
            }
        }

        if updated != subscription {
            if !self
                .store
                .compare_and_save(&updated, subscription.version)
                .await?
            {
                return Err(ApiError::conflict(subscription.external_id.clone()));
            }
            updated.version = subscription.version + 1;
        }

        if updated.status == SubscriptionStatus::Canceled {
            let canceled_at = updated.canceled_at.unwrap_or_else(current_timestamp);
            self.users
                .clear_entitlement(updated.user_id, canceled_at)
                .await?;
        } else {
            self.users
                .set_entitlement(updated.user_id, updated.entitlement_mirror())
                .await?;
        }

        Ok(updated)
    }

    /// Entitlement snapshot for a user, from their most recent subscription.
    ///
    /// Exposes both `is_active` and the raw status so the authorization
    /// layer can pick its own past_due policy.
    pub async fn entitlements(&self, user_id: Uuid) -> Result<Entitlements> {
        match self.store.latest_for_user(user_id).await? {
            Some(sub) => Ok(Entitlements {
                has_subscription: true,
                is_active: sub.is_active(),
                status: Some(sub.status),
                plan: Some(sub.plan),
                features: sub
                    .features
                    .iter()
                    .filter(|f| f.enabled)
                    .map(|f| f.name.clone())
                    .collect(),
                expires_at: Some(sub.current_period_end),
            }),
            None => Ok(Entitlements::none()),
        }
    }

    /// Per-plan count and monthly revenue across active, unexpired
    /// subscriptions.
    pub async fn active_by_plan(&self) -> Result<Vec<PlanTally>> {
        let now = current_timestamp();
        let subscriptions = self.store.list_all().await?;

        let mut tallies: Vec<PlanTally> = Plan::all()
            .into_iter()
            .map(|plan| PlanTally {
                plan,
                count: 0,
                monthly_revenue_cents: 0,
            })
            .collect();

        for sub in subscriptions {
            if !sub.is_active() || sub.current_period_end <= now {
                continue;
            }
            if let Some(tally) = tallies.iter_mut().find(|t| t.plan == sub.plan) {
                tally.count += 1;
                tally.monthly_revenue_cents += sub.price_cents;
            }
        }

        Ok(tallies)
    }
}

/// Entitlement snapshot derived from a user's subscription.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct Entitlements {
    pub has_subscription: bool,
    pub is_active: bool,
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<Plan>,
    pub features: Vec<String>,
    pub expires_at: Option<u64>,
}

impl Entitlements {
    /// Entitlements for a user with no subscription.
    #[must_use]
    pub fn none() -> Self {
        Self {
            has_subscription: false,
            is_active: false,
            status: None,
            plan: None,
            features: Vec::new(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.is_active && self.features.iter().any(|f| f == feature)
    }
}

/// Per-plan rollup of active subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanTally {
    pub plan: Plan,
    pub count: usize,
    pub monthly_revenue_cents: i64,
}
