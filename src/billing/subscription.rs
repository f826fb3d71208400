//! Subscription records and the lifecycle state machine.
//!
//! `pending → active → {past_due ↔ active} → canceled`; canceled is
//! terminal. Billing history is append-only and deduplicated on the
//! provider-side invoice/order reference.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plans::{Plan, PlanConfig};
use crate::providers::{ProviderKind, ProviderSubscription};
use crate::store::Record;
use crate::users::SubscriptionMirror;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created, awaiting payment confirmation.
    Pending,
    /// Paid and entitled.
    Active,
    /// A charge failed; the provider is retrying.
    PastDue,
    /// Terminal.
    Canceled,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        *self == Self::Canceled
    }

    /// Whether the state machine permits moving to `next`.
    ///
    /// Re-asserting the current status is always allowed (webhook
    /// redeliveries do this constantly).
    #[must_use]
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Canceled => false,
            Self::Pending => true,
            Self::Active => matches!(next, Self::PastDue | Self::Canceled),
            Self::PastDue => matches!(next, Self::Active | Self::Canceled),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one billing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingOutcome {
    Succeeded,
    Failed,
}

/// One entry in the append-only billing history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEntry {
    pub amount_cents: i64,
    pub currency: String,
    pub outcome: BillingOutcome,
    pub timestamp: u64,
    /// Provider-side invoice/order id. Appends deduplicate on this.
    pub reference: String,
}

/// A feature granted by the subscription's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeature {
    pub name: String,
    pub enabled: bool,
}

/// One user's entitlement to a paid plan.
///
/// `external_id` is the provider's subscription id: unique, immutable once
/// set, and the join key for webhook reconciliation. Records are retained
/// after cancellation for billing audit, never hard-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: Plan,
    pub provider: ProviderKind,
    pub external_id: String,
    pub status: SubscriptionStatus,
    pub price_cents: i64,
    pub currency: String,
    /// Expiry of the current billing period (unix seconds).
    pub current_period_end: u64,
    pub features: Vec<PlanFeature>,
    pub billing_history: Vec<BillingEntry>,
    pub canceled_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    /// Monotonic counter for optimistic locking; the store bumps it on
    /// every successful save.
    pub version: u64,
}

impl Subscription {
    /// Build a local record from the provider's creation result.
    #[must_use]
    pub fn from_provider(
        user_id: Uuid,
        config: &PlanConfig,
        provider: ProviderKind,
        external: &ProviderSubscription,
    ) -> Self {
        let now = current_timestamp();
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan: config.plan,
            provider,
            external_id: external.external_id.clone(),
            status: external.status,
            price_cents: config.price_cents,
            currency: config.currency.clone(),
            current_period_end: external.current_period_end.unwrap_or(0),
            features: config
                .features
                .iter()
                .map(|name| PlanFeature {
                    name: name.clone(),
                    enabled: true,
                })
                .collect(),
            billing_history: Vec::new(),
            canceled_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether the billing history already carries this provider reference.
    #[must_use]
    pub fn has_billing_reference(&self, reference: &str) -> bool {
        self.billing_history
            .iter()
            .any(|entry| entry.reference == reference)
    }

    /// Append a billing entry unless its reference was already recorded.
    ///
    /// Returns whether an entry was appended.
    pub fn record_payment(&mut self, entry: BillingEntry) -> bool {
        if self.has_billing_reference(&entry.reference) {
            return false;
        }
        self.billing_history.push(entry);
        true
    }

    /// Sum of successfully charged amounts.
    #[must_use]
    pub fn total_revenue_cents(&self) -> i64 {
        self.billing_history
            .iter()
            .filter(|entry| entry.outcome == BillingOutcome::Succeeded)
            .map(|entry| entry.amount_cents)
            .sum()
    }

    /// The user-record mirror derived from this subscription.
    #[must_use]
    pub fn entitlement_mirror(&self) -> SubscriptionMirror {
        SubscriptionMirror {
            is_active: self.is_active(),
            status: Some(self.status),
            plan: Some(self.plan),
            expires_at: Some(self.current_period_end),
            canceled_at: self.canceled_at,
        }
    }
}

impl Record for Subscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::plans::Plans;

    fn subscription() -> Subscription {
        let plans = Plans::standard();
        let config = plans.require(Plan::Pro).unwrap();
        Subscription::from_provider(
            Uuid::new_v4(),
            config,
            ProviderKind::Stripe,
            &ProviderSubscription {
                external_id: "sub_1".to_string(),
                status: SubscriptionStatus::Active,
                current_period_end: Some(1_700_000_000),
            },
        )
    }

    #[test]
    fn transition_table() {
        use SubscriptionStatus::*;

        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(PastDue));
        assert!(Pending.can_transition_to(Canceled));
        assert!(Active.can_transition_to(PastDue));
        assert!(Active.can_transition_to(Canceled));
        assert!(PastDue.can_transition_to(Active));
        assert!(PastDue.can_transition_to(Canceled));

        // Re-asserting the current status is fine.
        assert!(Active.can_transition_to(Active));
        assert!(Canceled.can_transition_to(Canceled));

        // Canceled is terminal.
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(PastDue));
        assert!(!Canceled.can_transition_to(Pending));

        // Nothing re-enters pending.
        assert!(!Active.can_transition_to(Pending));
        assert!(!PastDue.can_transition_to(Pending));
    }

    #[test]
    fn from_provider_copies_plan_config() {
        let sub = subscription();
        assert_eq!(sub.plan, Plan::Pro);
        assert_eq!(sub.price_cents, 2_900);
        assert_eq!(sub.current_period_end, 1_700_000_000);
        assert!(sub.features.iter().any(|f| f.name == "premium_content"));
        assert!(sub.billing_history.is_empty());
        assert_eq!(sub.version, 0);
    }

    #[test]
    fn payment_recording_dedups_on_reference() {
        let mut sub = subscription();
        let entry = BillingEntry {
            amount_cents: 2_900,
            currency: "eur".to_string(),
            outcome: BillingOutcome::Succeeded,
            timestamp: 1,
            reference: "in_1".to_string(),
        };

        assert!(sub.record_payment(entry.clone()));
        assert!(!sub.record_payment(entry));
        assert_eq!(sub.billing_history.len(), 1);
    }

    #[test]
    fn total_revenue_counts_only_successes() {
        let mut sub = subscription();
        sub.record_payment(BillingEntry {
            amount_cents: 2_900,
            currency: "eur".to_string(),
            outcome: BillingOutcome::Succeeded,
            timestamp: 1,
            reference: "in_1".to_string(),
        });
        sub.record_payment(BillingEntry {
            amount_cents: 2_900,
            currency: "eur".to_string(),
            outcome: BillingOutcome::Failed,
            timestamp: 2,
            reference: "in_2".to_string(),
        });

        assert_eq!(sub.total_revenue_cents(), 2_900);
    }

    #[test]
    fn mirror_reflects_status() {
        let mut sub = subscription();
        let mirror = sub.entitlement_mirror();
        assert!(mirror.is_active);
        assert_eq!(mirror.plan, Some(Plan::Pro));
        assert_eq!(mirror.expires_at, Some(1_700_000_000));

        sub.status = SubscriptionStatus::PastDue;
        assert!(!sub.entitlement_mirror().is_active);
        // Raw status stays visible so the authorization layer can decide
        // its own past_due policy.
        assert_eq!(
            sub.entitlement_mirror().status,
            Some(SubscriptionStatus::PastDue)
        );
    }
}
