//! Payment provider adapters.
//!
//! Two providers with divergent native APIs are exposed through one
//! capability set: create, update, cancel, retrieve. Provider-native status
//! vocabularies and event taxonomies are normalized at this boundary and
//! never leak past it. Unknown native statuses map to `PastDue` — treat as
//! needing attention, never silently active.

pub mod paddle;
pub mod stripe;

pub use paddle::PaddleProvider;
pub use stripe::StripeProvider;

use crate::billing::subscription::SubscriptionStatus;
use crate::error::{ApiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// The supported payment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    Paddle,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paddle => "paddle",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paddle" => Ok(Self::Paddle),
            other => Err(ApiError::validation(format!(
                "Unknown payment provider: {other}"
            ))),
        }
    }
}

/// Provider-side view of a subscription, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub external_id: String,
    pub status: SubscriptionStatus,
    /// End of the current billing period (unix seconds), when the provider
    /// reports one.
    pub current_period_end: Option<u64>,
}

/// Uniform capability set over a payment provider.
///
/// Implementations own all knowledge of the provider's native API; callers
/// see only normalized shapes.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether subscription creation needs an explicit payment method
    /// reference (card-on-file providers do; checkout-flow providers don't).
    fn requires_payment_method(&self) -> bool;

    /// Create a provider-side customer and return its reference.
    async fn create_customer(&self, email: &str, user_id: Uuid) -> Result<String>;

    async fn create_subscription(
        &self,
        customer_ref: &str,
        plan_ref: &str,
        payment_method: Option<&str>,
    ) -> Result<ProviderSubscription>;

    async fn update_subscription(
        &self,
        external_id: &str,
        new_plan_ref: &str,
    ) -> Result<ProviderSubscription>;

    /// Cancel a subscription. Idempotent: canceling an already-canceled
    /// subscription is not an error.
    async fn cancel_subscription(&self, external_id: &str) -> Result<()>;

    /// Current external state; used to re-sync after an ambiguous webhook.
    async fn retrieve_subscription(&self, external_id: &str) -> Result<ProviderSubscription>;
}

impl std::fmt::Debug for dyn PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentProvider")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Registry of configured providers, injected into the reconciliation core.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn PaymentProvider>> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            ApiError::validation(format!("Payment provider not configured: {kind}"))
        })
    }
}

/// Kind of a normalized webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StatusChanged,
    PaymentSucceeded,
    PaymentFailed,
}

/// Payment amount attached to a payment-outcome event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentDetails {
    pub amount_cents: i64,
    pub currency: String,
    /// Provider-side invoice/order id; billing history dedups on this.
    pub reference: String,
}

/// Provider-agnostic webhook event, produced by each adapter's normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub provider: ProviderKind,
    /// Provider event/alert id; reconciliation dedups redeliveries on this.
    pub event_id: String,
    pub external_id: String,
    pub kind: EventKind,
    pub status: SubscriptionStatus,
    pub period_end: Option<u64>,
    pub payment: Option<PaymentDetails>,
}

/// Normalize a raw provider payload into a [`NormalizedEvent`].
///
/// Returns `Ok(None)` for event types the reconciliation core doesn't care
/// about.
pub fn normalize(provider: ProviderKind, payload: &serde_json::Value) -> Result<Option<NormalizedEvent>> {
    match provider {
        ProviderKind::Stripe => stripe::normalize_event(payload),
        ProviderKind::Paddle => paddle::normalize_event(payload),
    }
}

/// Mock provider for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Scriptable in-memory payment provider.
    ///
    /// Records every call so tests can assert on external-call counts.
    pub struct MockProvider {
        kind: ProviderKind,
        requires_payment_method: bool,
        calls: AtomicU64,
        counter: AtomicU64,
        fail_next: AtomicBool,
        subscriptions: RwLock<HashMap<String, ProviderSubscription>>,
        default_period_end: u64,
    }

    impl MockProvider {
        #[must_use]
        pub fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                requires_payment_method: kind == ProviderKind::Stripe,
                calls: AtomicU64::new(0),
                counter: AtomicU64::new(0),
                fail_next: AtomicBool::new(false),
                subscriptions: RwLock::new(HashMap::new()),
                default_period_end: 4_102_444_800, // far future
            }
        }

        /// Total external calls made through this provider.
        pub fn call_count(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Make the next call fail with a declined-charge provider error.
        pub fn fail_next_call(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        fn record_call(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ApiError::Provider {
                    provider: self.kind,
                    code: Some("card_declined".to_string()),
                    message: "The charge was declined".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn requires_payment_method(&self) -> bool {
            self.requires_payment_method
        }

        async fn create_customer(&self, _email: &str, _user_id: Uuid) -> Result<String> {
            self.record_call()?;
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("cus_{}_{n}", self.kind))
        }

        async fn create_subscription(
            &self,
            _customer_ref: &str,
            _plan_ref: &str,
            _payment_method: Option<&str>,
        ) -> Result<ProviderSubscription> {
            self.record_call()?;
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let sub = ProviderSubscription {
                external_id: format!("sub_{}_{n}", self.kind),
                status: SubscriptionStatus::Active,
                current_period_end: Some(self.default_period_end),
            };
            self.subscriptions
                .write()
                .unwrap()
                .insert(sub.external_id.clone(), sub.clone());
            Ok(sub)
        }

        async fn update_subscription(
            &self,
            external_id: &str,
            _new_plan_ref: &str,
        ) -> Result<ProviderSubscription> {
            self.record_call()?;
            let subs = self.subscriptions.read().unwrap();
            subs.get(external_id).cloned().ok_or_else(|| ApiError::Provider {
                provider: self.kind,
                code: Some("resource_missing".to_string()),
                message: format!("No such subscription: {external_id}"),
            })
        }

        async fn cancel_subscription(&self, external_id: &str) -> Result<()> {
            self.record_call()?;
            // Idempotent: canceling a missing or canceled subscription succeeds.
            if let Some(sub) = self.subscriptions.write().unwrap().get_mut(external_id) {
                sub.status = SubscriptionStatus::Canceled;
            }
            Ok(())
        }

        async fn retrieve_subscription(&self, external_id: &str) -> Result<ProviderSubscription> {
            self.record_call()?;
            let subs = self.subscriptions.read().unwrap();
            subs.get(external_id).cloned().ok_or_else(|| ApiError::Provider {
                provider: self.kind,
                code: Some("resource_missing".to_string()),
                message: format!("No such subscription: {external_id}"),
            })
        }
    }
}
