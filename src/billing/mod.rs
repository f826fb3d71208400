//! Subscription and billing reconciliation.
//!
//! Owns the subscription lifecycle end to end: creation against a payment
//! provider, plan changes, cancellation, and webhook-driven reconciliation
//! that keeps local state converged with the provider's source of truth
//! despite out-of-order, duplicate, or partially-failed deliveries.
//!
//! # Example
//!
//! ```rust,ignore
//! use pressbill::billing::{Plans, SubscriptionManager, WebhookProcessor};
//!
//! let manager = SubscriptionManager::new(store.clone(), users.clone(), providers, Plans::standard());
//! let sub = manager
//!     .create_subscription(user_id, "pro", ProviderKind::Stripe, Some("pm_card"))
//!     .await?;
//!
//! // Later, from the webhook route:
//! let processor = WebhookProcessor::new(store, users);
//! processor.process(ProviderKind::Stripe, &raw_body).await?;
//! ```

pub mod manager;
pub mod plans;
pub mod store;
pub mod subscription;
pub mod webhook;

pub use manager::{Entitlements, PlanTally, SubscriptionManager};
pub use plans::{Plan, PlanBuilder, PlanConfig, Plans, PlansBuilder};
pub use store::{InMemorySubscriptionStore, SubscriptionStore};
pub use subscription::{
    BillingEntry, BillingOutcome, PlanFeature, Subscription, SubscriptionStatus,
};
pub use webhook::{SignatureVerifier, WebhookOutcome, WebhookProcessor};
