//! Webhook-driven state reconciliation.
//!
//! Delivery is at-least-once, out of order, and duplicated; reconciliation
//! makes that safe with three guards:
//!
//! - a processed-event set keyed by provider event id, so redelivered
//!   payloads short-circuit;
//! - reference-deduplicated billing history, so two distinct events about
//!   the same invoice append once;
//! - monotonic `current_period_end` plus the status state machine, so stale
//!   events update status bookkeeping without regressing newer data.
//!
//! Writes go through the store's version CAS. A losing writer surfaces a
//! retryable error and the provider redelivers; there is no in-process
//! retry loop.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::store::SubscriptionStore;
use super::subscription::{BillingEntry, BillingOutcome, Subscription, SubscriptionStatus};
use crate::error::{ApiError, Result};
use crate::providers::{self, EventKind, NormalizedEvent, ProviderKind};
use crate::users::UserStore;

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WebhookOutcome {
    /// Event was applied.
    Processed,
    /// Event id was seen before (idempotent redelivery).
    AlreadyProcessed,
    /// Event type isn't relevant to reconciliation.
    Ignored,
    /// No local subscription carries this externalId; logged and discarded.
    /// Not an error — webhooks can arrive before local creation commits, or
    /// for foreign/test accounts.
    UnknownSubscription,
}

/// Webhook reconciliation processor.
pub struct WebhookProcessor<S: SubscriptionStore, U: UserStore> {
    store: S,
    users: U,
}

impl<S: SubscriptionStore, U: UserStore> WebhookProcessor<S, U> {
    #[must_use]
    pub fn new(store: S, users: U) -> Self {
        Self { store, users }
    }

    /// Normalize a raw provider payload and reconcile it.
    ///
    /// The route layer verifies the delivery signature before calling this
    /// and maps any returned error to a non-2xx response so the provider
    /// redelivers.
    pub async fn process(
        &self,
        provider: ProviderKind,
        payload: &[u8],
    ) -> Result<WebhookOutcome> {
        let value: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "pressbill::billing::webhook",
                provider = %provider,
                error = %e,
                "failed to parse webhook payload"
            );
            ApiError::validation("Malformed webhook payload")
        })?;

        match providers::normalize(provider, &value)? {
            Some(event) => self.reconcile(event).await,
            None => Ok(WebhookOutcome::Ignored),
        }
    }

    /// Apply a normalized event to local state.
    pub async fn reconcile(&self, event: NormalizedEvent) -> Result<WebhookOutcome> {
        // Event ids are provider-scoped; key the idempotency set accordingly.
        let event_key = format!("{}:{}", event.provider, event.event_id);
        if self.store.is_event_processed(&event_key).await? {
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let Some(subscription) = self.store.find_by_external_id(&event.external_id).await? else {
            tracing::info!(
                target: "pressbill::billing::webhook",
                provider = %event.provider,
                external_id = %event.external_id,
                event_id = %event.event_id,
                "webhook for unknown subscription discarded"
            );
            return Ok(WebhookOutcome::UnknownSubscription);
        };

        let mut updated = subscription.clone();
        let changed = apply_event(&mut updated, &event, current_timestamp());

        if changed {
            if !self
                .store
                .compare_and_save(&updated, subscription.version)
                .await?
            {
                // A concurrent reconciliation won the version race. Surface
                // a retryable error; redelivery reapplies safely.
                return Err(ApiError::conflict(event.external_id.clone()));
            }
            updated.version = subscription.version + 1;
        }

        // Write-through the entitlement mirror so it converges even when
        // the authoritative record didn't change.
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

        self.store.mark_event_processed(&event_key).await?;

        tracing::debug!(
            target: "pressbill::billing::webhook",
            provider = %event.provider,
            external_id = %event.external_id,
            event_id = %event.event_id,
            status = %updated.status,
            changed,
            "webhook reconciled"
        );

        Ok(WebhookOutcome::Processed)
    }
}

/// Apply one normalized event to a subscription. Returns whether anything
/// changed.
fn apply_event(subscription: &mut Subscription, event: &NormalizedEvent, now: u64) -> bool {
    let mut changed = false;

    // Status bookkeeping always runs, but canceled is terminal and the
    // state machine gates anything unusual.
    if subscription.status != event.status
        && subscription.status.can_transition_to(event.status)
    {
        subscription.status = event.status;
        if event.status == SubscriptionStatus::Canceled && subscription.canceled_at.is_none() {
            subscription.canceled_at = Some(now);
        }
        changed = true;
    }

    // Period end only moves forward; a stale event must not overwrite a
    // newer expiry.
    if let Some(period_end) = event.period_end {
        if period_end > subscription.current_period_end {
            subscription.current_period_end = period_end;
            changed = true;
        }
    }

    if let Some(payment) = &event.payment {
        let outcome = match event.kind {
            EventKind::PaymentFailed => BillingOutcome::Failed,
            _ => BillingOutcome::Succeeded,
        };
        let appended = subscription.record_payment(BillingEntry {
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            outcome,
            timestamp: now,
            reference: payment.reference.clone(),
        });
        changed = changed || appended;
    }

    changed
}

/// Verifier for the shared-secret HMAC signature scheme
/// (`t=<unix>,v1=<hex hmac-sha256>` over `"{t}.{payload}"`).
///
/// The route layer runs this before handing the payload to the processor.
/// The secret is held as a [`SecretString`] so it never reaches logs.
pub struct SignatureVerifier {
    secret: SecretString,
}

impl SignatureVerifier {
    /// Signatures older than this are rejected (replay protection).
    const TOLERANCE_SECONDS: i64 = 300;

    #[must_use]
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify a signature header against the raw payload.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<()> {
        let parts = parse_signature_header(signature_header)?;

        let now = current_timestamp() as i64;
        if (now - parts.timestamp).abs() > Self::TOLERANCE_SECONDS {
            return Err(ApiError::validation("Webhook timestamp too old"));
        }

        let signed_payload = format!(
            "{}.{}",
            parts.timestamp,
            String::from_utf8_lossy(payload)
        );
        let expected = compute_signature(self.secret.expose_secret(), signed_payload.as_bytes())?;

        let expected_bytes = hex::decode(&expected)
            .map_err(|_| ApiError::internal("Hex encode error"))?;
        let provided_bytes = hex::decode(&parts.signature)
            .map_err(|_| ApiError::validation("Invalid signature format"))?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(ApiError::validation("Invalid webhook signature"));
        }

        Ok(())
    }
}

struct SignatureParts {
    timestamp: i64,
    signature: String,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| ApiError::validation("Invalid signature header format"))?;

        match key.trim() {
            "t" => timestamp = value.parse().ok(),
            "v1" => signature = Some(value.to_string()),
            _ => {} // Ignore other scheme versions.
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp
            .ok_or_else(|| ApiError::validation("Missing timestamp in signature"))?,
        signature: signature
            .ok_or_else(|| ApiError::validation("Missing v1 signature"))?,
    })
}

fn compute_signature(secret: &str, payload: &[u8]) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::internal("HMAC error"))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::plans::{Plan, Plans};
    use crate::billing::store::InMemorySubscriptionStore;
    use crate::providers::{PaymentDetails, ProviderSubscription};
    use crate::users::{InMemoryUserStore, User, UserStore};
    use uuid::Uuid;

    struct Fixture {
        processor: WebhookProcessor<InMemorySubscriptionStore, InMemoryUserStore>,
        store: InMemorySubscriptionStore,
        users: InMemoryUserStore,
    }

    fn fixture() -> Fixture {
        let store = InMemorySubscriptionStore::new();
        let users = InMemoryUserStore::new();
        Fixture {
            processor: WebhookProcessor::new(store.clone(), users.clone()),
            store,
            users,
        }
    }

    async fn seeded_subscription(fx: &Fixture, external_id: &str) -> Subscription {
        let user = fx
            .users
            .insert(User::new(format!("{}@example.com", Uuid::new_v4()), "U"))
            .await
            .unwrap();
        let plans = Plans::standard();
        let sub = Subscription::from_provider(
            user.id,
            plans.require(Plan::Pro).unwrap(),
            ProviderKind::Stripe,
            &ProviderSubscription {
                external_id: external_id.to_string(),
                status: SubscriptionStatus::Active,
                current_period_end: Some(1_700_000_000),
            },
        );
        fx.store.insert(sub.clone()).await.unwrap();
        fx.users
            .set_entitlement(user.id, sub.entitlement_mirror())
            .await
            .unwrap();
        sub
    }

    fn status_event(external_id: &str, event_id: &str, status: SubscriptionStatus) -> NormalizedEvent {
        NormalizedEvent {
            provider: ProviderKind::Stripe,
            event_id: event_id.to_string(),
            external_id: external_id.to_string(),
            kind: EventKind::StatusChanged,
            status,
            period_end: None,
            payment: None,
        }
    }

    fn payment_event(
        external_id: &str,
        event_id: &str,
        reference: &str,
        period_end: Option<u64>,
    ) -> NormalizedEvent {
        NormalizedEvent {
            provider: ProviderKind::Stripe,
            event_id: event_id.to_string(),
            external_id: external_id.to_string(),
            kind: EventKind::PaymentSucceeded,
            status: SubscriptionStatus::Active,
            period_end,
            payment: Some(PaymentDetails {
                amount_cents: 2_900,
                currency: "eur".to_string(),
                reference: reference.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn duplicate_event_id_is_idempotent() {
        let fx = fixture();
        let sub = seeded_subscription(&fx, "sub_1").await;

        let event = payment_event("sub_1", "evt_1", "in_1", Some(1_702_592_000));
        let outcome = fx.processor.reconcile(event.clone()).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let outcome = fx.processor.reconcile(event).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);

        let stored = fx.store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.billing_history.len(), 1);
    }

    #[tokio::test]
    async fn distinct_events_same_invoice_append_once() {
        let fx = fixture();
        let sub = seeded_subscription(&fx, "sub_1").await;

        fx.processor
            .reconcile(payment_event("sub_1", "evt_1", "in_1", None))
            .await
            .unwrap();
        fx.processor
            .reconcile(payment_event("sub_1", "evt_2", "in_1", None))
            .await
            .unwrap();

        let stored = fx.store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.billing_history.len(), 1);
    }

    #[tokio::test]
    async fn unknown_external_id_is_discarded_without_error() {
        let fx = fixture();
        let outcome = fx
            .processor
            .reconcile(status_event("sub_ghost", "evt_1", SubscriptionStatus::Active))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::UnknownSubscription);
        assert!(fx
            .store
            .find_by_external_id("sub_ghost")
            .await
            .unwrap()
            .is_none());

        // Not marked processed: once local creation commits, a redelivery
        // may still land.
        assert!(fx.store.processed_events().is_empty());
    }

    #[tokio::test]
    async fn stale_period_end_does_not_regress() {
        let fx = fixture();
        let sub = seeded_subscription(&fx, "sub_1").await;

        let mut event = status_event("sub_1", "evt_1", SubscriptionStatus::PastDue);
        event.period_end = Some(1_600_000_000); // older than stored
        fx.processor.reconcile(event).await.unwrap();

        let stored = fx.store.get(sub.id).await.unwrap().unwrap();
        // Status bookkeeping applied, expiry untouched.
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert_eq!(stored.current_period_end, 1_700_000_000);
    }

    #[tokio::test]
    async fn canceled_is_terminal() {
        let fx = fixture();
        let sub = seeded_subscription(&fx, "sub_1").await;

        fx.processor
            .reconcile(status_event("sub_1", "evt_1", SubscriptionStatus::Canceled))
            .await
            .unwrap();
        fx.processor
            .reconcile(status_event("sub_1", "evt_2", SubscriptionStatus::Active))
            .await
            .unwrap();

        let stored = fx.store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        assert!(stored.canceled_at.is_some());

        let user = fx.users.get(stored.user_id).await.unwrap().unwrap();
        assert!(!user.subscription.is_active);
    }

    #[tokio::test]
    async fn past_due_and_active_oscillate() {
        let fx = fixture();
        let sub = seeded_subscription(&fx, "sub_1").await;

        let mut failed = status_event("sub_1", "evt_1", SubscriptionStatus::PastDue);
        failed.kind = EventKind::PaymentFailed;
        failed.payment = Some(PaymentDetails {
            amount_cents: 2_900,
            currency: "eur".to_string(),
            reference: "in_fail".to_string(),
        });
        fx.processor.reconcile(failed).await.unwrap();

        let stored = fx.store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert_eq!(
            stored.billing_history[0].outcome,
            BillingOutcome::Failed
        );
        let user = fx.users.get(stored.user_id).await.unwrap().unwrap();
        assert!(!user.subscription.is_active);

        // Successful retry flips it back.
        fx.processor
            .reconcile(payment_event("sub_1", "evt_2", "in_retry", Some(1_702_592_000)))
            .await
            .unwrap();

        let stored = fx.store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.billing_history.len(), 2);
        assert_eq!(stored.current_period_end, 1_702_592_000);
        let user = fx.users.get(stored.user_id).await.unwrap().unwrap();
        assert!(user.subscription.is_active);
        assert_eq!(user.subscription.expires_at, Some(1_702_592_000));
    }

    #[tokio::test]
    async fn process_parses_and_routes_raw_payloads() {
        let fx = fixture();
        seeded_subscription(&fx, "sub_1").await;

        let payload = serde_json::json!({
            "id": "evt_raw",
            "type": "customer.subscription.updated",
            "data": {"object": {
                "id": "sub_1",
                "status": "past_due",
                "current_period_end": 1_702_592_000u64
            }}
        });
        let outcome = fx
            .processor
            .process(ProviderKind::Stripe, payload.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let outcome = fx
            .processor
            .process(
                ProviderKind::Stripe,
                serde_json::json!({
                    "id": "evt_other",
                    "type": "charge.refunded",
                    "data": {"object": {}}
                })
                .to_string()
                .as_bytes(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);

        assert!(fx
            .processor
            .process(ProviderKind::Stripe, b"not json")
            .await
            .is_err());
    }

    fn sign(secret: &str, payload: &[u8], timestamp: i64) -> String {
        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let sig = compute_signature(secret, signed_payload.as_bytes()).unwrap();
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn signature_verification_roundtrip() {
        let verifier = SignatureVerifier::new("whsec_test_secret".to_string());
        let payload = br#"{"id":"evt_1"}"#;
        let now = current_timestamp() as i64;

        let header = sign("whsec_test_secret", payload, now);
        assert!(verifier.verify(payload, &header).is_ok());

        // Wrong secret.
        let header = sign("whsec_other", payload, now);
        assert!(verifier.verify(payload, &header).is_err());

        // Tampered payload.
        let header = sign("whsec_test_secret", payload, now);
        assert!(verifier.verify(br#"{"id":"evt_2"}"#, &header).is_err());
    }

    #[test]
    fn signature_replay_window() {
        let verifier = SignatureVerifier::new("whsec_test_secret".to_string());
        let payload = b"{}";
        let header = sign("whsec_test_secret", payload, 1_000_000_000);
        assert!(verifier.verify(payload, &header).is_err());
    }

    #[test]
    fn signature_header_parsing() {
        let parts = parse_signature_header("t=1234567890,v1=abc123").unwrap();
        assert_eq!(parts.timestamp, 1_234_567_890);
        assert_eq!(parts.signature, "abc123");

        assert!(parse_signature_header("garbage").is_err());
        assert!(parse_signature_header("v1=abc123").is_err());
        assert!(parse_signature_header("t=123").is_err());
    }
}
