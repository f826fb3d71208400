//! Stripe adapter.
//!
//! Speaks the Stripe REST API directly over reqwest with a bounded timeout.
//! The secret key is held as a [`SecretString`] so it never appears in debug
//! output.

use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::billing::subscription::SubscriptionStatus;
use crate::config::ProviderConfig;
use crate::error::{ApiError, Result};
use async_trait::async_trait;

use super::{
    EventKind, NormalizedEvent, PaymentDetails, PaymentProvider, ProviderKind,
    ProviderSubscription,
};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com";

/// Validate a Stripe API key format.
///
/// Valid prefixes: `sk_test_`, `sk_live_`, `rk_test_`, `rk_live_`.
fn validate_api_key(key: &str) -> Result<()> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.len() < MIN_KEY_LENGTH {
        return Err(ApiError::validation(format!(
            "Stripe API key too short (minimum {MIN_KEY_LENGTH} characters)"
        )));
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(ApiError::validation(
            "Stripe API key must start with sk_test_, sk_live_, rk_test_, or rk_live_",
        ));
    }

    Ok(())
}

/// Map a Stripe-native subscription status onto the local enum.
///
/// Unknown statuses map to `PastDue`: a state we don't recognize needs
/// attention, it must not pass as entitled.
pub(crate) fn map_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "canceled" => SubscriptionStatus::Canceled,
        "past_due" => SubscriptionStatus::PastDue,
        "incomplete" => SubscriptionStatus::Pending,
        _ => SubscriptionStatus::PastDue,
    }
}

/// Live Stripe client.
pub struct StripeProvider {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl StripeProvider {
    /// Create a new Stripe adapter from provider configuration.
    ///
    /// # Errors
    ///
    /// Fails if the API key format is invalid or the HTTP client can't be
    /// constructed.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        validate_api_key(&config.api_key)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ApiError::internal(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            http,
            api_key: SecretString::new(config.api_key.clone()),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    /// Whether the adapter runs against a test-mode key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.api_key.expose_secret());
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let code = body["error"]["code"].as_str().map(String::from);
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("request failed")
                .to_string();
            tracing::warn!(
                target: "pressbill::providers::stripe",
                status = status.as_u16(),
                code = code.as_deref().unwrap_or(""),
                "stripe call failed"
            );
            return Err(ApiError::Provider {
                provider: ProviderKind::Stripe,
                code,
                message,
            });
        }

        Ok(body)
    }

    fn parse_subscription(&self, body: &Value) -> Result<ProviderSubscription> {
        let external_id = body["id"]
            .as_str()
            .ok_or_else(|| ApiError::internal("Stripe subscription missing id"))?
            .to_string();
        let status = map_status(body["status"].as_str().unwrap_or_default());
        Ok(ProviderSubscription {
            external_id,
            status,
            current_period_end: body["current_period_end"].as_u64(),
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    fn requires_payment_method(&self) -> bool {
        true
    }

    async fn create_customer(&self, email: &str, user_id: Uuid) -> Result<String> {
        let form = [
            ("email", email.to_string()),
            ("metadata[user_id]", user_id.to_string()),
        ];
        let body = self.send(Method::POST, "/v1/customers", Some(&form)).await?;
        body["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ApiError::internal("Stripe customer missing id"))
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        plan_ref: &str,
        payment_method: Option<&str>,
    ) -> Result<ProviderSubscription> {
        let payment_method = payment_method.ok_or(ApiError::MissingPaymentMethod)?;

        let form = [
            ("customer", customer_ref.to_string()),
            ("items[0][price]", plan_ref.to_string()),
            ("default_payment_method", payment_method.to_string()),
            ("payment_behavior", "default_incomplete".to_string()),
        ];
        let body = self
            .send(Method::POST, "/v1/subscriptions", Some(&form))
            .await?;
        self.parse_subscription(&body)
    }

    async fn update_subscription(
        &self,
        external_id: &str,
        new_plan_ref: &str,
    ) -> Result<ProviderSubscription> {
        // The provider record is authoritative for the item being replaced;
        // fetch it rather than trusting anything cached locally.
        let current = self
            .send(
                Method::GET,
                &format!("/v1/subscriptions/{external_id}"),
                None,
            )
            .await?;
        let item_id = current["items"]["data"][0]["id"]
            .as_str()
            .ok_or_else(|| ApiError::internal("Stripe subscription missing items"))?
            .to_string();

        let form = [
            ("items[0][id]", item_id),
            ("items[0][price]", new_plan_ref.to_string()),
            ("proration_behavior", "create_prorations".to_string()),
        ];
        let body = self
            .send(
                Method::POST,
                &format!("/v1/subscriptions/{external_id}"),
                Some(&form),
            )
            .await?;
        self.parse_subscription(&body)
    }

    async fn cancel_subscription(&self, external_id: &str) -> Result<()> {
        let result = self
            .send(
                Method::DELETE,
                &format!("/v1/subscriptions/{external_id}"),
                None,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already canceled or gone: the desired state holds.
            Err(ApiError::Provider {
                code: Some(code), ..
            }) if code == "resource_missing" => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn retrieve_subscription(&self, external_id: &str) -> Result<ProviderSubscription> {
        let body = self
            .send(
                Method::GET,
                &format!("/v1/subscriptions/{external_id}"),
                None,
            )
            .await?;
        self.parse_subscription(&body)
    }
}

/// Normalize a Stripe webhook payload.
///
/// Returns `Ok(None)` for event types reconciliation doesn't consume.
pub fn normalize_event(payload: &Value) -> Result<Option<NormalizedEvent>> {
    let event_id = payload["id"]
        .as_str()
        .ok_or_else(|| ApiError::validation("Webhook event missing id"))?
        .to_string();
    let event_type = payload["type"]
        .as_str()
        .ok_or_else(|| ApiError::validation("Webhook event missing type"))?;
    let object = &payload["data"]["object"];

    let event = match event_type {
        "customer.subscription.created" | "customer.subscription.updated" => {
            let external_id = object["id"]
                .as_str()
                .ok_or_else(|| ApiError::validation("Subscription event missing id"))?
                .to_string();
            NormalizedEvent {
                provider: ProviderKind::Stripe,
                event_id,
                external_id,
                kind: EventKind::StatusChanged,
                status: map_status(object["status"].as_str().unwrap_or_default()),
                period_end: object["current_period_end"].as_u64(),
                payment: None,
            }
        }
        "customer.subscription.deleted" => {
            let external_id = object["id"]
                .as_str()
                .ok_or_else(|| ApiError::validation("Subscription event missing id"))?
                .to_string();
            NormalizedEvent {
                provider: ProviderKind::Stripe,
                event_id,
                external_id,
                kind: EventKind::StatusChanged,
                status: SubscriptionStatus::Canceled,
                period_end: object["current_period_end"].as_u64(),
                payment: None,
            }
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            // One-off invoices carry no subscription; nothing to reconcile.
            let Some(external_id) = object["subscription"].as_str() else {
                return Ok(None);
            };
            NormalizedEvent {
                provider: ProviderKind::Stripe,
                event_id: event_id.clone(),
                external_id: external_id.to_string(),
                kind: EventKind::PaymentSucceeded,
                status: SubscriptionStatus::Active,
                period_end: object["period_end"].as_u64(),
                payment: Some(PaymentDetails {
                    amount_cents: object["amount_paid"].as_i64().unwrap_or(0),
                    currency: object["currency"].as_str().unwrap_or("eur").to_string(),
                    reference: object["id"].as_str().unwrap_or(&event_id).to_string(),
                }),
            }
        }
        "invoice.payment_failed" => {
            let Some(external_id) = object["subscription"].as_str() else {
                return Ok(None);
            };
            NormalizedEvent {
                provider: ProviderKind::Stripe,
                event_id: event_id.clone(),
                external_id: external_id.to_string(),
                kind: EventKind::PaymentFailed,
                status: SubscriptionStatus::PastDue,
                period_end: None,
                payment: Some(PaymentDetails {
                    amount_cents: object["amount_due"].as_i64().unwrap_or(0),
                    currency: object["currency"].as_str().unwrap_or("eur").to_string(),
                    reference: object["id"].as_str().unwrap_or(&event_id).to_string(),
                }),
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}
