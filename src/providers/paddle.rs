//! Paddle adapter.
//!
//! The REST side speaks Paddle's JSON API; webhook normalization consumes
//! the flat alert format Paddle actually delivers (string-typed numbers,
//! `alert_name` discriminator, date-formatted billing timestamps).

use chrono::{DateTime, NaiveDate, NaiveDateTime};
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

const DEFAULT_BASE_URL: &str = "https://api.paddle.com";

/// Map a Paddle-native subscription status onto the local enum.
///
/// Unknown statuses map to `PastDue` (conservative).
pub(crate) fn map_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" => SubscriptionStatus::PastDue,
        "deleted" | "cancelled" | "canceled" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::PastDue,
    }
}

/// Parse Paddle's date-formatted billing timestamps into unix seconds.
///
/// Alerts use `2026-09-07` or `2026-09-07 10:20:30`; the REST API returns
/// RFC 3339.
fn parse_billing_timestamp(raw: &str) -> Option<u64> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp() as u64);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp() as u64);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp() as u64)
}

/// Parse a decimal amount string ("29.00") into cents.
fn parse_amount_cents(raw: &str) -> i64 {
    raw.parse::<f64>()
        .map(|amount| (amount * 100.0).round() as i64)
        .unwrap_or(0)
}

/// Alert fields arrive as strings or numbers depending on delivery path.
fn string_field(payload: &Value, name: &str) -> Option<String> {
    match &payload[name] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Live Paddle client.
pub struct PaddleProvider {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl PaddleProvider {
    /// Create a new Paddle adapter from provider configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ApiError::validation("Paddle API key cannot be empty"));
        }

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

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.api_key.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let code = body["error"]["code"].as_str().map(String::from);
            let message = body["error"]["detail"]
                .as_str()
                .unwrap_or("request failed")
                .to_string();
            tracing::warn!(
                target: "pressbill::providers::paddle",
                status = status.as_u16(),
                code = code.as_deref().unwrap_or(""),
                "paddle call failed"
            );
            return Err(ApiError::Provider {
                provider: ProviderKind::Paddle,
                code,
                message,
            });
        }

        Ok(body)
    }

    fn parse_subscription(&self, body: &Value) -> Result<ProviderSubscription> {
        let data = &body["data"];
        let external_id = data["id"]
            .as_str()
            .ok_or_else(|| ApiError::internal("Paddle subscription missing id"))?
            .to_string();
        let status = map_status(data["status"].as_str().unwrap_or_default());
        let current_period_end = data["next_billed_at"]
            .as_str()
            .and_then(parse_billing_timestamp);
        Ok(ProviderSubscription {
            external_id,
            status,
            current_period_end,
        })
    }
}

#[async_trait]
impl PaymentProvider for PaddleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Paddle
    }

    fn requires_payment_method(&self) -> bool {
        // Paddle collects payment details in its own checkout flow.
        false
    }

    async fn create_customer(&self, email: &str, user_id: Uuid) -> Result<String> {
        let body = serde_json::json!({
            "email": email,
            "custom_data": {"user_id": user_id.to_string()},
        });
        let response = self.send(Method::POST, "/customers", Some(body)).await?;
        response["data"]["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ApiError::internal("Paddle customer missing id"))
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        plan_ref: &str,
        _payment_method: Option<&str>,
    ) -> Result<ProviderSubscription> {
        let body = serde_json::json!({
            "customer_id": customer_ref,
            "items": [{"price_id": plan_ref, "quantity": 1}],
        });
        let response = self.send(Method::POST, "/subscriptions", Some(body)).await?;
        self.parse_subscription(&response)
    }

    async fn update_subscription(
        &self,
        external_id: &str,
        new_plan_ref: &str,
    ) -> Result<ProviderSubscription> {
        let body = serde_json::json!({
            "items": [{"price_id": new_plan_ref, "quantity": 1}],
            "proration_billing_mode": "prorated_immediately",
        });
        let response = self
            .send(
                Method::PATCH,
                &format!("/subscriptions/{external_id}"),
                Some(body),
            )
            .await?;
        self.parse_subscription(&response)
    }

    async fn cancel_subscription(&self, external_id: &str) -> Result<()> {
        let body = serde_json::json!({"effective_from": "immediately"});
        let result = self
            .send(
                Method::POST,
                &format!("/subscriptions/{external_id}/cancel"),
                Some(body),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already canceled: the desired state holds.
            Err(ApiError::Provider {
                code: Some(code), ..
            }) if code == "subscription_already_canceled" => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn retrieve_subscription(&self, external_id: &str) -> Result<ProviderSubscription> {
        let response = self
            .send(Method::GET, &format!("/subscriptions/{external_id}"), None)
            .await?;
        self.parse_subscription(&response)
    }
}

/// Normalize a Paddle webhook alert.
///
/// Returns `Ok(None)` for alert types reconciliation doesn't consume.
pub fn normalize_event(payload: &Value) -> Result<Option<NormalizedEvent>> {
    let alert_name = payload["alert_name"]
        .as_str()
        .ok_or_else(|| ApiError::validation("Paddle alert missing alert_name"))?;
    let event_id = string_field(payload, "alert_id")
        .ok_or_else(|| ApiError::validation("Paddle alert missing alert_id"))?;
    let external_id = match string_field(payload, "subscription_id") {
        Some(id) => id,
        None => return Ok(None),
    };

    let period_end = payload["next_bill_date"]
        .as_str()
        .and_then(parse_billing_timestamp);

    let event = match alert_name {
        "subscription_updated" => NormalizedEvent {
            provider: ProviderKind::Paddle,
            event_id,
            external_id,
            kind: EventKind::StatusChanged,
            status: map_status(payload["status"].as_str().unwrap_or_default()),
            period_end,
            payment: None,
        },
        "subscription_cancelled" => NormalizedEvent {
            provider: ProviderKind::Paddle,
            event_id,
            external_id,
            kind: EventKind::StatusChanged,
            // The alert may omit the status field; cancellation is implied.
            status: map_status(payload["status"].as_str().unwrap_or("deleted")),
            period_end,
            payment: None,
        },
        "subscription_payment_succeeded" => {
            let reference = string_field(payload, "order_id").unwrap_or_else(|| event_id.clone());
            NormalizedEvent {
                provider: ProviderKind::Paddle,
                event_id,
                external_id,
                kind: EventKind::PaymentSucceeded,
                status: SubscriptionStatus::Active,
                period_end,
                payment: Some(PaymentDetails {
                    amount_cents: payload["amount"]
                        .as_str()
                        .map(parse_amount_cents)
                        .unwrap_or(0),
                    currency: payload["currency"].as_str().unwrap_or("EUR").to_string(),
                    reference,
                }),
            }
        }
        "subscription_payment_failed" => {
            let reference = string_field(payload, "order_id").unwrap_or_else(|| event_id.clone());
            NormalizedEvent {
                provider: ProviderKind::Paddle,
                event_id,
                external_id,
                kind: EventKind::PaymentFailed,
                status: SubscriptionStatus::PastDue,
                period_end: None,
                payment: Some(PaymentDetails {
                    amount_cents: payload["amount"]
                        .as_str()
                        .map(parse_amount_cents)
                        .unwrap_or(0),
                    currency: payload["currency"].as_str().unwrap_or("EUR").to_string(),
                    reference,
                }),
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_mapping_is_conservative() {
        assert_eq!(map_status("active"), SubscriptionStatus::Active);
        assert_eq!(map_status("trialing"), SubscriptionStatus::Active);
        assert_eq!(map_status("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(map_status("deleted"), SubscriptionStatus::Canceled);
        assert_eq!(map_status("cancelled"), SubscriptionStatus::Canceled);
        assert_eq!(map_status("paused"), SubscriptionStatus::PastDue);
        assert_eq!(map_status(""), SubscriptionStatus::PastDue);
    }

    #[test]
    fn billing_timestamp_formats() {
        assert_eq!(parse_billing_timestamp("1970-01-02"), Some(86_400));
        assert_eq!(
            parse_billing_timestamp("1970-01-02 00:00:30"),
            Some(86_430)
        );
        assert_eq!(
            parse_billing_timestamp("1970-01-02T00:00:30Z"),
            Some(86_430)
        );
        assert_eq!(parse_billing_timestamp("next tuesday"), None);
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(parse_amount_cents("29.00"), 2900);
        assert_eq!(parse_amount_cents("15.5"), 1550);
        assert_eq!(parse_amount_cents("garbage"), 0);
    }

    #[test]
    fn normalizes_subscription_updated() {
        let payload = json!({
            "alert_id": 424_242,
            "alert_name": "subscription_updated",
            "subscription_id": "8873",
            "status": "active",
            "next_bill_date": "1970-01-02"
        });

        let event = normalize_event(&payload).unwrap().unwrap();
        assert_eq!(event.event_id, "424242");
        assert_eq!(event.external_id, "8873");
        assert_eq!(event.status, SubscriptionStatus::Active);
        assert_eq!(event.period_end, Some(86_400));
    }

    #[test]
    fn normalizes_cancellation_without_status_field() {
        let payload = json!({
            "alert_id": "1",
            "alert_name": "subscription_cancelled",
            "subscription_id": "8873"
        });

        let event = normalize_event(&payload).unwrap().unwrap();
        assert_eq!(event.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn normalizes_payment_succeeded_with_order_reference() {
        let payload = json!({
            "alert_id": "2",
            "alert_name": "subscription_payment_succeeded",
            "subscription_id": "8873",
            "order_id": "ord_991",
            "amount": "29.00",
            "currency": "EUR",
            "next_bill_date": "1970-01-02"
        });

        let event = normalize_event(&payload).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::PaymentSucceeded);
        let payment = event.payment.unwrap();
        assert_eq!(payment.amount_cents, 2900);
        assert_eq!(payment.reference, "ord_991");
    }

    #[test]
    fn unknown_alerts_are_ignored() {
        let payload = json!({
            "alert_id": "3",
            "alert_name": "locker_processed",
            "subscription_id": "8873"
        });
        assert!(normalize_event(&payload).unwrap().is_none());

        // Alerts with no subscription attached are not ours to reconcile.
        let payload = json!({
            "alert_id": "4",
            "alert_name": "subscription_updated"
        });
        assert!(normalize_event(&payload).unwrap().is_none());
    }
}
