//! Pressbill - content and monetization backend for a blog platform
//!
//! Pressbill manages paid subscriptions against two external payment
//! providers, keeps local state reconciled with their webhook streams,
//! tracks affiliate-link clicks and conversions, and rolls daily analytics.
//!
//! # Features
//!
//! - **Billing**: subscription lifecycle with webhook-driven reconciliation
//!   (idempotent, order-tolerant, version-CAS serialized per subscription)
//! - **Providers**: Stripe and Paddle behind one capability trait
//! - **Affiliate**: click dedup, one-way conversions, denormalized counters
//! - **Analytics**: idempotent daily rollups
//! - **Cache**: TTL key-value layer for memoized aggregates
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pressbill::{ConfigBuilder, billing::{Plans, SubscriptionManager}};
//! use pressbill::billing::InMemorySubscriptionStore;
//! use pressbill::providers::{ProviderRegistry, StripeProvider, PaddleProvider};
//! use pressbill::users::InMemoryUserStore;
//! use std::sync::Arc;
//!
//! # fn main() -> pressbill::Result<()> {
//! pressbill::init_tracing();
//!
//! let config = ConfigBuilder::new().from_env().build();
//! let providers = ProviderRegistry::new()
//!     .register(Arc::new(StripeProvider::new(&config.stripe)?))
//!     .register(Arc::new(PaddleProvider::new(&config.paddle)?));
//!
//! let manager = SubscriptionManager::new(
//!     InMemorySubscriptionStore::new(),
//!     InMemoryUserStore::new(),
//!     providers,
//!     Plans::standard(),
//! );
//! # let _ = manager;
//! # Ok(())
//! # }
//! ```

#![allow(async_fn_in_trait)] // CacheExt helpers are generics-only by design

pub mod affiliate;
pub mod analytics;
pub mod billing;
pub mod cache;
mod config;
pub mod content;
mod error;
pub mod providers;
pub mod store;
pub mod users;

// Re-exports for the public API.
pub use cache::{Cache, CacheExt, InMemoryCache, NoopCache};
pub use config::{CacheConfig, Config, ConfigBuilder, LoggingConfig, ProviderConfig};
pub use error::{ApiError, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults.
///
/// Call early in `main()`, before constructing services.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log level filter (e.g. "info", "pressbill=debug")
/// - `PRESSBILL_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("PRESSBILL_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from a loaded [`Config`].
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
