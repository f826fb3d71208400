//! Plan configuration and definitions.
//!
//! Plans are a closed three-tier enum; each tier carries pricing, a feature
//! list, and the per-provider references the adapters subscribe against.
//!
//! ```rust,ignore
//! use pressbill::billing::{Plan, Plans};
//!
//! let plans = Plans::builder()
//!     .plan(Plan::Basic)
//!         .price_cents(1_500)
//!         .stripe_price("price_basic_monthly")
//!         .paddle_plan("pri_basic_monthly")
//!         .features(["blog_access", "email_updates", "community"])
//!         .done()
//!     .build();
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ApiError, Result};
use crate::providers::ProviderKind;

/// The closed set of subscription plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Basic,
    Pro,
    Enterprise,
}

impl Plan {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// All plans, cheapest first.
    #[must_use]
    pub fn all() -> [Plan; 3] {
        [Self::Basic, Self::Pro, Self::Enterprise]
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Plan {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(ApiError::InvalidPlan(other.to_string())),
        }
    }
}

/// Configuration for a single plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanConfig {
    pub plan: Plan,
    /// Monthly price in cents.
    pub price_cents: i64,
    /// ISO currency code, lowercase.
    pub currency: String,
    /// Features available on this plan.
    pub features: Vec<String>,
    /// Stripe price id the adapter subscribes against.
    pub stripe_price_id: String,
    /// Paddle price id the adapter subscribes against.
    pub paddle_plan_id: String,
}

impl PlanConfig {
    /// The provider-side reference for this plan.
    #[must_use]
    pub fn provider_ref(&self, provider: ProviderKind) -> &str {
        match provider {
            ProviderKind::Stripe => &self.stripe_price_id,
            ProviderKind::Paddle => &self.paddle_plan_id,
        }
    }

    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// A collection of plan configurations.
#[derive(Debug, Clone, Default)]
pub struct Plans {
    plans: HashMap<Plan, PlanConfig>,
}

impl Plans {
    #[must_use]
    pub fn builder() -> PlansBuilder {
        PlansBuilder::default()
    }

    /// The stock three-tier catalog with placeholder provider references.
    ///
    /// Production wiring builds plans from config so the references match
    /// the live provider catalogs; tests use this directly.
    #[must_use]
    pub fn standard() -> Self {
        Self::builder()
            .plan(Plan::Basic)
            .price_cents(1_500)
            .stripe_price("price_basic_monthly")
            .paddle_plan("pri_basic_monthly")
            .features(["blog_access", "email_updates", "community"])
            .done()
            .plan(Plan::Pro)
            .price_cents(2_900)
            .stripe_price("price_pro_monthly")
            .paddle_plan("pri_pro_monthly")
            .features([
                "blog_access",
                "email_updates",
                "community",
                "premium_content",
                "priority_support",
                "no_ads",
            ])
            .done()
            .plan(Plan::Enterprise)
            .price_cents(3_900)
            .stripe_price("price_enterprise_monthly")
            .paddle_plan("pri_enterprise_monthly")
            .features([
                "blog_access",
                "email_updates",
                "community",
                "premium_content",
                "priority_support",
                "no_ads",
                "custom_solutions",
                "dedicated_support",
                "api_access",
            ])
            .done()
            .build()
    }

    #[must_use]
    pub fn get(&self, plan: Plan) -> Option<&PlanConfig> {
        self.plans.get(&plan)
    }

    /// Fetch a plan's configuration, failing with `InvalidPlan` when the
    /// catalog doesn't carry it.
    pub fn require(&self, plan: Plan) -> Result<&PlanConfig> {
        self.get(plan)
            .ok_or_else(|| ApiError::InvalidPlan(plan.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Plan, &PlanConfig)> {
        self.plans.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Builder for [`Plans`].
#[derive(Debug, Default)]
pub struct PlansBuilder {
    plans: HashMap<Plan, PlanConfig>,
}

impl PlansBuilder {
    #[must_use]
    pub fn plan(self, plan: Plan) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            config: PlanConfig {
                plan,
                price_cents: 0,
                currency: "eur".to_string(),
                features: Vec::new(),
                stripe_price_id: String::new(),
                paddle_plan_id: String::new(),
            },
        }
    }

    #[must_use]
    pub fn build(self) -> Plans {
        Plans { plans: self.plans }
    }
}

/// Builder for a single plan within [`PlansBuilder`].
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlansBuilder,
    config: PlanConfig,
}

impl PlanBuilder {
    #[must_use]
    pub fn price_cents(mut self, cents: i64) -> Self {
        self.config.price_cents = cents;
        self
    }

    #[must_use]
    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.config.currency = currency.into();
        self
    }

    #[must_use]
    pub fn stripe_price(mut self, price_id: impl Into<String>) -> Self {
        self.config.stripe_price_id = price_id.into();
        self
    }

    #[must_use]
    pub fn paddle_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.config.paddle_plan_id = plan_id.into();
        self
    }

    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.features = features.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn done(mut self) -> PlansBuilder {
        self.parent.plans.insert(self.config.plan, self.config);
        self.parent
    }
}
