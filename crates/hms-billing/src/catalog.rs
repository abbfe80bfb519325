//! Plan Catalog
//!
//! Plans, billable entities, tenants and the administrative operations that
//! maintain them. Catalog data is configuration: it is soft-deactivated
//! rather than deleted.

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use hms_common::{BillingError, BillingResult};

use crate::discounts::DiscountCode;
use crate::pricing::PricingRule;
use crate::store::BillingStore;

/// Billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingCycle {
    /// Calendar months in one cycle
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Yearly => 12,
        }
    }

    /// End of the cycle starting at `from`.
    ///
    /// Month arithmetic clamps to the last day of shorter months.
    pub fn advance(&self, from: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        from.checked_add_months(Months::new(self.months()))
            .ok_or_else(|| BillingError::Internal(format!("cycle end overflows after {}", from)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" | "annual" | "annually" => Ok(Self::Yearly),
            other => Err(BillingError::Validation(format!("unknown billing cycle '{}'", other))),
        }
    }
}

/// Capacity limits of a plan (`None` = unlimited)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLimits {
    pub max_users: Option<u32>,
    pub max_entities: Option<u32>,
    pub storage_quota_mb: Option<u64>,
}

/// Per-entity usage thresholds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimit {
    /// Advisory threshold
    pub soft_limit: Option<Decimal>,
    /// Blocking threshold
    pub hard_limit: Option<Decimal>,
}

/// Subscription plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    /// Price of one month
    pub base_price: Decimal,
    /// Price of one year; defaults to twelve months
    #[serde(default)]
    pub yearly_price: Option<Decimal>,
    pub billing_cycle: BillingCycle,
    /// Trial length; falls back to the configured default
    #[serde(default)]
    pub trial_days: Option<u32>,
    #[serde(default)]
    pub capacity: CapacityLimits,
    /// Usage thresholds keyed by billable entity id
    #[serde(default)]
    pub usage_limits: HashMap<String, UsageLimit>,
    /// Ordinal used to tell upgrades from downgrades
    pub tier_rank: u32,
    pub active: bool,
}

impl SubscriptionPlan {
    /// Price of one cycle of `cycle`
    pub fn cycle_price(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.base_price,
            BillingCycle::Quarterly => self.base_price * dec!(3),
            BillingCycle::Yearly => self.yearly_price.unwrap_or(self.base_price * dec!(12)),
        }
    }

    /// Cycle price normalised to one month (unrounded)
    pub fn monthly_equivalent(&self, cycle: BillingCycle) -> Decimal {
        self.cycle_price(cycle) / Decimal::from(cycle.months())
    }

    /// Check plan fields
    pub fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::Validation("plan name cannot be empty".into()));
        }
        if self.base_price < Decimal::ZERO {
            return Err(BillingError::Validation("base price cannot be negative".into()));
        }
        if matches!(self.yearly_price, Some(p) if p < Decimal::ZERO) {
            return Err(BillingError::Validation("yearly price cannot be negative".into()));
        }
        // cycle_price multiplies the base price up to a year
        if self.base_price.checked_mul(dec!(12)).is_none() {
            return Err(BillingError::Validation("base price is out of range".into()));
        }
        for (entity, limit) in &self.usage_limits {
            let negative = [limit.soft_limit, limit.hard_limit]
                .iter()
                .flatten()
                .any(|v| *v < Decimal::ZERO);
            if negative {
                return Err(BillingError::Validation(format!("negative usage limit for '{}'", entity)));
            }
            if let (Some(soft), Some(hard)) = (limit.soft_limit, limit.hard_limit) {
                if soft > hard {
                    return Err(BillingError::Validation(format!(
                        "soft limit above hard limit for '{}'", entity
                    )));
                }
            }
        }
        Ok(())
    }

    /// Same plan apart from the `active` flag
    fn same_terms(&self, other: &SubscriptionPlan) -> bool {
        let mut other = other.clone();
        other.active = self.active;
        *self == other
    }
}

/// Something whose consumption is metered (lab orders, imaging studies, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillableEntity {
    pub id: String,
    pub name: String,
    /// Unit label shown on invoices
    pub unit: String,
}

/// Tenant (hospital / clinic customer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
}

/// Catalog bundle, as imported by operators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogBundle {
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub plans: Vec<SubscriptionPlan>,
    #[serde(default)]
    pub entities: Vec<BillableEntity>,
    #[serde(default)]
    pub rules: Vec<PricingRule>,
    #[serde(default)]
    pub discount_codes: Vec<DiscountCode>,
}

/// Catalog manager
pub struct CatalogManager {
    store: Arc<dyn BillingStore>,
}

impl CatalogManager {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Register tenant
    pub fn register_tenant(&self, tenant: Tenant) -> BillingResult<Tenant> {
        if tenant.name.trim().is_empty() {
            return Err(BillingError::Validation("tenant name cannot be empty".into()));
        }
        self.store.save_tenant(tenant.clone())?;
        tracing::info!(tenant_id = %tenant.id, "tenant registered");
        Ok(tenant)
    }

    /// Create or update a plan.
    ///
    /// A plan referenced by a live subscription only accepts changes to its
    /// `active` flag.
    pub fn upsert_plan(&self, plan: SubscriptionPlan) -> BillingResult<SubscriptionPlan> {
        plan.validate()?;

        if let Some(existing) = self.store.get_plan(&plan.id)? {
            if !existing.same_terms(&plan) && self.store.plan_in_use(&plan.id)? {
                return Err(BillingError::Conflict(format!(
                    "plan {} is referenced by a live subscription", plan.id
                )));
            }
        }

        self.store.save_plan(plan.clone())?;
        tracing::info!(plan_id = %plan.id, tier_rank = plan.tier_rank, "plan saved");
        Ok(plan)
    }

    /// Soft-delete a plan
    pub fn deactivate_plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        let mut plan = self.store.get_plan(&plan_id)?
            .ok_or_else(|| BillingError::not_found("plan", plan_id))?;
        plan.active = false;
        self.store.save_plan(plan.clone())?;
        tracing::info!(plan_id = %plan_id, "plan deactivated");
        Ok(plan)
    }

    /// Get plan
    pub fn plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        self.store.get_plan(&plan_id)?
            .ok_or_else(|| BillingError::not_found("plan", plan_id))
    }

    /// Save billable entity
    pub fn save_entity(&self, entity: BillableEntity) -> BillingResult<BillableEntity> {
        if entity.id.trim().is_empty() {
            return Err(BillingError::Validation("entity id cannot be empty".into()));
        }
        self.store.save_entity(entity.clone())?;
        Ok(entity)
    }

    /// Save pricing rule; configuration errors fail here, not at evaluation
    pub fn save_pricing_rule(&self, rule: PricingRule) -> BillingResult<PricingRule> {
        rule.validate()?;

        if let Some(plan_id) = rule.plan_id {
            if self.store.get_plan(&plan_id)?.is_none() {
                return Err(BillingError::not_found("plan", plan_id));
            }
        }
        if let Some(entity_id) = &rule.entity_id {
            if self.store.get_entity(entity_id)?.is_none() {
                return Err(BillingError::not_found("billable entity", entity_id));
            }
        }

        self.store.save_rule(rule.clone())?;
        tracing::info!(rule_id = %rule.id, rule_type = rule.rule_type().as_str(), "pricing rule saved");
        Ok(rule)
    }

    /// Save discount code (stored upper-case)
    pub fn save_discount_code(&self, mut code: DiscountCode) -> BillingResult<DiscountCode> {
        code.code = code.code.trim().to_uppercase();
        code.validate()?;
        self.store.save_discount(code.clone())?;
        Ok(code)
    }

    /// Import a whole bundle, in dependency order
    pub fn import(&self, bundle: CatalogBundle) -> BillingResult<ImportSummary> {
        let summary = ImportSummary {
            tenants: bundle.tenants.len(),
            plans: bundle.plans.len(),
            entities: bundle.entities.len(),
            rules: bundle.rules.len(),
            discount_codes: bundle.discount_codes.len(),
        };

        for tenant in bundle.tenants {
            self.register_tenant(tenant)?;
        }
        for plan in bundle.plans {
            self.upsert_plan(plan)?;
        }
        for entity in bundle.entities {
            self.save_entity(entity)?;
        }
        for rule in bundle.rules {
            self.save_pricing_rule(rule)?;
        }
        for code in bundle.discount_codes {
            self.save_discount_code(code)?;
        }

        Ok(summary)
    }
}

/// Counts of imported catalog items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub tenants: usize,
    pub plans: usize,
    pub entities: usize,
    pub rules: usize,
    pub discount_codes: usize,
}
