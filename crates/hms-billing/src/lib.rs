//! HMS Billing Engine
//!
//! Subscription lifecycle and metered pricing for the hospital-management
//! platform.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BILLING PLATFORM                                │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │   Catalog    │  │   Pricing    │  │   Metering   │  │ Subscription│ │
//! │  │ plans, rules │  │  Evaluator   │  │ usage,alerts │  │  Lifecycle  │ │
//! │  └──────────────┘  └──────┬───────┘  └──────┬───────┘  └──────┬──────┘ │
//! │                           └─────────┬───────┴─────────────────┘        │
//! │                            ┌────────▼────────┐                          │
//! │                            │    Invoicing    │◄── discount codes        │
//! │                            └────────┬────────┘                          │
//! │  ┌──────────────────────────────────▼────────────────────────────────┐ │
//! │  │           BillingStore port (clock + id generator injected)        │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod catalog;
pub mod config;
pub mod discounts;
pub mod invoicing;
pub mod lifecycle;
pub mod metering;
pub mod pricing;
pub mod store;
pub mod subscriptions;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub use catalog::{BillableEntity, BillingCycle, CatalogBundle, CatalogManager, SubscriptionPlan, Tenant};
pub use config::BillingConfig;
pub use discounts::{DiscountCode, DiscountType};
pub use hms_common::{BillingError, BillingResult, Clock, IdGenerator, RandomIds, SystemClock};
pub use invoicing::{GenerateInvoice, Invoice, InvoiceGenerator, InvoiceStatus};
pub use lifecycle::{AccountStatus, SubscriptionStatus};
pub use metering::{BillingStatus, MeteringEngine, RecordUsage, UsageAlert, UsageOutcome, UsageSummary};
pub use pricing::{EvaluationInput, PricingEngine, PricingRule, PricingTier, RuleConfig};
pub use store::{BillingStore, InMemoryBillingStore, StoreSnapshot};
pub use subscriptions::{
    CreateSubscription, PlanChange, PlanChangeRequest, Subscription, SubscriptionManager, SweepReport,
};

/// Billing platform
pub struct BillingPlatform {
    /// Plans, entities, rules, discount codes
    pub catalog: Arc<CatalogManager>,
    /// Pricing rule evaluator
    pub pricing: PricingEngine,
    /// Usage meter
    pub metering: Arc<MeteringEngine>,
    /// Subscription lifecycle manager
    pub subscriptions: Arc<SubscriptionManager>,
    /// Invoice generator
    pub invoicing: Arc<InvoiceGenerator>,
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    config: BillingConfig,
}

impl BillingPlatform {
    /// Wire every component over the given ports
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: BillingConfig,
    ) -> BillingResult<Self> {
        config.validate()?;
        Ok(Self {
            catalog: Arc::new(CatalogManager::new(store.clone())),
            pricing: PricingEngine::new(),
            metering: Arc::new(MeteringEngine::new(store.clone(), clock.clone(), ids.clone())),
            subscriptions: Arc::new(SubscriptionManager::new(
                store.clone(),
                clock.clone(),
                ids.clone(),
                config.default_trial_days,
            )),
            invoicing: Arc::new(InvoiceGenerator::new(store.clone(), clock.clone(), ids, config.clone())),
            store,
            clock,
            config,
        })
    }

    /// Platform over a fresh in-memory store, wall clock and random ids
    pub fn in_memory(config: BillingConfig) -> BillingResult<Self> {
        Self::new(
            Arc::new(InMemoryBillingStore::new()),
            Arc::new(SystemClock),
            Arc::new(RandomIds),
            config,
        )
    }

    /// Active configuration
    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Persistence port the platform writes through
    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    /// Current time per the injected clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create subscription
    pub fn create_subscription(&self, request: CreateSubscription) -> BillingResult<Subscription> {
        self.subscriptions.create(request)
    }

    /// Upgrade subscription
    pub fn upgrade_subscription(&self, request: PlanChangeRequest) -> BillingResult<PlanChange> {
        self.subscriptions.upgrade(request)
    }

    /// Downgrade subscription
    pub fn downgrade_subscription(&self, request: PlanChangeRequest) -> BillingResult<PlanChange> {
        self.subscriptions.downgrade(request)
    }

    /// Cancel subscription
    pub fn cancel_subscription(&self, id: Uuid, reason: Option<String>) -> BillingResult<Subscription> {
        self.subscriptions.cancel(id, reason)
    }

    /// Renew subscription
    pub fn renew_subscription(&self, id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions.renew(id)
    }

    /// Expire/renew due subscriptions
    pub fn sweep_expired_subscriptions(&self, now: DateTime<Utc>) -> BillingResult<SweepReport> {
        self.subscriptions.sweep_expired(now)
    }

    /// Record usage
    pub fn record_usage(&self, request: RecordUsage) -> BillingResult<UsageOutcome> {
        self.metering.record_usage(request)
    }

    /// Resolve alert
    pub fn resolve_alert(&self, alert_id: Uuid) -> BillingResult<UsageAlert> {
        self.metering.resolve_alert(alert_id)
    }

    /// Usage summary
    pub fn get_usage_summary(
        &self,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: &[BillingStatus],
    ) -> BillingResult<UsageSummary> {
        self.metering.get_usage_summary(subscription_id, start, end, statuses)
    }

    /// Unresolved alerts
    pub fn get_active_alerts(&self, subscription_id: Uuid) -> BillingResult<Vec<UsageAlert>> {
        self.metering.active_alerts(subscription_id)
    }

    /// Generate invoice
    pub fn generate_invoice(&self, request: GenerateInvoice) -> BillingResult<Invoice> {
        self.invoicing.generate(request)
    }

    /// Evaluate a pricing rule (validated first, it may never have been saved)
    pub fn evaluate_pricing_rule(&self, rule: &PricingRule, input: EvaluationInput<'_>) -> BillingResult<Decimal> {
        self.pricing.evaluate_checked(rule, input)
    }

    /// Get MRR (Monthly Recurring Revenue)
    pub fn get_mrr(&self) -> BillingResult<Decimal> {
        self.subscriptions.calculate_mrr()
    }

    /// Get ARR (Annual Recurring Revenue)
    pub fn get_arr(&self) -> BillingResult<Decimal> {
        self.subscriptions.calculate_arr()
    }
}
