//! Invoice Generation
//!
//! An invoice for one subscription period is built from the base price of the
//! plan the period started on, one line per active pricing rule of that plan
//! (evaluated against the period's billable usage), pending upgrade
//! prorations and at most one discount code. A mid-cycle upgrade is charged
//! through its proration line only; the new plan's price applies from the
//! next cycle. Everything the invoice consumes is committed in a single store
//! call, which also rejects an invoice overlapping a non-cancelled one.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use hms_common::{money_add, money_mul, money_sub, money_sum, round_money, BillingError, BillingResult, Clock, IdGenerator};

use crate::config::BillingConfig;
use crate::discounts::DiscountManager;
use crate::metering::UsageRecord;
use crate::pricing::{complexity_factor, evaluate, EvaluationInput, PricingRule, RuleConfig};
use crate::store::BillingStore;
use crate::subscriptions::{ChangeKind, Subscription, SubscriptionStatus};

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Draft, Cancelled)
                | (Sent, Paid) | (Sent, Overdue) | (Sent, Cancelled)
                | (Overdue, Paid) | (Overdue, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Line item type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Subscription,
    Usage,
    Proration,
}

/// Invoice line item; `amount` is always `round2(quantity * unit_price)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub description: String,
    pub item_type: ItemType,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub rule_id: Option<Uuid>,
    /// Units behind a usage line billed as one priced unit
    pub metered_units: Option<Decimal>,
}

impl InvoiceLineItem {
    pub fn new(description: impl Into<String>, item_type: ItemType, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            item_type,
            quantity,
            unit_price,
            amount: round_money(quantity * unit_price),
            rule_id: None,
            metered_units: None,
        }
    }
}

/// Invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    /// `INV-000001`, assigned on commit
    pub number: String,
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: InvoiceStatus,
    pub line_items: Vec<InvoiceLineItem>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub discount_code: Option<String>,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Usage records this invoice billed
    pub usage_record_ids: Vec<Uuid>,
    /// Upgrade change records charged as proration lines
    pub proration_change_ids: Vec<Uuid>,
}

impl Invoice {
    /// Still counts for the one-invoice-per-period guard
    pub fn is_open(&self) -> bool {
        self.status != InvoiceStatus::Cancelled
    }

    /// Same subscription and the periods share at least one instant
    pub fn overlaps(&self, subscription_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.subscription_id == subscription_id && start < self.period_end && self.period_start < end
    }
}

/// Everything an invoice consumes, committed as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceCommit {
    pub invoice: Invoice,
    /// Code to redeem (one use) with the invoice
    pub discount_code: Option<String>,
}

/// Generate invoice request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateInvoice {
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub discount_code: Option<String>,
}

impl GenerateInvoice {
    pub fn new(subscription_id: Uuid, period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Self {
        Self { subscription_id, period_start, period_end, discount_code: None }
    }

    pub fn with_discount(mut self, code: &str) -> Self {
        self.discount_code = Some(code.into());
        self
    }
}

/// Usage line for one rule, or `None` when it prices to zero
fn usage_line(rule: &PricingRule, records: &[UsageRecord], basis: Decimal) -> BillingResult<Option<InvoiceLineItem>> {
    let units = money_sum(records.iter().map(|r| r.units))?;

    let amount = match &rule.config {
        // complexity is per record; weight the units so the rule rounds once
        RuleConfig::Multiplier { multipliers, .. } => {
            let weighted = records.iter().try_fold(Decimal::ZERO, |acc, r| {
                money_add(acc, money_mul(r.units, complexity_factor(multipliers, r.complexity.as_deref()))?)
            })?;
            evaluate(rule, EvaluationInput::units(weighted))?
        }
        _ => evaluate(rule, EvaluationInput::units(units).with_basis(basis))?,
    };
    if amount.is_zero() {
        return Ok(None);
    }

    let mut line = match &rule.config {
        RuleConfig::PerUnit { unit_price } => {
            InvoiceLineItem::new(rule.name.clone(), ItemType::Usage, units, *unit_price)
        }
        _ => {
            let mut line = InvoiceLineItem::new(rule.name.clone(), ItemType::Usage, Decimal::ONE, amount);
            if rule.entity_id.is_some() {
                line.metered_units = Some(units);
            }
            line
        }
    };
    line.rule_id = Some(rule.id);
    Ok(Some(line))
}

/// Invoice generator
pub struct InvoiceGenerator {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    discounts: DiscountManager,
    config: BillingConfig,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: BillingConfig,
    ) -> Self {
        Self {
            discounts: DiscountManager::new(store.clone()),
            store,
            clock,
            ids,
            config,
        }
    }

    /// Plan whose price applies to the cycle starting at `period_start`
    fn billed_plan_id(&self, sub: &Subscription, period_start: DateTime<Utc>) -> BillingResult<Uuid> {
        if period_start >= sub.current_period_end {
            let pending = sub.pending_change.as_ref().filter(|p| p.effective_at <= period_start);
            return Ok(pending.map_or(sub.plan_id, |p| p.plan_id));
        }
        if period_start >= sub.current_period_start {
            return Ok(sub.cycle_plan_id);
        }

        // an earlier cycle: the plan it was created, activated or renewed on
        let started = self.store.change_records(&sub.id)?
            .into_iter()
            .filter(|r| {
                matches!(r.kind, ChangeKind::Created | ChangeKind::Activated | ChangeKind::Renewed)
                    && r.effective_at <= period_start
            })
            .max_by_key(|r| r.effective_at)
            .map(|r| r.to_plan_id);
        Ok(started.unwrap_or(sub.cycle_plan_id))
    }

    /// Generate a draft invoice for `[period_start, period_end)`
    pub fn generate(&self, request: GenerateInvoice) -> BillingResult<Invoice> {
        let GenerateInvoice { subscription_id, period_start, period_end, discount_code } = request;
        if period_end <= period_start {
            return Err(BillingError::Validation("invoice period is empty".into()));
        }

        let sub = self.store.get_subscription(&subscription_id)?
            .ok_or_else(|| BillingError::not_found("subscription", subscription_id))?;
        let plan_id = self.billed_plan_id(&sub, period_start)?;
        let plan = self.store.get_plan(&plan_id)?
            .ok_or_else(|| BillingError::not_found("plan", plan_id))?;

        if self.store.open_invoice_for_period(&sub.id, period_start, period_end)?.is_some() {
            return Err(BillingError::Conflict(format!(
                "subscription {} already has an invoice for {} to {}", sub.id, period_start, period_end
            )));
        }

        let now = self.clock.now();

        let base_price = if sub.status == SubscriptionStatus::Trial {
            Decimal::ZERO
        } else {
            plan.cycle_price(sub.billing_cycle)
        };
        let mut line_items = vec![InvoiceLineItem::new(
            format!("{} plan ({})", plan.name, sub.billing_cycle.as_str()),
            ItemType::Subscription,
            Decimal::ONE,
            base_price,
        )];

        let mut usage_ids = BTreeSet::new();
        let mut pulled: HashMap<String, Vec<UsageRecord>> = HashMap::new();
        for rule in self.store.rules_for_plan(&plan.id)? {
            let records = match &rule.entity_id {
                Some(entity_id) => {
                    if !pulled.contains_key(entity_id) {
                        let records = self.store.billable_usage(&sub.id, entity_id, period_start, period_end)?;
                        pulled.insert(entity_id.clone(), records);
                    }
                    pulled.get(entity_id).cloned().unwrap_or_default()
                }
                None => Vec::new(),
            };
            usage_ids.extend(records.iter().map(|r| r.id));

            if let Some(line) = usage_line(&rule, &records, base_price)? {
                line_items.push(line);
            }
        }

        let mut proration_ids = Vec::new();
        for change in self.store.unbilled_prorations(&sub.id)? {
            line_items.push(InvoiceLineItem::new(
                format!("Upgrade proration ({})", change.effective_at.format("%Y-%m-%d")),
                ItemType::Proration,
                Decimal::ONE,
                change.proration_amount,
            ));
            proration_ids.push(change.id);
        }

        let subtotal = money_sum(line_items.iter().map(|l| l.amount))?;

        let (discount, discount_code) = match discount_code {
            Some(code) => {
                let code = self.discounts.redeemable(&code, now)?;
                (code.discount_for(subtotal)?, Some(code.code))
            }
            None => (Decimal::ZERO, None),
        };

        let taxable = money_sub(subtotal, discount)?;
        let tax = round_money(money_mul(taxable, self.config.tax_rate)?);
        let total = money_add(taxable, tax)?;

        let invoice = Invoice {
            id: self.ids.next_id(),
            number: String::new(),
            subscription_id: sub.id,
            tenant_id: sub.tenant_id,
            plan_id: plan.id,
            period_start,
            period_end,
            status: InvoiceStatus::Draft,
            line_items,
            subtotal,
            discount,
            discount_code: discount_code.clone(),
            tax_rate: self.config.tax_rate,
            tax,
            total,
            currency: self.config.currency.clone(),
            due_date: now + Duration::days(i64::from(self.config.invoice_due_days)),
            created_at: now,
            sent_at: None,
            paid_at: None,
            cancelled_at: None,
            usage_record_ids: usage_ids.into_iter().collect(),
            proration_change_ids: proration_ids,
        };

        let invoice = self.store.commit_invoice(InvoiceCommit { invoice, discount_code })?;
        tracing::info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.number,
            subscription_id = %invoice.subscription_id,
            lines = invoice.line_items.len(),
            total = %invoice.total,
            "invoice generated"
        );
        Ok(invoice)
    }

    /// Draft -> Sent; billed usage becomes Invoiced
    pub fn finalize(&self, id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.store.finalize_invoice(&id, self.clock.now())?;
        tracing::info!(invoice_id = %id, invoice_number = %invoice.number, "invoice finalized");
        Ok(invoice)
    }

    /// Record payment
    pub fn mark_paid(&self, id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.store.update_invoice_status(
            &id,
            &[InvoiceStatus::Sent, InvoiceStatus::Overdue],
            InvoiceStatus::Paid,
            self.clock.now(),
        )?;
        tracing::info!(invoice_id = %id, total = %invoice.total, "invoice paid");
        Ok(invoice)
    }

    /// Move every Sent invoice past its due date to Overdue
    pub fn mark_overdue(&self, now: DateTime<Utc>) -> BillingResult<Vec<Invoice>> {
        let mut overdue = Vec::new();
        for invoice in self.store.invoices_with_status(InvoiceStatus::Sent)? {
            if invoice.due_date >= now {
                continue;
            }
            match self.store.update_invoice_status(&invoice.id, &[InvoiceStatus::Sent], InvoiceStatus::Overdue, now) {
                Ok(updated) => {
                    tracing::warn!(invoice_id = %updated.id, due_date = %updated.due_date, "invoice overdue");
                    overdue.push(updated);
                }
                // paid or cancelled in the meantime
                Err(hms_common::StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(overdue)
    }

    /// Cancel; frees the period, its usage and its prorations for regeneration
    pub fn cancel(&self, id: Uuid) -> BillingResult<Invoice> {
        let invoice = self.store.update_invoice_status(
            &id,
            &[InvoiceStatus::Draft, InvoiceStatus::Sent, InvoiceStatus::Overdue],
            InvoiceStatus::Cancelled,
            self.clock.now(),
        )?;
        tracing::info!(invoice_id = %id, "invoice cancelled");
        Ok(invoice)
    }

    pub fn get(&self, id: Uuid) -> BillingResult<Invoice> {
        self.store.get_invoice(&id)?
            .ok_or_else(|| BillingError::not_found("invoice", id))
    }

    pub fn for_subscription(&self, subscription_id: Uuid) -> BillingResult<Vec<Invoice>> {
        Ok(self.store.invoices_for_subscription(&subscription_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discounts::{DiscountCode, DiscountType};
    use crate::metering::{BillingStatus, UsageQuery};
    use crate::pricing::PricingTier;
    use crate::testing::Fixture;
    use rust_decimal_macros::dec;

    fn lab_tiers(fx: &Fixture) -> PricingRule {
        let rule = PricingRule::new(
            fx.basic.id,
            "Lab orders",
            RuleConfig::Tiered {
                tiers: vec![
                    PricingTier::new(dec!(0), Some(dec!(10)), dec!(1.00)),
                    PricingTier::new(dec!(10), None, dec!(0.50)),
                ],
            },
        )
        .metering("lab-order");
        fx.catalog.save_pricing_rule(rule).unwrap()
    }

    fn welcome(fx: &Fixture, limit: u32) -> DiscountCode {
        fx.catalog
            .save_discount_code(DiscountCode {
                code: "welcome".into(),
                description: "First month".into(),
                discount_type: DiscountType::Percentage,
                value: dec!(10),
                valid_from: fx.start,
                valid_until: None,
                usage_limit: Some(limit),
                usage_count: 0,
                active: true,
            })
            .unwrap()
    }

    #[test]
    fn test_tiered_invoice_example() {
        let fx = Fixture::new();
        let rule = lab_tiers(&fx);
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "lab-order", dec!(15));

        let invoice = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap();

        assert_eq!(invoice.number, "INV-000001");
        assert_eq!(invoice.line_items.len(), 2);
        let usage = &invoice.line_items[1];
        assert_eq!(usage.amount, dec!(12.50));
        assert_eq!(usage.rule_id, Some(rule.id));
        assert_eq!(usage.metered_units, Some(dec!(15)));
        assert_eq!(invoice.subtotal, dec!(112.50));
        assert_eq!(invoice.total, dec!(112.50));
        for line in &invoice.line_items {
            assert_eq!(line.amount, round_money(line.quantity * line.unit_price));
        }
    }

    #[test]
    fn test_duplicate_generation_conflicts() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let request = GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end);

        fx.invoices.generate(request.clone()).unwrap();
        let err = fx.invoices.generate(request).unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        assert_eq!(fx.invoices.for_subscription(sub.id).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_generation_leaves_one_invoice() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let request = GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end);

        let results: Vec<BillingResult<Invoice>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| fx.invoices.generate(request.clone()))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(e, BillingError::Conflict(_))));
        assert_eq!(fx.invoices.for_subscription(sub.id).unwrap().len(), 1);
    }

    #[test]
    fn test_usage_status_progression() {
        let fx = Fixture::new();
        lab_tiers(&fx);
        let sub = fx.subscribe(fx.basic.id);
        let recorded = fx.record(sub.id, "lab-order", dec!(3)).record;

        let invoice = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap();
        assert_eq!(invoice.usage_record_ids, vec![recorded.id]);
        let billed = fx.store.usage_records(&sub.id, &UsageQuery::default()).unwrap();
        assert_eq!(billed[0].billing_status, BillingStatus::Billed);
        assert_eq!(billed[0].invoice_id, Some(invoice.id));

        let sent = fx.invoices.finalize(invoice.id).unwrap();
        assert_eq!(sent.status, InvoiceStatus::Sent);
        let invoiced = fx.store.usage_records(&sub.id, &UsageQuery::default()).unwrap();
        assert_eq!(invoiced[0].billing_status, BillingStatus::Invoiced);

        assert!(matches!(fx.invoices.finalize(invoice.id), Err(BillingError::Conflict(_))));
    }

    #[test]
    fn test_cancelled_invoice_frees_period_and_usage() {
        let fx = Fixture::new();
        lab_tiers(&fx);
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "lab-order", dec!(4));
        let request = GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end);

        let first = fx.invoices.generate(request.clone()).unwrap();
        fx.invoices.cancel(first.id).unwrap();

        let second = fx.invoices.generate(request).unwrap();
        assert_eq!(second.number, "INV-000002");
        assert_eq!(second.usage_record_ids, first.usage_record_ids);
        assert_eq!(second.total, first.total);
    }

    #[test]
    fn test_discount_applied_and_counted() {
        let fx = Fixture::new();
        welcome(&fx, 1);
        let sub = fx.subscribe(fx.basic.id);

        let invoice = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end).with_discount("Welcome"))
            .unwrap();
        assert_eq!(invoice.discount, dec!(10.00));
        assert_eq!(invoice.total, dec!(90.00));
        assert_eq!(invoice.discount_code.as_deref(), Some("WELCOME"));

        // single use
        let next_start = sub.current_period_end;
        let err = fx.invoices
            .generate(GenerateInvoice::new(sub.id, next_start, next_start + Duration::days(30)).with_discount("WELCOME"))
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_unknown_discount_leaves_nothing_behind() {
        let fx = Fixture::new();
        lab_tiers(&fx);
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "lab-order", dec!(2));

        let err = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end).with_discount("NOPE"))
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(fx.invoices.for_subscription(sub.id).unwrap().is_empty());
        let records = fx.store.usage_records(&sub.id, &UsageQuery::default()).unwrap();
        assert_eq!(records[0].billing_status, BillingStatus::Unbilled);
    }

    #[test]
    fn test_upgrade_proration_billed_once() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        fx.clock.advance(Duration::days(20));
        fx.subscriptions.upgrade(fx.change(sub.id, fx.premium.id)).unwrap();

        let first = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap();
        let proration: Vec<_> = first.line_items.iter().filter(|l| l.item_type == ItemType::Proration).collect();
        assert_eq!(proration.len(), 1);
        assert_eq!(proration[0].amount, dec!(33.33));
        // the cycle is billed at the plan it started on; the upgrade is the proration
        assert_eq!(first.plan_id, fx.basic.id);
        assert_eq!(first.line_items[0].amount, dec!(100));
        assert_eq!(first.subtotal, dec!(133.33));

        let next_start = sub.current_period_end;
        let second = fx.invoices
            .generate(GenerateInvoice::new(sub.id, next_start, next_start + Duration::days(31)))
            .unwrap();
        assert!(second.line_items.iter().all(|l| l.item_type != ItemType::Proration));
        assert_eq!(second.plan_id, fx.premium.id);
        assert_eq!(second.subtotal, dec!(200));
    }

    #[test]
    fn test_upgrade_cycle_invoiced_after_renewal() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        fx.clock.advance(Duration::days(20));
        fx.subscriptions.upgrade(fx.change(sub.id, fx.premium.id)).unwrap();
        fx.clock.set(sub.current_period_end);
        let renewed = fx.subscriptions.renew(sub.id).unwrap();
        assert_eq!(renewed.cycle_plan_id, fx.premium.id);

        // the upgraded cycle never costs more than basic + proration
        let late = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap();
        assert_eq!(late.plan_id, fx.basic.id);
        assert_eq!(late.subtotal, dec!(133.33));

        let current = fx.invoices
            .generate(GenerateInvoice::new(sub.id, renewed.current_period_start, renewed.current_period_end))
            .unwrap();
        assert_eq!(current.subtotal, dec!(200));
    }

    #[test]
    fn test_overflowing_usage_fails_generation() {
        let fx = Fixture::new();
        let rule = PricingRule::new(fx.basic.id, "Radiology", RuleConfig::PerUnit { unit_price: dec!(2) })
            .metering("radiology-study");
        fx.catalog.save_pricing_rule(rule).unwrap();
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "radiology-study", Decimal::MAX);

        let err = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(fx.invoices.for_subscription(sub.id).unwrap().is_empty());
    }

    #[test]
    fn test_tax_on_discounted_subtotal() {
        let fx = Fixture::with_config(BillingConfig { tax_rate: dec!(0.0875), ..Default::default() });
        welcome(&fx, 5);
        let sub = fx.subscribe(fx.basic.id);

        let invoice = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end).with_discount("WELCOME"))
            .unwrap();
        // (100 - 10) * 0.0875 = 7.875
        assert_eq!(invoice.tax, dec!(7.88));
        assert_eq!(invoice.total, dec!(97.88));
    }

    #[test]
    fn test_payment_transitions() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let invoice = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap();

        assert!(matches!(fx.invoices.mark_paid(invoice.id), Err(BillingError::Conflict(_))));
        fx.invoices.finalize(invoice.id).unwrap();

        let overdue = fx.invoices.mark_overdue(invoice.due_date + Duration::days(1)).unwrap();
        assert_eq!(overdue.len(), 1);
        let paid = fx.invoices.mark_paid(invoice.id).unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert!(paid.paid_at.is_some());
        assert!(matches!(fx.invoices.cancel(invoice.id), Err(BillingError::Conflict(_))));
    }

    #[test]
    fn test_missing_subscription() {
        let fx = Fixture::new();
        let err = fx.invoices
            .generate(GenerateInvoice::new(Uuid::new_v4(), fx.start, fx.start + Duration::days(30)))
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[test]
    fn test_per_unit_line_keeps_quantity() {
        let fx = Fixture::new();
        let rule = PricingRule::new(fx.basic.id, "Radiology", RuleConfig::PerUnit { unit_price: dec!(2.25) })
            .metering("radiology-study");
        fx.catalog.save_pricing_rule(rule).unwrap();
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "radiology-study", dec!(3));

        let invoice = fx.invoices
            .generate(GenerateInvoice::new(sub.id, sub.current_period_start, sub.current_period_end))
            .unwrap();
        let line = &invoice.line_items[1];
        assert_eq!(line.quantity, dec!(3));
        assert_eq!(line.unit_price, dec!(2.25));
        assert_eq!(line.amount, dec!(6.75));
    }
}
