//! Persistence port
//!
//! [`BillingStore`] is the one port the engine persists through. Besides
//! plain get/save it exposes the atomic primitives the engine's invariants
//! rest on: exclusive subscription insert, versioned subscription update,
//! usage append with alert raise, invoice commit and invoice finalization.
//! Each of them must run as one unit in any implementation.
//!
//! [`InMemoryBillingStore`] keeps everything behind a single `RwLock` and can
//! be snapshotted to JSON.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use hms_common::{StoreError, StoreResult};

use crate::catalog::{BillableEntity, SubscriptionPlan, Tenant};
use crate::discounts::DiscountCode;
use crate::invoicing::{Invoice, InvoiceCommit, InvoiceStatus};
use crate::metering::{BillingStatus, UsageAlert, UsageAppend, UsageQuery, UsageRecord};
use crate::pricing::PricingRule;
use crate::subscriptions::{ChangeKind, Subscription, SubscriptionChangeRecord, SubscriptionStatus};

/// Builds the cancelled version of a superseded subscription plus its log entry
pub type SupersedeFn<'a> = &'a dyn Fn(&Subscription) -> (Subscription, SubscriptionChangeRecord);

/// Alerts to raise for a new period aggregate
pub type RaiseFn<'a> = &'a dyn Fn(Decimal) -> Vec<UsageAlert>;

/// Billing persistence port
pub trait BillingStore: Send + Sync {
    // catalog

    fn save_tenant(&self, tenant: Tenant) -> StoreResult<()>;
    fn get_tenant(&self, id: &Uuid) -> StoreResult<Option<Tenant>>;
    fn save_plan(&self, plan: SubscriptionPlan) -> StoreResult<()>;
    fn get_plan(&self, id: &Uuid) -> StoreResult<Option<SubscriptionPlan>>;
    /// Referenced by a live subscription
    fn plan_in_use(&self, id: &Uuid) -> StoreResult<bool>;
    fn save_entity(&self, entity: BillableEntity) -> StoreResult<()>;
    fn get_entity(&self, id: &str) -> StoreResult<Option<BillableEntity>>;
    fn save_rule(&self, rule: PricingRule) -> StoreResult<()>;
    /// Active rules of a plan by display order
    fn rules_for_plan(&self, plan_id: &Uuid) -> StoreResult<Vec<PricingRule>>;
    fn save_discount(&self, code: DiscountCode) -> StoreResult<()>;
    fn get_discount(&self, code: &str) -> StoreResult<Option<DiscountCode>>;

    // subscriptions

    fn get_subscription(&self, id: &Uuid) -> StoreResult<Option<Subscription>>;
    fn live_subscription(&self, tenant_id: &Uuid) -> StoreResult<Option<Subscription>>;
    /// Live subscriptions whose period ended at or before `now`
    fn subscriptions_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>>;
    fn subscriptions_with_status(&self, status: SubscriptionStatus) -> StoreResult<Vec<Subscription>>;

    /// Insert `subscription`, cancelling every live subscription of the same
    /// tenant through `supersede`, in one unit. Returns the superseded ones.
    fn insert_subscription_exclusive(
        &self,
        subscription: Subscription,
        created: SubscriptionChangeRecord,
        supersede: SupersedeFn<'_>,
    ) -> StoreResult<Vec<Subscription>>;

    /// Replace a subscription if its stored version is `expected_version`,
    /// appending `changes` in the same unit. Stale version -> `Conflict`.
    fn update_subscription(
        &self,
        next: Subscription,
        expected_version: u64,
        changes: Vec<SubscriptionChangeRecord>,
    ) -> StoreResult<Subscription>;

    fn change_records(&self, subscription_id: &Uuid) -> StoreResult<Vec<SubscriptionChangeRecord>>;
    /// Positive upgrade prorations not yet on an open invoice
    fn unbilled_prorations(&self, subscription_id: &Uuid) -> StoreResult<Vec<SubscriptionChangeRecord>>;

    // usage

    /// Append a record, bump its period aggregate and insert the alerts
    /// `raise` returns for the new total, skipping kinds that already have
    /// an unresolved alert. A repeated idempotency key writes nothing.
    ///
    /// The subscription must still be live when the record lands, and the
    /// record is stamped with the period current at that moment. An
    /// aggregate that would overflow is `Invalid`.
    fn append_usage(&self, record: UsageRecord, raise: RaiseFn<'_>) -> StoreResult<UsageAppend>;
    fn usage_records(&self, subscription_id: &Uuid, query: &UsageQuery) -> StoreResult<Vec<UsageRecord>>;
    /// Records in `[start, end)` an invoice may still bill
    fn billable_usage(
        &self,
        subscription_id: &Uuid,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageRecord>>;
    /// `NotFound` when absent or already resolved
    fn resolve_alert(&self, id: &Uuid, at: DateTime<Utc>) -> StoreResult<UsageAlert>;
    fn unresolved_alerts(&self, subscription_id: &Uuid) -> StoreResult<Vec<UsageAlert>>;

    // invoices

    fn open_invoice_for_period(
        &self,
        subscription_id: &Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Option<Invoice>>;
    /// Insert the invoice with the next number, bill its usage, link its
    /// prorations and redeem its discount code, in one unit.
    fn commit_invoice(&self, commit: InvoiceCommit) -> StoreResult<Invoice>;
    /// Draft -> Sent, billed usage -> Invoiced
    fn finalize_invoice(&self, id: &Uuid, at: DateTime<Utc>) -> StoreResult<Invoice>;
    fn update_invoice_status(
        &self,
        id: &Uuid,
        expected: &[InvoiceStatus],
        next: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Invoice>;
    fn get_invoice(&self, id: &Uuid) -> StoreResult<Option<Invoice>>;
    fn invoices_for_subscription(&self, subscription_id: &Uuid) -> StoreResult<Vec<Invoice>>;
    fn invoices_with_status(&self, status: InvoiceStatus) -> StoreResult<Vec<Invoice>>;
}

/// Serializable image of a store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub tenants: Vec<Tenant>,
    pub plans: Vec<SubscriptionPlan>,
    pub entities: Vec<BillableEntity>,
    pub rules: Vec<PricingRule>,
    pub discount_codes: Vec<DiscountCode>,
    pub subscriptions: Vec<Subscription>,
    pub change_records: Vec<SubscriptionChangeRecord>,
    pub usage: Vec<UsageRecord>,
    pub alerts: Vec<UsageAlert>,
    pub invoices: Vec<Invoice>,
    pub invoice_sequence: u64,
}

type AggregateKey = (Uuid, String, DateTime<Utc>);

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    plans: HashMap<Uuid, SubscriptionPlan>,
    entities: HashMap<String, BillableEntity>,
    rules: HashMap<Uuid, PricingRule>,
    discounts: HashMap<String, DiscountCode>,
    subscriptions: HashMap<Uuid, Subscription>,
    changes: Vec<SubscriptionChangeRecord>,
    usage: Vec<UsageRecord>,
    usage_index: HashMap<Uuid, usize>,
    aggregates: HashMap<AggregateKey, Decimal>,
    idempotency: HashMap<(Uuid, String), Uuid>,
    alerts: HashMap<Uuid, UsageAlert>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_sequence: u64,
}

impl State {
    fn push_usage(&mut self, record: UsageRecord) -> StoreResult<Decimal> {
        let key = (record.subscription_id, record.entity_id.clone(), record.period_start);
        let current = self.aggregates.get(&key).copied().unwrap_or(Decimal::ZERO);
        let total = current.checked_add(record.units).ok_or_else(|| {
            StoreError::Invalid(format!(
                "usage total for {} on subscription {} is out of range", record.entity_id, record.subscription_id
            ))
        })?;
        self.aggregates.insert(key, total);
        if let Some(k) = &record.idempotency_key {
            self.idempotency.insert((record.subscription_id, k.clone()), record.id);
        }
        self.usage_index.insert(record.id, self.usage.len());
        self.usage.push(record);
        Ok(total)
    }

    fn usage_mut(&mut self, id: &Uuid) -> Option<&mut UsageRecord> {
        let idx = *self.usage_index.get(id)?;
        self.usage.get_mut(idx)
    }

    fn has_unresolved(&self, alert: &UsageAlert) -> bool {
        self.alerts.values().any(|a| {
            !a.resolved
                && a.subscription_id == alert.subscription_id
                && a.entity_id == alert.entity_id
                && a.kind == alert.kind
        })
    }

    /// Billed, but only by invoices that have since been cancelled
    fn is_billable(&self, record: &UsageRecord) -> bool {
        match record.billing_status {
            BillingStatus::Unbilled => true,
            BillingStatus::Billed => record
                .invoice_id
                .and_then(|id| self.invoices.get(&id))
                .map_or(true, |inv| !inv.is_open()),
            BillingStatus::Invoiced => false,
        }
    }

    fn proration_linked(&self, change_id: &Uuid) -> bool {
        self.invoices
            .values()
            .any(|inv| inv.is_open() && inv.proration_change_ids.contains(change_id))
    }

    /// Any open invoice whose period shares time with `[start, end)`
    fn open_invoice(&self, subscription_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<&Invoice> {
        self.invoices
            .values()
            .find(|inv| inv.is_open() && inv.overlaps(subscription_id, start, end))
    }
}

/// In-memory store
pub struct InMemoryBillingStore {
    state: RwLock<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self { state: RwLock::new(State::default()) }
    }

    /// Rebuild a store, including its aggregates and indexes
    pub fn from_snapshot(snapshot: StoreSnapshot) -> StoreResult<Self> {
        let mut state = State {
            tenants: snapshot.tenants.into_iter().map(|t| (t.id, t)).collect(),
            plans: snapshot.plans.into_iter().map(|p| (p.id, p)).collect(),
            entities: snapshot.entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
            rules: snapshot.rules.into_iter().map(|r| (r.id, r)).collect(),
            discounts: snapshot.discount_codes.into_iter().map(|d| (d.code.clone(), d)).collect(),
            subscriptions: snapshot.subscriptions.into_iter().map(|s| (s.id, s)).collect(),
            changes: snapshot.change_records,
            alerts: snapshot.alerts.into_iter().map(|a| (a.id, a)).collect(),
            invoices: snapshot.invoices.into_iter().map(|i| (i.id, i)).collect(),
            invoice_sequence: snapshot.invoice_sequence,
            ..State::default()
        };
        for record in snapshot.usage {
            state.push_usage(record)?;
        }
        Ok(Self { state: RwLock::new(state) })
    }

    /// Copy of the current state, in a stable order
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();

        let mut tenants: Vec<_> = state.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        let mut plans: Vec<_> = state.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.tier_rank.cmp(&b.tier_rank).then(a.id.cmp(&b.id)));
        let mut entities: Vec<_> = state.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        let mut rules: Vec<_> = state.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.id.cmp(&b.id)));
        let mut discount_codes: Vec<_> = state.discounts.values().cloned().collect();
        discount_codes.sort_by(|a, b| a.code.cmp(&b.code));
        let mut subscriptions: Vec<_> = state.subscriptions.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut alerts: Vec<_> = state.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then(a.id.cmp(&b.id)));
        let mut invoices: Vec<_> = state.invoices.values().cloned().collect();
        invoices.sort_by(|a, b| a.number.cmp(&b.number));

        StoreSnapshot {
            tenants,
            plans,
            entities,
            rules,
            discount_codes,
            subscriptions,
            change_records: state.changes.clone(),
            usage: state.usage.clone(),
            alerts,
            invoices,
            invoice_sequence: state.invoice_sequence,
        }
    }
}

impl Default for InMemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_created(mut subs: Vec<Subscription>) -> Vec<Subscription> {
    subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    subs
}

impl BillingStore for InMemoryBillingStore {
    fn save_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        self.state.write().tenants.insert(tenant.id, tenant);
        Ok(())
    }

    fn get_tenant(&self, id: &Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.state.read().tenants.get(id).cloned())
    }

    fn save_plan(&self, plan: SubscriptionPlan) -> StoreResult<()> {
        self.state.write().plans.insert(plan.id, plan);
        Ok(())
    }

    fn get_plan(&self, id: &Uuid) -> StoreResult<Option<SubscriptionPlan>> {
        Ok(self.state.read().plans.get(id).cloned())
    }

    fn plan_in_use(&self, id: &Uuid) -> StoreResult<bool> {
        Ok(self.state.read().subscriptions.values().any(|s| s.status.is_live() && s.plan_id == *id))
    }

    fn save_entity(&self, entity: BillableEntity) -> StoreResult<()> {
        self.state.write().entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    fn get_entity(&self, id: &str) -> StoreResult<Option<BillableEntity>> {
        Ok(self.state.read().entities.get(id).cloned())
    }

    fn save_rule(&self, rule: PricingRule) -> StoreResult<()> {
        self.state.write().rules.insert(rule.id, rule);
        Ok(())
    }

    fn rules_for_plan(&self, plan_id: &Uuid) -> StoreResult<Vec<PricingRule>> {
        let mut rules: Vec<_> = self.state.read()
            .rules
            .values()
            .filter(|r| r.active && r.plan_id == Some(*plan_id))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    fn save_discount(&self, code: DiscountCode) -> StoreResult<()> {
        self.state.write().discounts.insert(code.code.clone(), code);
        Ok(())
    }

    fn get_discount(&self, code: &str) -> StoreResult<Option<DiscountCode>> {
        Ok(self.state.read().discounts.get(code).cloned())
    }

    fn get_subscription(&self, id: &Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self.state.read().subscriptions.get(id).cloned())
    }

    fn live_subscription(&self, tenant_id: &Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self.state.read()
            .subscriptions
            .values()
            .find(|s| s.tenant_id == *tenant_id && s.status.is_live())
            .cloned())
    }

    fn subscriptions_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let due = self.state.read()
            .subscriptions
            .values()
            .filter(|s| s.status.is_live() && s.current_period_end <= now)
            .cloned()
            .collect();
        Ok(sorted_by_created(due))
    }

    fn subscriptions_with_status(&self, status: SubscriptionStatus) -> StoreResult<Vec<Subscription>> {
        let matching = self.state.read()
            .subscriptions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        Ok(sorted_by_created(matching))
    }

    fn insert_subscription_exclusive(
        &self,
        subscription: Subscription,
        created: SubscriptionChangeRecord,
        supersede: SupersedeFn<'_>,
    ) -> StoreResult<Vec<Subscription>> {
        let mut state = self.state.write();
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::Conflict(format!("subscription {} already exists", subscription.id)));
        }

        let live: Vec<Subscription> = state.subscriptions
            .values()
            .filter(|s| s.tenant_id == subscription.tenant_id && s.status.is_live())
            .cloned()
            .collect();

        let mut superseded = Vec::with_capacity(live.len());
        for old in live {
            let (mut next, record) = supersede(&old);
            next.version = old.version + 1;
            state.subscriptions.insert(next.id, next.clone());
            state.changes.push(record);
            superseded.push(next);
        }

        state.subscriptions.insert(subscription.id, subscription);
        state.changes.push(created);
        Ok(sorted_by_created(superseded))
    }

    fn update_subscription(
        &self,
        mut next: Subscription,
        expected_version: u64,
        changes: Vec<SubscriptionChangeRecord>,
    ) -> StoreResult<Subscription> {
        let mut state = self.state.write();
        let current = state.subscriptions
            .get(&next.id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", next.id)))?;

        if current.version != expected_version {
            return Err(StoreError::Conflict(format!(
                "subscription {} was modified concurrently (version {}, expected {})",
                next.id, current.version, expected_version
            )));
        }
        if current.status != next.status && !current.status.can_transition_to(next.status) {
            return Err(StoreError::Conflict(format!(
                "subscription {} cannot move from {} to {}", next.id, current.status, next.status
            )));
        }
        if next.status.is_live() && !current.status.is_live() {
            let tenant_live = state.subscriptions
                .values()
                .any(|s| s.id != next.id && s.tenant_id == next.tenant_id && s.status.is_live());
            if tenant_live {
                return Err(StoreError::Conflict(format!(
                    "tenant {} already has a live subscription", next.tenant_id
                )));
            }
        }

        next.version = expected_version + 1;
        state.subscriptions.insert(next.id, next.clone());
        state.changes.extend(changes);
        Ok(next)
    }

    fn change_records(&self, subscription_id: &Uuid) -> StoreResult<Vec<SubscriptionChangeRecord>> {
        Ok(self.state.read()
            .changes
            .iter()
            .filter(|c| c.subscription_id == *subscription_id)
            .cloned()
            .collect())
    }

    fn unbilled_prorations(&self, subscription_id: &Uuid) -> StoreResult<Vec<SubscriptionChangeRecord>> {
        let state = self.state.read();
        Ok(state.changes
            .iter()
            .filter(|c| {
                c.subscription_id == *subscription_id
                    && c.kind == ChangeKind::Upgrade
                    && c.proration_amount > Decimal::ZERO
                    && !state.proration_linked(&c.id)
            })
            .cloned()
            .collect())
    }

    fn append_usage(&self, mut record: UsageRecord, raise: RaiseFn<'_>) -> StoreResult<UsageAppend> {
        let mut state = self.state.write();

        if let Some(key) = &record.idempotency_key {
            let seen = state.idempotency
                .get(&(record.subscription_id, key.clone()))
                .and_then(|id| state.usage_index.get(id))
                .and_then(|idx| state.usage.get(*idx))
                .cloned();
            if let Some(original) = seen {
                let period_total = state.aggregates
                    .get(&(original.subscription_id, original.entity_id.clone(), original.period_start))
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                return Ok(UsageAppend { record: original, period_total, raised: Vec::new(), duplicate: true });
            }
        }

        let sub = state.subscriptions
            .get(&record.subscription_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {}", record.subscription_id)))?;
        if !sub.status.is_live() {
            return Err(StoreError::Conflict(format!(
                "subscription {} is {}; usage not accepted", sub.id, sub.status
            )));
        }
        record.period_start = sub.current_period_start;

        let period_total = state.push_usage(record.clone())?;

        let mut raised = Vec::new();
        for alert in raise(period_total) {
            if state.has_unresolved(&alert) {
                continue;
            }
            state.alerts.insert(alert.id, alert.clone());
            raised.push(alert);
        }

        Ok(UsageAppend { record, period_total, raised, duplicate: false })
    }

    fn usage_records(&self, subscription_id: &Uuid, query: &UsageQuery) -> StoreResult<Vec<UsageRecord>> {
        Ok(self.state.read()
            .usage
            .iter()
            .filter(|r| r.subscription_id == *subscription_id && query.matches(r))
            .cloned()
            .collect())
    }

    fn billable_usage(
        &self,
        subscription_id: &Uuid,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageRecord>> {
        let state = self.state.read();
        Ok(state.usage
            .iter()
            .filter(|r| {
                r.subscription_id == *subscription_id
                    && r.entity_id == entity_id
                    && r.recorded_at >= start
                    && r.recorded_at < end
                    && state.is_billable(r)
            })
            .cloned()
            .collect())
    }

    fn resolve_alert(&self, id: &Uuid, at: DateTime<Utc>) -> StoreResult<UsageAlert> {
        let mut state = self.state.write();
        let alert = state.alerts
            .get_mut(id)
            .filter(|a| !a.resolved)
            .ok_or_else(|| StoreError::NotFound(format!("unresolved alert {}", id)))?;
        alert.resolved = true;
        alert.resolved_at = Some(at);
        Ok(alert.clone())
    }

    fn unresolved_alerts(&self, subscription_id: &Uuid) -> StoreResult<Vec<UsageAlert>> {
        let mut alerts: Vec<_> = self.state.read()
            .alerts
            .values()
            .filter(|a| a.subscription_id == *subscription_id && !a.resolved)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then(a.id.cmp(&b.id)));
        Ok(alerts)
    }

    fn open_invoice_for_period(
        &self,
        subscription_id: &Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Option<Invoice>> {
        Ok(self.state.read().open_invoice(*subscription_id, start, end).cloned())
    }

    fn commit_invoice(&self, commit: InvoiceCommit) -> StoreResult<Invoice> {
        let InvoiceCommit { mut invoice, discount_code } = commit;
        let mut state = self.state.write();

        // every check first; nothing below may fail once writing starts
        if state.open_invoice(invoice.subscription_id, invoice.period_start, invoice.period_end).is_some() {
            return Err(StoreError::Conflict(format!(
                "subscription {} already has an invoice for {} to {}",
                invoice.subscription_id, invoice.period_start, invoice.period_end
            )));
        }
        for id in &invoice.usage_record_ids {
            let record = state.usage_index
                .get(id)
                .and_then(|idx| state.usage.get(*idx))
                .ok_or_else(|| StoreError::NotFound(format!("usage record {}", id)))?;
            if !state.is_billable(record) {
                return Err(StoreError::Conflict(format!("usage record {} is already billed", id)));
            }
        }
        if let Some(change_id) = invoice.proration_change_ids.iter().find(|id| state.proration_linked(id)) {
            return Err(StoreError::Conflict(format!("proration {} is already invoiced", change_id)));
        }
        if let Some(code) = &discount_code {
            let discount = state.discounts
                .get(code)
                .ok_or_else(|| StoreError::Invalid(format!("unknown discount code {}", code)))?;
            if discount.remaining_uses() == Some(0) {
                return Err(StoreError::Invalid(format!("discount code {} is exhausted", code)));
            }
        }

        state.invoice_sequence += 1;
        invoice.number = format!("INV-{:06}", state.invoice_sequence);

        let invoice_id = invoice.id;
        for id in &invoice.usage_record_ids {
            if let Some(record) = state.usage_mut(id) {
                record.billing_status = BillingStatus::Billed;
                record.invoice_id = Some(invoice_id);
            }
        }
        if let Some(discount) = discount_code.as_ref().and_then(|c| state.discounts.get_mut(c)) {
            discount.usage_count += 1;
        }

        state.invoices.insert(invoice_id, invoice.clone());
        Ok(invoice)
    }

    fn finalize_invoice(&self, id: &Uuid, at: DateTime<Utc>) -> StoreResult<Invoice> {
        let mut state = self.state.write();
        let invoice = state.invoices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {}", id)))?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(StoreError::Conflict(format!(
                "invoice {} is {}, only drafts can be finalized", id, invoice.status.as_str()
            )));
        }
        invoice.status = InvoiceStatus::Sent;
        invoice.sent_at = Some(at);
        let invoice = invoice.clone();

        for usage_id in &invoice.usage_record_ids {
            if let Some(record) = state.usage_mut(usage_id) {
                if record.billing_status.can_advance_to(BillingStatus::Invoiced) {
                    record.billing_status = BillingStatus::Invoiced;
                }
            }
        }
        Ok(invoice)
    }

    fn update_invoice_status(
        &self,
        id: &Uuid,
        expected: &[InvoiceStatus],
        next: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Invoice> {
        let mut state = self.state.write();
        let invoice = state.invoices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("invoice {}", id)))?;
        if !expected.contains(&invoice.status) || !invoice.status.can_transition_to(next) {
            return Err(StoreError::Conflict(format!(
                "invoice {} cannot move from {} to {}", id, invoice.status.as_str(), next.as_str()
            )));
        }

        invoice.status = next;
        match next {
            InvoiceStatus::Paid => invoice.paid_at = Some(at),
            InvoiceStatus::Cancelled => invoice.cancelled_at = Some(at),
            InvoiceStatus::Sent => invoice.sent_at = Some(at),
            _ => {}
        }
        Ok(invoice.clone())
    }

    fn get_invoice(&self, id: &Uuid) -> StoreResult<Option<Invoice>> {
        Ok(self.state.read().invoices.get(id).cloned())
    }

    fn invoices_for_subscription(&self, subscription_id: &Uuid) -> StoreResult<Vec<Invoice>> {
        let mut invoices: Vec<_> = self.state.read()
            .invoices
            .values()
            .filter(|i| i.subscription_id == *subscription_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(invoices)
    }

    fn invoices_with_status(&self, status: InvoiceStatus) -> StoreResult<Vec<Invoice>> {
        let mut invoices: Vec<_> = self.state.read()
            .invoices
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoicing::GenerateInvoice;
    use crate::metering::RecordUsage;
    use crate::testing::Fixture;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stale_version_conflicts() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);

        let mut first = sub.clone();
        first.auto_renew = false;
        let saved = fx.store.update_subscription(first, sub.version, Vec::new()).unwrap();
        assert_eq!(saved.version, sub.version + 1);

        let err = fx.store.update_subscription(sub.clone(), sub.version, Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_cancelled_never_revives() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let cancelled = fx.subscriptions.cancel(sub.id, None).unwrap();

        let mut revived = cancelled.clone();
        revived.status = SubscriptionStatus::Active;
        let err = fx.store.update_subscription(revived, cancelled.version, Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_one_live_subscription_per_tenant() {
        let fx = Fixture::new();
        let first = fx.subscribe(fx.basic.id);
        let second = fx.subscribe(fx.premium.id);

        let live: Vec<_> = fx.store.snapshot()
            .subscriptions
            .into_iter()
            .filter(|s| s.tenant_id == fx.tenant.id && s.status.is_live())
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
        assert_eq!(fx.store.get_subscription(&first.id).unwrap().unwrap().status, SubscriptionStatus::Cancelled);
    }

    #[test]
    fn test_snapshot_restores_aggregates() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "lab-order", dec!(3));
        fx.record(sub.id, "lab-order", dec!(2));

        let json = serde_json::to_string(&fx.store.snapshot()).unwrap();
        let restored = InMemoryBillingStore::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.snapshot(), fx.store.snapshot());

        let record = UsageRecord {
            id: Uuid::new_v4(),
            ..fx.store.usage_records(&sub.id, &UsageQuery::default()).unwrap().remove(0)
        };
        let appended = restored.append_usage(record, &|_| Vec::new()).unwrap();
        assert_eq!(appended.period_total, dec!(8));
    }

    #[test]
    fn test_usage_overflow_leaves_aggregate_untouched() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let first = fx.record(sub.id, "radiology-study", Decimal::MAX);

        let err = fx.metering
            .record_usage(RecordUsage::new(sub.id, "radiology-study", Decimal::MAX))
            .unwrap_err();
        assert!(matches!(err, hms_common::BillingError::Validation(_)));
        assert_eq!(fx.store.usage_records(&sub.id, &UsageQuery::default()).unwrap().len(), 1);

        let record = UsageRecord { id: Uuid::new_v4(), units: dec!(1), ..first.record };
        let err = fx.store.append_usage(record, &|_| Vec::new()).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_usage_stamped_with_period_at_append() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let stale = fx.record(sub.id, "lab-order", dec!(1)).record;

        // renewed between the caller's read and the append
        fx.clock.set(sub.current_period_end);
        let renewed = fx.subscriptions.renew(sub.id).unwrap();
        let appended = fx.store
            .append_usage(UsageRecord { id: Uuid::new_v4(), idempotency_key: None, ..stale.clone() }, &|_| Vec::new())
            .unwrap();
        assert_eq!(appended.record.period_start, renewed.current_period_start);
        assert_eq!(appended.period_total, dec!(1));

        // cancelled between the caller's read and the append
        fx.subscriptions.cancel(sub.id, None).unwrap();
        let err = fx.store
            .append_usage(UsageRecord { id: Uuid::new_v4(), ..stale }, &|_| Vec::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_overlapping_invoice_period_conflicts() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let (start, end) = (sub.current_period_start, sub.current_period_end);
        fx.invoices.generate(GenerateInvoice::new(sub.id, start, end)).unwrap();

        for (s, e) in [
            (start, end + chrono::Duration::seconds(1)),
            (start + chrono::Duration::days(10), end + chrono::Duration::days(10)),
            (start - chrono::Duration::days(1), start + chrono::Duration::seconds(1)),
        ] {
            let err = fx.invoices.generate(GenerateInvoice::new(sub.id, s, e)).unwrap_err();
            assert!(matches!(err, hms_common::BillingError::Conflict(_)), "{} .. {}", s, e);
        }
        // adjacent periods do not overlap
        fx.invoices.generate(GenerateInvoice::new(sub.id, end, end + chrono::Duration::days(31))).unwrap();
        assert_eq!(fx.store.invoices_for_subscription(&sub.id).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_unresolved_alert_skipped() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let soft = fx.metering
            .record_usage(RecordUsage::new(sub.id, "lab-order", dec!(6)))
            .unwrap()
            .alerts
            .remove(0);

        let record = UsageRecord { id: Uuid::new_v4(), ..fx.store.usage_records(&sub.id, &UsageQuery::default()).unwrap().remove(0) };
        let again = fx.store.append_usage(record, &|_| vec![UsageAlert { id: Uuid::new_v4(), ..soft.clone() }]).unwrap();
        assert!(again.raised.is_empty());
        assert_eq!(fx.store.unresolved_alerts(&sub.id).unwrap().len(), 1);
    }
}
