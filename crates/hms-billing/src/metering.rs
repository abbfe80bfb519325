//! Metering Engine
//!
//! Appends usage records against a (subscription, billable entity) pair,
//! keeps per-period aggregates and raises soft/hard limit alerts. The
//! aggregate bump and the alert check happen inside one store call
//! ([`BillingStore::append_usage`]), so concurrent writers crossing the same
//! threshold raise one alert between them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use hms_common::{money_add, money_sum, BillingError, BillingResult, Clock, IdGenerator};

use crate::catalog::UsageLimit;
use crate::store::BillingStore;

/// Per-record billing status. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Unbilled,
    /// Included in a generated (draft) invoice
    Billed,
    /// Included in a finalized invoice
    Invoiced,
}

impl BillingStatus {
    pub fn can_advance_to(&self, next: BillingStatus) -> bool {
        next > *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbilled => "unbilled",
            Self::Billed => "billed",
            Self::Invoiced => "invoiced",
        }
    }
}

impl std::str::FromStr for BillingStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unbilled" => Ok(Self::Unbilled),
            "billed" => Ok(Self::Billed),
            "invoiced" => Ok(Self::Invoiced),
            other => Err(BillingError::Validation(format!("unknown billing status '{}'", other))),
        }
    }
}

/// Usage record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub entity_id: String,
    pub units: Decimal,
    pub complexity: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Start of the subscription cycle the record was metered in
    pub period_start: DateTime<Utc>,
    pub billing_status: BillingStatus,
    /// Invoice that billed this record
    pub invoice_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Alert kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Advisory
    SoftLimit,
    /// Blocking until resolved
    HardLimit,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoftLimit => "soft_limit",
            Self::HardLimit => "hard_limit",
        }
    }
}

/// Usage alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAlert {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub entity_id: String,
    pub kind: AlertKind,
    pub threshold: Decimal,
    /// Period aggregate when the alert was raised
    pub observed: Decimal,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Record usage request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordUsage {
    pub subscription_id: Uuid,
    pub entity_id: String,
    pub units: Decimal,
    pub complexity: Option<String>,
    /// Replays with the same key return the original record
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RecordUsage {
    pub fn new(subscription_id: Uuid, entity_id: &str, units: Decimal) -> Self {
        Self {
            subscription_id,
            entity_id: entity_id.into(),
            units,
            ..Default::default()
        }
    }

    pub fn with_complexity(mut self, label: &str) -> Self {
        self.complexity = Some(label.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// What the store did with an appended record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageAppend {
    pub record: UsageRecord,
    /// (subscription, entity, period) aggregate after the append
    pub period_total: Decimal,
    /// Alerts newly inserted by this append
    pub raised: Vec<UsageAlert>,
    /// Idempotency key seen before; nothing was written
    pub duplicate: bool,
}

/// Record usage result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageOutcome {
    pub record: UsageRecord,
    pub period_total: Decimal,
    pub alerts: Vec<UsageAlert>,
    pub duplicate: bool,
}

/// Usage record filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageQuery {
    pub entity_id: Option<String>,
    /// Inclusive
    pub start: Option<DateTime<Utc>>,
    /// Exclusive
    pub end: Option<DateTime<Utc>>,
    /// Empty = any status
    pub statuses: Vec<BillingStatus>,
}

impl UsageQuery {
    pub fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start: Some(start), end: Some(end), ..Default::default() }
    }

    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.entity_id.as_ref().map_or(true, |e| *e == record.entity_id)
            && self.start.map_or(true, |s| record.recorded_at >= s)
            && self.end.map_or(true, |e| record.recorded_at < e)
            && (self.statuses.is_empty() || self.statuses.contains(&record.billing_status))
    }
}

/// Units per entity in a summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityUsage {
    pub entity_id: String,
    pub units: Decimal,
    pub records: usize,
}

/// Usage summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub subscription_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub entities: Vec<EntityUsage>,
    pub total_units: Decimal,
}

impl UsageSummary {
    pub fn units_for(&self, entity_id: &str) -> Decimal {
        self.entities
            .iter()
            .find(|e| e.entity_id == entity_id)
            .map_or(Decimal::ZERO, |e| e.units)
    }
}

/// Alerts `limit` calls for at `total`
fn crossed(limit: &UsageLimit, total: Decimal) -> Vec<(AlertKind, Decimal)> {
    [(AlertKind::SoftLimit, limit.soft_limit), (AlertKind::HardLimit, limit.hard_limit)]
        .into_iter()
        .filter_map(|(kind, threshold)| threshold.filter(|t| total >= *t).map(|t| (kind, t)))
        .collect()
}

/// Metering engine
pub struct MeteringEngine {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MeteringEngine {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    /// Record usage
    pub fn record_usage(&self, request: RecordUsage) -> BillingResult<UsageOutcome> {
        if request.units <= Decimal::ZERO {
            return Err(BillingError::Validation(format!("units must be positive, got {}", request.units)));
        }

        let sub = self.store.get_subscription(&request.subscription_id)?
            .ok_or_else(|| BillingError::not_found("subscription", request.subscription_id))?;
        if self.store.get_entity(&request.entity_id)?.is_none() {
            return Err(BillingError::not_found("billable entity", &request.entity_id));
        }
        if !sub.status.is_live() {
            return Err(BillingError::Conflict(format!(
                "subscription {} is {}; usage not accepted", sub.id, sub.status
            )));
        }

        let plan = self.store.get_plan(&sub.plan_id)?
            .ok_or_else(|| BillingError::not_found("plan", sub.plan_id))?;
        let limit = plan.usage_limits.get(&request.entity_id).cloned().unwrap_or_default();

        let now = self.clock.now();
        let record = UsageRecord {
            id: self.ids.next_id(),
            subscription_id: sub.id,
            entity_id: request.entity_id,
            units: request.units,
            complexity: request.complexity,
            recorded_at: now,
            // restamped by the store under its lock
            period_start: sub.current_period_start,
            billing_status: BillingStatus::Unbilled,
            invoice_id: None,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata,
        };

        let raise = |total: Decimal| {
            crossed(&limit, total)
                .into_iter()
                .map(|(kind, threshold)| UsageAlert {
                    id: self.ids.next_id(),
                    subscription_id: record.subscription_id,
                    entity_id: record.entity_id.clone(),
                    kind,
                    threshold,
                    observed: total,
                    raised_at: now,
                    resolved: false,
                    resolved_at: None,
                })
                .collect::<Vec<_>>()
        };

        let appended = self.store.append_usage(record.clone(), &raise)?;
        if appended.duplicate {
            tracing::debug!(
                subscription_id = %appended.record.subscription_id,
                record_id = %appended.record.id,
                "duplicate usage ignored"
            );
        } else {
            tracing::debug!(
                subscription_id = %appended.record.subscription_id,
                entity_id = %appended.record.entity_id,
                units = %appended.record.units,
                period_total = %appended.period_total,
                "usage recorded"
            );
        }
        for alert in &appended.raised {
            tracing::warn!(
                subscription_id = %alert.subscription_id,
                entity_id = %alert.entity_id,
                kind = alert.kind.as_str(),
                threshold = %alert.threshold,
                observed = %alert.observed,
                "usage alert raised"
            );
        }

        Ok(UsageOutcome {
            record: appended.record,
            period_total: appended.period_total,
            alerts: appended.raised,
            duplicate: appended.duplicate,
        })
    }

    /// Resolve alert. Absent and already-resolved alerts are both `NotFound`.
    pub fn resolve_alert(&self, alert_id: Uuid) -> BillingResult<UsageAlert> {
        let alert = self.store.resolve_alert(&alert_id, self.clock.now())?;
        tracing::info!(alert_id = %alert_id, subscription_id = %alert.subscription_id, "usage alert resolved");
        Ok(alert)
    }

    /// Unresolved alerts of a subscription
    pub fn active_alerts(&self, subscription_id: Uuid) -> BillingResult<Vec<UsageAlert>> {
        Ok(self.store.unresolved_alerts(&subscription_id)?)
    }

    /// Whether an unresolved hard-limit alert blocks the entity
    pub fn is_blocked(&self, subscription_id: Uuid, entity_id: &str) -> BillingResult<bool> {
        Ok(self.active_alerts(subscription_id)?
            .iter()
            .any(|a| a.kind == AlertKind::HardLimit && a.entity_id == entity_id))
    }

    /// Units per entity recorded in `[start, end)`, restricted to `statuses`
    /// (empty = all)
    pub fn get_usage_summary(
        &self,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: &[BillingStatus],
    ) -> BillingResult<UsageSummary> {
        if end <= start {
            return Err(BillingError::Validation("summary window is empty".into()));
        }
        if self.store.get_subscription(&subscription_id)?.is_none() {
            return Err(BillingError::not_found("subscription", subscription_id));
        }

        let query = UsageQuery { statuses: statuses.to_vec(), ..UsageQuery::window(start, end) };
        let mut by_entity: BTreeMap<String, EntityUsage> = BTreeMap::new();
        for record in self.store.usage_records(&subscription_id, &query)? {
            let entry = by_entity.entry(record.entity_id.clone()).or_insert_with(|| EntityUsage {
                entity_id: record.entity_id.clone(),
                units: Decimal::ZERO,
                records: 0,
            });
            entry.units = money_add(entry.units, record.units)?;
            entry.records += 1;
        }

        let entities: Vec<EntityUsage> = by_entity.into_values().collect();
        let total_units = money_sum(entities.iter().map(|e| e.units))?;
        Ok(UsageSummary { subscription_id, start, end, entities, total_units })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BillingCycle, SubscriptionPlan};
    use crate::subscriptions::CreateSubscription;
    use crate::testing::Fixture;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_record_usage_validation() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);

        let err = fx.metering.record_usage(RecordUsage::new(sub.id, "lab-order", dec!(0))).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        let err = fx.metering.record_usage(RecordUsage::new(sub.id, "lab-order", dec!(-2))).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = fx.metering.record_usage(RecordUsage::new(Uuid::new_v4(), "lab-order", dec!(1))).unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        let err = fx.metering.record_usage(RecordUsage::new(sub.id, "telepathy", dec!(1))).unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[test]
    fn test_usage_rejected_after_cancel() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        fx.subscriptions.cancel(sub.id, None).unwrap();
        let err = fx.metering.record_usage(RecordUsage::new(sub.id, "lab-order", dec!(1))).unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[test]
    fn test_soft_then_hard_alerts_once_each() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);

        // basic: lab-order soft 5, hard 10
        let first = fx.record(sub.id, "lab-order", dec!(4));
        assert!(first.alerts.is_empty());

        let soft = fx.record(sub.id, "lab-order", dec!(1));
        assert_eq!(soft.alerts.len(), 1);
        assert_eq!(soft.alerts[0].kind, AlertKind::SoftLimit);
        assert_eq!(soft.alerts[0].observed, dec!(5));

        assert!(fx.record(sub.id, "lab-order", dec!(1)).alerts.is_empty());

        let hard = fx.record(sub.id, "lab-order", dec!(10));
        assert_eq!(hard.alerts.len(), 1);
        assert_eq!(hard.alerts[0].kind, AlertKind::HardLimit);
        assert!(fx.metering.is_blocked(sub.id, "lab-order").unwrap());
        assert!(!fx.metering.is_blocked(sub.id, "radiology-study").unwrap());
        assert_eq!(fx.metering.active_alerts(sub.id).unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_then_reraise() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let soft = fx.record(sub.id, "lab-order", dec!(6)).alerts.remove(0);

        let resolved = fx.metering.resolve_alert(soft.id).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_at, Some(fx.start));
        assert!(matches!(fx.metering.resolve_alert(soft.id), Err(BillingError::NotFound(_))));
        assert!(matches!(fx.metering.resolve_alert(Uuid::new_v4()), Err(BillingError::NotFound(_))));

        // aggregate untouched, so the next record is still over the soft limit
        let again = fx.record(sub.id, "lab-order", dec!(1));
        assert_eq!(again.period_total, dec!(7));
        assert_eq!(again.alerts.len(), 1);
        assert_ne!(again.alerts[0].id, soft.id);
    }

    #[test]
    fn test_aggregate_resets_on_new_period() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "lab-order", dec!(3));

        fx.clock.set(sub.current_period_end);
        fx.subscriptions.renew(sub.id).unwrap();
        let next = fx.record(sub.id, "lab-order", dec!(2));
        assert_eq!(next.period_total, dec!(2));
        assert_eq!(next.record.period_start, sub.current_period_end);
    }

    #[test]
    fn test_idempotency_key_replay() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        let request = RecordUsage::new(sub.id, "lab-order", dec!(2)).with_idempotency_key("evt-1");

        let first = fx.metering.record_usage(request.clone()).unwrap();
        let replay = fx.metering.record_usage(request).unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.record.id, first.record.id);
        assert_eq!(replay.period_total, dec!(2));
    }

    #[test]
    fn test_usage_summary_filters() {
        let fx = Fixture::new();
        let sub = fx.subscribe(fx.basic.id);
        fx.record(sub.id, "lab-order", dec!(2));
        fx.record(sub.id, "lab-order", dec!(1.5));
        fx.clock.advance(Duration::days(2));
        fx.record(sub.id, "radiology-study", dec!(4));

        let end = fx.start + Duration::days(30);
        let summary = fx.metering.get_usage_summary(sub.id, fx.start, end, &[]).unwrap();
        assert_eq!(summary.units_for("lab-order"), dec!(3.5));
        assert_eq!(summary.units_for("radiology-study"), dec!(4));
        assert_eq!(summary.total_units, dec!(7.5));
        assert_eq!(summary.entities[0].records, 2);

        let first_day = fx.metering
            .get_usage_summary(sub.id, fx.start, fx.start + Duration::days(1), &[])
            .unwrap();
        assert_eq!(first_day.total_units, dec!(3.5));

        let billed = fx.metering
            .get_usage_summary(sub.id, fx.start, end, &[BillingStatus::Billed])
            .unwrap();
        assert!(billed.entities.is_empty());

        assert!(matches!(
            fx.metering.get_usage_summary(sub.id, end, fx.start, &[]),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_raise_one_hard_alert() {
        const WRITERS: u32 = 16;

        let fx = Fixture::new();
        let mut plan = SubscriptionPlan { id: Uuid::new_v4(), name: "Metered".into(), ..fx.basic.clone() };
        plan.usage_limits.clear();
        plan.usage_limits.insert("lab-order".into(), UsageLimit {
            soft_limit: None,
            hard_limit: Some(Decimal::from(WRITERS - 1)),
        });
        fx.catalog.upsert_plan(plan.clone()).unwrap();
        let sub = fx.subscriptions
            .create(CreateSubscription::new(fx.tenant.id, plan.id, BillingCycle::Monthly, false))
            .unwrap();

        let outcomes: Vec<UsageOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..WRITERS)
                .map(|_| s.spawn(|| fx.metering.record_usage(RecordUsage::new(sub.id, "lab-order", dec!(1)))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
        });

        let raised: usize = outcomes.iter().map(|o| o.alerts.len()).sum();
        assert_eq!(raised, 1);
        let unresolved = fx.metering.active_alerts(sub.id).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].kind, AlertKind::HardLimit);
        assert!(outcomes.iter().any(|o| o.period_total == Decimal::from(WRITERS)));
    }

    #[test]
    fn test_billing_status_only_moves_forward() {
        assert!(BillingStatus::Unbilled.can_advance_to(BillingStatus::Billed));
        assert!(BillingStatus::Billed.can_advance_to(BillingStatus::Invoiced));
        assert!(!BillingStatus::Invoiced.can_advance_to(BillingStatus::Billed));
        assert!(!BillingStatus::Billed.can_advance_to(BillingStatus::Billed));
        assert_eq!("Invoiced".parse::<BillingStatus>().unwrap(), BillingStatus::Invoiced);
        assert!("paid".parse::<BillingStatus>().is_err());
    }
}
