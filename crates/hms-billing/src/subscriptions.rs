//! Subscription Management
//!
//! Owns the subscription state machine (see [`crate::lifecycle`]) and the
//! proration math. Every transition is written with an optimistic version
//! check, so two concurrent transitions on one subscription cannot both
//! apply: the loser gets `Conflict`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use hms_common::{
    money_add, money_div, money_mul, money_sub, non_negative_money, round_money, BillingError, BillingResult, Clock,
    IdGenerator,
};

use crate::catalog::{BillingCycle, CapacityLimits, SubscriptionPlan};
use crate::store::BillingStore;

pub use crate::lifecycle::SubscriptionStatus;

/// Renewals a single sweep may apply to one lagging subscription
const MAX_CATCH_UP_CYCLES: usize = 120;

/// Usage snapshot reported by the tenant's services
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub user_count: u32,
    pub entity_count: u32,
    pub storage_used_mb: u64,
}

/// Downgrade waiting for the next cycle boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPlanChange {
    pub plan_id: Uuid,
    pub effective_at: DateTime<Utc>,
    pub change_id: Uuid,
}

/// Subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    /// Plan in effect when the current cycle started
    pub cycle_plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub auto_renew: bool,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub usage: UsageSnapshot,
    pub next_billing_at: Option<DateTime<Utc>>,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub pending_change: Option<PendingPlanChange>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whole days in the current cycle
    pub fn cycle_days(&self) -> i64 {
        (self.current_period_end - self.current_period_start).num_days()
    }

    /// Whole days left in the current cycle at `now`, truncated, never negative
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.current_period_end - now).num_days().clamp(0, self.cycle_days().max(0))
    }
}

/// Kind of lifecycle change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Activated,
    Upgrade,
    Downgrade,
    DowngradeApplied,
    Renewed,
    Cancelled,
    Superseded,
    Expired,
    TrialEnded,
    AutoRenewChanged,
}

/// Append-only lifecycle log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChangeRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub kind: ChangeKind,
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub proration_amount: Decimal,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub effective_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Create subscription request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscription {
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: BillingCycle,
    pub is_trial: bool,
    pub auto_renew: bool,
}

impl CreateSubscription {
    pub fn new(tenant_id: Uuid, plan_id: Uuid, billing_cycle: BillingCycle, is_trial: bool) -> Self {
        Self { tenant_id, plan_id, billing_cycle, is_trial, auto_renew: true }
    }
}

/// Upgrade / downgrade request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChangeRequest {
    pub subscription_id: Uuid,
    pub new_plan_id: Uuid,
    pub reason: Option<String>,
    pub actor: Option<String>,
}

/// Result of an upgrade or downgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChange {
    pub subscription: Subscription,
    pub record: SubscriptionChangeRecord,
    /// Whether the plan id already changed
    pub applied: bool,
}

/// Pending vs applied downgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlanChangeState {
    None,
    Pending { plan_id: Uuid, effective_at: DateTime<Utc> },
    Applied { plan_id: Uuid, applied_at: DateTime<Utc> },
}

/// Outcome of a sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub renewed: Vec<Uuid>,
    pub expired: Vec<Uuid>,
    pub trials_ended: Vec<Uuid>,
    /// Lost a race with another transition; picked up by the next sweep
    pub skipped: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

impl SweepReport {
    pub fn touched(&self) -> usize {
        self.renewed.len() + self.expired.len() + self.trials_ended.len()
    }
}

/// Capacity limit exceeded by a usage snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityBreach {
    pub resource: String,
    pub limit: u64,
    pub observed: u64,
}

/// Capacity check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReport {
    pub subscription_id: Uuid,
    pub breaches: Vec<CapacityBreach>,
}

impl CapacityReport {
    pub fn within_limits(&self) -> bool {
        self.breaches.is_empty()
    }
}

fn capacity_breaches(limits: &CapacityLimits, usage: &UsageSnapshot) -> Vec<CapacityBreach> {
    let checks = [
        ("users", limits.max_users.map(u64::from), u64::from(usage.user_count)),
        ("entities", limits.max_entities.map(u64::from), u64::from(usage.entity_count)),
        ("storage_mb", limits.storage_quota_mb, usage.storage_used_mb),
    ];
    checks
        .into_iter()
        .filter_map(|(resource, limit, observed)| {
            limit.filter(|l| observed > *l).map(|limit| CapacityBreach {
                resource: resource.into(),
                limit,
                observed,
            })
        })
        .collect()
}

/// Proration for moving from `current` to `new` with `days_remaining` of
/// `total_days` left: `(new - current) * remaining / total`, rounded once.
pub fn prorate(current: Decimal, new: Decimal, days_remaining: i64, total_days: i64) -> BillingResult<Decimal> {
    if total_days <= 0 || days_remaining <= 0 {
        return Ok(Decimal::ZERO);
    }
    let delta = money_mul(money_sub(new, current)?, Decimal::from(days_remaining))?;
    Ok(round_money(money_div(delta, Decimal::from(total_days))?))
}

/// Subscription manager
pub struct SubscriptionManager {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    default_trial_days: u32,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        default_trial_days: u32,
    ) -> Self {
        Self { store, clock, ids, default_trial_days }
    }

    /// Get subscription
    pub fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.store.get_subscription(&id)?
            .ok_or_else(|| BillingError::not_found("subscription", id))
    }

    /// Live (Trial or Active) subscription of a tenant
    pub fn live_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.store.live_subscription(&tenant_id)?)
    }

    /// Change log of a subscription, oldest first
    pub fn history(&self, id: Uuid) -> BillingResult<Vec<SubscriptionChangeRecord>> {
        self.get(id)?;
        Ok(self.store.change_records(&id)?)
    }

    fn plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        self.store.get_plan(&plan_id)?
            .ok_or_else(|| BillingError::not_found("plan", plan_id))
    }

    fn active_plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        let plan = self.plan(plan_id)?;
        if !plan.active {
            return Err(BillingError::Validation(format!("plan {} is not active", plan_id)));
        }
        Ok(plan)
    }

    fn record(
        &self,
        sub: &Subscription,
        kind: ChangeKind,
        to_plan_id: Uuid,
        proration_amount: Decimal,
        reason: Option<String>,
        actor: Option<String>,
        effective_at: DateTime<Utc>,
    ) -> SubscriptionChangeRecord {
        SubscriptionChangeRecord {
            id: self.ids.next_id(),
            subscription_id: sub.id,
            kind,
            from_plan_id: sub.plan_id,
            to_plan_id,
            proration_amount,
            reason,
            actor,
            effective_at,
            recorded_at: self.clock.now(),
        }
    }

    /// Create subscription, superseding any live subscription of the tenant
    pub fn create(&self, request: CreateSubscription) -> BillingResult<Subscription> {
        if self.store.get_tenant(&request.tenant_id)?.is_none() {
            return Err(BillingError::not_found("tenant", request.tenant_id));
        }
        let plan = self.active_plan(request.plan_id)?;

        let now = self.clock.now();
        let (status, end, trial_start, trial_end, last_billed_at) = if request.is_trial {
            let days = plan.trial_days.unwrap_or(self.default_trial_days);
            if days == 0 {
                return Err(BillingError::Validation(format!("plan {} offers no trial", plan.id)));
            }
            let end = now + Duration::days(i64::from(days));
            (SubscriptionStatus::Trial, end, Some(now), Some(end), None)
        } else {
            (SubscriptionStatus::Active, request.billing_cycle.advance(now)?, None, None, Some(now))
        };

        let subscription = Subscription {
            id: self.ids.next_id(),
            tenant_id: request.tenant_id,
            plan_id: plan.id,
            cycle_plan_id: plan.id,
            status,
            billing_cycle: request.billing_cycle,
            auto_renew: request.auto_renew,
            current_period_start: now,
            current_period_end: end,
            trial_start,
            trial_end,
            usage: UsageSnapshot::default(),
            next_billing_at: Some(end),
            last_billed_at,
            pending_change: None,
            cancellation_reason: None,
            cancelled_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let created = self.record(&subscription, ChangeKind::Created, plan.id, Decimal::ZERO, None, None, now);
        let supersede = |old: &Subscription| {
            let mut next = old.clone();
            next.status = SubscriptionStatus::Cancelled;
            next.auto_renew = false;
            next.pending_change = None;
            next.cancellation_reason = Some(format!("superseded by {}", subscription.id));
            next.cancelled_at = Some(now);
            next.updated_at = now;
            let record = self.record(
                old,
                ChangeKind::Superseded,
                old.plan_id,
                Decimal::ZERO,
                next.cancellation_reason.clone(),
                None,
                now,
            );
            (next, record)
        };

        let superseded = self.store.insert_subscription_exclusive(subscription.clone(), created, &supersede)?;
        for old in &superseded {
            tracing::info!(subscription_id = %old.id, tenant_id = %old.tenant_id, "subscription superseded");
        }
        tracing::info!(
            subscription_id = %subscription.id,
            tenant_id = %subscription.tenant_id,
            plan_id = %subscription.plan_id,
            status = %subscription.status,
            "subscription created"
        );

        self.get(subscription.id)
    }

    /// Convert a trial into a paid subscription starting now
    pub fn activate(&self, id: Uuid, actor: Option<String>) -> BillingResult<Subscription> {
        let sub = self.get(id)?;
        if !matches!(sub.status, SubscriptionStatus::Trial | SubscriptionStatus::TrialEnded) {
            return Err(BillingError::Conflict(format!("subscription {} is {}, not a trial", id, sub.status)));
        }
        self.active_plan(sub.plan_id)?;

        let now = self.clock.now();
        let mut next = sub.clone();
        next.status = SubscriptionStatus::Active;
        next.current_period_start = now;
        next.current_period_end = sub.billing_cycle.advance(now)?;
        next.cycle_plan_id = sub.plan_id;
        next.last_billed_at = Some(now);
        next.next_billing_at = Some(next.current_period_end);
        next.updated_at = now;

        let record = self.record(&sub, ChangeKind::Activated, sub.plan_id, Decimal::ZERO, None, actor, now);
        let saved = self.store.update_subscription(next, sub.version, vec![record])?;
        tracing::info!(subscription_id = %id, "trial converted");
        Ok(saved)
    }

    fn require_active(&self, id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get(id)?;
        if sub.status != SubscriptionStatus::Active {
            return Err(BillingError::Conflict(format!(
                "subscription {} has no active plan to change ({})", id, sub.status
            )));
        }
        Ok(sub)
    }

    /// Upgrade: applied immediately, prorated over the days left in the cycle
    pub fn upgrade(&self, request: PlanChangeRequest) -> BillingResult<PlanChange> {
        let sub = self.require_active(request.subscription_id)?;
        let current = self.plan(sub.plan_id)?;
        let target = self.active_plan(request.new_plan_id)?;

        if target.tier_rank <= current.tier_rank {
            tracing::warn!(
                subscription_id = %sub.id,
                from_rank = current.tier_rank,
                to_rank = target.tier_rank,
                "upgrade rejected"
            );
            return Err(BillingError::Conflict(format!(
                "plan {} (rank {}) is not above plan {} (rank {})",
                target.id, target.tier_rank, current.id, current.tier_rank
            )));
        }

        let now = self.clock.now();
        let amount = non_negative_money(prorate(
            current.cycle_price(sub.billing_cycle),
            target.cycle_price(sub.billing_cycle),
            sub.days_remaining(now),
            sub.cycle_days(),
        )?);

        let mut next = sub.clone();
        next.plan_id = target.id;
        next.pending_change = None;
        next.updated_at = now;

        let record = self.record(&sub, ChangeKind::Upgrade, target.id, amount, request.reason, request.actor, now);
        let saved = self.store.update_subscription(next, sub.version, vec![record.clone()])?;
        tracing::info!(
            subscription_id = %sub.id,
            from_plan = %current.id,
            to_plan = %target.id,
            proration = %amount,
            "subscription upgraded"
        );

        Ok(PlanChange { subscription: saved, record, applied: true })
    }

    /// Downgrade: no refund; takes effect at the next renewal.
    ///
    /// Going back to the plan the current cycle started on (undoing an
    /// upgrade made within the cycle) applies at once.
    pub fn downgrade(&self, request: PlanChangeRequest) -> BillingResult<PlanChange> {
        let sub = self.require_active(request.subscription_id)?;
        let current = self.plan(sub.plan_id)?;
        let target = self.active_plan(request.new_plan_id)?;

        if target.tier_rank >= current.tier_rank {
            tracing::warn!(
                subscription_id = %sub.id,
                from_rank = current.tier_rank,
                to_rank = target.tier_rank,
                "downgrade rejected"
            );
            return Err(BillingError::Conflict(format!(
                "plan {} (rank {}) is not below plan {} (rank {})",
                target.id, target.tier_rank, current.id, current.tier_rank
            )));
        }

        let now = self.clock.now();
        let revert = target.id == sub.cycle_plan_id;
        let effective_at = if revert { now } else { sub.current_period_end };

        let record = self.record(
            &sub,
            ChangeKind::Downgrade,
            target.id,
            Decimal::ZERO,
            request.reason,
            request.actor,
            effective_at,
        );

        let mut next = sub.clone();
        next.updated_at = now;
        if revert {
            next.plan_id = target.id;
            next.pending_change = None;
        } else {
            next.pending_change = Some(PendingPlanChange {
                plan_id: target.id,
                effective_at,
                change_id: record.id,
            });
        }

        let saved = self.store.update_subscription(next, sub.version, vec![record.clone()])?;
        tracing::info!(
            subscription_id = %sub.id,
            from_plan = %current.id,
            to_plan = %target.id,
            applied = revert,
            effective_at = %effective_at,
            "subscription downgraded"
        );

        Ok(PlanChange { subscription: saved, record, applied: revert })
    }

    /// Pending vs applied downgrade
    pub fn plan_change_state(&self, id: Uuid) -> BillingResult<PlanChangeState> {
        let sub = self.get(id)?;
        if let Some(pending) = &sub.pending_change {
            return Ok(PlanChangeState::Pending {
                plan_id: pending.plan_id,
                effective_at: pending.effective_at,
            });
        }

        let applied = self.store.change_records(&id)?
            .into_iter()
            .rev()
            .find(|r| matches!(r.kind, ChangeKind::Downgrade | ChangeKind::DowngradeApplied | ChangeKind::Upgrade));
        Ok(match applied {
            Some(r) if r.kind != ChangeKind::Upgrade && r.to_plan_id == sub.plan_id => {
                PlanChangeState::Applied { plan_id: r.to_plan_id, applied_at: r.effective_at }
            }
            _ => PlanChangeState::None,
        })
    }

    /// Cancel. Cancelling twice is a conflict, not a no-op.
    pub fn cancel(&self, id: Uuid, reason: Option<String>) -> BillingResult<Subscription> {
        let sub = self.get(id)?;
        if sub.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::Conflict(format!("subscription {} is already cancelled", id)));
        }

        let now = self.clock.now();
        let mut next = sub.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.auto_renew = false;
        next.pending_change = None;
        next.cancellation_reason = reason.clone();
        next.cancelled_at = Some(now);
        next.next_billing_at = None;
        next.updated_at = now;

        let record = self.record(&sub, ChangeKind::Cancelled, sub.plan_id, Decimal::ZERO, reason, None, now);
        let saved = self.store.update_subscription(next, sub.version, vec![record])?;
        tracing::info!(subscription_id = %id, "subscription cancelled");
        Ok(saved)
    }

    /// Toggle auto-renew
    pub fn set_auto_renew(&self, id: Uuid, auto_renew: bool) -> BillingResult<Subscription> {
        let sub = self.get(id)?;
        if sub.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::Conflict(format!("subscription {} is cancelled", id)));
        }
        if sub.auto_renew == auto_renew {
            return Ok(sub);
        }

        let now = self.clock.now();
        let mut next = sub.clone();
        next.auto_renew = auto_renew;
        next.updated_at = now;
        let record = self.record(
            &sub,
            ChangeKind::AutoRenewChanged,
            sub.plan_id,
            Decimal::ZERO,
            Some(format!("auto_renew={}", auto_renew)),
            None,
            now,
        );
        Ok(self.store.update_subscription(next, sub.version, vec![record])?)
    }

    /// Renew by exactly one cycle from the previous end date
    pub fn renew(&self, id: Uuid) -> BillingResult<Subscription> {
        let sub = self.get(id)?;
        self.renew_once(sub, self.clock.now())
    }

    /// One renewal, due-ness judged at `now`
    fn renew_once(&self, sub: Subscription, now: DateTime<Utc>) -> BillingResult<Subscription> {
        if !sub.auto_renew {
            return Err(BillingError::Conflict(format!("subscription {} does not auto-renew", sub.id)));
        }
        if !matches!(sub.status, SubscriptionStatus::Active | SubscriptionStatus::Expired) {
            return Err(BillingError::Conflict(format!("subscription {} cannot renew from {}", sub.id, sub.status)));
        }
        if sub.current_period_end > now {
            return Err(BillingError::Conflict(format!(
                "subscription {} is not due for renewal until {}", sub.id, sub.current_period_end
            )));
        }

        let start = sub.current_period_end;
        let end = sub.billing_cycle.advance(start)?;

        let mut next = sub.clone();
        next.status = SubscriptionStatus::Active;
        next.current_period_start = start;
        next.current_period_end = end;
        next.last_billed_at = Some(start);
        next.next_billing_at = Some(end);
        next.updated_at = now;

        let mut records = Vec::new();
        if let Some(pending) = sub.pending_change.as_ref().filter(|p| p.effective_at <= start) {
            next.plan_id = pending.plan_id;
            next.pending_change = None;
            records.push(self.record(
                &sub,
                ChangeKind::DowngradeApplied,
                pending.plan_id,
                Decimal::ZERO,
                Some(format!("scheduled by change {}", pending.change_id)),
                None,
                start,
            ));
            tracing::info!(subscription_id = %sub.id, plan_id = %pending.plan_id, "pending downgrade applied");
        }
        next.cycle_plan_id = next.plan_id;
        records.push(self.record(&sub, ChangeKind::Renewed, next.plan_id, Decimal::ZERO, None, None, start));

        let saved = self.store.update_subscription(next, sub.version, records)?;
        self.log_renewal(saved)
    }

    fn log_renewal(&self, saved: Subscription) -> BillingResult<Subscription> {
        tracing::info!(
            subscription_id = %saved.id,
            period_start = %saved.current_period_start,
            period_end = %saved.current_period_end,
            "subscription renewed"
        );
        Ok(saved)
    }

    /// Expire or renew every live subscription whose cycle ended by `now`.
    ///
    /// Safe to repeat: subscriptions already moved out of Trial/Active are
    /// not touched again.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> BillingResult<SweepReport> {
        let mut report = SweepReport::default();

        for sub in self.store.subscriptions_due(now)? {
            let (id, status, auto_renew) = (sub.id, sub.status, sub.auto_renew);
            let outcome = match status {
                SubscriptionStatus::Trial => self
                    .end_period(sub, SubscriptionStatus::TrialEnded, ChangeKind::TrialEnded, now)
                    .map(|_| report.trials_ended.push(id)),
                SubscriptionStatus::Active if auto_renew => self
                    .catch_up(sub, now)
                    .map(|_| report.renewed.push(id)),
                SubscriptionStatus::Active => self
                    .end_period(sub, SubscriptionStatus::Expired, ChangeKind::Expired, now)
                    .map(|_| report.expired.push(id)),
                _ => Ok(()),
            };

            match outcome {
                Ok(()) => {}
                Err(BillingError::Conflict(msg)) => {
                    tracing::warn!(subscription_id = %id, reason = %msg, "sweep skipped subscription");
                    report.skipped.push(id);
                }
                Err(err) => {
                    tracing::warn!(subscription_id = %id, error = %err, "sweep failed for subscription");
                    report.failed.push((id, err.to_string()));
                }
            }
        }

        tracing::info!(
            renewed = report.renewed.len(),
            expired = report.expired.len(),
            trials_ended = report.trials_ended.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "subscription sweep finished"
        );
        Ok(report)
    }

    fn catch_up(&self, mut sub: Subscription, now: DateTime<Utc>) -> BillingResult<Subscription> {
        for _ in 0..MAX_CATCH_UP_CYCLES {
            if sub.current_period_end > now {
                break;
            }
            sub = self.renew_once(sub, now)?;
        }
        Ok(sub)
    }

    fn end_period(
        &self,
        sub: Subscription,
        status: SubscriptionStatus,
        kind: ChangeKind,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut next = sub.clone();
        next.status = status;
        next.pending_change = None;
        next.next_billing_at = None;
        next.updated_at = now;

        let record = self.record(&sub, kind, sub.plan_id, Decimal::ZERO, None, None, sub.current_period_end);
        let saved = self.store.update_subscription(next, sub.version, vec![record])?;
        tracing::info!(subscription_id = %saved.id, status = %saved.status, "subscription period ended");
        Ok(saved)
    }

    /// Store a usage snapshot and report capacity breaches
    pub fn update_usage_snapshot(&self, id: Uuid, usage: UsageSnapshot) -> BillingResult<CapacityReport> {
        let sub = self.get(id)?;
        let plan = self.plan(sub.plan_id)?;

        let mut next = sub.clone();
        next.usage = usage;
        next.updated_at = self.clock.now();
        self.store.update_subscription(next, sub.version, Vec::new())?;

        let breaches = capacity_breaches(&plan.capacity, &usage);
        if !breaches.is_empty() {
            tracing::warn!(subscription_id = %id, breaches = breaches.len(), "plan capacity exceeded");
        }
        Ok(CapacityReport { subscription_id: id, breaches })
    }

    /// Monthly recurring revenue over Active subscriptions
    pub fn calculate_mrr(&self) -> BillingResult<Decimal> {
        let mut total = Decimal::ZERO;
        for sub in self.store.subscriptions_with_status(SubscriptionStatus::Active)? {
            total = money_add(total, self.plan(sub.plan_id)?.monthly_equivalent(sub.billing_cycle))?;
        }
        Ok(round_money(total))
    }

    /// Annual recurring revenue
    pub fn calculate_arr(&self) -> BillingResult<Decimal> {
        money_mul(self.calculate_mrr()?, Decimal::from(12))
    }
}
