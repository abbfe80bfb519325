//! Subscription commands

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;
use uuid::Uuid;

use hms_billing::subscriptions::{PlanChangeState, SubscriptionChangeRecord};
use hms_billing::{CreateSubscription, PlanChangeRequest, Subscription};

use super::Context;
use crate::session::Session;
use crate::SubscriptionCommands;

#[derive(Tabled)]
struct ChangeRow {
    kind: String,
    from_plan: Uuid,
    to_plan: Uuid,
    proration: String,
    effective_at: String,
    reason: String,
}

impl From<&SubscriptionChangeRecord> for ChangeRow {
    fn from(r: &SubscriptionChangeRecord) -> Self {
        Self {
            kind: format!("{:?}", r.kind),
            from_plan: r.from_plan_id,
            to_plan: r.to_plan_id,
            proration: r.proration_amount.to_string(),
            effective_at: r.effective_at.to_rfc3339(),
            reason: r.reason.clone().unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
struct Details {
    subscription: Subscription,
    plan_change: PlanChangeState,
    history: Vec<SubscriptionChangeRecord>,
}

#[derive(Serialize)]
struct Revenue {
    mrr: rust_decimal::Decimal,
    arr: rust_decimal::Decimal,
}

fn request(id: Uuid, plan: Uuid, reason: Option<String>, actor: Option<String>) -> PlanChangeRequest {
    PlanChangeRequest { subscription_id: id, new_plan_id: plan, reason, actor }
}

pub async fn handle(action: SubscriptionCommands, ctx: &Context) -> Result<()> {
    if let SubscriptionCommands::Sweep { watch: true, interval } = action {
        return watch(ctx, interval).await;
    }

    let session = ctx.session()?;
    let platform = &session.platform;

    match action {
        SubscriptionCommands::Create { tenant, plan, cycle, trial, no_auto_renew } => {
            let sub = platform.create_subscription(CreateSubscription {
                tenant_id: tenant,
                plan_id: plan,
                billing_cycle: cycle,
                is_trial: trial,
                auto_renew: !no_auto_renew,
            })?;
            session.save()?;
            ctx.format.print(&sub)?;
        }
        SubscriptionCommands::Activate { id } => {
            let sub = platform.subscriptions.activate(id, None)?;
            session.save()?;
            ctx.format.print(&sub)?;
        }
        SubscriptionCommands::Upgrade { id, plan, reason, actor } => {
            let change = platform.upgrade_subscription(request(id, plan, reason, actor))?;
            session.save()?;
            if ctx.format.is_table() {
                println!(
                    "{} upgraded to {}; proration {}",
                    "✓".green().bold(),
                    change.subscription.plan_id,
                    change.record.proration_amount
                );
            } else {
                ctx.format.print(&change)?;
            }
        }
        SubscriptionCommands::Downgrade { id, plan, reason, actor } => {
            let change = platform.downgrade_subscription(request(id, plan, reason, actor))?;
            session.save()?;
            if ctx.format.is_table() {
                let when = if change.applied {
                    "now".to_string()
                } else {
                    change.record.effective_at.to_rfc3339()
                };
                println!("{} downgrade to {} effective {}", "✓".green().bold(), plan, when);
            } else {
                ctx.format.print(&change)?;
            }
        }
        SubscriptionCommands::Cancel { id, reason } => {
            let sub = platform.cancel_subscription(id, reason)?;
            session.save()?;
            ctx.format.print(&sub)?;
        }
        SubscriptionCommands::Renew { id } => {
            let sub = platform.renew_subscription(id)?;
            session.save()?;
            ctx.format.print(&sub)?;
        }
        SubscriptionCommands::AutoRenew { id, enabled } => {
            let sub = platform.subscriptions.set_auto_renew(id, enabled)?;
            session.save()?;
            ctx.format.print(&sub)?;
        }
        SubscriptionCommands::Show { id } => {
            let details = Details {
                subscription: platform.subscriptions.get(id)?,
                plan_change: platform.subscriptions.plan_change_state(id)?,
                history: platform.subscriptions.history(id)?,
            };
            if ctx.format.is_table() {
                ctx.format.print(&details.subscription)?;
                if let PlanChangeState::Pending { plan_id, effective_at } = &details.plan_change {
                    println!("{} downgrade to {} pending until {}", "!".yellow().bold(), plan_id, effective_at);
                }
                let rows = details.history.iter().map(ChangeRow::from).collect();
                ctx.format.print_list(&details.history, rows)?;
            } else {
                ctx.format.print(&details)?;
            }
        }
        SubscriptionCommands::Revenue => {
            ctx.format.print(&Revenue { mrr: platform.get_mrr()?, arr: platform.get_arr()? })?;
        }
        SubscriptionCommands::Sweep { .. } => sweep_once(&session, ctx)?,
    }
    Ok(())
}

/// One sweep pass against the current state file
fn sweep_once(session: &Session, ctx: &Context) -> Result<()> {
    let now = session.platform.now();
    let report = session.platform.sweep_expired_subscriptions(now)?;
    let overdue = session.platform.invoicing.mark_overdue(now)?;
    session.save()?;

    if ctx.format.is_table() {
        println!(
            "{} renewed {}, expired {}, trials ended {}, skipped {}, failed {}, invoices overdue {}",
            "→".blue(),
            report.renewed.len(),
            report.expired.len(),
            report.trials_ended.len(),
            report.skipped.len(),
            report.failed.len(),
            overdue.len(),
        );
        for (id, reason) in &report.failed {
            println!("  {} {} {}", "✗".red().bold(), id, reason);
        }
    } else {
        ctx.format.print(&report)?;
    }
    Ok(())
}

async fn watch(ctx: &Context, interval: Option<u64>) -> Result<()> {
    let secs = interval.unwrap_or(ctx.config.billing().sweep_interval_secs).max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    tracing::info!(interval_secs = secs, "sweep watch started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // the state lock is held for one pass only
                let pass = ctx.session().and_then(|session| sweep_once(&session, ctx));
                if let Err(e) = pass {
                    tracing::warn!(error = %e, "sweep failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("sweep watch stopped");
                return Ok(());
            }
        }
    }
}
