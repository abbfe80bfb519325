//! Usage commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;
use uuid::Uuid;

use hms_billing::metering::EntityUsage;
use hms_billing::{RecordUsage, UsageAlert};

use super::Context;
use crate::UsageCommands;

#[derive(Tabled)]
struct EntityRow {
    entity: String,
    units: String,
    records: usize,
}

impl From<&EntityUsage> for EntityRow {
    fn from(e: &EntityUsage) -> Self {
        Self { entity: e.entity_id.clone(), units: e.units.to_string(), records: e.records }
    }
}

#[derive(Tabled)]
struct AlertRow {
    id: Uuid,
    entity: String,
    kind: &'static str,
    threshold: String,
    observed: String,
    raised_at: String,
}

impl From<&UsageAlert> for AlertRow {
    fn from(a: &UsageAlert) -> Self {
        Self {
            id: a.id,
            entity: a.entity_id.clone(),
            kind: a.kind.as_str(),
            threshold: a.threshold.to_string(),
            observed: a.observed.to_string(),
            raised_at: a.raised_at.to_rfc3339(),
        }
    }
}

pub fn handle(action: UsageCommands, ctx: &Context) -> Result<()> {
    let session = ctx.session()?;
    let platform = &session.platform;

    match action {
        UsageCommands::Record { subscription, entity, units, complexity, key } => {
            let mut request = RecordUsage::new(subscription, &entity, units);
            if let Some(label) = complexity.as_deref() {
                request = request.with_complexity(label);
            }
            if let Some(key) = key.as_deref() {
                request = request.with_idempotency_key(key);
            }
            let outcome = platform.record_usage(request)?;
            session.save()?;

            if !ctx.format.is_table() {
                return ctx.format.print(&outcome);
            }
            if outcome.duplicate {
                println!("{} already recorded as {}", "→".blue(), outcome.record.id);
            } else {
                println!(
                    "{} recorded {} {}; period total {}",
                    "✓".green().bold(),
                    outcome.record.units,
                    outcome.record.entity_id,
                    outcome.period_total
                );
            }
            for alert in &outcome.alerts {
                println!(
                    "{} {} reached for {} ({} >= {})",
                    "!".yellow().bold(),
                    alert.kind.as_str(),
                    alert.entity_id,
                    alert.observed,
                    alert.threshold
                );
            }
        }
        UsageCommands::Summary { subscription, from, to, status } => {
            let sub = platform.subscriptions.get(subscription)?;
            let start = from.unwrap_or(sub.current_period_start);
            let end = to.unwrap_or(sub.current_period_end);
            let summary = platform.get_usage_summary(subscription, start, end, &status)?;

            if ctx.format.is_table() {
                println!("{} to {}: {} units", start.to_rfc3339(), end.to_rfc3339(), summary.total_units);
                let rows = summary.entities.iter().map(EntityRow::from).collect();
                ctx.format.print_list(&summary.entities, rows)?;
            } else {
                ctx.format.print(&summary)?;
            }
        }
        UsageCommands::Alerts { subscription } => {
            let alerts = platform.get_active_alerts(subscription)?;
            let rows = alerts.iter().map(AlertRow::from).collect();
            ctx.format.print_list(&alerts, rows)?;
        }
        UsageCommands::Resolve { id } => {
            let alert = platform.resolve_alert(id)?;
            session.save()?;
            ctx.format.print(&alert)?;
        }
    }
    Ok(())
}
