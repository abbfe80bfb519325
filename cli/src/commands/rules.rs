//! Pricing rule commands

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use hms_billing::{EvaluationInput, PricingEngine, PricingRule};

use super::{read_document, Context};
use crate::RuleCommands;

#[derive(Serialize)]
struct Evaluation<'a> {
    rule: &'a str,
    rule_type: &'static str,
    units: rust_decimal::Decimal,
    amount: rust_decimal::Decimal,
}

pub fn handle(action: RuleCommands, ctx: &Context) -> Result<()> {
    let engine = PricingEngine::new();
    match action {
        RuleCommands::Validate { file } => {
            let rule: PricingRule = read_document(&file)?;
            rule.validate()?;
            println!("{} {} ({})", "✓".green().bold(), rule.name, rule.rule_type().as_str());
        }
        RuleCommands::Evaluate { file, units, complexity, basis } => {
            let rule: PricingRule = read_document(&file)?;
            let mut input = EvaluationInput::units(units).with_basis(basis);
            if let Some(label) = complexity.as_deref() {
                input = input.with_complexity(label);
            }
            let amount = engine.evaluate_checked(&rule, input)?;
            ctx.format.print(&Evaluation {
                rule: &rule.name,
                rule_type: rule.rule_type().as_str(),
                units,
                amount,
            })?;
        }
    }
    Ok(())
}
