//! Pricing Engine
//!
//! Turns a pricing rule, a unit count and an optional complexity label into a
//! monetary amount. Evaluation is pure: no state, no I/O. Each rule's amount
//! is rounded once, at the end, to cents (half-up) and is never negative.
//!
//! Rule configurations are validated when they are saved
//! ([`PricingRule::validate`]); evaluation assumes a valid configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hms_common::{money_add, money_div, money_mul, money_sub, non_negative_money, BillingError, BillingResult};

/// Pricing rule type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Flat,
    PerUnit,
    Tiered,
    Multiplier,
    Percentage,
    Bundle,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::PerUnit => "per_unit",
            Self::Tiered => "tiered",
            Self::Multiplier => "multiplier",
            Self::Percentage => "percentage",
            Self::Bundle => "bundle",
        }
    }
}

/// One band of a tiered rule: `[min_unit, max_unit)` at `unit_price`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub min_unit: Decimal,
    /// `None` = unbounded
    pub max_unit: Option<Decimal>,
    pub unit_price: Decimal,
}

impl PricingTier {
    pub fn new(min_unit: Decimal, max_unit: Option<Decimal>, unit_price: Decimal) -> Self {
        Self { min_unit, max_unit, unit_price }
    }

    /// Units of `units` that fall inside this tier
    pub fn overlap(&self, units: Decimal) -> Decimal {
        let upper = self.max_unit.map_or(units, |max| units.min(max));
        (upper - self.min_unit).max(Decimal::ZERO)
    }
}

/// Multiplier applied for a complexity label (low/medium/high/critical)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityMultiplier {
    pub label: String,
    pub factor: Decimal,
}

/// Type-specific rule configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConfig {
    /// Fixed amount, units ignored
    Flat { amount: Decimal },
    /// `unit_price * units`
    PerUnit { unit_price: Decimal },
    /// Units partitioned across contiguous tiers covering `[0, inf)`
    Tiered { tiers: Vec<PricingTier> },
    /// `base_unit_price * units * factor(label)`, factor 1 when unmatched
    Multiplier {
        base_unit_price: Decimal,
        multipliers: Vec<ComplexityMultiplier>,
    },
    /// `basis * percentage / 100`, basis supplied by the caller
    Percentage { percentage: Decimal },
    /// Full bundles at `bundle_price`, remaining units at `overage_unit_price`
    Bundle {
        bundle_size: Decimal,
        bundle_price: Decimal,
        overage_unit_price: Decimal,
    },
}

impl RuleConfig {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::Flat { .. } => RuleType::Flat,
            Self::PerUnit { .. } => RuleType::PerUnit,
            Self::Tiered { .. } => RuleType::Tiered,
            Self::Multiplier { .. } => RuleType::Multiplier,
            Self::Percentage { .. } => RuleType::Percentage,
            Self::Bundle { .. } => RuleType::Bundle,
        }
    }
}

/// Pricing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Uuid,
    /// Plan this rule is attached to
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    /// Billable entity whose usage feeds the rule
    #[serde(default)]
    pub entity_id: Option<String>,
    pub name: String,
    pub config: RuleConfig,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl PricingRule {
    /// New active rule attached to a plan
    pub fn new(plan_id: Uuid, name: &str, config: RuleConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: Some(plan_id),
            entity_id: None,
            name: name.into(),
            config,
            display_order: 0,
            active: true,
        }
    }

    /// Feed the rule from an entity's usage
    pub fn metering(mut self, entity_id: &str) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set display order
    pub fn ordered(mut self, display_order: i32) -> Self {
        self.display_order = display_order;
        self
    }

    pub fn rule_type(&self) -> RuleType {
        self.config.rule_type()
    }

    /// Check the configuration; run at save time
    pub fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::Validation("rule name cannot be empty".into()));
        }

        match &self.config {
            RuleConfig::Flat { amount } => non_negative("flat amount", *amount),
            RuleConfig::PerUnit { unit_price } => non_negative("unit price", *unit_price),
            RuleConfig::Tiered { tiers } => validate_tiers(tiers),
            RuleConfig::Multiplier { base_unit_price, multipliers } => {
                non_negative("base unit price", *base_unit_price)?;
                let mut seen = std::collections::HashSet::new();
                for m in multipliers {
                    let label = m.label.trim().to_lowercase();
                    if label.is_empty() {
                        return Err(BillingError::Validation("complexity label cannot be empty".into()));
                    }
                    if !seen.insert(label) {
                        return Err(BillingError::Validation(format!(
                            "duplicate complexity label '{}'", m.label
                        )));
                    }
                    non_negative("multiplier factor", m.factor)?;
                }
                Ok(())
            }
            RuleConfig::Percentage { percentage } => non_negative("percentage", *percentage),
            RuleConfig::Bundle { bundle_size, bundle_price, overage_unit_price } => {
                if *bundle_size <= Decimal::ZERO {
                    return Err(BillingError::Validation("bundle size must be positive".into()));
                }
                non_negative("bundle price", *bundle_price)?;
                non_negative("overage unit price", *overage_unit_price)
            }
        }?;

        // Metered rule types need an entity to read usage from
        let metered = matches!(
            self.rule_type(),
            RuleType::PerUnit | RuleType::Tiered | RuleType::Multiplier | RuleType::Bundle
        );
        if metered && self.plan_id.is_some() && self.entity_id.is_none() {
            return Err(BillingError::Validation(format!(
                "{} rule '{}' must name the entity it meters", self.rule_type().as_str(), self.name
            )));
        }
        Ok(())
    }
}

fn non_negative(what: &str, value: Decimal) -> BillingResult<()> {
    if value < Decimal::ZERO {
        return Err(BillingError::Validation(format!("{} cannot be negative", what)));
    }
    Ok(())
}

/// Tiers must start at zero, be contiguous and end unbounded
fn validate_tiers(tiers: &[PricingTier]) -> BillingResult<()> {
    let first = tiers.first()
        .ok_or_else(|| BillingError::Validation("tiered rule needs at least one tier".into()))?;
    if first.min_unit != Decimal::ZERO {
        return Err(BillingError::Validation("first tier must start at 0".into()));
    }

    for (i, tier) in tiers.iter().enumerate() {
        non_negative("tier unit price", tier.unit_price)?;
        let is_last = i + 1 == tiers.len();
        match (tier.max_unit, is_last) {
            (None, true) => {}
            (None, false) => {
                return Err(BillingError::Validation(format!(
                    "tier {} is unbounded but is not the last tier", i
                )));
            }
            (Some(_), true) => {
                return Err(BillingError::Validation("last tier must be unbounded".into()));
            }
            (Some(max), false) => {
                if max <= tier.min_unit {
                    return Err(BillingError::Validation(format!("tier {} is empty or inverted", i)));
                }
                let next = &tiers[i + 1];
                if next.min_unit > max {
                    return Err(BillingError::Validation(format!(
                        "gap between tier {} (ends {}) and tier {} (starts {})", i, max, i + 1, next.min_unit
                    )));
                }
                if next.min_unit < max {
                    return Err(BillingError::Validation(format!(
                        "tier {} overlaps tier {}", i, i + 1
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Evaluation input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationInput<'a> {
    pub units: Decimal,
    pub complexity: Option<&'a str>,
    /// Base amount for percentage rules
    pub basis: Decimal,
}

impl<'a> EvaluationInput<'a> {
    pub fn units(units: Decimal) -> Self {
        Self { units, complexity: None, basis: Decimal::ZERO }
    }

    pub fn with_complexity(mut self, label: &'a str) -> Self {
        self.complexity = Some(label);
        self
    }

    pub fn with_basis(mut self, basis: Decimal) -> Self {
        self.basis = basis;
        self
    }
}

/// Evaluate a rule
pub fn evaluate(rule: &PricingRule, input: EvaluationInput<'_>) -> BillingResult<Decimal> {
    if input.units < Decimal::ZERO {
        return Err(BillingError::Validation("units cannot be negative".into()));
    }
    if input.basis < Decimal::ZERO {
        return Err(BillingError::Validation("percentage basis cannot be negative".into()));
    }

    let units = input.units;
    let raw = match &rule.config {
        RuleConfig::Flat { amount } => *amount,
        RuleConfig::PerUnit { unit_price } => money_mul(*unit_price, units)?,
        RuleConfig::Tiered { tiers } => tiers.iter().try_fold(Decimal::ZERO, |acc, tier| {
            money_add(acc, money_mul(tier.overlap(units), tier.unit_price)?)
        })?,
        RuleConfig::Multiplier { base_unit_price, multipliers } => money_mul(
            money_mul(*base_unit_price, units)?,
            complexity_factor(multipliers, input.complexity),
        )?,
        RuleConfig::Percentage { percentage } => money_div(money_mul(input.basis, *percentage)?, dec!(100))?,
        RuleConfig::Bundle { bundle_size, bundle_price, overage_unit_price } => {
            if *bundle_size <= Decimal::ZERO {
                return Err(BillingError::Validation("bundle size must be positive".into()));
            }
            let bundles = money_div(units, *bundle_size)?.floor();
            let overage = money_sub(units, money_mul(bundles, *bundle_size)?)?;
            money_add(money_mul(bundles, *bundle_price)?, money_mul(overage, *overage_unit_price)?)?
        }
    };

    let amount = non_negative_money(raw);
    tracing::debug!(
        rule_id = %rule.id,
        rule_type = rule.rule_type().as_str(),
        units = %units,
        amount = %amount,
        "pricing rule evaluated"
    );
    Ok(amount)
}

/// Factor for a complexity label, case-insensitive; 1 when absent or unmatched
pub fn complexity_factor(multipliers: &[ComplexityMultiplier], label: Option<&str>) -> Decimal {
    label
        .and_then(|label| {
            multipliers.iter().find(|m| m.label.trim().eq_ignore_ascii_case(label.trim()))
        })
        .map_or(Decimal::ONE, |m| m.factor)
}

/// Per-tier unit allocation for `units`
pub fn tier_breakdown(tiers: &[PricingTier], units: Decimal) -> Vec<Decimal> {
    tiers.iter().map(|tier| tier.overlap(units)).collect()
}

/// Pricing engine
#[derive(Debug, Default, Clone, Copy)]
pub struct PricingEngine;

impl PricingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a rule
    pub fn evaluate(&self, rule: &PricingRule, input: EvaluationInput<'_>) -> BillingResult<Decimal> {
        evaluate(rule, input)
    }

    /// Validate and evaluate, for ad-hoc rules that were never saved
    pub fn evaluate_checked(&self, rule: &PricingRule, input: EvaluationInput<'_>) -> BillingResult<Decimal> {
        rule.validate()?;
        evaluate(rule, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rule(config: RuleConfig) -> PricingRule {
        PricingRule::new(Uuid::new_v4(), "test", config).metering("lab-order")
    }

    fn two_tier() -> Vec<PricingTier> {
        vec![
            PricingTier::new(dec!(0), Some(dec!(10)), dec!(1.00)),
            PricingTier::new(dec!(10), None, dec!(0.50)),
        ]
    }

    fn eval(rule: &PricingRule, units: Decimal) -> Decimal {
        evaluate(rule, EvaluationInput::units(units)).unwrap()
    }

    #[test]
    fn test_flat_ignores_units() {
        let r = rule(RuleConfig::Flat { amount: dec!(49.99) });
        assert_eq!(eval(&r, dec!(0)), dec!(49.99));
        assert_eq!(eval(&r, dec!(1000)), dec!(49.99));
    }

    #[test]
    fn test_per_unit() {
        let r = rule(RuleConfig::PerUnit { unit_price: dec!(0.35) });
        assert_eq!(eval(&r, dec!(7)), dec!(2.45));
    }

    #[test]
    fn test_tiered_example() {
        let r = rule(RuleConfig::Tiered { tiers: two_tier() });
        assert_eq!(eval(&r, dec!(15)), dec!(12.50));
        assert_eq!(eval(&r, dec!(10)), dec!(10.00));
        assert_eq!(eval(&r, dec!(0)), dec!(0));
    }

    #[test]
    fn test_multiplier_labels() {
        let r = rule(RuleConfig::Multiplier {
            base_unit_price: dec!(20),
            multipliers: vec![
                ComplexityMultiplier { label: "low".into(), factor: dec!(0.5) },
                ComplexityMultiplier { label: "critical".into(), factor: dec!(2.5) },
            ],
        });
        let input = EvaluationInput::units(dec!(3));
        assert_eq!(evaluate(&r, input.with_complexity("CRITICAL")).unwrap(), dec!(150));
        assert_eq!(evaluate(&r, input.with_complexity("low")).unwrap(), dec!(30));
        // unmatched and missing labels fall back to 1.0
        assert_eq!(evaluate(&r, input.with_complexity("medium")).unwrap(), dec!(60));
        assert_eq!(evaluate(&r, input).unwrap(), dec!(60));
    }

    #[test]
    fn test_percentage_uses_basis() {
        let r = PricingRule::new(Uuid::new_v4(), "support", RuleConfig::Percentage { percentage: dec!(12.5) });
        let amount = evaluate(&r, EvaluationInput::units(dec!(99)).with_basis(dec!(100.00))).unwrap();
        assert_eq!(amount, dec!(12.50));
    }

    #[test]
    fn test_bundle_with_overage() {
        let r = rule(RuleConfig::Bundle {
            bundle_size: dec!(50),
            bundle_price: dec!(40),
            overage_unit_price: dec!(1.10),
        });
        assert_eq!(eval(&r, dec!(120)), dec!(102.00));
        assert_eq!(eval(&r, dec!(49)), dec!(53.90));
    }

    #[test]
    fn test_rounding_applied_once() {
        // 3 * 0.333 = 0.999 -> 1.00; per-unit rounding would give 0.99
        let r = rule(RuleConfig::PerUnit { unit_price: dec!(0.333) });
        assert_eq!(eval(&r, dec!(3)), dec!(1.00));
    }

    #[test]
    fn test_negative_units_rejected() {
        let r = rule(RuleConfig::PerUnit { unit_price: dec!(1) });
        let err = evaluate(&r, EvaluationInput::units(dec!(-1))).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_overflowing_units_rejected() {
        let per_unit = rule(RuleConfig::PerUnit { unit_price: dec!(2) });
        let err = evaluate(&per_unit, EvaluationInput::units(Decimal::MAX)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let tiered = rule(RuleConfig::Tiered {
            tiers: vec![
                PricingTier::new(dec!(0), Some(dec!(10)), dec!(1)),
                PricingTier::new(dec!(10), None, dec!(3)),
            ],
        });
        assert!(evaluate(&tiered, EvaluationInput::units(Decimal::MAX)).is_err());

        let bundle = rule(RuleConfig::Bundle {
            bundle_size: dec!(0.5),
            bundle_price: dec!(40),
            overage_unit_price: dec!(1),
        });
        assert!(evaluate(&bundle, EvaluationInput::units(Decimal::MAX)).is_err());
    }

    #[test]
    fn test_tier_gap_rejected_at_save() {
        let r = rule(RuleConfig::Tiered {
            tiers: vec![
                PricingTier::new(dec!(0), Some(dec!(10)), dec!(1)),
                PricingTier::new(dec!(12), None, dec!(0.5)),
            ],
        });
        let err = r.validate().unwrap_err();
        assert!(err.to_string().contains("gap"));
    }

    #[test]
    fn test_tier_overlap_rejected_at_save() {
        let r = rule(RuleConfig::Tiered {
            tiers: vec![
                PricingTier::new(dec!(0), Some(dec!(10)), dec!(1)),
                PricingTier::new(dec!(8), None, dec!(0.5)),
            ],
        });
        assert!(r.validate().unwrap_err().to_string().contains("overlaps"));
    }

    #[test]
    fn test_bounded_last_tier_rejected() {
        let r = rule(RuleConfig::Tiered {
            tiers: vec![PricingTier::new(dec!(0), Some(dec!(10)), dec!(1))],
        });
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_duplicate_multiplier_label_rejected() {
        let r = rule(RuleConfig::Multiplier {
            base_unit_price: dec!(1),
            multipliers: vec![
                ComplexityMultiplier { label: "High".into(), factor: dec!(2) },
                ComplexityMultiplier { label: "high".into(), factor: dec!(3) },
            ],
        });
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_metered_rule_requires_entity() {
        let r = PricingRule::new(Uuid::new_v4(), "labs", RuleConfig::PerUnit { unit_price: dec!(1) });
        assert!(r.validate().is_err());
        assert!(r.metering("lab-order").validate().is_ok());
    }

    #[test]
    fn test_rule_config_json_shape() {
        let json = r#"{"type":"bundle","bundle_size":"10","bundle_price":"8","overage_unit_price":"1"}"#;
        let config: RuleConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.rule_type(), RuleType::Bundle);
    }

    fn tiers_strategy() -> impl Strategy<Value = Vec<PricingTier>> {
        // widths and prices in cents, then turned into contiguous tiers
        (prop::collection::vec((1u32..500, 0u32..10_000), 0..5), 0u32..10_000).prop_map(|(bands, last_price)| {
            let mut tiers = Vec::new();
            let mut min = Decimal::ZERO;
            for (width, price) in bands {
                let max = min + Decimal::from(width);
                tiers.push(PricingTier::new(min, Some(max), Decimal::new(price as i64, 2)));
                min = max;
            }
            tiers.push(PricingTier::new(min, None, Decimal::new(last_price as i64, 2)));
            tiers
        })
    }

    proptest! {
        #[test]
        fn prop_tier_overlaps_conserve_units(tiers in tiers_strategy(), units in 0u32..5_000) {
            let units = Decimal::from(units);
            let allocated: Decimal = tier_breakdown(&tiers, units).iter().sum();
            prop_assert_eq!(allocated, units);
        }

        #[test]
        fn prop_generated_tiers_validate(tiers in tiers_strategy()) {
            let valid = rule(RuleConfig::Tiered { tiers }).validate().is_ok();
            prop_assert!(valid);
        }

        #[test]
        fn prop_boundary_split_is_additive(tiers in tiers_strategy(), extra in 0u32..2_000, pick in any::<prop::sample::Index>()) {
            // Splitting at a tier boundary b: price(b + x) = price(b) + price of x units
            // evaluated on the tiers shifted down by b.
            let boundary = tiers[pick.index(tiers.len())].min_unit;
            let extra = Decimal::from(extra);
            let whole = eval(&rule(RuleConfig::Tiered { tiers: tiers.clone() }), boundary + extra);
            let head = eval(&rule(RuleConfig::Tiered { tiers: tiers.clone() }), boundary);

            let shifted: Vec<PricingTier> = tiers.iter()
                .filter(|t| t.max_unit.map_or(true, |max| max > boundary))
                .map(|t| PricingTier::new(
                    t.min_unit - boundary,
                    t.max_unit.map(|max| max - boundary),
                    t.unit_price,
                ))
                .collect();
            let tail = eval(&rule(RuleConfig::Tiered { tiers: shifted }), extra);

            prop_assert_eq!(whole, head + tail);
        }

        #[test]
        fn prop_amounts_never_negative(tiers in tiers_strategy(), units in 0u32..5_000) {
            let amount = eval(&rule(RuleConfig::Tiered { tiers }), Decimal::from(units));
            prop_assert!(amount >= Decimal::ZERO);
        }
    }
}
