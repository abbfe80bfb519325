//! Discount Codes

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use hms_common::{money_div, money_mul, round_money, BillingError, BillingResult};

use crate::store::BillingStore;

/// Discount type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `value` percent of the subtotal
    Percentage,
    /// `value` off, capped at the subtotal
    Fixed,
}

/// Discount code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCode {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    /// Maximum redemptions (`None` = unlimited)
    #[serde(default)]
    pub usage_limit: Option<u32>,
    #[serde(default)]
    pub usage_count: u32,
    pub active: bool,
}

impl DiscountCode {
    /// Check configuration
    pub fn validate(&self) -> BillingResult<()> {
        if self.code.is_empty() {
            return Err(BillingError::Validation("discount code cannot be empty".into()));
        }
        match self.discount_type {
            DiscountType::Percentage if self.value <= Decimal::ZERO || self.value > dec!(100) => {
                return Err(BillingError::Validation("percentage discount must be in (0, 100]".into()));
            }
            DiscountType::Fixed if self.value <= Decimal::ZERO => {
                return Err(BillingError::Validation("fixed discount must be positive".into()));
            }
            _ => {}
        }
        if matches!(self.valid_until, Some(until) if until <= self.valid_from) {
            return Err(BillingError::Validation("discount window ends before it starts".into()));
        }
        Ok(())
    }

    /// Redemptions left (`None` = unlimited)
    pub fn remaining_uses(&self) -> Option<u32> {
        self.usage_limit.map(|limit| limit.saturating_sub(self.usage_count))
    }

    /// Check the code can be redeemed at `now`
    pub fn check_redeemable(&self, now: DateTime<Utc>) -> BillingResult<()> {
        if !self.active {
            return Err(BillingError::Validation(format!("discount code {} is inactive", self.code)));
        }
        if now < self.valid_from {
            return Err(BillingError::Validation(format!("discount code {} is not yet valid", self.code)));
        }
        if matches!(self.valid_until, Some(until) if now >= until) {
            return Err(BillingError::Validation(format!("discount code {} has expired", self.code)));
        }
        if self.remaining_uses() == Some(0) {
            return Err(BillingError::Validation(format!("discount code {} is exhausted", self.code)));
        }
        Ok(())
    }

    /// Discount granted on `subtotal`, never more than the subtotal
    pub fn discount_for(&self, subtotal: Decimal) -> BillingResult<Decimal> {
        let raw = match self.discount_type {
            DiscountType::Percentage => money_div(money_mul(subtotal, self.value)?, dec!(100))?,
            DiscountType::Fixed => self.value,
        };
        Ok(round_money(raw.min(subtotal).max(Decimal::ZERO)))
    }
}

/// Discount code lookup
pub struct DiscountManager {
    store: Arc<dyn BillingStore>,
}

impl DiscountManager {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Resolve a code the caller wants to redeem.
    ///
    /// Unknown, inactive, expired and exhausted codes are all `Validation`
    /// failures; the redemption itself is counted when the invoice commits.
    pub fn redeemable(&self, code: &str, now: DateTime<Utc>) -> BillingResult<DiscountCode> {
        let normalized = code.trim().to_uppercase();
        let discount = self.store.get_discount(&normalized)?
            .ok_or_else(|| BillingError::Validation(format!("unknown discount code {}", normalized)))?;
        discount.check_redeemable(now)?;
        Ok(discount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn code(discount_type: DiscountType, value: Decimal) -> DiscountCode {
        DiscountCode {
            code: "WELCOME".into(),
            description: String::new(),
            discount_type,
            value,
            valid_from: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            valid_until: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            usage_limit: Some(2),
            usage_count: 0,
            active: true,
        }
    }

    #[test]
    fn test_percentage_discount() {
        let d = code(DiscountType::Percentage, dec!(15));
        assert_eq!(d.discount_for(dec!(112.50)).unwrap(), dec!(16.88));
    }

    #[test]
    fn test_fixed_discount_capped() {
        let d = code(DiscountType::Fixed, dec!(500));
        assert_eq!(d.discount_for(dec!(112.50)).unwrap(), dec!(112.50));
    }

    #[test]
    fn test_redeemable_window_and_limit() {
        let mut d = code(DiscountType::Fixed, dec!(10));
        let inside = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!(d.check_redeemable(inside).is_ok());
        assert!(d.check_redeemable(d.valid_from - Duration::seconds(1)).is_err());
        assert!(d.check_redeemable(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()).is_err());

        d.usage_count = 2;
        let err = d.check_redeemable(inside).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_config_validation() {
        assert!(code(DiscountType::Percentage, dec!(101)).validate().is_err());
        assert!(code(DiscountType::Fixed, dec!(0)).validate().is_err());
        assert!(code(DiscountType::Percentage, dec!(100)).validate().is_ok());
    }
}
