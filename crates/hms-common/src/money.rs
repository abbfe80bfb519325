//! Money arithmetic
//!
//! All monetary amounts are `rust_decimal::Decimal` in a single currency that
//! the caller has already resolved. Rounding happens once, at the end of a
//! computation, to two decimal places with round-half-up (midpoint away from
//! zero).

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};

/// Scale of every stored monetary amount
pub const MONEY_SCALE: u32 = 2;

/// Round to cents, half-up
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to cents and clamp at zero
pub fn non_negative_money(amount: Decimal) -> Decimal {
    round_money(amount.max(Decimal::ZERO))
}

fn out_of_range(op: &str, a: Decimal, b: Decimal) -> BillingError {
    BillingError::Validation(format!("amount out of range: {} {} {}", a, op, b))
}

/// `a + b`; `Validation` when the result does not fit a `Decimal`
pub fn money_add(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_add(b).ok_or_else(|| out_of_range("+", a, b))
}

/// `a - b`; `Validation` on overflow
pub fn money_sub(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_sub(b).ok_or_else(|| out_of_range("-", a, b))
}

/// `a * b`; `Validation` on overflow
pub fn money_mul(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_mul(b).ok_or_else(|| out_of_range("*", a, b))
}

/// `a / b`; `Validation` on overflow or a zero divisor
pub fn money_div(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_div(b).ok_or_else(|| out_of_range("/", a, b))
}

/// Overflow-checked sum
pub fn money_sum<I: IntoIterator<Item = Decimal>>(values: I) -> BillingResult<Decimal> {
    values.into_iter().try_fold(Decimal::ZERO, money_add)
}
