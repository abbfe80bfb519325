//! Engine configuration

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use hms_common::{BillingError, BillingResult};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] BillingError),
}

/// Billing engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Single currency every price is expressed in
    pub currency: String,
    /// Tax as a fraction of the discounted subtotal (0.08 = 8%)
    pub tax_rate: Decimal,
    /// Days between invoice generation and due date
    pub invoice_due_days: u32,
    /// Trial length for plans that do not state one
    pub default_trial_days: u32,
    /// Period of the expiry/renewal sweep
    pub sweep_interval_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            currency: "USD".into(),
            tax_rate: Decimal::ZERO,
            invoice_due_days: 30,
            default_trial_days: 14,
            sweep_interval_secs: 3600,
        }
    }
}

impl BillingConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.currency.trim().is_empty() {
            return Err(BillingError::Validation("currency cannot be empty".into()));
        }
        if self.tax_rate < Decimal::ZERO || self.tax_rate >= Decimal::ONE {
            return Err(BillingError::Validation(format!(
                "tax_rate must be a fraction in [0, 1), got {}", self.tax_rate
            )));
        }
        if self.invoice_due_days == 0 {
            return Err(BillingError::Validation("invoice_due_days must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(BillingError::Validation("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }
}
