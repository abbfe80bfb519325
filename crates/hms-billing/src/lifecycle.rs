//! Subscription lifecycle states
//!
//! `SubscriptionStatus` is the one lifecycle enum for every module. Other
//! modules see it through adapters: the onboarding module works with the
//! coarser [`AccountStatus`], and persistence layers use the string forms
//! (`as_str` / `FromStr`, which also accept legacy spellings).
//!
//! ```text
//!   Trial ──activate──► Active ──cancel──► Cancelled
//!     │                 │  ▲ │
//!     │ trial over      │  │ └─ upgrade / downgrade / renew (Active → Active)
//!     ▼                 ▼  │
//!  TrialEnded        Expired (renew if auto-renew)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use hms_common::BillingError;

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    Expired,
    /// Trial ran out without conversion
    TrialEnded,
}

impl SubscriptionStatus {
    /// Trial or Active; at most one per tenant
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Trial | Self::Active)
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            (Trial, Active) | (Trial, TrialEnded) => true,
            (TrialEnded, Active) => true,
            (Active, Active) | (Active, Expired) => true,
            (Expired, Active) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::TrialEnded => "trial_ended",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" | "trialing" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "trial_ended" | "trialended" => Ok(Self::TrialEnded),
            other => Err(BillingError::Validation(format!("unknown subscription status '{}'", other))),
        }
    }
}

/// Account status as the onboarding module sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Evaluating the product
    Trialing,
    /// Paying customer
    Active,
    /// Lapsed; data retained, access restricted until renewal or conversion
    Suspended,
    /// Closed by the customer or an administrator
    Closed,
}

impl From<SubscriptionStatus> for AccountStatus {
    fn from(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Trial => Self::Trialing,
            SubscriptionStatus::Active => Self::Active,
            SubscriptionStatus::Expired | SubscriptionStatus::TrialEnded => Self::Suspended,
            SubscriptionStatus::Cancelled => Self::Closed,
        }
    }
}

impl AccountStatus {
    /// Whether the account may use metered features
    pub fn has_access(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn test_cancelled_is_final() {
        for next in [Trial, Active, Cancelled, Expired, TrialEnded] {
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_trial_cannot_expire_as_paid() {
        assert!(Trial.can_transition_to(TrialEnded));
        assert!(!Trial.can_transition_to(Expired));
        assert!(!TrialEnded.can_transition_to(Trial));
    }

    #[test]
    fn test_expired_renews() {
        assert!(Expired.can_transition_to(Active));
        assert!(Active.can_transition_to(Active));
    }

    #[test]
    fn test_legacy_spellings() {
        assert_eq!("Canceled".parse::<SubscriptionStatus>().unwrap(), Cancelled);
        assert_eq!("trialing".parse::<SubscriptionStatus>().unwrap(), Trial);
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_account_adapter() {
        assert_eq!(AccountStatus::from(TrialEnded), AccountStatus::Suspended);
        assert!(!AccountStatus::from(Expired).has_access());
        assert!(AccountStatus::from(Trial).has_access());
    }
}
