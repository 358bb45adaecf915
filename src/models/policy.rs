use crate::error::{CommerceError, Result};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommercePolicy {
    pub max_per_transaction: Decimal,
    pub daily_limit: Decimal,
    pub auto_approve_below: Decimal,
    #[serde(default)]
    pub whitelisted_recipients: BTreeSet<Address>,
    #[serde(default)]
    pub blacklisted_recipients: BTreeSet<Address>,
}

impl Default for CommercePolicy {
    fn default() -> Self {
        Self {
            max_per_transaction: Decimal::new(100, 2),
            daily_limit: Decimal::new(1000, 2),
            auto_approve_below: Decimal::new(10, 2),
            whitelisted_recipients: BTreeSet::new(),
            blacklisted_recipients: BTreeSet::new(),
        }
    }
}

impl CommercePolicy {
    /// Checks non-negative limits, `autoApproveBelow <= maxPerTransaction` and
    /// disjoint allow/deny lists.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("maxPerTransaction", self.max_per_transaction),
            ("dailyLimit", self.daily_limit),
            ("autoApproveBelow", self.auto_approve_below),
        ] {
            if value.is_sign_negative() {
                return Err(CommerceError::InvalidPolicy(format!(
                    "{} must not be negative (got {})",
                    name, value
                )));
            }
        }
        if self.auto_approve_below > self.max_per_transaction {
            return Err(CommerceError::InvalidPolicy(format!(
                "autoApproveBelow ${} exceeds maxPerTransaction ${}",
                self.auto_approve_below, self.max_per_transaction
            )));
        }
        if let Some(both) = self
            .whitelisted_recipients
            .intersection(&self.blacklisted_recipients)
            .next()
        {
            return Err(CommerceError::InvalidPolicy(format!(
                "{:?} is both whitelisted and blacklisted",
                both
            )));
        }
        Ok(())
    }
}

/// Which rule decided a payment check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    Blacklisted,
    PerTransactionLimit,
    DailyLimit,
    Whitelisted,
    AutoApproved,
    ApprovalRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub rule: PolicyRule,
}

impl PolicyDecision {
    pub fn deny(rule: PolicyRule, reason: String) -> Self {
        Self {
            allowed: false,
            requires_approval: false,
            reason: Some(reason),
            rule,
        }
    }

    pub fn allow(rule: PolicyRule) -> Self {
        Self {
            allowed: true,
            requires_approval: rule == PolicyRule::ApprovalRequired,
            reason: None,
            rule,
        }
    }
}
