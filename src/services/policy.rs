use crate::error::{CommerceError, Result};
use crate::models::{CommercePolicy, DailySpending, PaymentRecord, PolicyDecision, PolicyRule};
use crate::services::Ledger;
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const POLICY_FILE: &str = "commerce-policy.json";

/// Single authority on whether a payment may proceed and whether a human must
/// sign off on it.
pub struct PolicyEngine {
    policy: RwLock<CommercePolicy>,
    ledger: Arc<Ledger>,
    path: Option<PathBuf>,
}

impl PolicyEngine {
    /// In-memory engine; `update_policy` does not persist.
    pub fn new(policy: CommercePolicy, ledger: Arc<Ledger>) -> Self {
        Self {
            policy: RwLock::new(policy),
            ledger,
            path: None,
        }
    }

    /// Loads `commerce-policy.json` from `dir`, falling back to the default
    /// policy when the file does not exist.
    pub async fn load(dir: &Path, ledger: Arc<Ledger>) -> Result<Self> {
        let path = dir.join(POLICY_FILE);
        let policy = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let policy: CommercePolicy = serde_json::from_slice(&bytes).map_err(|e| {
                    CommerceError::InvalidPolicy(format!("{}: {}", path.display(), e))
                })?;
                policy.validate()?;
                policy
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No persisted policy, using defaults");
                CommercePolicy::default()
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            max_per_transaction = %policy.max_per_transaction,
            daily_limit = %policy.daily_limit,
            auto_approve_below = %policy.auto_approve_below,
            whitelisted = policy.whitelisted_recipients.len(),
            blacklisted = policy.blacklisted_recipients.len(),
            "Commerce policy loaded"
        );

        Ok(Self {
            policy: RwLock::new(policy),
            ledger,
            path: Some(path),
        })
    }

    pub async fn policy(&self) -> CommercePolicy {
        self.policy.read().await.clone()
    }

    /// Validates and swaps in a new policy, re-persisting the whole document.
    pub async fn update_policy(&self, policy: CommercePolicy) -> Result<()> {
        policy.validate()?;

        let mut current = self.policy.write().await;
        if let Some(path) = &self.path {
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(&policy)?).await?;
            tokio::fs::rename(&tmp, path).await?;
        }
        *current = policy;

        tracing::info!(
            max_per_transaction = %current.max_per_transaction,
            daily_limit = %current.daily_limit,
            auto_approve_below = %current.auto_approve_below,
            "Commerce policy updated"
        );
        Ok(())
    }

    /// Evaluates the rules in order; the first match decides. Blacklist and
    /// the hard limits come before the whitelist, so allow-listing never lifts
    /// a ceiling.
    pub async fn check_payment(&self, recipient: Address, amount: Decimal) -> PolicyDecision {
        let policy = self.policy.read().await.clone();

        let decision = if policy.blacklisted_recipients.contains(&recipient) {
            PolicyDecision::deny(
                PolicyRule::Blacklisted,
                format!("recipient {:?} is blacklisted", recipient),
            )
        } else if amount.is_sign_negative() {
            PolicyDecision::deny(
                PolicyRule::PerTransactionLimit,
                format!("amount ${} is negative", amount),
            )
        } else if amount > policy.max_per_transaction {
            PolicyDecision::deny(
                PolicyRule::PerTransactionLimit,
                format!(
                    "amount ${} exceeds per-transaction limit of ${}",
                    amount, policy.max_per_transaction
                ),
            )
        } else {
            let spent = self.ledger.daily_spending(policy.daily_limit).await.total;
            if spent + amount > policy.daily_limit {
                PolicyDecision::deny(
                    PolicyRule::DailyLimit,
                    format!(
                        "amount ${} would bring today's spend to ${}, over the daily limit of ${} (already spent ${})",
                        amount,
                        spent + amount,
                        policy.daily_limit,
                        spent
                    ),
                )
            } else if policy.whitelisted_recipients.contains(&recipient) {
                PolicyDecision::allow(PolicyRule::Whitelisted)
            } else if amount < policy.auto_approve_below {
                PolicyDecision::allow(PolicyRule::AutoApproved)
            } else {
                PolicyDecision::allow(PolicyRule::ApprovalRequired)
            }
        };

        tracing::debug!(
            recipient = ?recipient,
            amount = %amount,
            allowed = decision.allowed,
            requires_approval = decision.requires_approval,
            rule = ?decision.rule,
            "Payment policy evaluated"
        );

        decision
    }

    pub async fn daily_spending(&self) -> DailySpending {
        let limit = self.policy.read().await.daily_limit;
        self.ledger.daily_spending(limit).await
    }

    /// Books a settled payment. Only call once a transaction hash exists.
    pub async fn record_payment(
        &self,
        to: Address,
        amount: Decimal,
        tx_hash: H256,
        currency: &str,
        memo: Option<&str>,
    ) -> Result<PaymentRecord> {
        self.ledger.record(to, amount, tx_hash, currency, memo).await
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
}
