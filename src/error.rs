use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T, E = CommerceError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CommerceError {
    // Protocol
    #[error("402 response carried no X-Payment-Required header")]
    MissingChallenge,

    #[error("Malformed payment challenge: {0}")]
    MalformedChallenge(String),

    #[error("Seller answered the paid retry with another 402 (payment {tx_hash:?} already settled)")]
    UnexpectedChallenge { tx_hash: H256 },

    // Policy
    #[error("amount ${amount} exceeds hard ceiling of ${ceiling}")]
    CeilingExceeded { amount: Decimal, ceiling: Decimal },

    #[error("Payment of ${amount} to {recipient:?} denied by policy: {reason}")]
    PolicyDenied {
        recipient: Address,
        amount: Decimal,
        reason: String,
    },

    // Approval
    #[error("Approval denied for {action}: {description}")]
    ApprovalDenied { action: String, description: String },

    #[error("Approval for {action} timed out after {after_secs}s")]
    ApprovalTimeout { action: String, after_secs: u64 },

    #[error("Approval for {action} was cancelled")]
    ApprovalCancelled { action: String },

    // Settlement
    #[error("Insufficient balance: {available} < {required}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("Settlement of ${amount} to {recipient:?} failed: {reason}")]
    Settlement {
        recipient: Address,
        amount: Decimal,
        reason: String,
    },

    #[error("Paid ${amount} in {tx_hash:?} but the resource could not be fetched: {reason}")]
    PaidButUndelivered {
        tx_hash: H256,
        amount: Decimal,
        reason: String,
    },

    // Mandates
    #[error("{kind} mandate {id} expired at {expired_at}")]
    MandateExpired {
        kind: &'static str,
        id: String,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Mandate mismatch: {0}")]
    MandateMismatch(String),

    #[error("price exceeds budget: cart total ${total} > max budget ${budget}")]
    BudgetExceeded { total: Decimal, budget: Decimal },

    #[error("Merchant error: {0}")]
    Merchant(String),

    // Plumbing
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Explorer error: {0}")]
    Explorer(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CommerceError {
    /// Whether the caller may start the whole flow again (fresh challenge or
    /// quote) with a reasonable chance of a different outcome.
    pub fn is_retryable_with_new_request(&self) -> bool {
        matches!(
            self,
            CommerceError::ApprovalTimeout { .. }
                | CommerceError::ApprovalCancelled { .. }
                | CommerceError::Settlement { .. }
                | CommerceError::MandateExpired { .. }
                | CommerceError::BudgetExceeded { .. }
                | CommerceError::Merchant(_)
                | CommerceError::Http(_)
        )
    }

    /// Stable machine-readable code, used in CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            CommerceError::MissingChallenge
            | CommerceError::MalformedChallenge(_)
            | CommerceError::UnexpectedChallenge { .. } => "PROTOCOL_ERROR",
            CommerceError::CeilingExceeded { .. } | CommerceError::PolicyDenied { .. } => {
                "POLICY_DENIED"
            }
            CommerceError::ApprovalDenied { .. } => "APPROVAL_DENIED",
            CommerceError::ApprovalTimeout { .. } => "APPROVAL_TIMEOUT",
            CommerceError::ApprovalCancelled { .. } => "APPROVAL_CANCELLED",
            CommerceError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            CommerceError::Settlement { .. } => "SETTLEMENT_FAILURE",
            CommerceError::PaidButUndelivered { .. } => "PAID_BUT_UNDELIVERED",
            CommerceError::MandateExpired { .. } => "MANDATE_EXPIRED",
            CommerceError::MandateMismatch(_) => "MANDATE_MISMATCH",
            CommerceError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            CommerceError::Merchant(_) => "MERCHANT_ERROR",
            CommerceError::InvalidAmount(_) => "INVALID_AMOUNT",
            CommerceError::InvalidPolicy(_) => "INVALID_POLICY",
            CommerceError::Signing(_) => "SIGNING_ERROR",
            CommerceError::Chain(_) => "CHAIN_ERROR",
            CommerceError::Explorer(_) => "EXPLORER_ERROR",
            CommerceError::Storage(_) => "STORAGE_ERROR",
            CommerceError::Http(_) => "HTTP_ERROR",
        }
    }
}

impl From<ethers::providers::ProviderError> for CommerceError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        CommerceError::Chain(e.to_string())
    }
}

impl From<std::io::Error> for CommerceError {
    fn from(e: std::io::Error) -> Self {
        CommerceError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CommerceError {
    fn from(e: serde_json::Error) -> Self {
        CommerceError::Storage(e.to_string())
    }
}
