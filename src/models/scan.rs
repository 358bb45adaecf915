//! Read-only projections of chain and explorer state.

use super::ledger::TransactionLogEntry;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One token transfer touching a scanned address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTransaction {
    pub hash: H256,
    pub from: Address,
    pub to: Address,
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistorySource {
    Explorer,
    LocalLedger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientTotal {
    pub recipient: Address,
    pub total: Decimal,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub address: Address,
    pub balance: Decimal,
    pub history_source: HistorySource,
    pub transactions: Vec<ScanTransaction>,
    pub total_sent: Decimal,
    pub total_received: Decimal,
    pub sent_count: usize,
    pub received_count: usize,
    pub top_recipients: Vec<RecipientTotal>,
    /// Payments of average size the current balance still covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runway: Option<u64>,
}

/// On-chain facts about a single transaction. Only `hash`, `found` and
/// `confirmed` are set when the chain does not know the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxVerification {
    pub hash: H256,
    pub found: bool,
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TxVerification {
    pub fn not_found(hash: H256) -> Self {
        Self {
            hash,
            found: false,
            confirmed: false,
            success: None,
            from: None,
            to: None,
            amount: None,
            block_number: None,
            confirmations: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub address: Address,
    /// Spend the chain shows but the local log never recorded.
    pub on_chain_only: Vec<ScanTransaction>,
    /// Logged payments with no matching on-chain transfer.
    pub local_only: Vec<TransactionLogEntry>,
    pub matched: usize,
    /// The explorer window ended before the start of history; local entries
    /// older than the oldest fetched transfer were left out of the comparison.
    #[serde(default)]
    pub history_truncated: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.on_chain_only.is_empty() && self.local_only.is_empty()
    }
}
