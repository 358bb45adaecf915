use chrono::{DateTime, NaiveDate, Utc};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub to: Address,
    pub amount: Decimal,
    pub tx_hash: H256,
    pub timestamp_iso: DateTime<Utc>,
}

/// Spend recorded during one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLedger {
    pub date_key: String,
    pub payments: Vec<PaymentRecord>,
}

impl DailyLedger {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date_key: date_key(date),
            payments: Vec::new(),
        }
    }

    pub fn total(&self) -> Decimal {
        self.payments.iter().map(|p| p.amount).sum()
    }

    pub fn count(&self) -> usize {
        self.payments.len()
    }
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Permanent log entry; survives daily rollover and feeds reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogEntry {
    pub tx_hash: H256,
    pub to: Address,
    pub amount: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySpending {
    pub date_key: String,
    pub total: Decimal,
    pub count: usize,
    pub remaining: Decimal,
    pub daily_limit: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_ledger_serializes_camel_case() {
        let ledger = DailyLedger::empty(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["dateKey"], "2026-03-09");
        assert!(json["payments"].as_array().unwrap().is_empty());
        assert_eq!(ledger.total(), Decimal::ZERO);
    }
}
