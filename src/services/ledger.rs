//! File-backed spend bookkeeping for one runtime directory.
//!
//! Three JSON documents live side by side:
//! - `daily-ledger.json`: today's payments, replaced on UTC day rollover
//! - `transaction-log.json`: every payment ever recorded, append-only
//! - `receipts.json`: mandate purchase records for audit export
//!
//! A file that cannot be parsed is moved aside (never deleted) and treated as
//! empty; [`Ledger::corruption_count`] exposes how often that happened.

use crate::error::Result;
use crate::models::{
    date_key, DailyLedger, DailySpending, PaymentRecord, TransactionLogEntry, TransactionRecord,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DAILY_LEDGER_FILE: &str = "daily-ledger.json";
pub const TRANSACTION_LOG_FILE: &str = "transaction-log.json";
pub const RECEIPTS_FILE: &str = "receipts.json";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Ledger {
    dir: PathBuf,
    write_lock: Mutex<()>,
    clock: Clock,
    corruptions: AtomicU64,
}

impl Ledger {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        tracing::info!(dir = %dir.display(), "Ledger opened");

        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            clock: Arc::new(Utc::now),
            corruptions: AtomicU64::new(0),
        })
    }

    /// Replaces the wall clock, used to pin "today".
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn corruption_count(&self) -> u64 {
        self.corruptions.load(Ordering::SeqCst)
    }

    pub async fn load_today(&self) -> DailyLedger {
        let _guard = self.write_lock.lock().await;
        self.read_today().await
    }

    /// Appends a payment to the permanent log and today's ledger; both are on
    /// disk when this returns. Recording the same hash twice is a no-op.
    pub async fn record(
        &self,
        to: Address,
        amount: Decimal,
        tx_hash: H256,
        currency: &str,
        memo: Option<&str>,
    ) -> Result<PaymentRecord> {
        let _guard = self.write_lock.lock().await;
        let now = self.now();

        let mut today = self.read_today().await;
        if let Some(existing) = today.payments.iter().find(|p| p.tx_hash == tx_hash) {
            tracing::warn!(tx_hash = ?tx_hash, "Payment already recorded, skipping");
            return Ok(existing.clone());
        }

        let mut log: Vec<TransactionLogEntry> =
            self.read_json(TRANSACTION_LOG_FILE).await.unwrap_or_default();
        if let Some(logged) = log.iter().find(|e| e.tx_hash == tx_hash) {
            let record = PaymentRecord {
                to: logged.to,
                amount: logged.amount,
                tx_hash,
                timestamp_iso: logged.timestamp,
            };
            // Logged but missing from today's ledger: only today's entries count.
            if date_key(logged.timestamp.date_naive()) == today.date_key {
                today.payments.push(record.clone());
                self.write_json(DAILY_LEDGER_FILE, &today).await?;
            }
            tracing::warn!(tx_hash = ?tx_hash, "Payment already in transaction log, skipping");
            return Ok(record);
        }
        log.push(TransactionLogEntry {
            tx_hash,
            to,
            amount,
            currency: currency.to_string(),
            timestamp: now,
            memo: memo.map(str::to_string),
        });
        self.write_json(TRANSACTION_LOG_FILE, &log).await?;

        let record = PaymentRecord {
            to,
            amount,
            tx_hash,
            timestamp_iso: now,
        };
        today.payments.push(record.clone());
        self.write_json(DAILY_LEDGER_FILE, &today).await?;

        tracing::info!(
            to = ?to,
            amount = %amount,
            tx_hash = ?tx_hash,
            daily_total = %today.total(),
            "Payment recorded"
        );

        Ok(record)
    }

    pub async fn daily_spending(&self, daily_limit: Decimal) -> DailySpending {
        let today = self.load_today().await;
        let total = today.total();
        DailySpending {
            date_key: today.date_key.clone(),
            total,
            count: today.count(),
            remaining: (daily_limit - total).max(Decimal::ZERO),
            daily_limit,
        }
    }

    pub async fn transaction_log(&self) -> Vec<TransactionLogEntry> {
        let _guard = self.write_lock.lock().await;
        self.read_json(TRANSACTION_LOG_FILE).await.unwrap_or_default()
    }

    pub async fn local_hashes(&self) -> HashSet<H256> {
        self.transaction_log()
            .await
            .into_iter()
            .map(|entry| entry.tx_hash)
            .collect()
    }

    pub async fn store_receipt(&self, record: &TransactionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut receipts: Vec<TransactionRecord> =
            self.read_json(RECEIPTS_FILE).await.unwrap_or_default();
        receipts.push(record.clone());
        self.write_json(RECEIPTS_FILE, &receipts).await
    }

    pub async fn receipts(&self) -> Vec<TransactionRecord> {
        let _guard = self.write_lock.lock().await;
        self.read_json(RECEIPTS_FILE).await.unwrap_or_default()
    }

    /// Looks a purchase up by any of its mandate or receipt ids.
    pub async fn find_receipt(&self, id: &str) -> Option<TransactionRecord> {
        self.receipts().await.into_iter().find(|r| {
            r.receipt.id == id || r.intent.id == id || r.cart.id == id || r.payment.id == id
        })
    }

    async fn read_today(&self) -> DailyLedger {
        let today = self.now().date_naive();
        match self.read_json::<DailyLedger>(DAILY_LEDGER_FILE).await {
            Some(ledger) if ledger.date_key == date_key(today) => ledger,
            Some(stale) => {
                tracing::info!(
                    previous = %stale.date_key,
                    previous_total = %stale.total(),
                    "Daily ledger rolled over"
                );
                DailyLedger::empty(today)
            }
            None => DailyLedger::empty(today),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                self.corruptions.fetch_add(1, Ordering::SeqCst);
                tracing::error!(file = %path.display(), error = %e, "Ledger file unreadable, treating as empty");
                return None;
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.corruptions.fetch_add(1, Ordering::SeqCst);
                let aside = self.dir.join(format!(
                    "{}.corrupt-{}",
                    name,
                    self.now().format("%Y%m%dT%H%M%S%.3f")
                ));
                if let Err(rename_err) = tokio::fs::rename(&path, &aside).await {
                    tracing::error!(file = %path.display(), error = %rename_err, "Could not preserve corrupted ledger file");
                }
                tracing::error!(
                    file = %path.display(),
                    preserved_as = %aside.display(),
                    error = %e,
                    "Ledger file corrupted, treating as empty"
                );
                None
            }
        }
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let json = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
