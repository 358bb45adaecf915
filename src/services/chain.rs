//! On-chain settlement checks and ledger reconciliation.

use crate::contracts::{transfer_topic, IERC20};
use crate::error::{CommerceError, Result};
use crate::models::{
    from_token_units, HistorySource, RecipientTotal, ReconcileReport, ScanSummary,
    ScanTransaction, TransactionLogEntry, TxVerification, TOKEN_DECIMALS,
};
use crate::services::{ExplorerApi, Ledger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::{
    providers::{Http, Middleware, Provider},
    types::{Address, Transaction, TransactionReceipt, H256, U256},
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Read access to the settlement chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>>;
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>>;
    async fn block_number(&self) -> Result<u64>;
    async fn block_timestamp(&self, number: u64) -> Result<Option<DateTime<Utc>>>;
    /// Settlement-asset balance in token units.
    async fn balance_of(&self, owner: Address) -> Result<U256>;
}

/// JSON-RPC reader with an optional fallback endpoint.
pub struct RpcChainReader {
    primary: Arc<Provider<Http>>,
    fallback: Option<Arc<Provider<Http>>>,
    token: Address,
}

impl RpcChainReader {
    pub fn new(rpc_url: &str, fallback_url: Option<&str>, token: Address) -> Result<Self> {
        let connect = |url: &str| {
            Provider::<Http>::try_from(url)
                .map(Arc::new)
                .map_err(|e| CommerceError::Chain(format!("invalid RPC url {}: {}", url, e)))
        };

        Ok(Self {
            primary: connect(rpc_url)?,
            fallback: fallback_url.map(connect).transpose()?,
            token,
        })
    }

    fn providers(&self) -> impl Iterator<Item = &Arc<Provider<Http>>> {
        std::iter::once(&self.primary).chain(self.fallback.iter())
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>> {
        let mut last_err = None;
        for provider in self.providers() {
            match provider.get_transaction(hash).await {
                Ok(tx) => return Ok(tx),
                Err(e) => {
                    tracing::warn!(error = %e, "RPC get_transaction failed, trying fallback");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Into::into).unwrap_or_else(no_provider))
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        let mut last_err = None;
        for provider in self.providers() {
            match provider.get_transaction_receipt(hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    tracing::warn!(error = %e, "RPC get_transaction_receipt failed, trying fallback");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Into::into).unwrap_or_else(no_provider))
    }

    async fn block_number(&self) -> Result<u64> {
        let mut last_err = None;
        for provider in self.providers() {
            match provider.get_block_number().await {
                Ok(number) => return Ok(number.as_u64()),
                Err(e) => {
                    tracing::warn!(error = %e, "RPC get_block_number failed, trying fallback");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Into::into).unwrap_or_else(no_provider))
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<DateTime<Utc>>> {
        let mut last_err = None;
        for provider in self.providers() {
            match provider.get_block(number).await {
                Ok(block) => {
                    return Ok(block.and_then(|b| {
                        DateTime::<Utc>::from_timestamp(b.timestamp.low_u64() as i64, 0)
                    }))
                }
                Err(e) => {
                    tracing::warn!(block = number, error = %e, "RPC get_block failed, trying fallback");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Into::into).unwrap_or_else(no_provider))
    }

    async fn balance_of(&self, owner: Address) -> Result<U256> {
        let mut last_err = String::new();
        for provider in self.providers() {
            let token = IERC20::new(self.token, provider.clone());
            match token.balance_of(owner).call().await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    tracing::warn!(owner = ?owner, error = %e, "balanceOf failed, trying fallback");
                    last_err = e.to_string();
                }
            }
        }
        Err(CommerceError::Chain(last_err))
    }
}

fn no_provider() -> CommerceError {
    CommerceError::Chain("no RPC provider configured".to_string())
}

/// A decoded ERC-20 `Transfer` event.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransfer {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// Finds the first `Transfer` log emitted by `token` in the receipt.
pub fn decode_token_transfer(receipt: &TransactionReceipt, token: Address) -> Option<TokenTransfer> {
    let topic = transfer_topic();
    receipt
        .logs
        .iter()
        .filter(|log| log.address == token)
        .find(|log| log.topics.first() == Some(&topic) && log.topics.len() >= 3)
        .filter(|log| log.data.len() == 32)
        .map(|log| TokenTransfer {
            from: Address::from(log.topics[1]),
            to: Address::from(log.topics[2]),
            amount: U256::from_big_endian(&log.data),
        })
}

pub struct ChainVerifier {
    chain: Arc<dyn ChainReader>,
    explorer: Arc<dyn ExplorerApi>,
    ledger: Arc<Ledger>,
    token: Address,
    wallet: Option<Address>,
    min_confirmations: u64,
    page_size: u32,
    max_pages: u32,
}

impl ChainVerifier {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        explorer: Arc<dyn ExplorerApi>,
        ledger: Arc<Ledger>,
        token: Address,
    ) -> Self {
        Self {
            chain,
            explorer,
            ledger,
            token,
            wallet: None,
            min_confirmations: 0,
            page_size: 100,
            max_pages: 10,
        }
    }

    /// The agent's own wallet: the only address the local log can stand in for.
    pub fn with_wallet(mut self, wallet: Address) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn with_min_confirmations(mut self, confirmations: u64) -> Self {
        self.min_confirmations = confirmations;
        self
    }

    pub fn with_paging(mut self, page_size: u32, max_pages: u32) -> Self {
        self.page_size = page_size.max(1);
        self.max_pages = max_pages.max(1);
        self
    }

    /// Checks a settlement against the chain. The amount comes from the token
    /// contract's own `Transfer` log, not from what was requested.
    pub async fn verify_transaction(&self, hash: H256) -> Result<TxVerification> {
        let (tx, receipt) = futures::try_join!(
            self.chain.transaction(hash),
            self.chain.transaction_receipt(hash)
        )?;

        let (Some(tx), Some(receipt)) = (tx, receipt) else {
            tracing::info!(tx_hash = ?hash, "Transaction not found on chain");
            return Ok(TxVerification::not_found(hash));
        };

        let success = receipt.status == Some(1u64.into());
        let transfer = decode_token_transfer(&receipt, self.token);
        let amount = transfer
            .as_ref()
            .map(|t| from_token_units(t.amount, TOKEN_DECIMALS))
            .transpose()?;

        let block_number = receipt.block_number.map(|n| n.as_u64());
        let (confirmations, timestamp) = match block_number {
            Some(block) => {
                let (latest, timestamp) = futures::try_join!(
                    self.chain.block_number(),
                    self.chain.block_timestamp(block)
                )?;
                (Some(latest.saturating_sub(block)), timestamp)
            }
            None => (None, None),
        };

        let confirmed = success
            && confirmations.is_some_and(|c| c >= self.min_confirmations);

        tracing::info!(
            tx_hash = ?hash,
            success,
            confirmed,
            confirmations = ?confirmations,
            amount = ?amount,
            "Transaction verified"
        );

        Ok(TxVerification {
            hash,
            found: true,
            confirmed,
            success: Some(success),
            from: Some(transfer.as_ref().map_or(tx.from, |t| t.from)),
            to: transfer.as_ref().map(|t| t.to).or(tx.to),
            amount,
            block_number,
            confirmations,
            timestamp,
        })
    }

    /// Balance, history and spending profile of `address`.
    pub async fn scan_wallet(&self, address: Address) -> Result<ScanSummary> {
        let (balance, history) =
            futures::join!(self.chain.balance_of(address), self.explorer_history(address));
        let balance = from_token_units(balance?, TOKEN_DECIMALS)?;

        let (transactions, source) = match history {
            Ok((txs, _)) => (txs, HistorySource::Explorer),
            Err(e) => {
                tracing::warn!(address = ?address, error = %e, "Explorer unreachable, using local ledger");
                (self.local_history(address).await, HistorySource::LocalLedger)
            }
        };

        Ok(summarize(address, balance, transactions, source))
    }

    /// Compares outgoing on-chain transfers with the local transaction log.
    /// The local log only describes the agent's own wallet; any other address
    /// is compared against an empty local side.
    pub async fn reconcile(&self, address: Address) -> Result<ReconcileReport> {
        let (history, truncated) = self.explorer_history(address).await?;
        let oldest = history.iter().map(|t| t.timestamp).min();
        let on_chain: Vec<ScanTransaction> = history
            .into_iter()
            .filter(|t| t.from == address && !t.is_error)
            .collect();

        let mut local = if self.wallet == Some(address) {
            self.ledger.transaction_log().await
        } else {
            tracing::info!(address = ?address, "Not the agent wallet, no local log to compare");
            Vec::new()
        };
        if truncated {
            if let Some(oldest) = oldest {
                local.retain(|e| e.timestamp >= oldest);
            }
            tracing::warn!(
                address = ?address,
                window = self.page_size as u64 * self.max_pages as u64,
                oldest = ?oldest,
                "Explorer history cut off, older local payments not compared"
            );
        }

        let mut report = reconcile_sets(address, on_chain, local);
        report.history_truncated = truncated;

        if report.is_clean() {
            tracing::info!(address = ?address, matched = report.matched, "Ledger reconciled");
        } else {
            tracing::warn!(
                address = ?address,
                matched = report.matched,
                on_chain_only = report.on_chain_only.len(),
                local_only = report.local_only.len(),
                "Ledger discrepancies found"
            );
        }
        Ok(report)
    }

    /// Newest-first transfers, and whether paging stopped at `max_pages`
    /// with more history possibly left.
    async fn explorer_history(&self, address: Address) -> Result<(Vec<ScanTransaction>, bool)> {
        let mut all = Vec::new();
        for page in 1..=self.max_pages {
            let batch = self
                .explorer
                .token_transfers(address, page, self.page_size)
                .await?;
            let done = batch.len() < self.page_size as usize;
            all.extend(batch);
            if done {
                return Ok((all, false));
            }
        }
        Ok((all, true))
    }

    async fn local_history(&self, address: Address) -> Vec<ScanTransaction> {
        if self.wallet != Some(address) {
            return Vec::new();
        }
        self.ledger
            .transaction_log()
            .await
            .into_iter()
            .map(|entry| ScanTransaction {
                hash: entry.tx_hash,
                from: address,
                to: entry.to,
                value: entry.amount,
                timestamp: entry.timestamp,
                block_number: 0,
                is_error: false,
            })
            .rev()
            .collect()
    }
}

pub fn summarize(
    address: Address,
    balance: Decimal,
    transactions: Vec<ScanTransaction>,
    source: HistorySource,
) -> ScanSummary {
    let mut total_sent = Decimal::ZERO;
    let mut total_received = Decimal::ZERO;
    let mut sent_count = 0usize;
    let mut received_count = 0usize;
    let mut per_recipient: BTreeMap<Address, (Decimal, usize)> = BTreeMap::new();

    for tx in transactions.iter().filter(|t| !t.is_error) {
        if tx.from == address {
            total_sent += tx.value;
            sent_count += 1;
            let entry = per_recipient.entry(tx.to).or_insert((Decimal::ZERO, 0));
            entry.0 += tx.value;
            entry.1 += 1;
        }
        if tx.to == address {
            total_received += tx.value;
            received_count += 1;
        }
    }

    let mut top_recipients: Vec<RecipientTotal> = per_recipient
        .into_iter()
        .map(|(recipient, (total, count))| RecipientTotal {
            recipient,
            total,
            count,
        })
        .collect();
    top_recipients.sort_by(|a, b| b.total.cmp(&a.total));
    top_recipients.truncate(5);

    let runway = if sent_count > 0 && total_sent > Decimal::ZERO {
        let average = total_sent / Decimal::from(sent_count);
        (balance / average).floor().to_u64()
    } else {
        None
    };

    ScanSummary {
        address,
        balance,
        history_source: source,
        transactions,
        total_sent,
        total_received,
        sent_count,
        received_count,
        top_recipients,
        runway,
    }
}

pub fn reconcile_sets(
    address: Address,
    on_chain: Vec<ScanTransaction>,
    local: Vec<TransactionLogEntry>,
) -> ReconcileReport {
    let local_hashes: HashSet<H256> = local.iter().map(|e| e.tx_hash).collect();

    let mut seen = HashSet::new();
    let on_chain: Vec<ScanTransaction> = on_chain
        .into_iter()
        .filter(|t| seen.insert(t.hash))
        .collect();
    let chain_hashes: HashSet<H256> = on_chain.iter().map(|t| t.hash).collect();

    let matched = chain_hashes.intersection(&local_hashes).count();
    let on_chain_only = on_chain
        .into_iter()
        .filter(|t| !local_hashes.contains(&t.hash))
        .collect();

    let mut local_seen = HashSet::new();
    let local_only = local
        .into_iter()
        .filter(|e| !chain_hashes.contains(&e.tx_hash))
        .filter(|e| local_seen.insert(e.tx_hash))
        .collect();

    ReconcileReport {
        address,
        on_chain_only,
        local_only,
        matched,
        history_truncated: false,
    }
}
