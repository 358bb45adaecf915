#![allow(dead_code)]

use agent_commerce::{
    client::{
        sign_mandate, ApprovalChannel, ApprovalGate, MerchantGateway, PaymentSigner,
        TransferOutcome,
    },
    config::Config,
    models::{
        to_token_units, CartItem, CartMandate, CommercePolicy, IntentMandate, PaymentMandate,
        PaymentReceipt, TOKEN_DECIMALS,
    },
    services::{Ledger, PolicyEngine},
    CommerceContext, CommerceError, Result,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const AGENT_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const MERCHANT_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

pub fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn policy(max: &str, daily: &str, auto: &str) -> CommercePolicy {
    CommercePolicy {
        max_per_transaction: d(max),
        daily_limit: d(daily),
        auto_approve_below: d(auto),
        ..CommercePolicy::default()
    }
}

/// In-memory wallet: real signatures, simulated balance and transfers.
pub struct MockSigner {
    wallet: LocalWallet,
    balance: Mutex<U256>,
    transfers: Mutex<Vec<(Address, U256)>>,
    fail_transfers: AtomicBool,
    cancel_on_transfer: Mutex<Option<CancellationToken>>,
}

impl MockSigner {
    pub fn new(key: &str, balance: &str) -> Self {
        Self {
            wallet: LocalWallet::from_str(key).unwrap(),
            balance: Mutex::new(to_token_units(d(balance), TOKEN_DECIMALS).unwrap()),
            transfers: Mutex::new(Vec::new()),
            fail_transfers: AtomicBool::new(false),
            cancel_on_transfer: Mutex::new(None),
        }
    }

    pub fn transfers(&self) -> Vec<(Address, U256)> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn fail_transfers(&self) {
        self.fail_transfers.store(true, Ordering::SeqCst);
    }

    /// Cancels `token` while the next transfer is being broadcast.
    pub fn cancel_on_transfer(&self, token: CancellationToken) {
        *self.cancel_on_transfer.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl PaymentSigner for MockSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature> {
        self.wallet
            .sign_message(message)
            .await
            .map_err(|e| CommerceError::Signing(e.to_string()))
    }

    async fn balance(&self) -> Result<U256> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn transfer(&self, to: Address, units: U256) -> Result<TransferOutcome> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(CommerceError::Chain("execution reverted".to_string()));
        }
        if let Some(token) = self.cancel_on_transfer.lock().unwrap().take() {
            token.cancel();
        }
        let mut transfers = self.transfers.lock().unwrap();
        transfers.push((to, units));
        *self.balance.lock().unwrap() -= units;
        let n = transfers.len() as u64;
        Ok(TransferOutcome {
            tx_hash: H256::from(keccak256(format!("tx-{}", n))),
            block_number: Some(100 + n),
        })
    }
}

/// Answers every request the same way; `None` never answers.
pub struct Approver {
    answer: Option<bool>,
    calls: AtomicUsize,
}

impl Approver {
    pub fn yes() -> Self {
        Self::new(Some(true))
    }

    pub fn no() -> Self {
        Self::new(Some(false))
    }

    pub fn silent() -> Self {
        Self::new(None)
    }

    fn new(answer: Option<bool>) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalChannel for Approver {
    async fn request_approval(&self, _: &str, _: &str, _: &Value) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            Some(answer) => Ok(answer),
            None => std::future::pending().await,
        }
    }
}

pub fn config(dir: &TempDir) -> Config {
    Config {
        rpc_url: "http://localhost:8545".to_string(),
        rpc_fallback: None,
        chain_id: 84532,
        network: "base-sepolia".to_string(),
        usdc_address: Address::repeat_byte(0x11),
        currency: "USDC".to_string(),
        agent_id: "test-agent".to_string(),
        private_key: None,
        runtime_dir: dir.path().to_path_buf(),
        hard_ceiling: d("5.00"),
        approval_timeout: Duration::from_millis(100),
        explorer_api_url: "http://localhost:1/api".to_string(),
        explorer_api_key: None,
        min_confirmations: 0,
    }
}

pub struct Harness {
    pub ctx: Arc<CommerceContext>,
    pub signer: Arc<MockSigner>,
    pub approver: Arc<Approver>,
    pub dir: TempDir,
}

pub async fn harness(policy: CommercePolicy, balance: &str, approver: Approver) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let ledger = Arc::new(Ledger::open(dir.path()).await.unwrap());
    let engine = Arc::new(PolicyEngine::new(policy, ledger.clone()));
    let signer = Arc::new(MockSigner::new(AGENT_KEY, balance));
    let approver = Arc::new(approver);
    let approvals = ApprovalGate::new(approver.clone(), config.approval_timeout);

    let ctx = CommerceContext::new(config, ledger, engine, signer.clone(), approvals);
    Harness {
        ctx,
        signer,
        approver,
        dir,
    }
}

/// Quotes a single item, optionally signing the cart with its own key.
pub struct MockMerchant {
    pub name: String,
    pub price: Decimal,
    pub signer: Option<MockSigner>,
    pub expires_in: ChronoDuration,
    pub delivered: Mutex<Vec<(PaymentMandate, PaymentReceipt)>>,
}

impl MockMerchant {
    pub fn new(name: &str, price: &str) -> Self {
        Self {
            name: name.to_string(),
            price: d(price),
            signer: Some(MockSigner::new(MERCHANT_KEY, "0")),
            expires_in: ChronoDuration::minutes(5),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.signer
            .as_ref()
            .map(|s| s.address())
            .unwrap_or_else(|| Address::repeat_byte(0x22))
    }
}

#[async_trait]
impl MerchantGateway for MockMerchant {
    async fn request_cart(&self, _: &str, intent: &IntentMandate) -> Result<CartMandate> {
        let now = Utc::now();
        let mut cart = CartMandate::new(
            &intent.id,
            self.address(),
            &self.name,
            vec![CartItem {
                name: "dataset".to_string(),
                description: intent.description.clone(),
                price: self.price,
                quantity: 1,
            }],
            now,
        );
        cart.expiry = now + self.expires_in;
        if let Some(signer) = &self.signer {
            sign_mandate(signer, &mut cart).await?;
        }
        Ok(cart)
    }

    async fn deliver(
        &self,
        _: &str,
        payment: &PaymentMandate,
        proof: &PaymentReceipt,
    ) -> Result<Option<Value>> {
        self.delivered
            .lock()
            .unwrap()
            .push((payment.clone(), proof.clone()));
        Ok(Some(json!({"download": "https://merchant.example/dataset.csv"})))
    }
}
