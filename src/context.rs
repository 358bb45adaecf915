use crate::client::{ApprovalChannel, ApprovalGate, PaymentSigner, WalletSigner};
use crate::config::Config;
use crate::error::{CommerceError, Result};
use crate::services::{Ledger, PolicyEngine};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Everything a payment flow needs, built once per process.
pub struct CommerceContext {
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub policy: Arc<PolicyEngine>,
    pub signer: Arc<dyn PaymentSigner>,
    pub approvals: ApprovalGate,
    spend_lock: Mutex<()>,
}

impl CommerceContext {
    pub fn new(
        config: Config,
        ledger: Arc<Ledger>,
        policy: Arc<PolicyEngine>,
        signer: Arc<dyn PaymentSigner>,
        approvals: ApprovalGate,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ledger,
            policy,
            signer,
            approvals,
            spend_lock: Mutex::new(()),
        })
    }

    /// Opens the runtime directory and the configured wallet.
    pub async fn from_config(
        config: Config,
        channel: Arc<dyn ApprovalChannel>,
    ) -> Result<Arc<Self>> {
        let private_key = config
            .private_key
            .as_deref()
            .ok_or_else(|| CommerceError::Signing("AGENT_PRIVATE_KEY is not set".to_string()))?;

        let signer = WalletSigner::new(
            &config.rpc_url,
            private_key,
            config.chain_id,
            config.usdc_address,
        )?;
        let ledger = Arc::new(Ledger::open(&config.runtime_dir).await?);
        let policy = Arc::new(PolicyEngine::load(&config.runtime_dir, ledger.clone()).await?);
        let approvals = ApprovalGate::new(channel, config.approval_timeout);

        Ok(Self::new(config, ledger, policy, Arc::new(signer), approvals))
    }

    /// Held from the policy check through ledger recording, so two flows in
    /// this process never both pass the daily limit on the same total.
    pub async fn spend_lock(&self) -> MutexGuard<'_, ()> {
        self.spend_lock.lock().await
    }
}
