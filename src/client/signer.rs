//! The agent's wallet: signs mandates and moves the settlement asset.

use crate::contracts::IERC20;
use crate::error::{CommerceError, Result};
use crate::models::Mandate;
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, Signature, H256, U256},
};
use std::str::FromStr;
use std::sync::Arc;

/// A confirmed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
}

#[async_trait]
pub trait PaymentSigner: Send + Sync {
    fn address(&self) -> Address;

    /// EIP-191 personal-message signature over `message`.
    async fn sign(&self, message: &[u8]) -> Result<Signature>;

    /// Settlement-asset balance in token units.
    async fn balance(&self) -> Result<U256>;

    /// Broadcasts an asset transfer and waits for a successful receipt.
    async fn transfer(&self, to: Address, units: U256) -> Result<TransferOutcome>;
}

/// Local private key plus an HTTP provider, sending through the ERC-20
/// `transfer` of the configured asset.
pub struct WalletSigner {
    provider: Arc<SignerMiddleware<Provider<Http>, LocalWallet>>,
    wallet: LocalWallet,
    usdc_address: Address,
}

impl WalletSigner {
    pub fn new(
        rpc_url: &str,
        private_key: &str,
        chain_id: u64,
        usdc_address: Address,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| CommerceError::Chain(format!("invalid RPC url {}: {}", rpc_url, e)))?;

        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| CommerceError::Signing(format!("invalid private key: {}", e)))?
            .with_chain_id(chain_id);

        let provider = Arc::new(SignerMiddleware::new(provider, wallet.clone()));

        tracing::info!(address = ?wallet.address(), chain_id, "Wallet signer ready");

        Ok(Self {
            provider,
            wallet,
            usdc_address,
        })
    }
}

#[async_trait]
impl PaymentSigner for WalletSigner {
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
        let usdc = IERC20::new(self.usdc_address, self.provider.clone());
        usdc.balance_of(self.address())
            .call()
            .await
            .map_err(|e| CommerceError::Chain(format!("balanceOf failed: {}", e)))
    }

    async fn transfer(&self, to: Address, units: U256) -> Result<TransferOutcome> {
        let usdc = IERC20::new(self.usdc_address, self.provider.clone());

        let call = usdc.transfer(to, units);
        let pending = call
            .send()
            .await
            .map_err(|e| CommerceError::Chain(format!("transfer not broadcast: {}", e)))?;
        let tx_hash = *pending;

        tracing::info!(tx_hash = ?tx_hash, to = ?to, units = %units, "Transfer broadcast, waiting for receipt");

        let receipt = pending
            .await
            .map_err(|e| CommerceError::Chain(format!("receipt for {:?} unavailable: {}", tx_hash, e)))?
            .ok_or_else(|| CommerceError::Chain(format!("transaction {:?} dropped", tx_hash)))?;

        if receipt.status != Some(1u64.into()) {
            return Err(CommerceError::Chain(format!(
                "transaction {:?} reverted",
                receipt.transaction_hash
            )));
        }

        Ok(TransferOutcome {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()),
        })
    }
}

/// Signs the mandate's core-field digest and stores the `0x`-prefixed
/// signature on it.
pub async fn sign_mandate<M: Mandate + Send>(signer: &dyn PaymentSigner, mandate: &mut M) -> Result<()> {
    let digest = mandate.digest()?;
    let signature = signer.sign(&digest[..]).await?;
    mandate.set_signature(format!("0x{}", hex::encode(signature.to_vec())));

    tracing::debug!(kind = M::KIND, id = mandate.id(), signer = ?signer.address(), "Mandate signed");
    Ok(())
}

/// Whether the mandate carries a signature by `address` over its current
/// core fields. Unsigned mandates do not verify.
pub fn verify_mandate<M: Mandate>(mandate: &M, address: Address) -> Result<bool> {
    let Some(raw) = mandate.signature() else {
        return Ok(false);
    };
    let signature = Signature::from_str(raw)
        .map_err(|e| CommerceError::Signing(format!("unparseable {} signature: {}", M::KIND, e)))?;
    let digest = mandate.digest()?;
    Ok(signature.verify(&digest[..], address).is_ok())
}
