use anyhow::{bail, Context, Result};
use ethers::types::Address;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Settlement chain
    pub rpc_url: String,
    pub rpc_fallback: Option<String>,
    pub chain_id: u64,
    pub network: String,
    pub usdc_address: Address,
    pub currency: String,

    // Agent identity
    pub agent_id: String,
    pub private_key: Option<String>,

    // Bookkeeping
    pub runtime_dir: PathBuf,

    // Safety
    pub hard_ceiling: Decimal,
    pub approval_timeout: Duration,

    // Verification
    pub explorer_api_url: String,
    pub explorer_api_key: Option<String>,
    pub min_confirmations: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            rpc_url: std::env::var("PAYMENT_RPC_URL").context("PAYMENT_RPC_URL required")?,
            rpc_fallback: std::env::var("PAYMENT_RPC_FALLBACK").ok(),
            chain_id: std::env::var("PAYMENT_CHAIN_ID")
                .unwrap_or_else(|_| "84532".to_string())
                .parse()
                .context("Invalid PAYMENT_CHAIN_ID")?,
            network: std::env::var("PAYMENT_NETWORK")
                .unwrap_or_else(|_| "base-sepolia".to_string()),
            usdc_address: Self::parse_address("USDC_ADDRESS")?,
            currency: std::env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "USDC".to_string()),

            agent_id: std::env::var("AGENT_ID").unwrap_or_else(|_| "agent".to_string()),
            private_key: std::env::var("AGENT_PRIVATE_KEY").ok(),

            runtime_dir: std::env::var("RUNTIME_DIR")
                .unwrap_or_else(|_| ".agent-commerce".to_string())
                .into(),

            hard_ceiling: Decimal::from_str(
                &std::env::var("HARD_CEILING_USD").unwrap_or_else(|_| "5.00".to_string()),
            )
            .context("Invalid HARD_CEILING_USD")?,
            approval_timeout: Duration::from_secs(
                std::env::var("APPROVAL_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .context("Invalid APPROVAL_TIMEOUT_SECS")?,
            ),

            explorer_api_url: std::env::var("EXPLORER_API_URL")
                .unwrap_or_else(|_| "https://api-sepolia.basescan.org/api".to_string()),
            explorer_api_key: std::env::var("EXPLORER_API_KEY").ok(),
            min_confirmations: std::env::var("MIN_CONFIRMATIONS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid MIN_CONFIRMATIONS")?,
        };

        config.validate()?;
        Ok(config)
    }

    fn parse_address(var: &str) -> Result<Address> {
        let addr_str = std::env::var(var).with_context(|| format!("{} required", var))?;
        Address::from_str(&addr_str).with_context(|| format!("Invalid address for {}", var))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rpc_url.starts_with("http") {
            bail!("PAYMENT_RPC_URL must be HTTP(S) URL");
        }
        if !self.explorer_api_url.starts_with("http") {
            bail!("EXPLORER_API_URL must be HTTP(S) URL");
        }
        if let Some(key) = &self.private_key {
            if !key.starts_with("0x") {
                bail!("AGENT_PRIVATE_KEY must start with 0x");
            }
        }
        if self.hard_ceiling <= Decimal::ZERO {
            bail!("HARD_CEILING_USD must be positive");
        }
        if self.approval_timeout.is_zero() {
            bail!("APPROVAL_TIMEOUT_SECS must be at least 1");
        }

        tracing::info!(
            network = %self.network,
            chain_id = self.chain_id,
            runtime_dir = %self.runtime_dir.display(),
            "Configuration validated"
        );

        Ok(())
    }
}
