use agent_commerce::{
    client::{
        ApprovalChannel, DenyAll, FetchOptions, HttpMerchantGateway, MandateFlow, PaymentClient,
        TerminalApproval,
    },
    config::Config,
    models::{parse_usd, CommercePolicy},
    services::{ChainVerifier, EtherscanExplorer, Ledger, PolicyEngine, RpcChainReader},
    CommerceContext, CommerceError,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "agent-commerce", version, about = "Policy-gated payments for autonomous agents")]
struct Cli {
    /// Refuse every approval instead of prompting on the terminal.
    #[arg(long, global = true, env = "AGENT_UNATTENDED")]
    unattended: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a URL, paying an x402 challenge if the seller asks for one.
    PayAndFetch {
        url: String,
        #[arg(long, default_value = "agent request")]
        reason: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Extra request header as `Name: value`; repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
        #[arg(long)]
        body: Option<String>,
    },
    /// Today's spend against the daily limit.
    CheckBudget,
    /// The permanent payment log, newest first.
    AuditTrail {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Buy from a merchant through signed intent, cart and payment mandates.
    MandatePurchase {
        #[arg(long)]
        description: String,
        #[arg(long)]
        service_url: String,
        #[arg(long)]
        merchant: Option<String>,
        #[arg(long)]
        max_budget: String,
    },
    /// Stored mandate purchase records.
    GetReceipts {
        /// Any intent, cart, payment or receipt id.
        #[arg(long)]
        id: Option<String>,
    },
    VerifyTx {
        hash: String,
    },
    ScanWallet {
        /// Defaults to the agent's own wallet.
        #[arg(long)]
        address: Option<String>,
    },
    /// Compare on-chain outgoing transfers with the local payment log.
    Reconcile {
        #[arg(long)]
        address: Option<String>,
    },
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    Show,
    /// Replace individual fields; unspecified ones keep their current value.
    Set {
        #[arg(long)]
        max_per_transaction: Option<String>,
        #[arg(long)]
        daily_limit: Option<String>,
        #[arg(long)]
        auto_approve_below: Option<String>,
        #[arg(long = "whitelist")]
        whitelist: Vec<String>,
        #[arg(long = "blacklist")]
        blacklist: Vec<String>,
        #[arg(long = "unwhitelist")]
        unwhitelist: Vec<String>,
        #[arg(long = "unblacklist")]
        unblacklist: Vec<String>,
    },
}

#[derive(Serialize)]
struct ErrorOutput<'a> {
    error: &'a str,
    message: String,
    retryable: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing::info!("agent-commerce v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    match run(cli, config, &cancel).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<CommerceError>() {
            Some(commerce) => {
                print_json(&ErrorOutput {
                    error: commerce.code(),
                    message: commerce.to_string(),
                    retryable: commerce.is_retryable_with_new_request(),
                })?;
                std::process::exit(1);
            }
            None => Err(e),
        },
    }
}

async fn run(cli: Cli, config: Config, cancel: &CancellationToken) -> Result<()> {
    let channel: Arc<dyn ApprovalChannel> = if cli.unattended {
        Arc::new(DenyAll)
    } else {
        Arc::new(TerminalApproval)
    };

    match cli.command {
        Command::PayAndFetch {
            url,
            reason,
            method,
            headers,
            body,
        } => {
            let ctx = CommerceContext::from_config(config, channel).await?;
            let client = PaymentClient::new(ctx);
            let options = FetchOptions {
                method: Method::from_str(&method.to_uppercase())
                    .with_context(|| format!("Invalid HTTP method {}", method))?,
                headers: parse_headers(&headers)?,
                body: body.map(String::into_bytes),
            };
            let outcome = client.fetch_with_cancel(&url, options, &reason, cancel).await?;
            print_json(&outcome)
        }

        Command::CheckBudget => {
            let policy = open_policy(&config).await?;
            print_json(&policy.daily_spending().await)
        }

        Command::AuditTrail { limit } => {
            let ledger = Ledger::open(&config.runtime_dir).await?;
            let mut log = ledger.transaction_log().await;
            log.reverse();
            log.truncate(limit);
            print_json(&log)
        }

        Command::MandatePurchase {
            description,
            service_url,
            merchant,
            max_budget,
        } => {
            let max_budget = parse_usd(&max_budget)?;
            let ctx = CommerceContext::from_config(config, channel).await?;
            let flow = MandateFlow::new(
                Arc::new(PaymentClient::new(ctx)),
                Arc::new(HttpMerchantGateway::new()),
            );
            let record = flow
                .purchase_with_cancel(
                    &description,
                    &service_url,
                    merchant.as_deref(),
                    max_budget,
                    cancel,
                )
                .await?;
            print_json(&record)
        }

        Command::GetReceipts { id } => {
            let ledger = Ledger::open(&config.runtime_dir).await?;
            match id {
                Some(id) => {
                    let record = ledger
                        .find_receipt(&id)
                        .await
                        .with_context(|| format!("No receipt matches {}", id))?;
                    print_json(&record)
                }
                None => print_json(&ledger.receipts().await),
            }
        }

        Command::VerifyTx { hash } => {
            let hash = H256::from_str(&hash).with_context(|| format!("Invalid tx hash {}", hash))?;
            let verifier = build_verifier(&config).await?;
            print_json(&verifier.verify_transaction(hash).await?)
        }

        Command::ScanWallet { address } => {
            let address = target_address(&config, address.as_deref())?;
            let verifier = build_verifier(&config).await?;
            print_json(&verifier.scan_wallet(address).await?)
        }

        Command::Reconcile { address } => {
            let address = target_address(&config, address.as_deref())?;
            let verifier = build_verifier(&config).await?;
            print_json(&verifier.reconcile(address).await?)
        }

        Command::Policy { action } => {
            let engine = open_policy(&config).await?;
            match action {
                PolicyAction::Show => print_json(&engine.policy().await),
                PolicyAction::Set {
                    max_per_transaction,
                    daily_limit,
                    auto_approve_below,
                    whitelist,
                    blacklist,
                    unwhitelist,
                    unblacklist,
                } => {
                    let mut policy: CommercePolicy = engine.policy().await;
                    if let Some(v) = max_per_transaction {
                        policy.max_per_transaction = parse_usd(&v)?;
                    }
                    if let Some(v) = daily_limit {
                        policy.daily_limit = parse_usd(&v)?;
                    }
                    if let Some(v) = auto_approve_below {
                        policy.auto_approve_below = parse_usd(&v)?;
                    }
                    for a in &whitelist {
                        policy.whitelisted_recipients.insert(parse_address(a)?);
                    }
                    for a in &blacklist {
                        policy.blacklisted_recipients.insert(parse_address(a)?);
                    }
                    for a in &unwhitelist {
                        policy.whitelisted_recipients.remove(&parse_address(a)?);
                    }
                    for a in &unblacklist {
                        policy.blacklisted_recipients.remove(&parse_address(a)?);
                    }
                    engine.update_policy(policy).await?;
                    print_json(&engine.policy().await)
                }
            }
        }
    }
}

async fn open_policy(config: &Config) -> Result<PolicyEngine> {
    let ledger = Arc::new(Ledger::open(&config.runtime_dir).await?);
    Ok(PolicyEngine::load(&config.runtime_dir, ledger).await?)
}

async fn build_verifier(config: &Config) -> Result<ChainVerifier> {
    let chain = RpcChainReader::new(
        &config.rpc_url,
        config.rpc_fallback.as_deref(),
        config.usdc_address,
    )?;
    let explorer = EtherscanExplorer::new(
        config.explorer_api_url.clone(),
        config.explorer_api_key.clone(),
        config.usdc_address,
    );
    let ledger = Arc::new(Ledger::open(&config.runtime_dir).await?);

    let mut verifier = ChainVerifier::new(
        Arc::new(chain),
        Arc::new(explorer),
        ledger,
        config.usdc_address,
    )
    .with_min_confirmations(config.min_confirmations);
    if let Some(wallet) = agent_address(config)? {
        verifier = verifier.with_wallet(wallet);
    }
    Ok(verifier)
}

fn agent_address(config: &Config) -> Result<Option<Address>> {
    config
        .private_key
        .as_deref()
        .map(|key| {
            LocalWallet::from_str(key)
                .map(|w| w.address())
                .context("Invalid AGENT_PRIVATE_KEY")
        })
        .transpose()
}

fn target_address(config: &Config, explicit: Option<&str>) -> Result<Address> {
    match explicit {
        Some(a) => parse_address(a),
        None => agent_address(config)?
            .context("No --address given and AGENT_PRIVATE_KEY is not set"),
    }
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value).with_context(|| format!("Invalid address {}", value))
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in raw {
        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("Header must be `Name: value`, got {}", line))?;
        headers.insert(
            HeaderName::from_str(name.trim()).with_context(|| format!("Invalid header name {}", name))?,
            HeaderValue::from_str(value.trim()).with_context(|| format!("Invalid header value for {}", name))?,
        );
    }
    Ok(headers)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
