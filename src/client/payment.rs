//! x402 client: fetch a resource, and when the seller answers 402, pay the
//! challenge in the settlement asset and retry once with proof.

use crate::client::ApprovalRequest;
use crate::context::CommerceContext;
use crate::error::{CommerceError, Result};
use crate::models::{
    from_token_units, to_token_units, PaymentChallenge, PaymentReceipt, PolicyDecision,
    PROOF_HEADER, TOKEN_DECIMALS,
};
use ethers::types::Address;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: String,
    /// Present when a payment was made for this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentReceipt>,
    pub cancelled_after_payment: bool,
}

/// What to approve before money moves.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub recipient: Address,
    pub amount: Decimal,
    pub action: String,
    pub description: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub recipient: Address,
    pub amount: Decimal,
    pub currency: String,
    pub memo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub receipt: PaymentReceipt,
    pub block_number: Option<u64>,
}

pub struct PaymentClient {
    ctx: Arc<CommerceContext>,
    http: reqwest::Client,
}

impl PaymentClient {
    pub fn new(ctx: Arc<CommerceContext>) -> Self {
        Self {
            ctx,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn context(&self) -> &Arc<CommerceContext> {
        &self.ctx
    }

    pub async fn fetch(&self, url: &str, options: FetchOptions, reason: &str) -> Result<FetchOutcome> {
        self.fetch_with_cancel(url, options, reason, &CancellationToken::new())
            .await
    }

    /// Cancellation is honoured up to broadcast. Once money has moved the
    /// flow completes and the outcome carries `cancelled_after_payment`.
    pub async fn fetch_with_cancel(
        &self,
        url: &str,
        options: FetchOptions,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let first = self.send(url, &options, None).await?;
        if first.status() != StatusCode::PAYMENT_REQUIRED {
            return Self::outcome(first, None, false).await;
        }

        let challenge = PaymentChallenge::from_headers(first.headers())?;
        self.check_challenge(&challenge)?;

        tracing::info!(
            url,
            amount = %challenge.amount,
            currency = %challenge.currency,
            recipient = ?challenge.recipient,
            "Payment required"
        );

        let settlement = {
            let _spend = self.ctx.spend_lock().await;

            let description = format!(
                "Pay {} {} to {:?} for {}",
                challenge.amount, challenge.currency, challenge.recipient, url
            );
            self.authorize(
                &Authorization {
                    recipient: challenge.recipient,
                    amount: challenge.amount,
                    action: "x402_payment".to_string(),
                    description,
                    metadata: json!({
                        "amount": challenge.amount,
                        "currency": challenge.currency,
                        "recipient": challenge.recipient,
                        "url": url,
                        "reason": reason,
                    }),
                },
                cancel,
            )
            .await?;

            if cancel.is_cancelled() {
                return Err(CommerceError::ApprovalCancelled {
                    action: "x402_payment".to_string(),
                });
            }

            self.settle(&SettlementRequest {
                recipient: challenge.recipient,
                amount: challenge.amount,
                currency: challenge.currency.clone(),
                memo: Some(format!("x402 {}: {}", url, reason)),
            })
            .await?
        };

        let receipt = settlement.receipt;
        let cancelled_after_payment = cancel.is_cancelled();
        if cancelled_after_payment {
            tracing::error!(
                tx_hash = ?receipt.tx_hash,
                amount = %receipt.amount,
                "Fetch cancelled after payment was broadcast; completing delivery"
            );
        }

        let undelivered = |reason: String| CommerceError::PaidButUndelivered {
            tx_hash: receipt.tx_hash,
            amount: receipt.amount,
            reason,
        };

        let proof = receipt.to_header().map_err(|e| undelivered(e.to_string()))?;
        let retry = self
            .send(url, &options, Some(&proof))
            .await
            .map_err(|e| undelivered(e.to_string()))?;

        if retry.status() == StatusCode::PAYMENT_REQUIRED {
            tracing::error!(tx_hash = ?receipt.tx_hash, url, "Seller rejected payment proof");
            return Err(CommerceError::UnexpectedChallenge {
                tx_hash: receipt.tx_hash,
            });
        }

        let tx_hash = receipt.tx_hash;
        let amount = receipt.amount;
        Self::outcome(retry, Some(receipt), cancelled_after_payment)
            .await
            .map_err(|e| CommerceError::PaidButUndelivered {
                tx_hash,
                amount,
                reason: e.to_string(),
            })
    }

    /// Hard ceiling, policy and (when required) human approval. Callers hold
    /// the spend lock through the matching [`settle`](Self::settle).
    pub async fn authorize(
        &self,
        request: &Authorization,
        cancel: &CancellationToken,
    ) -> Result<PolicyDecision> {
        self.check_ceiling(request.amount)?;

        let decision = self
            .ctx
            .policy
            .check_payment(request.recipient, request.amount)
            .await;
        if !decision.allowed {
            let reason = decision.reason.clone().unwrap_or_default();
            tracing::warn!(recipient = ?request.recipient, amount = %request.amount, %reason, "Payment denied by policy");
            return Err(CommerceError::PolicyDenied {
                recipient: request.recipient,
                amount: request.amount,
                reason,
            });
        }

        if decision.requires_approval {
            self.ctx
                .approvals
                .request(
                    &ApprovalRequest {
                        action: request.action.clone(),
                        description: request.description.clone(),
                        metadata: request.metadata.clone(),
                    },
                    cancel,
                )
                .await?;
        }

        Ok(decision)
    }

    /// Moves the funds and books them. A ledger failure after broadcast is
    /// logged, never returned: the transfer happened either way.
    pub async fn settle(&self, request: &SettlementRequest) -> Result<Settlement> {
        self.check_ceiling(request.amount)?;
        let units = to_token_units(request.amount, TOKEN_DECIMALS)?;

        let signer = &self.ctx.signer;
        let balance = signer.balance().await?;
        if balance < units {
            let available = from_token_units(balance, TOKEN_DECIMALS)?;
            tracing::warn!(required = %request.amount, %available, "Insufficient balance");
            return Err(CommerceError::InsufficientBalance {
                required: request.amount,
                available,
            });
        }

        let outcome = signer
            .transfer(request.recipient, units)
            .await
            .map_err(|e| CommerceError::Settlement {
                recipient: request.recipient,
                amount: request.amount,
                reason: e.to_string(),
            })?;

        let receipt = PaymentReceipt {
            tx_hash: outcome.tx_hash,
            amount: request.amount,
            currency: request.currency.clone(),
            recipient: request.recipient,
            payer: signer.address(),
            timestamp_ms: self.ctx.ledger.now().timestamp_millis(),
        };

        tracing::info!(
            tx_hash = ?receipt.tx_hash,
            amount = %receipt.amount,
            recipient = ?receipt.recipient,
            block = ?outcome.block_number,
            "Payment settled"
        );

        if let Err(e) = self
            .ctx
            .policy
            .record_payment(
                request.recipient,
                request.amount,
                outcome.tx_hash,
                &request.currency,
                request.memo.as_deref(),
            )
            .await
        {
            tracing::error!(tx_hash = ?outcome.tx_hash, error = %e, "Settled payment could not be recorded");
        }

        Ok(Settlement {
            receipt,
            block_number: outcome.block_number,
        })
    }

    fn check_ceiling(&self, amount: Decimal) -> Result<()> {
        let ceiling = self.ctx.config.hard_ceiling;
        if amount > ceiling {
            return Err(CommerceError::CeilingExceeded { amount, ceiling });
        }
        Ok(())
    }

    fn check_challenge(&self, challenge: &PaymentChallenge) -> Result<()> {
        let config = &self.ctx.config;
        if !challenge.currency.eq_ignore_ascii_case(&config.currency) {
            return Err(CommerceError::MalformedChallenge(format!(
                "unsupported currency {} (this agent pays in {})",
                challenge.currency, config.currency
            )));
        }
        if challenge.network != config.network {
            return Err(CommerceError::MalformedChallenge(format!(
                "unsupported network {} (this agent settles on {})",
                challenge.network, config.network
            )));
        }
        // An amount the token cannot represent can never be paid.
        to_token_units(challenge.amount, TOKEN_DECIMALS)
            .map_err(|e| CommerceError::MalformedChallenge(e.to_string()))?;
        Ok(())
    }

    async fn send(
        &self,
        url: &str,
        options: &FetchOptions,
        proof: Option<&str>,
    ) -> reqwest::Result<Response> {
        let mut request = self
            .http
            .request(options.method.clone(), url)
            .headers(options.headers.clone());
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }
        if let Some(proof) = proof {
            request = request.header(PROOF_HEADER, proof);
        }
        request.send().await
    }

    async fn outcome(
        response: Response,
        payment: Option<PaymentReceipt>,
        cancelled_after_payment: bool,
    ) -> Result<FetchOutcome> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        Ok(FetchOutcome {
            status,
            content_type,
            body,
            payment,
            cancelled_after_payment,
        })
    }
}
