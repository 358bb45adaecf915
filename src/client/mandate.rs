//! AP2 purchase: Intent → Cart → Payment → Receipt.

use crate::client::merchant::MerchantGateway;
use crate::client::payment::{Authorization, PaymentClient, SettlementRequest};
use crate::client::signer::{sign_mandate, verify_mandate};
use crate::error::{CommerceError, Result};
use crate::models::{
    CartMandate, IntentMandate, Mandate, MandateReceipt, PaymentMandate, ReceiptStatus,
    TransactionRecord,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct MandateFlow {
    payments: Arc<PaymentClient>,
    merchant: Arc<dyn MerchantGateway>,
}

impl MandateFlow {
    pub fn new(payments: Arc<PaymentClient>, merchant: Arc<dyn MerchantGateway>) -> Self {
        Self { payments, merchant }
    }

    pub async fn purchase(
        &self,
        description: &str,
        service_url: &str,
        merchant_name: Option<&str>,
        max_budget: Decimal,
    ) -> Result<TransactionRecord> {
        self.purchase_with_cancel(
            description,
            service_url,
            merchant_name,
            max_budget,
            &CancellationToken::new(),
        )
        .await
    }

    /// Runs the whole purchase. Validation, policy and approval failures are
    /// returned as errors before any payment mandate exists. Once a payment
    /// mandate is signed the outcome is a record whose receipt status says
    /// whether money moved.
    pub async fn purchase_with_cancel(
        &self,
        description: &str,
        service_url: &str,
        merchant_name: Option<&str>,
        max_budget: Decimal,
        cancel: &CancellationToken,
    ) -> Result<TransactionRecord> {
        let ctx = self.payments.context();
        let config = &ctx.config;
        let signer = ctx.signer.as_ref();

        let merchants = merchant_name.map(|name| BTreeSet::from([name.to_string()]));
        let mut intent = IntentMandate::new(
            &config.agent_id,
            description,
            merchants,
            max_budget,
            &config.currency,
            signer.address(),
            false,
            ctx.ledger.now(),
        );
        sign_mandate(signer, &mut intent).await?;
        tracing::info!(intent_id = %intent.id, %max_budget, service_url, "Intent created");

        let cart = self.merchant.request_cart(service_url, &intent).await?;
        validate_cart(&intent, &cart, ctx.ledger.now())?;

        let spend = ctx.spend_lock().await;

        self.payments
            .authorize(
                &Authorization {
                    recipient: cart.merchant_address,
                    amount: cart.total,
                    action: "mandate_purchase".to_string(),
                    description: format!(
                        "Buy \"{}\" from {} for {} {}",
                        intent.description, cart.merchant_name, cart.total, config.currency
                    ),
                    metadata: json!({
                        "intentId": intent.id,
                        "cartId": cart.id,
                        "merchant": cart.merchant_name,
                        "merchantAddress": cart.merchant_address,
                        "total": cart.total,
                        "currency": config.currency,
                        "items": cart.items,
                    }),
                },
                cancel,
            )
            .await?;

        if cancel.is_cancelled() {
            return Err(CommerceError::ApprovalCancelled {
                action: "mandate_purchase".to_string(),
            });
        }

        let mut payment = PaymentMandate::for_cart(
            &cart,
            signer.address(),
            &config.currency,
            &config.network,
            &config.agent_id,
            ctx.ledger.now(),
        );
        sign_mandate(signer, &mut payment).await?;

        let settled = self
            .payments
            .settle(&SettlementRequest {
                recipient: payment.payee_address,
                amount: payment.amount,
                currency: payment.currency.clone(),
                memo: Some(format!("mandate {}", payment.id)),
            })
            .await;
        drop(spend);

        let mut receipt = MandateReceipt {
            id: format!("receipt_{}", Uuid::new_v4().simple()),
            payment_mandate_id: payment.id.clone(),
            cart_mandate_id: cart.id.clone(),
            intent_mandate_id: intent.id.clone(),
            tx_hash: None,
            block_number: None,
            status: ReceiptStatus::Success,
            error_message: None,
            settled_at: ctx.ledger.now(),
            delivery_confirmed: false,
            delivered_at: None,
            delivery_data: None,
            cancelled_after_payment: false,
        };

        match settled {
            Ok(settlement) => {
                receipt.tx_hash = Some(settlement.receipt.tx_hash);
                receipt.block_number = settlement.block_number;
                if cancel.is_cancelled() {
                    receipt.cancelled_after_payment = true;
                    tracing::error!(
                        payment_id = %payment.id,
                        tx_hash = ?settlement.receipt.tx_hash,
                        "Purchase cancelled after payment was broadcast; completing delivery"
                    );
                }

                match self
                    .merchant
                    .deliver(service_url, &payment, &settlement.receipt)
                    .await
                {
                    Ok(data) => {
                        receipt.delivery_confirmed = true;
                        receipt.delivered_at = Some(ctx.ledger.now());
                        receipt.delivery_data = data;
                    }
                    Err(e) => {
                        tracing::warn!(
                            payment_id = %payment.id,
                            tx_hash = ?settlement.receipt.tx_hash,
                            error = %e,
                            "Paid but delivery not confirmed"
                        );
                    }
                }
            }
            Err(e) => {
                receipt.status = match e {
                    CommerceError::Settlement { .. } => ReceiptStatus::Failed,
                    _ => ReceiptStatus::Error,
                };
                receipt.error_message = Some(e.to_string());
                tracing::warn!(payment_id = %payment.id, status = ?receipt.status, error = %e, "Mandate payment not settled");
            }
        }

        let record = TransactionRecord::new(intent, cart, payment, receipt);
        if let Err(e) = ctx.ledger.store_receipt(&record).await {
            tracing::error!(receipt_id = %record.receipt.id, error = %e, "Purchase record could not be stored");
        }

        tracing::info!(
            receipt_id = %record.receipt.id,
            status = ?record.receipt.status,
            delivered = record.receipt.delivery_confirmed,
            "Mandate purchase finished"
        );
        Ok(record)
    }
}

/// Checks a merchant's cart against the intent it answers. Nothing is signed
/// or paid when this fails.
pub fn validate_cart(intent: &IntentMandate, cart: &CartMandate, now: DateTime<Utc>) -> Result<()> {
    if intent.is_expired(now) {
        return Err(CommerceError::MandateExpired {
            kind: IntentMandate::KIND,
            id: intent.id.clone(),
            expired_at: intent.expiry,
        });
    }
    if cart.intent_id != intent.id {
        return Err(CommerceError::MandateMismatch(format!(
            "cart {} answers intent {}, expected {}",
            cart.id, cart.intent_id, intent.id
        )));
    }
    if cart.is_expired(now) {
        return Err(CommerceError::MandateExpired {
            kind: CartMandate::KIND,
            id: cart.id.clone(),
            expired_at: cart.expiry,
        });
    }

    let expected = CartMandate::compute_total(&cart.items);
    if cart.total != expected {
        return Err(CommerceError::MandateMismatch(format!(
            "cart total {} does not match items ({})",
            cart.total, expected
        )));
    }

    if cart.signature.is_some() && !verify_mandate(cart, cart.signed_by)? {
        return Err(CommerceError::MandateMismatch(format!(
            "cart {} signature does not match signer {:?}",
            cart.id, cart.signed_by
        )));
    }

    if let Some(merchants) = &intent.merchants {
        if !merchants.contains(&cart.merchant_name) {
            return Err(CommerceError::MandateMismatch(format!(
                "merchant {} is not allowed by the intent",
                cart.merchant_name
            )));
        }
    }

    if cart.total > intent.max_budget {
        return Err(CommerceError::BudgetExceeded {
            total: cart.total,
            budget: intent.max_budget,
        });
    }

    Ok(())
}
