use crate::error::{CommerceError, Result};
use crate::models::{CartMandate, IntentMandate, PaymentMandate, PaymentReceipt, PROOF_HEADER};
use async_trait::async_trait;
use serde_json::Value;

/// The seller side of a mandate purchase.
#[async_trait]
pub trait MerchantGateway: Send + Sync {
    /// Asks the merchant to quote against `intent`.
    async fn request_cart(&self, service_url: &str, intent: &IntentMandate) -> Result<CartMandate>;

    /// Hands over payment proof; returns whatever the merchant delivers.
    async fn deliver(
        &self,
        service_url: &str,
        payment: &PaymentMandate,
        proof: &PaymentReceipt,
    ) -> Result<Option<Value>>;
}

/// Merchant reachable over HTTP at `{service_url}/cart` and `{service_url}/deliver`.
pub struct HttpMerchantGateway {
    client: reqwest::Client,
}

impl HttpMerchantGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(service_url: &str, path: &str) -> String {
        format!("{}/{}", service_url.trim_end_matches('/'), path)
    }
}

impl Default for HttpMerchantGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MerchantGateway for HttpMerchantGateway {
    async fn request_cart(&self, service_url: &str, intent: &IntentMandate) -> Result<CartMandate> {
        let url = Self::endpoint(service_url, "cart");
        let response = self
            .client
            .post(&url)
            .json(intent)
            .send()
            .await
            .map_err(|e| CommerceError::Merchant(format!("cart request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommerceError::Merchant(format!(
                "cart request returned {}: {}",
                status, body
            )));
        }

        let cart: CartMandate = response
            .json()
            .await
            .map_err(|e| CommerceError::Merchant(format!("unreadable cart: {}", e)))?;

        tracing::info!(
            cart_id = %cart.id,
            merchant = %cart.merchant_name,
            total = %cart.total,
            items = cart.items.len(),
            "Cart received"
        );
        Ok(cart)
    }

    async fn deliver(
        &self,
        service_url: &str,
        payment: &PaymentMandate,
        proof: &PaymentReceipt,
    ) -> Result<Option<Value>> {
        let url = Self::endpoint(service_url, "deliver");
        let response = self
            .client
            .post(&url)
            .header(PROOF_HEADER, proof.to_header()?)
            .json(payment)
            .send()
            .await
            .map_err(|e| CommerceError::Merchant(format!("delivery request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CommerceError::Merchant(format!(
                "delivery returned {}: {}",
                status, body
            )));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(
            serde_json::from_str(&body).unwrap_or(Value::String(body)),
        ))
    }
}
