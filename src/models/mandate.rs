//! AP2 mandates: the signed Intent, Cart and Payment documents of a
//! multi-party purchase, plus the receipt and audit record they produce.

use crate::error::{CommerceError, Result};
use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, H256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::amount::TOKEN_DECIMALS;

pub fn intent_ttl() -> Duration {
    Duration::minutes(30)
}

pub fn cart_ttl() -> Duration {
    Duration::minutes(5)
}

/// A document signed over the digest of its own core fields.
///
/// The core fields are the serialized mandate minus `signature`; the digest is
/// keccak256 of their canonical JSON (keys sorted at every level), so
/// signatures do not depend on field order.
pub trait Mandate: Serialize {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn signature(&self) -> Option<&str>;
    fn set_signature(&mut self, signature: String);

    fn core_fields(&self) -> Result<Value> {
        let mut value =
            serde_json::to_value(self).map_err(|e| CommerceError::Signing(e.to_string()))?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("signature");
        }
        Ok(value)
    }

    fn digest(&self) -> Result<[u8; 32]> {
        Ok(keccak256(canonical_json(&self.core_fields()?).as_bytes()))
    }
}

/// Serializes JSON with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentMandate {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchants: Option<BTreeSet<String>>,
    pub max_budget: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub requires_confirmation: bool,
    pub signed_by: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl IntentMandate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: &str,
        description: &str,
        merchants: Option<BTreeSet<String>>,
        max_budget: Decimal,
        currency: &str,
        signed_by: Address,
        requires_confirmation: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("intent_{}", Uuid::new_v4().simple()),
            agent_id: agent_id.to_string(),
            description: description.to_string(),
            merchants,
            max_budget,
            currency: currency.to_string(),
            created_at: now,
            expiry: now + intent_ttl(),
            requires_confirmation,
            signed_by,
            signature: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

impl Mandate for IntentMandate {
    const KIND: &'static str = "intent";

    fn id(&self) -> &str {
        &self.id
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_signature(&mut self, signature: String) {
        self.signature = Some(signature);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: Decimal,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartMandate {
    pub id: String,
    pub intent_id: String,
    pub merchant_address: Address,
    pub merchant_name: String,
    pub items: Vec<CartItem>,
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub signed_by: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl CartMandate {
    /// Builds a quote the way a merchant would: total computed, 5 minute expiry.
    pub fn new(
        intent_id: &str,
        merchant_address: Address,
        merchant_name: &str,
        items: Vec<CartItem>,
        now: DateTime<Utc>,
    ) -> Self {
        let total = Self::compute_total(&items);
        Self {
            id: format!("cart_{}", Uuid::new_v4().simple()),
            intent_id: intent_id.to_string(),
            merchant_address,
            merchant_name: merchant_name.to_string(),
            items,
            total,
            created_at: now,
            expiry: now + cart_ttl(),
            signed_by: merchant_address,
            signature: None,
        }
    }

    /// Σ price × quantity at 6-decimal fixed point.
    pub fn compute_total(items: &[CartItem]) -> Decimal {
        items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum::<Decimal>()
            .round_dp(TOKEN_DECIMALS)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

impl Mandate for CartMandate {
    const KIND: &'static str = "cart";

    fn id(&self) -> &str {
        &self.id
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_signature(&mut self, signature: String) {
        self.signature = Some(signature);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMandate {
    pub id: String,
    pub cart_id: String,
    pub intent_id: String,
    pub payer_address: Address,
    pub payee_address: Address,
    pub amount: Decimal,
    pub currency: String,
    pub network: String,
    pub authorized_by: String,
    pub authorized_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl PaymentMandate {
    /// Binds payee and amount from an accepted cart.
    pub fn for_cart(
        cart: &CartMandate,
        payer_address: Address,
        currency: &str,
        network: &str,
        authorized_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("payment_{}", Uuid::new_v4().simple()),
            cart_id: cart.id.clone(),
            intent_id: cart.intent_id.clone(),
            payer_address,
            payee_address: cart.merchant_address,
            amount: cart.total,
            currency: currency.to_string(),
            network: network.to_string(),
            authorized_by: authorized_by.to_string(),
            authorized_at: now,
            signature: None,
        }
    }
}

impl Mandate for PaymentMandate {
    const KIND: &'static str = "payment";

    fn id(&self) -> &str {
        &self.id
    }
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }
    fn set_signature(&mut self, signature: String) {
        self.signature = Some(signature);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failed,
    Error,
}

/// Outcome of executing a [`PaymentMandate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MandateReceipt {
    pub id: String,
    pub payment_mandate_id: String,
    pub cart_mandate_id: String,
    pub intent_mandate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<H256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub settled_at: DateTime<Utc>,
    pub delivery_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_data: Option<Value>,
    /// The purchase was cancelled after the transfer had been broadcast.
    #[serde(default)]
    pub cancelled_after_payment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEvent {
    IntentCreated,
    CartReceived,
    PaymentAuthorized,
    PaymentSettled,
    PaymentFailed,
    DeliveryConfirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub event: TimelineEvent,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Full audit artifact of one mandate-based purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub intent: IntentMandate,
    pub cart: CartMandate,
    pub payment: PaymentMandate,
    pub receipt: MandateReceipt,
    pub timeline: Vec<TimelineEntry>,
}

impl TransactionRecord {
    /// Assembles the record; every timeline timestamp comes from a mandate or
    /// receipt field.
    pub fn new(
        intent: IntentMandate,
        cart: CartMandate,
        payment: PaymentMandate,
        receipt: MandateReceipt,
    ) -> Self {
        let mut timeline = vec![
            TimelineEntry {
                event: TimelineEvent::IntentCreated,
                timestamp: intent.created_at,
                actor: intent.agent_id.clone(),
                details: Some(format!(
                    "{} (budget {} {})",
                    intent.description, intent.max_budget, intent.currency
                )),
            },
            TimelineEntry {
                event: TimelineEvent::CartReceived,
                timestamp: cart.created_at,
                actor: cart.merchant_name.clone(),
                details: Some(format!("{} item(s), total {}", cart.items.len(), cart.total)),
            },
            TimelineEntry {
                event: TimelineEvent::PaymentAuthorized,
                timestamp: payment.authorized_at,
                actor: payment.authorized_by.clone(),
                details: Some(format!(
                    "{} {} to {:?}",
                    payment.amount, payment.currency, payment.payee_address
                )),
            },
        ];

        let settlement = match receipt.status {
            ReceiptStatus::Success => TimelineEntry {
                event: TimelineEvent::PaymentSettled,
                timestamp: receipt.settled_at,
                actor: payment.network.clone(),
                details: receipt.tx_hash.map(|h| format!("{:?}", h)),
            },
            ReceiptStatus::Failed | ReceiptStatus::Error => TimelineEntry {
                event: TimelineEvent::PaymentFailed,
                timestamp: receipt.settled_at,
                actor: payment.network.clone(),
                details: receipt.error_message.clone(),
            },
        };
        timeline.push(settlement);

        if receipt.delivery_confirmed {
            timeline.push(TimelineEntry {
                event: TimelineEvent::DeliveryConfirmed,
                timestamp: receipt.delivered_at.unwrap_or(receipt.settled_at),
                actor: cart.merchant_name.clone(),
                details: None,
            });
        }

        Self {
            intent,
            cart,
            payment,
            receipt,
            timeline,
        }
    }
}
