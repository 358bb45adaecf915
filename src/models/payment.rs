//! x402 wire types: the challenge carried by a 402 response and the proof
//! attached to the paid retry. Both travel as base64-encoded JSON headers.

use crate::error::{CommerceError, Result};
use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use ethers::types::{Address, H256};
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const CHALLENGE_HEADER: &str = "x-payment-required";
pub const PROOF_HEADER: &str = "x-payment";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    pub amount: Decimal,
    pub currency: String,
    pub recipient: Address,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facilitator_url: Option<String>,
}

impl PaymentChallenge {
    pub fn to_header(&self) -> Result<String> {
        encode_header(self)
    }

    pub fn from_header(value: &str) -> Result<Self> {
        let challenge: Self = decode_header(value).map_err(CommerceError::MalformedChallenge)?;
        if challenge.amount.is_sign_negative() {
            return Err(CommerceError::MalformedChallenge(format!(
                "negative amount {}",
                challenge.amount
            )));
        }
        Ok(challenge)
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let value = headers
            .get(CHALLENGE_HEADER)
            .ok_or(CommerceError::MissingChallenge)?
            .to_str()
            .map_err(|e| CommerceError::MalformedChallenge(e.to_string()))?;
        Self::from_header(value)
    }
}

/// Settlement-level receipt, sent back to the seller as payment proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub tx_hash: H256,
    pub amount: Decimal,
    pub currency: String,
    pub recipient: Address,
    pub payer: Address,
    pub timestamp_ms: i64,
}

impl PaymentReceipt {
    pub fn to_header(&self) -> Result<String> {
        encode_header(self)
    }

    pub fn from_header(value: &str) -> Result<Self> {
        decode_header(value).map_err(CommerceError::MalformedChallenge)
    }
}

fn encode_header<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(b64.encode(json))
}

fn decode_header<T: DeserializeOwned>(value: &str) -> std::result::Result<T, String> {
    let bytes = b64
        .decode(value.trim())
        .map_err(|e| format!("invalid base64: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON: {}", e))
}
