use crate::error::{CommerceError, Result};
use crate::models::{from_token_units, ScanTransaction, TOKEN_DECIMALS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

/// Indexed transfer history for an address, newest first.
#[async_trait]
pub trait ExplorerApi: Send + Sync {
    async fn token_transfers(
        &self,
        address: Address,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ScanTransaction>>;
}

/// Etherscan-compatible `account/tokentx` client (Basescan and friends).
pub struct EtherscanExplorer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    token: Address,
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenTransfer {
    hash: String,
    from: String,
    to: String,
    value: String,
    time_stamp: String,
    block_number: String,
    #[serde(default)]
    is_error: Option<String>,
    #[serde(default)]
    token_decimal: Option<String>,
}

impl EtherscanExplorer {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, token: Address) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            token,
        }
    }

    fn parse_transfer(raw: TokenTransfer) -> Result<ScanTransaction> {
        let bad = |field: &str, value: &str| {
            CommerceError::Explorer(format!("invalid {} in explorer result: {}", field, value))
        };

        let decimals = match raw.token_decimal.as_deref() {
            Some(d) => d.parse().map_err(|_| bad("tokenDecimal", d))?,
            None => TOKEN_DECIMALS,
        };
        let units = U256::from_dec_str(&raw.value).map_err(|_| bad("value", &raw.value))?;
        let seconds: i64 = raw
            .time_stamp
            .parse()
            .map_err(|_| bad("timeStamp", &raw.time_stamp))?;

        Ok(ScanTransaction {
            hash: H256::from_str(&raw.hash).map_err(|_| bad("hash", &raw.hash))?,
            from: Address::from_str(&raw.from).map_err(|_| bad("from", &raw.from))?,
            to: Address::from_str(&raw.to).map_err(|_| bad("to", &raw.to))?,
            value: from_token_units(units, decimals)?,
            timestamp: DateTime::<Utc>::from_timestamp(seconds, 0)
                .ok_or_else(|| bad("timeStamp", &raw.time_stamp))?,
            block_number: raw
                .block_number
                .parse()
                .map_err(|_| bad("blockNumber", &raw.block_number))?,
            is_error: raw.is_error.as_deref() == Some("1"),
        })
    }
}

#[async_trait]
impl ExplorerApi for EtherscanExplorer {
    async fn token_transfers(
        &self,
        address: Address,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ScanTransaction>> {
        let mut query = vec![
            ("module", "account".to_string()),
            ("action", "tokentx".to_string()),
            ("contractaddress", format!("{:?}", self.token)),
            ("address", format!("{:?}", address)),
            ("page", page.to_string()),
            ("offset", page_size.to_string()),
            ("sort", "desc".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.clone()));
        }

        let response = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| CommerceError::Explorer(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CommerceError::Explorer(format!(
                "explorer returned {}",
                response.status()
            )));
        }

        let body: ExplorerResponse = response
            .json()
            .await
            .map_err(|e| CommerceError::Explorer(e.to_string()))?;

        match body.result {
            Value::Array(items) => {
                let transfers = items
                    .into_iter()
                    .map(|item| {
                        serde_json::from_value::<TokenTransfer>(item)
                            .map_err(|e| CommerceError::Explorer(e.to_string()))
                            .and_then(Self::parse_transfer)
                    })
                    .collect::<Result<Vec<_>>>()?;
                tracing::debug!(address = ?address, page, count = transfers.len(), "Explorer page fetched");
                Ok(transfers)
            }
            other => {
                // Etherscan reports "no results" as status 0 with an empty or
                // string result.
                if body.message.starts_with("No transactions found") {
                    Ok(Vec::new())
                } else {
                    Err(CommerceError::Explorer(format!(
                        "status {} ({}): {}",
                        body.status, body.message, other
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use rust_decimal::Decimal;

    const TOKEN: &str = "0x036cbd53842c5426634e7929541ec2318f3dcf7e";
    const WALLET: &str = "0x1111111111111111111111111111111111111111";

    #[tokio::test]
    async fn test_parses_etherscan_page() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "status": "1",
            "message": "OK",
            "result": [{
                "blockNumber": "1200",
                "timeStamp": "1760000000",
                "hash": format!("0x{}", "ab".repeat(32)),
                "from": WALLET,
                "to": "0x2222222222222222222222222222222222222222",
                "value": "250000",
                "tokenDecimal": "6"
            }]
        });
        let mock = server
            .mock("GET", "/api")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("action".into(), "tokentx".into()),
                Matcher::UrlEncoded("address".into(), WALLET.into()),
                Matcher::UrlEncoded("sort".into(), "desc".into()),
            ]))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let explorer = EtherscanExplorer::new(
            format!("{}/api", server.url()),
            None,
            Address::from_str(TOKEN).unwrap(),
        );
        let transfers = explorer
            .token_transfers(Address::from_str(WALLET).unwrap(), 1, 100)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].value, Decimal::new(25, 2));
        assert_eq!(transfers[0].block_number, 1200);
        assert!(!transfers[0].is_error);
    }

    #[tokio::test]
    async fn test_no_transactions_is_empty_and_errors_surface() {
        let mut server = mockito::Server::new_async().await;
        let _empty = server
            .mock("GET", "/empty")
            .match_query(Matcher::Any)
            .with_body(r#"{"status":"0","message":"No transactions found","result":[]}"#)
            .create_async()
            .await;
        let _denied = server
            .mock("GET", "/denied")
            .match_query(Matcher::Any)
            .with_body(r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#)
            .create_async()
            .await;

        let token = Address::from_str(TOKEN).unwrap();
        let wallet = Address::from_str(WALLET).unwrap();

        let empty = EtherscanExplorer::new(format!("{}/empty", server.url()), None, token);
        assert!(empty.token_transfers(wallet, 1, 10).await.unwrap().is_empty());

        let denied = EtherscanExplorer::new(format!("{}/denied", server.url()), None, token);
        let err = denied.token_transfers(wallet, 1, 10).await.unwrap_err();
        assert!(err.to_string().contains("Invalid API Key"));
    }
}
