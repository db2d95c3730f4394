//! HTTP client for the Safe transaction service.
//!
//! Endpoints:
//! - POST /api/v1/safes/<safe>/multisig-transactions/
//! - GET /api/v1/safes/<safe>/multisig-transactions/
//! - GET /api/v1/multisig-transactions/<safe_tx_hash>/
//! - POST /api/v1/multisig-transactions/<safe_tx_hash>/confirmations/

use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use kwil_relay_types::{RelayError, Result};

use crate::SafeTransactionData;

/// Body of a transaction proposal: the payload plus the proposer's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProposal {
    #[serde(flatten)]
    pub data: SafeTransactionData,
    pub contract_transaction_hash: B256,
    #[serde(with = "checksum")]
    pub sender: Address,
    pub signature: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// An owner confirmation collected by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeConfirmation {
    pub owner: Address,
    pub signature: Bytes,
}

/// A multisig transaction as tracked by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeMultisigTransaction {
    pub safe: Address,
    #[serde(flatten)]
    pub data: SafeTransactionData,
    pub safe_tx_hash: B256,
    #[serde(default, deserialize_with = "nullable")]
    pub confirmations_required: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub confirmations: Vec<SafeConfirmation>,
    #[serde(default)]
    pub is_executed: bool,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
}

impl SafeMultisigTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations_required > 0
            && self.confirmations.len() as u64 >= self.confirmations_required
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Serialize)]
struct ConfirmationBody<'a> {
    signature: &'a Bytes,
}

/// The multisig authorization service: collects owner signatures for a
/// wallet transaction until it can be executed.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn propose_transaction(&self, safe: Address, proposal: &TransactionProposal)
        -> Result<()>;
    async fn confirm_transaction(&self, safe_tx_hash: B256, signature: &Bytes) -> Result<()>;
    /// Unknown hashes are reported as `RelayError::AuthService`.
    async fn get_transaction(&self, safe_tx_hash: B256) -> Result<SafeMultisigTransaction>;
    async fn get_multisig_transactions(&self, safe: Address)
        -> Result<Vec<SafeMultisigTransaction>>;
}

/// Safe transaction service client.
pub struct SafeServiceClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl SafeServiceClient {
    pub fn new(base_url: &str, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(30_000);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::AuthService(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::AuthService(format!(
                "POST {} returned status {}: {}",
                path, status, body
            )));
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::AuthService(format!("request failed: {}", e)))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RelayError::AuthService(format!("unknown transaction: {}", path)));
        }
        if !resp.status().is_success() {
            return Err(RelayError::AuthService(format!(
                "GET {} returned status {}",
                path,
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| RelayError::AuthService(format!("failed to parse response: {}", e)))
    }
}

#[async_trait]
impl AuthorizationService for SafeServiceClient {
    /// POST /api/v1/safes/<safe>/multisig-transactions/
    async fn propose_transaction(
        &self,
        safe: Address,
        proposal: &TransactionProposal,
    ) -> Result<()> {
        let path = format!(
            "/api/v1/safes/{}/multisig-transactions/",
            safe.to_checksum(None)
        );
        self.post(&path, proposal).await
    }

    /// POST /api/v1/multisig-transactions/<safe_tx_hash>/confirmations/
    async fn confirm_transaction(&self, safe_tx_hash: B256, signature: &Bytes) -> Result<()> {
        let path = format!("/api/v1/multisig-transactions/{}/confirmations/", safe_tx_hash);
        self.post(&path, &ConfirmationBody { signature }).await
    }

    /// GET /api/v1/multisig-transactions/<safe_tx_hash>/
    async fn get_transaction(&self, safe_tx_hash: B256) -> Result<SafeMultisigTransaction> {
        let path = format!("/api/v1/multisig-transactions/{}/", safe_tx_hash);
        self.get(&path).await
    }

    /// GET /api/v1/safes/<safe>/multisig-transactions/?executed=false
    async fn get_multisig_transactions(
        &self,
        safe: Address,
    ) -> Result<Vec<SafeMultisigTransaction>> {
        let path = format!(
            "/api/v1/safes/{}/multisig-transactions/?executed=false&ordering=nonce",
            safe.to_checksum(None)
        );
        let page: Page<SafeMultisigTransaction> = self.get(&path).await?;
        Ok(page.results)
    }
}

/// Treat an explicit `null` like a missing field.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The service wants EIP-55 checksummed addresses.
pub(crate) mod checksum {
    use alloy::primitives::Address;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&address.to_checksum(None))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        Address::deserialize(d)
    }
}

pub(crate) mod checksum_nullable {
    use alloy::primitives::Address;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
        super::checksum::serialize(address, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        super::nullable(d)
    }
}

/// Integers travel as decimal strings; older service versions send numbers.
pub(crate) mod decimal {
    use alloy::primitives::U256;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Text(text) => text.parse::<U256>().map_err(D::Error::custom),
            Raw::Number(n) => Ok(U256::from(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use serde_json::json;

    fn service_transaction(nonce: u64) -> serde_json::Value {
        json!({
            "safe": "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "to": "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512",
            "value": "0",
            "data": "0xeb630dd3",
            "operation": 0,
            "gasToken": "0x0000000000000000000000000000000000000000",
            "safeTxGas": 0,
            "baseGas": "0",
            "gasPrice": "0",
            "refundReceiver": null,
            "nonce": nonce,
            "safeTxHash": format!("0x{}", "aa".repeat(32)),
            "confirmationsRequired": 2,
            "confirmations": [
                {
                    "owner": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
                    "signature": format!("0x{}", "11".repeat(65)),
                    "signatureType": "EOA"
                }
            ],
            "isExecuted": false,
            "transactionHash": null,
            "trusted": true
        })
    }

    #[test]
    fn test_parse_service_transaction() {
        let tx: SafeMultisigTransaction = serde_json::from_value(service_transaction(4)).unwrap();
        assert_eq!(tx.data.nonce, U256::from(4u64));
        assert_eq!(tx.data.refund_receiver, Address::ZERO);
        assert_eq!(tx.confirmations.len(), 1);
        assert_eq!(tx.confirmations_required, 2);
        assert!(!tx.is_confirmed());
        assert_eq!(tx.transaction_hash, None);
    }

    #[test]
    fn test_parse_transaction_page() {
        let raw = json!({
            "count": 2,
            "next": null,
            "previous": null,
            "results": [service_transaction(4), service_transaction(5)]
        });
        let page: Page<SafeMultisigTransaction> = serde_json::from_value(raw).unwrap();
        let nonces: Vec<U256> = page.results.iter().map(|tx| tx.data.nonce).collect();
        assert_eq!(nonces, vec![U256::from(4u64), U256::from(5u64)]);

        let empty: Page<SafeMultisigTransaction> = serde_json::from_value(json!({"count": 0})).unwrap();
        assert!(empty.results.is_empty());
    }

    #[test]
    fn test_proposal_body_shape() {
        let proposal = TransactionProposal {
            data: SafeTransactionData::call(
                "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512".parse().unwrap(),
                Bytes::from(vec![0xeb, 0x63, 0x0d, 0xd3]),
                U256::from(12u64),
            ),
            contract_transaction_hash: B256::repeat_byte(0xaa),
            sender: "0x70997970c51812dc3a010c7d01b50e0d17dc79c8".parse().unwrap(),
            signature: Bytes::from(vec![0x11; 65]),
            origin: None,
        };

        let body = serde_json::to_value(&proposal).unwrap();
        assert_eq!(body["to"], "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512");
        assert_eq!(body["sender"], "0x70997970C51812dc3A010C7d01b50e0d17dc79C8");
        assert_eq!(body["nonce"], "12");
        assert_eq!(body["data"], "0xeb630dd3");
        assert_eq!(body["contractTransactionHash"], format!("0x{}", "aa".repeat(32)));
        assert!(body.get("origin").is_none());
    }
}
