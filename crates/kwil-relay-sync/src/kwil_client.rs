//! JSON-RPC client for the Kwil node hosting the reward extension.
//!
//! Calls go to `POST {rpc}/rpc/v1` with method `user.call`; the extension's
//! view actions answer with a query result table:
//! - `list_finalized($after, $limit)`
//! - `latest_finalized($limit)`

use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use async_trait::async_trait;
use kwil_relay_types::{hex_to_bytes, RelayError, Result, RewardBatch};

use crate::{validate_page, RewardSource, SourceConfig};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: CallParams<'a>,
}

#[derive(Debug, Serialize)]
struct CallParams<'a> {
    chain_id: &'a str,
    namespace: &'a str,
    action: &'a str,
    inputs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<CallResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CallResult {
    query_result: Option<QueryResult>,
    error: Option<String>,
}

/// A query result table as returned by `user.call`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Decode every row into a reward batch.
    pub fn into_batches(self) -> Result<Vec<RewardBatch>> {
        let col = |name: &str| self.column_names.iter().position(|c| c == name);
        let required = |name: &str| {
            col(name).ok_or_else(|| RelayError::Decode(format!("missing column {}", name)))
        };
        let root = required("root")?;
        let amount = required("amount")?;
        let signers = required("signers")?;
        let signatures = required("signatures")?;
        let created_at = required("created_at")?;
        let leaf_count = col("leaf_count");

        self.values
            .iter()
            .map(|row| {
                let cell = |i: usize| row.get(i).unwrap_or(&Value::Null);
                Ok(RewardBatch {
                    root: decode_b256(cell(root))?,
                    amount: decode_u256(cell(amount))?,
                    signers: decode_list(cell(signers), decode_address)?,
                    signatures: decode_list(cell(signatures), decode_bytes)?,
                    created_at: decode_u64(cell(created_at))?,
                    leaf_count: match leaf_count.map(cell) {
                        None | Some(Value::Null) => None,
                        Some(v) => Some(decode_u64(v)?),
                    },
                })
            })
            .collect()
    }
}

/// Byte columns arrive base64 encoded (Go JSON) or as 0x hex.
fn decode_bytes(value: &Value) -> Result<Bytes> {
    let s = value
        .as_str()
        .ok_or_else(|| RelayError::Decode(format!("expected bytes, got {}", value)))?;
    if s.starts_with("0x") {
        return Ok(Bytes::from(hex_to_bytes(s)?));
    }
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map(Bytes::from)
        .map_err(|e| RelayError::Decode(format!("invalid base64: {}", e)))
}

fn decode_b256(value: &Value) -> Result<B256> {
    let bytes = decode_bytes(value)?;
    if bytes.len() != 32 {
        return Err(RelayError::Decode(format!(
            "expected 32-byte root, got {} bytes",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

fn decode_address(value: &Value) -> Result<Address> {
    let bytes = decode_bytes(value)?;
    if bytes.len() != 20 {
        return Err(RelayError::Decode(format!(
            "expected 20-byte address, got {} bytes",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

fn decode_u256(value: &Value) -> Result<U256> {
    match value {
        Value::String(s) => s
            .parse::<U256>()
            .map_err(|e| RelayError::Decode(format!("invalid amount {}: {}", s, e))),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| RelayError::Decode(format!("invalid amount {}", n))),
        other => Err(RelayError::Decode(format!("invalid amount {}", other))),
    }
}

fn decode_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| RelayError::Decode(format!("invalid integer {}", n))),
        Value::String(s) => s
            .parse::<u64>()
            .map_err(|e| RelayError::Decode(format!("invalid integer {}: {}", s, e))),
        other => Err(RelayError::Decode(format!("invalid integer {}", other))),
    }
}

fn decode_list<T>(value: &Value, f: fn(&Value) -> Result<T>) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(f).collect(),
        other => Err(RelayError::Decode(format!("expected array, got {}", other))),
    }
}

/// Kwil node client.
pub struct KwilClient {
    config: SourceConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl KwilClient {
    pub fn new(config: SourceConfig, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(20_000);
        Self {
            config: SourceConfig {
                rpc_url: config.rpc_url.trim_end_matches('/').to_string(),
                ..config
            },
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Call a view action of the reward extension.
    ///
    /// POST /rpc/v1 {"method": "user.call", "params": {namespace, action, inputs}}
    pub async fn call(&self, action: &str, inputs: Vec<Value>) -> Result<QueryResult> {
        let url = format!("{}/rpc/v1", self.config.rpc_url);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "user.call",
            params: CallParams {
                chain_id: &self.config.chain_id,
                namespace: &self.config.namespace,
                action,
                inputs,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::Source(format!("kwil request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(RelayError::Source(format!(
                "kwil node returned status {}",
                resp.status()
            )));
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Source(format!("failed to parse kwil response: {}", e)))?;

        if let Some(err) = body.error {
            return Err(RelayError::Source(format!(
                "kwil rpc error {}: {}",
                err.code, err.message
            )));
        }
        let result = body
            .result
            .ok_or_else(|| RelayError::Source("kwil response has no result".into()))?;
        if let Some(err) = result.error.filter(|e| !e.is_empty()) {
            return Err(RelayError::Source(format!("{} failed: {}", action, err)));
        }
        Ok(result.query_result.unwrap_or_default())
    }
}

#[async_trait]
impl RewardSource for KwilClient {
    async fn list_finalized(&self, after_height: u64, limit: u64) -> Result<Vec<RewardBatch>> {
        let table = self
            .call("list_finalized", vec![after_height.into(), limit.into()])
            .await?;
        validate_page(after_height, table.into_batches()?)
    }

    async fn latest_finalized(&self, limit: u64) -> Result<Vec<RewardBatch>> {
        let table = self.call("latest_finalized", vec![limit.into()]).await?;
        table.into_batches()
    }
}
