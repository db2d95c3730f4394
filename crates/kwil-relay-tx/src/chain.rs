//! Destination-chain access for the executor account.

use alloy::consensus::Transaction as _;
use alloy::eips::BlockId;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;

use kwil_relay_types::{RelayError, Result};

use crate::{FeeParams, SubmitRequest};

/// A transaction as seen by the node. `block_number` is `None` while it
/// sits in the mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub block_number: Option<u64>,
    pub nonce: u64,
    pub to: Option<Address>,
    pub input: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainReceipt {
    pub block_number: Option<u64>,
    pub success: bool,
    pub effective_gas_price: u128,
    pub gas_used: u64,
}

/// Result of an `eth_call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(Bytes),
    /// The call reverted; carries the raw revert payload.
    Revert(Bytes),
}

/// The destination chain, from the point of view of one sending account.
#[async_trait]
pub trait DestinationChain: Send + Sync {
    /// The account transactions are sent from.
    fn account(&self) -> Address;
    async fn block_number(&self) -> Result<u64>;
    /// Next nonce for `account`, counting mempool transactions.
    async fn transaction_count(&self, account: Address) -> Result<u64>;
    async fn transaction(&self, hash: B256) -> Result<Option<ChainTransaction>>;
    async fn receipt(&self, hash: B256) -> Result<Option<ChainReceipt>>;
    async fn fee_data(&self) -> Result<FeeParams>;
    /// `eth_call` from `account`, at `block` or the latest block.
    async fn call(&self, to: Address, input: Bytes, block: Option<u64>) -> Result<CallOutcome>;
    async fn send_transaction(&self, request: SubmitRequest) -> Result<B256>;
}

fn rpc_error(err: RpcError<TransportErrorKind>) -> RelayError {
    RelayError::Rpc(err.to_string())
}

/// JSON-RPC node over HTTP, signing with a local key.
pub struct AlloyChain {
    provider: DynProvider,
    account: Address,
}

impl AlloyChain {
    pub fn connect(rpc_url: &str, signer: PrivateKeySigner) -> Result<Self> {
        let url = rpc_url
            .parse::<alloy::transports::http::reqwest::Url>()
            .map_err(|e| RelayError::InvalidArgument(format!("invalid rpc url {}: {}", rpc_url, e)))?;
        let account = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();
        Ok(Self { provider, account })
    }

    pub async fn chain_id(&self) -> Result<u64> {
        self.provider.get_chain_id().await.map_err(rpc_error)
    }
}

#[async_trait]
impl DestinationChain for AlloyChain {
    fn account(&self) -> Address {
        self.account
    }

    async fn block_number(&self) -> Result<u64> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn transaction_count(&self, account: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(account)
            .pending()
            .await
            .map_err(rpc_error)
    }

    async fn transaction(&self, hash: B256) -> Result<Option<ChainTransaction>> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(rpc_error)?;
        Ok(tx.map(|tx| ChainTransaction {
            hash,
            block_number: tx.block_number,
            nonce: tx.nonce(),
            to: tx.to(),
            input: tx.input().clone(),
        }))
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ChainReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(rpc_error)?;
        Ok(receipt.map(|r| ChainReceipt {
            block_number: r.block_number,
            success: r.status(),
            effective_gas_price: r.effective_gas_price,
            gas_used: r.gas_used,
        }))
    }

    async fn fee_data(&self) -> Result<FeeParams> {
        let estimate = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(rpc_error)?;
        Ok(FeeParams {
            max_fee_per_gas: estimate.max_fee_per_gas,
            max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
        })
    }

    async fn call(&self, to: Address, input: Bytes, block: Option<u64>) -> Result<CallOutcome> {
        let tx = TransactionRequest::default()
            .with_from(self.account)
            .with_to(to)
            .with_input(input);
        let mut call = self.provider.call(tx);
        if let Some(number) = block {
            call = call.block(BlockId::number(number));
        }
        match call.await {
            Ok(output) => Ok(CallOutcome::Success(output)),
            Err(err) => match err.as_error_resp().and_then(|e| e.as_revert_data()) {
                Some(data) => Ok(CallOutcome::Revert(data)),
                None => Err(rpc_error(err)),
            },
        }
    }

    async fn send_transaction(&self, request: SubmitRequest) -> Result<B256> {
        let mut tx = TransactionRequest::default()
            .with_from(self.account)
            .with_to(request.to)
            .with_input(request.input)
            .with_nonce(request.nonce)
            .with_max_fee_per_gas(request.fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(request.fees.max_priority_fee_per_gas);
        if let Some(gas_limit) = request.gas_limit {
            tx = tx.with_gas_limit(gas_limit);
        }
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(rpc_error)?;
        Ok(*pending.tx_hash())
    }
}
