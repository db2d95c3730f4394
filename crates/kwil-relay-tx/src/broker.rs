//! Multisig workflow for escrow calls: propose, confirm, execute.
//!
//! The broker only moves data between the wallet, the authorization
//! service and the chain. It does not count signatures and does not
//! interpret reverts; the poster decides what to do with either.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolValue};

use kwil_relay_types::{RelayError, Result};

use crate::chain::{CallOutcome, DestinationChain};
use crate::safe_client::{AuthorizationService, SafeMultisigTransaction, TransactionProposal};
use crate::{
    build_call_data, EscrowCall, FeeParams, ISafe, ProposedTransaction,
    SafeTransactionData, SubmitRequest, SubmittedTransaction,
};

/// Addresses the broker works against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub chain_id: u64,
    pub safe: Address,
    pub escrow: Address,
}

pub struct Broker<C, A> {
    chain: C,
    auth: A,
    config: BrokerConfig,
}

impl<C: DestinationChain, A: AuthorizationService> Broker<C, A> {
    pub fn new(chain: C, auth: A, config: BrokerConfig) -> Self {
        Self { chain, auth, config }
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn auth(&self) -> &A {
        &self.auth
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn build_call_data(&self, call: &EscrowCall) -> Bytes {
        build_call_data(call)
    }

    /// The wallet's on-chain transaction nonce.
    pub async fn wallet_nonce(&self) -> Result<U256> {
        let input = Bytes::from(ISafe::nonceCall {}.abi_encode());
        match self.chain.call(self.config.safe, input, None).await {
            Ok(CallOutcome::Success(output)) => U256::abi_decode(&output).map_err(|e| {
                RelayError::WalletUnreachable(format!("bad nonce() return data: {}", e))
            }),
            Ok(CallOutcome::Revert(data)) => Err(RelayError::WalletUnreachable(format!(
                "nonce() reverted: {}",
                data
            ))),
            Err(err) => Err(RelayError::WalletUnreachable(err.to_string())),
        }
    }

    /// First wallet nonce not taken by a transaction still queued at the
    /// authorization service.
    pub async fn next_free_nonce(&self) -> Result<U256> {
        let on_chain = self.wallet_nonce().await?;
        let queued = self.auth.get_multisig_transactions(self.config.safe).await?;
        Ok(queued
            .iter()
            .filter(|tx| !tx.is_executed)
            .map(|tx| tx.data.nonce + U256::from(1u64))
            .fold(on_chain, |next, after| next.max(after)))
    }

    /// Who posted `root`, or the zero address if nobody has.
    pub async fn reward_poster(&self, root: B256) -> Result<Address> {
        let input = build_call_data(&EscrowCall::RewardPoster { root });
        match self.chain.call(self.config.escrow, input, None).await? {
            CallOutcome::Success(output) => Address::abi_decode(&output)
                .map_err(|e| RelayError::Decode(format!("bad rewardPoster return data: {}", e))),
            CallOutcome::Revert(data) => Err(RelayError::Rpc(format!(
                "rewardPoster({}) reverted: {}",
                root, data
            ))),
        }
    }

    /// Wrap `postReward(root, amount)` in a wallet transaction.
    ///
    /// Without an explicit `nonce` the wallet's current nonce is read.
    pub async fn propose_transaction(
        &self,
        root: B256,
        amount: U256,
        nonce: Option<U256>,
    ) -> Result<ProposedTransaction> {
        self.wrap(&EscrowCall::PostReward { root, amount }, nonce)
            .await
    }

    /// Wrap `updatePosterFee(fee)` in a wallet transaction.
    pub async fn propose_fee_update(
        &self,
        fee: U256,
        nonce: Option<U256>,
    ) -> Result<ProposedTransaction> {
        self.wrap(&EscrowCall::UpdatePosterFee { fee }, nonce).await
    }

    async fn wrap(&self, call: &EscrowCall, nonce: Option<U256>) -> Result<ProposedTransaction> {
        let nonce = match nonce {
            Some(nonce) => nonce,
            None => self.wallet_nonce().await?,
        };
        let payload =
            SafeTransactionData::call(self.config.escrow, build_call_data(call), nonce);
        Ok(ProposedTransaction {
            safe_tx_hash: crate::safe_tx_hash(self.config.chain_id, self.config.safe, &payload),
            payload,
        })
    }

    /// Register the transaction with the authorization service, carrying
    /// the proposer's own signature.
    pub async fn propose(
        &self,
        proposed: &ProposedTransaction,
        sender: Address,
        signature: Bytes,
    ) -> Result<()> {
        let proposal = TransactionProposal {
            data: proposed.payload.clone(),
            contract_transaction_hash: proposed.safe_tx_hash,
            sender,
            signature,
            origin: Some("kwil-relay".into()),
        };
        self.auth
            .propose_transaction(self.config.safe, &proposal)
            .await
    }

    pub async fn confirm(&self, safe_tx_hash: B256, signature: &Bytes) -> Result<()> {
        self.auth.confirm_transaction(safe_tx_hash, signature).await
    }

    /// Current state of a wallet transaction at the authorization service.
    pub async fn transaction_status(&self, safe_tx_hash: B256) -> Result<SafeMultisigTransaction> {
        self.auth.get_transaction(safe_tx_hash).await
    }

    /// Send `execTransaction` with every collected confirmation.
    ///
    /// `nonce_override` re-uses an executor account nonce to replace a
    /// transaction that is stuck in the mempool.
    pub async fn execute(
        &self,
        safe_tx_hash: B256,
        fees: FeeParams,
        nonce_override: Option<u64>,
    ) -> Result<SubmittedTransaction> {
        let tx = self.auth.get_transaction(safe_tx_hash).await?;
        let expected = crate::safe_tx_hash(self.config.chain_id, self.config.safe, &tx.data);
        if expected != safe_tx_hash {
            return Err(RelayError::AuthService(format!(
                "service payload hashes to {}, expected {}",
                expected, safe_tx_hash
            )));
        }

        let input = exec_transaction_call_data(&tx);
        let account_nonce = match nonce_override {
            Some(nonce) => nonce,
            None => self.chain.transaction_count(self.chain.account()).await?,
        };

        let hash = self
            .chain
            .send_transaction(SubmitRequest {
                to: self.config.safe,
                input,
                nonce: account_nonce,
                fees,
                gas_limit: None,
            })
            .await?;

        tracing::info!(
            %safe_tx_hash,
            tx_hash = %hash,
            account_nonce,
            max_priority_fee = fees.max_priority_fee_per_gas,
            "execTransaction sent"
        );

        Ok(SubmittedTransaction {
            hash,
            account_nonce,
            fees,
        })
    }
}

/// Encode `execTransaction` for a service-tracked transaction.
///
/// The wallet requires signatures ordered by owner address, ascending.
pub fn exec_transaction_call_data(tx: &SafeMultisigTransaction) -> Bytes {
    let mut confirmations = tx.confirmations.clone();
    confirmations.sort_by_key(|c| c.owner);
    let signatures: Vec<u8> = confirmations
        .iter()
        .flat_map(|c| c.signature.iter().copied())
        .collect();

    let data = &tx.data;
    let call = ISafe::execTransactionCall {
        to: data.to,
        value: data.value,
        data: data.data.clone(),
        operation: data.operation,
        safeTxGas: data.safe_tx_gas,
        baseGas: data.base_gas,
        gasPrice: data.gas_price,
        gasToken: data.gas_token,
        refundReceiver: data.refund_receiver,
        signatures: Bytes::from(signatures),
    };
    Bytes::from(call.abi_encode())
}
