//! In-memory chain and authorization service for testing.
//!
//! `MemoryChain` understands exactly the calls the relay makes: the wallet's
//! `nonce()`, the escrow's `rewardPoster(bytes32)` and `execTransaction`
//! replays. Mining a successful `execTransaction` that wraps `postReward`
//! records the executor as the root's poster and bumps the wallet nonce.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolValue};
use async_trait::async_trait;

use kwil_relay_types::{RelayError, Result};

use crate::chain::{CallOutcome, ChainReceipt, ChainTransaction, DestinationChain};
use crate::safe_client::{
    AuthorizationService, SafeConfirmation, SafeMultisigTransaction, TransactionProposal,
};
use crate::{recover_signer, FeeParams, IRewardEscrow, ISafe, SubmitRequest};

struct ChainState {
    block: u64,
    next_nonce: u64,
    sends: u64,
    txs: HashMap<B256, ChainTransaction>,
    /// Transactions pushed out of the mempool by a same-nonce replacement.
    replaced: HashMap<B256, ChainTransaction>,
    receipts: HashMap<B256, ChainReceipt>,
    sent: Vec<SubmitRequest>,
    reward_posters: HashMap<B256, Address>,
    wallet_nonce: Option<U256>,
    fees: FeeParams,
    revert_data: Option<Bytes>,
    fail_sends: bool,
    fail_block_after_send: bool,
    fail_block_reads: u32,
}

/// Scripted destination chain. Clones share state.
#[derive(Clone)]
pub struct MemoryChain {
    account: Address,
    safe: Address,
    state: Arc<Mutex<ChainState>>,
}

impl MemoryChain {
    pub fn new(account: Address, safe: Address) -> Self {
        Self {
            account,
            safe,
            state: Arc::new(Mutex::new(ChainState {
                block: 1,
                next_nonce: 0,
                sends: 0,
                txs: HashMap::new(),
                replaced: HashMap::new(),
                receipts: HashMap::new(),
                sent: Vec::new(),
                reward_posters: HashMap::new(),
                wallet_nonce: Some(U256::ZERO),
                fees: FeeParams {
                    max_fee_per_gas: 20_000_000_000,
                    max_priority_fee_per_gas: 1_000_000_000,
                },
                revert_data: None,
                fail_sends: false,
                fail_block_after_send: false,
                fail_block_reads: 0,
            })),
        }
    }

    pub fn current_block(&self) -> u64 {
        self.state.lock().unwrap().block
    }

    pub fn advance(&self, blocks: u64) {
        self.state.lock().unwrap().block += blocks;
    }

    /// `None` makes the wallet's `nonce()` read fail.
    pub fn set_wallet_nonce(&self, nonce: Option<U256>) {
        self.state.lock().unwrap().wallet_nonce = nonce;
    }

    pub fn set_reward_poster(&self, root: B256, poster: Address) {
        self.state.lock().unwrap().reward_posters.insert(root, poster);
    }

    pub fn set_fees(&self, fees: FeeParams) {
        self.state.lock().unwrap().fees = fees;
    }

    /// Revert payload returned when an `execTransaction` is replayed.
    pub fn set_revert(&self, data: Bytes) {
        self.state.lock().unwrap().revert_data = Some(data);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Make the first `block_number` read after the next send fail.
    pub fn fail_block_number_after_send(&self) {
        self.state.lock().unwrap().fail_block_after_send = true;
    }

    /// Every transaction sent so far, replacements included.
    pub fn sent(&self) -> Vec<SubmitRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Include `hash` in the current block. A replaced transaction can
    /// still be mined; its replacement is then dropped.
    pub fn mine(&self, hash: B256, success: bool) {
        let mut state = self.state.lock().unwrap();
        let block = state.block;
        if let Some(tx) = state.replaced.remove(&hash) {
            let nonce = tx.nonce;
            let dropped: Vec<B256> = state
                .txs
                .values()
                .filter(|t| t.block_number.is_none() && t.nonce == nonce)
                .map(|t| t.hash)
                .collect();
            for h in dropped {
                if let Some(t) = state.txs.remove(&h) {
                    state.replaced.insert(h, t);
                }
            }
            state.txs.insert(hash, tx);
        }
        let Some(tx) = state.txs.get_mut(&hash) else {
            return;
        };
        tx.block_number = Some(block);
        let input = tx.input.clone();

        let gas_price = state
            .sent
            .iter()
            .rev()
            .find(|r| r.input == input)
            .map(|r| r.fees.max_fee_per_gas)
            .unwrap_or_default();
        state.receipts.insert(
            hash,
            ChainReceipt {
                block_number: Some(block),
                success,
                effective_gas_price: gas_price,
                gas_used: 80_000,
            },
        );

        if !success {
            return;
        }
        if let Ok(exec) = ISafe::execTransactionCall::abi_decode(&input) {
            if let Ok(post) = IRewardEscrow::postRewardCall::abi_decode(&exec.data) {
                let account = self.account;
                state.reward_posters.insert(post.rewardRoot, account);
            }
            if let Some(nonce) = state.wallet_nonce.as_mut() {
                *nonce += U256::from(1u64);
            }
        }
    }
}

#[async_trait]
impl DestinationChain for MemoryChain {
    fn account(&self) -> Address {
        self.account
    }

    async fn block_number(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_block_reads > 0 {
            state.fail_block_reads -= 1;
            return Err(RelayError::Rpc("timeout".into()));
        }
        Ok(state.block)
    }

    async fn transaction_count(&self, account: Address) -> Result<u64> {
        if account != self.account {
            return Ok(0);
        }
        Ok(self.state.lock().unwrap().next_nonce)
    }

    async fn transaction(&self, hash: B256) -> Result<Option<ChainTransaction>> {
        Ok(self.state.lock().unwrap().txs.get(&hash).cloned())
    }

    async fn receipt(&self, hash: B256) -> Result<Option<ChainReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).copied())
    }

    async fn fee_data(&self) -> Result<FeeParams> {
        Ok(self.state.lock().unwrap().fees)
    }

    async fn call(&self, to: Address, input: Bytes, _block: Option<u64>) -> Result<CallOutcome> {
        let state = self.state.lock().unwrap();
        let selector = input.get(..4).unwrap_or_default();

        if to == self.safe && selector == ISafe::nonceCall::SELECTOR {
            return match state.wallet_nonce {
                Some(nonce) => Ok(CallOutcome::Success(Bytes::from(nonce.abi_encode()))),
                None => Err(RelayError::Rpc("connection refused".into())),
            };
        }
        if to == self.safe && selector == ISafe::execTransactionCall::SELECTOR {
            return Ok(match &state.revert_data {
                Some(data) => CallOutcome::Revert(data.clone()),
                None => CallOutcome::Success(Bytes::from(true.abi_encode())),
            });
        }
        if let Ok(call) = IRewardEscrow::rewardPosterCall::abi_decode(&input) {
            let poster = state
                .reward_posters
                .get(&call.rewardRoot)
                .copied()
                .unwrap_or_default();
            return Ok(CallOutcome::Success(Bytes::from(poster.abi_encode())));
        }
        Err(RelayError::Rpc(format!("unexpected call to {}", to)))
    }

    async fn send_transaction(&self, request: SubmitRequest) -> Result<B256> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(RelayError::Rpc("send failed".into()));
        }
        state.sends += 1;
        let hash = keccak256(state.sends.to_be_bytes());

        // A send at an occupied nonce replaces the mempool transaction.
        let pushed_out: Vec<B256> = state
            .txs
            .values()
            .filter(|tx| tx.block_number.is_none() && tx.nonce == request.nonce)
            .map(|tx| tx.hash)
            .collect();
        for h in pushed_out {
            if let Some(tx) = state.txs.remove(&h) {
                state.replaced.insert(h, tx);
            }
        }
        if state.fail_block_after_send {
            state.fail_block_after_send = false;
            state.fail_block_reads = 1;
        }
        state.txs.insert(
            hash,
            ChainTransaction {
                hash,
                block_number: None,
                nonce: request.nonce,
                to: Some(request.to),
                input: request.input.clone(),
            },
        );
        state.next_nonce = state.next_nonce.max(request.nonce + 1);
        state.sent.push(request);
        Ok(hash)
    }
}

struct AuthState {
    txs: BTreeMap<B256, SafeMultisigTransaction>,
    proposals: usize,
    fail_next: Option<String>,
}

/// Authorization service that keeps transactions in memory and recovers
/// owners from signatures the way the real service does.
#[derive(Clone)]
pub struct MemoryAuthService {
    confirmations_required: u64,
    state: Arc<Mutex<AuthState>>,
}

impl MemoryAuthService {
    pub fn new(confirmations_required: u64) -> Self {
        Self {
            confirmations_required,
            state: Arc::new(Mutex::new(AuthState {
                txs: BTreeMap::new(),
                proposals: 0,
                fail_next: None,
            })),
        }
    }

    pub fn transaction(&self, safe_tx_hash: B256) -> Option<SafeMultisigTransaction> {
        self.state.lock().unwrap().txs.get(&safe_tx_hash).cloned()
    }

    pub fn proposal_count(&self) -> usize {
        self.state.lock().unwrap().proposals
    }

    /// Drop a transaction, as if the service had never seen it.
    pub fn forget(&self, safe_tx_hash: B256) {
        self.state.lock().unwrap().txs.remove(&safe_tx_hash);
    }

    /// Make the next request fail.
    pub fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    fn take_failure(state: &mut AuthState) -> Result<()> {
        match state.fail_next.take() {
            Some(message) => Err(RelayError::AuthService(message)),
            None => Ok(()),
        }
    }

    fn add_confirmation(tx: &mut SafeMultisigTransaction, owner: Address, signature: &Bytes) {
        if tx.confirmations.iter().all(|c| c.owner != owner) {
            tx.confirmations.push(SafeConfirmation {
                owner,
                signature: signature.clone(),
            });
        }
    }
}

#[async_trait]
impl AuthorizationService for MemoryAuthService {
    async fn propose_transaction(
        &self,
        safe: Address,
        proposal: &TransactionProposal,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state)?;

        let owner = recover_signer(proposal.contract_transaction_hash, &proposal.signature)?;
        if owner != proposal.sender {
            return Err(RelayError::AuthService(format!(
                "signature is from {}, not sender {}",
                owner, proposal.sender
            )));
        }

        state.proposals += 1;
        let required = self.confirmations_required;
        let tx = state
            .txs
            .entry(proposal.contract_transaction_hash)
            .or_insert_with(|| SafeMultisigTransaction {
                safe,
                data: proposal.data.clone(),
                safe_tx_hash: proposal.contract_transaction_hash,
                confirmations_required: required,
                confirmations: Vec::new(),
                is_executed: false,
                transaction_hash: None,
            });
        Self::add_confirmation(tx, owner, &proposal.signature);
        Ok(())
    }

    async fn confirm_transaction(&self, safe_tx_hash: B256, signature: &Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state)?;

        let owner = recover_signer(safe_tx_hash, signature)?;
        let tx = state.txs.get_mut(&safe_tx_hash).ok_or_else(|| {
            RelayError::AuthService(format!("unknown transaction {}", safe_tx_hash))
        })?;
        Self::add_confirmation(tx, owner, signature);
        Ok(())
    }

    async fn get_transaction(&self, safe_tx_hash: B256) -> Result<SafeMultisigTransaction> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state)?;
        state.txs.get(&safe_tx_hash).cloned().ok_or_else(|| {
            RelayError::AuthService(format!("unknown transaction {}", safe_tx_hash))
        })
    }

    async fn get_multisig_transactions(
        &self,
        safe: Address,
    ) -> Result<Vec<SafeMultisigTransaction>> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state)?;
        Ok(state
            .txs
            .values()
            .filter(|tx| tx.safe == safe && !tx.is_executed)
            .cloned()
            .collect())
    }
}
