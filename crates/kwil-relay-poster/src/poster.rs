//! The poster state machine.
//!
//! One record moves at a time, oldest source height first:
//! `Fetched -> Skipped`, or
//! `Fetched -> Proposed -> Confirmed -> Submitted -> Finalized`.
//! `Reverted` holds the pipeline until an operator steps in.

use std::future::Future;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use tokio::time::MissedTickBehavior;

use kwil_relay_store::Ledger;
use kwil_relay_sync::RewardSource;
use kwil_relay_tx::{
    decode_revert, sign_transaction_hash, AuthorizationService, Broker, CallOutcome,
    DestinationChain, FeeParams, ProposedTransaction,
};
use kwil_relay_types::{RelayError, Result, RewardRecord, RewardState, TxInfo};

/// Policy knobs for the poster.
#[derive(Debug, Clone)]
pub struct PosterConfig {
    pub page_size: u64,
    /// Blocks on top of the inclusion block before a post is final.
    pub confirmation_blocks: u64,
    /// Blocks a transaction may sit in the mempool before it is replaced.
    pub stuck_wait_blocks: u64,
    /// Added to the priority fee of a replacement, wei.
    pub tip_increment: u128,
    pub fast_sync_page_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            confirmation_blocks: 12,
            stuck_wait_blocks: 30,
            tip_increment: 1_000_000_000,
            fast_sync_page_delay: Duration::from_millis(1_000),
            poll_interval: Duration::from_secs(60),
        }
    }
}

pub struct Poster<S, C, A> {
    source: S,
    broker: Broker<C, A>,
    ledger: Ledger,
    signers: Vec<PrivateKeySigner>,
    config: PosterConfig,
}

impl<S, C, A> Poster<S, C, A>
where
    S: RewardSource,
    C: DestinationChain,
    A: AuthorizationService,
{
    /// `signers` are the wallet owner keys this poster signs with; the first
    /// one proposes.
    pub fn new(
        source: S,
        broker: Broker<C, A>,
        ledger: Ledger,
        signers: Vec<PrivateKeySigner>,
        config: PosterConfig,
    ) -> Self {
        Self {
            source,
            broker,
            ledger,
            signers,
            config,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn broker(&self) -> &Broker<C, A> {
        &self.broker
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Log the newest finalized batch, failing if the source is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        let latest = self.source.latest_finalized(1).await?;
        match latest.first() {
            Some(batch) => tracing::info!(
                height = batch.created_at,
                root = %batch.root,
                "source chain reachable"
            ),
            None => tracing::info!("source chain reachable, no finalized batches yet"),
        }
        Ok(())
    }

    /// Append batches finalized since the last synced height. Batches the
    /// escrow already knows are retired straight away.
    #[tracing::instrument(skip_all)]
    pub async fn fetch_pending_batches(&mut self) -> Result<usize> {
        let after = self.ledger.last_synced_height();
        let batches = self
            .source
            .list_finalized(after, self.config.page_size)
            .await?;
        tracing::debug!(after, count = batches.len(), "listed finalized batches");

        let mut added = 0;
        for batch in batches {
            let height = batch.created_at;
            let root = batch.root;
            if !self.ledger.append(batch)? {
                continue;
            }
            added += 1;
            tracing::info!(height, %root, "fetched reward batch");

            let poster = self.broker.reward_poster(root).await?;
            if poster != Address::ZERO {
                self.ledger.mark_skipped(height)?;
                tracing::info!(height, %root, %poster, "reward already posted, skipping");
            }
        }
        Ok(added)
    }

    /// Catch up with batches that were posted while this ledger did not
    /// exist, without collecting any signatures.
    ///
    /// Runs only while the ledger holds fewer records than the wallet has
    /// executed transactions. Stops at the first batch the escrow does not
    /// know (it is appended as pending) or when the source runs dry. A
    /// ledger with pending work has nothing to catch up on.
    #[tracing::instrument(skip_all)]
    pub async fn fast_sync(&mut self) -> Result<usize> {
        if let Some(record) = self.ledger.oldest_pending() {
            tracing::debug!(height = record.height(), "pending records present, no fast sync");
            return Ok(0);
        }

        let wallet_nonce = self.broker.wallet_nonce().await?;
        let target = u64::try_from(wallet_nonce).unwrap_or(u64::MAX);
        let mut synced = 0;

        while (self.ledger.len() as u64) < target {
            let page = self
                .source
                .list_finalized(self.ledger.last_synced_height(), self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            for batch in page {
                if self.ledger.len() as u64 >= target {
                    break;
                }
                let height = batch.created_at;
                let root = batch.root;
                if self.broker.reward_poster(root).await? == Address::ZERO {
                    self.ledger.append(batch)?;
                    tracing::info!(height, %root, synced, "fast sync reached an unposted batch");
                    return Ok(synced);
                }
                if self.ledger.append_synced(batch)? {
                    synced += 1;
                }
            }

            if self.ledger.len() as u64 >= target {
                break;
            }
            tokio::time::sleep(self.config.fast_sync_page_delay).await;
        }

        tracing::info!(synced, wallet_nonce = %wallet_nonce, "fast sync done");
        Ok(synced)
    }

    /// Advance the oldest pending record by one step.
    pub async fn check_status(&mut self) -> Result<Option<RewardState>> {
        let Some(record) = self.ledger.oldest_pending().cloned() else {
            return Ok(None);
        };
        match &record.result {
            None => self.submit(&record).await.map(Some),
            Some(info) if info.reverted => {
                tracing::warn!(
                    height = record.height(),
                    root = %record.request.root,
                    tx_hash = %info.hash,
                    "reward post reverted, waiting for an operator"
                );
                Ok(Some(RewardState::Reverted))
            }
            Some(_) => self.follow_tx(&record).await.map(Some),
        }
    }

    #[tracing::instrument(skip_all, fields(height = record.height(), root = %record.request.root))]
    async fn submit(&mut self, record: &RewardRecord) -> Result<RewardState> {
        let height = record.height();
        let batch = &record.request;

        // Someone may have posted it between fetch and now.
        let poster = self.broker.reward_poster(batch.root).await?;
        if poster != Address::ZERO {
            self.ledger.mark_skipped(height)?;
            tracing::info!(%poster, "reward already posted, skipping");
            return Ok(RewardState::Skipped);
        }

        let proposed = self
            .broker
            .propose_transaction(batch.root, batch.amount, None)
            .await?;
        let safe_tx_hash = proposed.safe_tx_hash;
        tracing::info!(
            %safe_tx_hash,
            wallet_nonce = %proposed.payload.nonce,
            state = %RewardState::Proposed,
            "reward post proposed"
        );

        if !self.collect_signatures(&proposed).await? {
            return Ok(RewardState::Proposed);
        }
        tracing::info!(%safe_tx_hash, state = %RewardState::Confirmed, "reward post confirmed");

        // Nothing fallible may sit between a successful send and the ledger
        // write, or the next tick would send again.
        let chain = self.broker.chain();
        let fees = chain.fee_data().await?;
        let post_block = chain.block_number().await?;
        let submitted = self.broker.execute(safe_tx_hash, fees, None).await?;

        self.ledger.mark_result(
            height,
            TxInfo {
                hash: submitted.hash,
                fee: fees.max_priority_fee_per_gas,
                gas_price: fees.max_fee_per_gas,
                post_block,
                include_block: 0,
                account_nonce: submitted.account_nonce,
                safe_tx_hash: Some(safe_tx_hash),
                reverted: false,
                replaced: Vec::new(),
            },
        )?;
        tracing::info!(
            tx_hash = %submitted.hash,
            post_block,
            account_nonce = submitted.account_nonce,
            "reward post submitted"
        );
        Ok(RewardState::Submitted)
    }

    /// Sign with every configured key, then report whether the wallet's
    /// threshold is met.
    async fn collect_signatures(&self, proposed: &ProposedTransaction) -> Result<bool> {
        let Some((proposer, others)) = self.signers.split_first() else {
            return Err(RelayError::InvalidArgument("no signer keys configured".into()));
        };
        let safe_tx_hash = proposed.safe_tx_hash;

        let signature = sign_transaction_hash(safe_tx_hash, proposer)?;
        self.broker
            .propose(proposed, proposer.address(), signature)
            .await?;
        for signer in others {
            let signature = sign_transaction_hash(safe_tx_hash, signer)?;
            self.broker.confirm(safe_tx_hash, &signature).await?;
        }

        let status = self.broker.transaction_status(safe_tx_hash).await?;
        if !status.is_confirmed() {
            tracing::info!(
                %safe_tx_hash,
                confirmations = status.confirmations.len(),
                required = status.confirmations_required,
                "waiting for more confirmations"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Follow a submitted transaction: replace it when stuck, finalize it
    /// once deep enough, flag it when it reverted.
    #[tracing::instrument(skip_all, fields(height = record.height(), root = %record.request.root))]
    pub async fn follow_tx(&mut self, record: &RewardRecord) -> Result<RewardState> {
        let height = record.height();
        let Some(mut info) = record.result.clone() else {
            return Err(RelayError::InvalidArgument(format!(
                "record at height {} has no transaction",
                height
            )));
        };

        let chain = self.broker.chain();
        let current = chain.block_number().await?;
        let mut tx = chain.transaction(info.hash).await?;

        // A replaced transaction at the same nonce may have been mined
        // instead of its replacement.
        if tx.as_ref().and_then(|tx| tx.block_number).is_none() {
            for hash in info.replaced.iter().rev() {
                let Some(earlier) = chain.transaction(*hash).await? else {
                    continue;
                };
                if earlier.block_number.is_some() {
                    tracing::info!(tx_hash = %hash, replacement = %info.hash, "replaced transaction was mined");
                    info.hash = *hash;
                    tx = Some(earlier);
                    break;
                }
            }
        }

        let Some(included) = tx.as_ref().and_then(|tx| tx.block_number) else {
            if current.saturating_sub(info.post_block) <= self.config.stuck_wait_blocks {
                tracing::debug!(tx_hash = %info.hash, current, post_block = info.post_block, "waiting for inclusion");
                return Ok(RewardState::Submitted);
            }
            // Landed through a transaction this ledger does not know about.
            let poster = self.broker.reward_poster(record.request.root).await?;
            if poster != Address::ZERO {
                tracing::warn!(tx_hash = %info.hash, %poster, "reward posted by an untracked transaction, skipping");
                self.ledger.mark_skipped(height)?;
                return Ok(RewardState::Skipped);
            }
            return self.replace_stuck(height, &info, current).await;
        };

        let depth = current.saturating_sub(included);
        if depth < self.config.confirmation_blocks {
            tracing::debug!(tx_hash = %info.hash, included, depth, "waiting for confirmations");
            return Ok(RewardState::Submitted);
        }

        let receipt = chain
            .receipt(info.hash)
            .await?
            .ok_or_else(|| RelayError::Rpc(format!("no receipt for included tx {}", info.hash)))?;

        if !receipt.success {
            let reason = self.revert_reason(tx.as_ref(), included).await;
            tracing::error!(tx_hash = %info.hash, included, %reason, "reward post reverted");
            self.ledger.mark_result(
                height,
                TxInfo {
                    gas_price: receipt.effective_gas_price,
                    reverted: true,
                    ..info
                },
            )?;
            return Ok(RewardState::Reverted);
        }

        self.ledger.mark_result(
            height,
            TxInfo {
                gas_price: receipt.effective_gas_price,
                include_block: included,
                ..info.clone()
            },
        )?;
        tracing::info!(
            tx_hash = %info.hash,
            include_block = included,
            gas_used = receipt.gas_used,
            "reward post finalized"
        );
        Ok(RewardState::Finalized)
    }

    async fn replace_stuck(&mut self, height: u64, info: &TxInfo, current: u64) -> Result<RewardState> {
        let safe_tx_hash = info.safe_tx_hash.ok_or_else(|| {
            RelayError::Other(format!("no wallet transaction recorded for height {}", height))
        })?;

        let estimate = self.broker.chain().fee_data().await?;
        let tip = bump_fee(info.fee, self.config.tip_increment);
        let fees = FeeParams {
            max_priority_fee_per_gas: tip,
            max_fee_per_gas: estimate
                .max_fee_per_gas
                .max(bump_fee(info.gas_price, self.config.tip_increment))
                .max(tip),
        };

        let submitted = self
            .broker
            .execute(safe_tx_hash, fees, Some(info.account_nonce))
            .await?;
        self.ledger.mark_result(
            height,
            TxInfo {
                hash: submitted.hash,
                fee: tip,
                gas_price: fees.max_fee_per_gas,
                post_block: current,
                include_block: 0,
                account_nonce: info.account_nonce,
                safe_tx_hash: Some(safe_tx_hash),
                reverted: false,
                replaced: replaced_hashes(info),
            },
        )?;
        tracing::warn!(
            old_tx_hash = %info.hash,
            tx_hash = %submitted.hash,
            account_nonce = info.account_nonce,
            tip,
            "replaced stuck transaction"
        );
        Ok(RewardState::Submitted)
    }

    async fn revert_reason(
        &self,
        tx: Option<&kwil_relay_tx::ChainTransaction>,
        block: u64,
    ) -> String {
        let Some((to, input)) = tx.and_then(|tx| tx.to.map(|to| (to, tx.input.clone()))) else {
            return "unknown (transaction not found)".into();
        };
        match self.broker.chain().call(to, input, Some(block)).await {
            Ok(CallOutcome::Revert(data)) => {
                decode_revert(&data).unwrap_or_else(|| format!("undecoded revert data {}", data))
            }
            Ok(CallOutcome::Success(_)) => "unknown (replay succeeded)".into(),
            Err(err) => format!("unknown (replay failed: {})", err),
        }
    }

    /// Propose `updatePosterFee(fee)` and sign it with every configured key.
    pub async fn propose_fee_update(&self, fee: U256) -> Result<(ProposedTransaction, bool)> {
        // Queue behind any reward post still collecting signatures.
        let nonce = self.broker.next_free_nonce().await?;
        let proposed = self.broker.propose_fee_update(fee, Some(nonce)).await?;
        let confirmed = self.collect_signatures(&proposed).await?;
        Ok((proposed, confirmed))
    }

    /// One tick: pick up new batches, then move the oldest pending record.
    #[tracing::instrument(skip_all)]
    pub async fn run_once(&mut self) -> Result<Option<RewardState>> {
        if let Err(err) = self.fetch_pending_batches().await {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(error = %err, "fetching reward batches failed");
        }
        self.check_status().await
    }

    /// Tick every `poll_interval` until `shutdown` resolves. A tick in
    /// flight always completes first. Only ledger failures end the loop
    /// early.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("poster stopped");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(Some(state)) => tracing::debug!(%state, "tick done"),
                        Ok(None) => tracing::trace!("nothing pending"),
                        Err(err) if err.is_fatal() => {
                            tracing::error!(error = %err, "ledger failure, stopping");
                            return Err(err);
                        }
                        Err(err) => tracing::warn!(error = %err, "tick failed, retrying next round"),
                    }
                }
            }
        }
    }
}

/// Replacement fee: at least `increment` more and at least 10% more, the
/// minimum bump nodes accept for a same-nonce replacement.
fn bump_fee(fee: u128, increment: u128) -> u128 {
    fee.saturating_add(increment)
        .max(fee.saturating_add(fee.div_ceil(10)))
}

fn replaced_hashes(info: &TxInfo) -> Vec<B256> {
    let mut hashes = info.replaced.clone();
    hashes.push(info.hash);
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;
    use alloy::sol_types::{Revert, SolError};
    use kwil_relay_store::MemorySnapshotStore;
    use kwil_relay_sync::MemorySource;
    use kwil_relay_tx::{BrokerConfig, MemoryAuthService, MemoryChain};
    use kwil_relay_types::RewardBatch;

    const KEY_A: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_B: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const GWEI: u128 = 1_000_000_000;

    struct Harness {
        poster: Poster<MemorySource, MemoryChain, MemoryAuthService>,
        source: MemorySource,
        chain: MemoryChain,
        auth: MemoryAuthService,
        store: MemorySnapshotStore,
        safe: Address,
    }

    fn batch(height: u64) -> RewardBatch {
        RewardBatch {
            root: B256::with_last_byte(height as u8),
            amount: U256::from(height * 100),
            signers: vec![],
            signatures: vec![],
            created_at: height,
            leaf_count: None,
        }
    }

    fn harness(batches: Vec<RewardBatch>, confirmations_required: u64) -> Harness {
        let safe: Address = "0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap();
        let escrow: Address = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".parse().unwrap();

        let chain = MemoryChain::new(Address::repeat_byte(0xee), safe);
        let auth = MemoryAuthService::new(confirmations_required);
        let source = MemorySource::new(batches);
        let store = MemorySnapshotStore::new();

        let broker = Broker::new(
            chain.clone(),
            auth.clone(),
            BrokerConfig {
                chain_id: 31337,
                safe,
                escrow,
            },
        );
        let signers = vec![KEY_A.parse().unwrap(), KEY_B.parse().unwrap()];
        let config = PosterConfig {
            fast_sync_page_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            ..PosterConfig::default()
        };
        let poster = Poster::new(
            source.clone(),
            broker,
            Ledger::open(store.clone()).unwrap(),
            signers,
            config,
        );

        Harness {
            poster,
            source,
            chain,
            auth,
            store,
            safe,
        }
    }

    fn result(h: &Harness, height: u64) -> TxInfo {
        h.poster
            .ledger()
            .record(height)
            .and_then(|r| r.result.clone())
            .unwrap()
    }

    fn rank(state: RewardState) -> u8 {
        match state {
            RewardState::Fetched => 0,
            RewardState::Proposed => 1,
            RewardState::Confirmed => 2,
            RewardState::Submitted => 3,
            RewardState::Reverted => 4,
            RewardState::Skipped | RewardState::Synced | RewardState::Finalized => 5,
        }
    }

    #[tokio::test]
    async fn test_fetch_skips_posted_batches() {
        let mut h = harness(vec![batch(1), batch(2), batch(3)], 2);
        h.chain
            .set_reward_poster(batch(2).root, Address::repeat_byte(0x42));

        assert_eq!(h.poster.fetch_pending_batches().await.unwrap(), 3);
        let ledger = h.poster.ledger();
        assert_eq!(ledger.state(1), Some(RewardState::Fetched));
        assert_eq!(ledger.state(2), Some(RewardState::Skipped));
        assert_eq!(ledger.state(3), Some(RewardState::Fetched));
        assert_eq!(ledger.last_synced_height(), 3);

        assert_eq!(h.poster.fetch_pending_batches().await.unwrap(), 0);
        assert_eq!(h.poster.ledger().len(), 3);
    }

    #[tokio::test]
    async fn test_lifecycle_is_monotonic() {
        let mut h = harness(vec![batch(1), batch(2)], 2);
        let mut seen = Vec::new();

        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Submitted));
        seen.push(h.poster.ledger().state(1).unwrap());
        assert_eq!(h.poster.ledger().state(2), Some(RewardState::Fetched));
        assert_eq!(h.chain.sent().len(), 1);

        // Nothing happens while the transaction sits in the mempool.
        h.poster.run_once().await.unwrap();
        seen.push(h.poster.ledger().state(1).unwrap());
        assert_eq!(h.chain.sent().len(), 1);

        let mined_at = h.chain.current_block();
        h.chain.mine(result(&h, 1).hash, true);
        h.chain.advance(11);
        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Submitted));
        seen.push(h.poster.ledger().state(1).unwrap());

        h.chain.advance(1);
        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Finalized));
        seen.push(h.poster.ledger().state(1).unwrap());
        assert_eq!(result(&h, 1).include_block, mined_at);
        assert!(!h.poster.ledger().is_pending(1));

        h.poster.run_once().await.unwrap();
        seen.push(h.poster.ledger().state(1).unwrap());
        assert!(seen.windows(2).all(|w| rank(w[0]) <= rank(w[1])));
        assert_eq!(seen.last(), Some(&RewardState::Finalized));

        // The next batch goes out at the next wallet nonce.
        assert_eq!(h.poster.ledger().state(2), Some(RewardState::Submitted));
        let safe_tx_hash = result(&h, 2).safe_tx_hash.unwrap();
        let tx = h.auth.transaction(safe_tx_hash).unwrap();
        assert_eq!(tx.data.nonce, U256::from(1u64));
    }

    #[tokio::test]
    async fn test_waits_for_missing_confirmations() {
        let mut h = harness(vec![batch(1)], 3);

        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Proposed));
        assert_eq!(h.poster.ledger().state(1), Some(RewardState::Fetched));
        assert!(h.chain.sent().is_empty());

        // Proposing again is harmless: same wallet transaction, same owners.
        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Proposed));
        assert_eq!(h.auth.proposal_count(), 2);
        let open = h.auth.get_multisig_transactions(h.safe).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].confirmations.len(), 2);
    }

    #[tokio::test]
    async fn test_skips_batch_posted_before_submit() {
        let mut h = harness(vec![batch(1)], 2);
        h.poster.fetch_pending_batches().await.unwrap();
        h.chain
            .set_reward_poster(batch(1).root, Address::repeat_byte(0x42));

        assert_eq!(h.poster.check_status().await.unwrap(), Some(RewardState::Skipped));
        assert_eq!(h.auth.proposal_count(), 0);
        assert_eq!(h.poster.check_status().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stuck_transaction_replaced_once() {
        let mut h = harness(vec![batch(1)], 2);
        h.poster.run_once().await.unwrap();
        let first = result(&h, 1);

        h.chain.advance(30);
        h.poster.check_status().await.unwrap();
        assert_eq!(h.chain.sent().len(), 1);

        h.chain.advance(1);
        assert_eq!(h.poster.check_status().await.unwrap(), Some(RewardState::Submitted));
        let sent = h.chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].nonce, sent[0].nonce);
        assert_eq!(
            sent[1].fees.max_priority_fee_per_gas,
            sent[0].fees.max_priority_fee_per_gas + GWEI
        );
        // Both caps go up by at least 10% or the node refuses the replacement.
        assert!(sent[1].fees.max_fee_per_gas * 10 >= sent[0].fees.max_fee_per_gas * 11);
        assert!(
            sent[1].fees.max_priority_fee_per_gas * 10
                >= sent[0].fees.max_priority_fee_per_gas * 11
        );

        let second = result(&h, 1);
        assert_ne!(second.hash, first.hash);
        assert_eq!(second.account_nonce, first.account_nonce);
        assert_eq!(second.fee, first.fee + GWEI);
        assert_eq!(second.post_block, h.chain.current_block());
        assert_eq!(second.safe_tx_hash, first.safe_tx_hash);
        assert_eq!(second.replaced, vec![first.hash]);

        // The replacement restarts the wait.
        h.poster.check_status().await.unwrap();
        assert_eq!(h.chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_revert_is_flagged_and_not_retried() {
        let mut h = harness(vec![batch(1)], 2);
        h.poster.run_once().await.unwrap();
        let submitted = result(&h, 1);

        let revert = Revert {
            reason: "GS013".into(),
        };
        h.chain.set_revert(Bytes::from(revert.abi_encode()));
        h.chain.mine(submitted.hash, false);
        h.chain.advance(12);

        assert_eq!(h.poster.check_status().await.unwrap(), Some(RewardState::Reverted));
        let info = result(&h, 1);
        assert!(info.reverted);
        assert_eq!(info.hash, submitted.hash);
        assert!(h.poster.ledger().is_pending(1));
        assert_eq!(h.poster.ledger().state(1), Some(RewardState::Reverted));

        h.chain.advance(100);
        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Reverted));
        assert_eq!(h.chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_wallet_transaction_is_transient() {
        let mut h = harness(vec![batch(1)], 2);
        h.poster.run_once().await.unwrap();
        let info = result(&h, 1);

        h.auth.forget(info.safe_tx_hash.unwrap());
        h.chain.advance(31);

        let err = h.poster.check_status().await.unwrap_err();
        assert!(matches!(err, RelayError::AuthService(_)));
        assert!(!err.is_fatal());
        assert_eq!(result(&h, 1), info);
        assert_eq!(h.chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_fast_sync_is_idempotent() {
        let mut h = harness((1..=5).map(batch).collect(), 2);
        for height in 1..=3 {
            h.chain
                .set_reward_poster(batch(height).root, Address::repeat_byte(0x42));
        }
        h.chain.set_wallet_nonce(Some(U256::from(5u64)));

        assert_eq!(h.poster.fast_sync().await.unwrap(), 3);
        let ledger = h.poster.ledger();
        for height in 1..=3 {
            assert_eq!(ledger.state(height), Some(RewardState::Synced));
        }
        assert_eq!(ledger.state(4), Some(RewardState::Fetched));
        assert!(ledger.record(5).is_none());

        let snapshot = ledger.snapshot();
        let saves = h.store.save_count();
        assert_eq!(h.poster.fast_sync().await.unwrap(), 0);
        assert_eq!(h.poster.ledger().snapshot(), snapshot);
        assert_eq!(h.store.save_count(), saves);
        assert_eq!(h.auth.proposal_count(), 0);
    }

    #[tokio::test]
    async fn test_fast_sync_stops_at_wallet_nonce() {
        let mut h = harness((1..=4).map(batch).collect(), 2);
        for height in 1..=4 {
            h.chain
                .set_reward_poster(batch(height).root, Address::repeat_byte(0x42));
        }
        h.chain.set_wallet_nonce(Some(U256::from(2u64)));

        assert_eq!(h.poster.fast_sync().await.unwrap(), 2);
        assert_eq!(h.poster.ledger().len(), 2);
        assert_eq!(h.poster.ledger().last_synced_height(), 2);

        let calls = h.source.list_calls();
        assert_eq!(h.poster.fast_sync().await.unwrap(), 0);
        assert_eq!(h.source.list_calls(), calls);

        // Whatever is left comes in through the normal fetch path.
        h.poster.fetch_pending_batches().await.unwrap();
        assert_eq!(h.poster.ledger().state(3), Some(RewardState::Skipped));
        assert_eq!(h.poster.ledger().state(4), Some(RewardState::Skipped));
    }

    #[tokio::test]
    async fn test_fast_sync_needs_wallet() {
        let mut h = harness(vec![batch(1)], 2);
        h.chain.set_wallet_nonce(None);
        let err = h.poster.fast_sync().await.unwrap_err();
        assert!(matches!(err, RelayError::WalletUnreachable(_)));
        assert!(h.poster.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_stops_loop() {
        let mut h = harness(vec![batch(1)], 2);
        h.store.fail_next_save();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            h.poster.run(std::future::pending::<()>()),
        )
        .await
        .expect("loop should stop on its own");

        assert!(matches!(outcome, Err(RelayError::Ledger(_))));
        assert!(h.poster.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_keep_loop_running() {
        let mut h = harness(vec![batch(1)], 2);
        h.source.fail_next("node restarting");

        let outcome = h
            .poster
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await;

        assert!(outcome.is_ok());
        assert!(h.source.list_calls() >= 2);
        assert_eq!(h.poster.ledger().state(1), Some(RewardState::Submitted));
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness(vec![batch(1), batch(2)], 2);
        h.poster.health_check().await.unwrap();

        h.source.fail_next("down");
        assert!(matches!(
            h.poster.health_check().await,
            Err(RelayError::Source(_))
        ));
    }

    #[tokio::test]
    async fn test_propose_fee_update() {
        let h = harness(vec![], 2);
        let (proposed, confirmed) = h
            .poster
            .propose_fee_update(U256::from(5000u64))
            .await
            .unwrap();

        assert!(confirmed);
        assert_eq!(&proposed.payload.data[..4], &[0xb1, 0x90, 0x50, 0xbd]);
        assert_eq!(proposed.payload.nonce, U256::ZERO);
        let tx = h.auth.transaction(proposed.safe_tx_hash).unwrap();
        assert_eq!(tx.confirmations.len(), 2);
    }

    #[tokio::test]
    async fn test_fee_update_queues_behind_open_reward_post() {
        let mut h = harness(vec![batch(1)], 3);
        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Proposed));

        let (proposed, confirmed) = h
            .poster
            .propose_fee_update(U256::from(5000u64))
            .await
            .unwrap();
        assert!(!confirmed);
        assert_eq!(proposed.payload.nonce, U256::from(1u64));
    }

    #[tokio::test]
    async fn test_block_read_failure_after_send_does_not_resend() {
        let mut h = harness(vec![batch(1)], 2);
        h.chain.fail_block_number_after_send();

        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Submitted));
        assert_eq!(h.chain.sent().len(), 1);
        let info = result(&h, 1);

        // The follow-up read fails once; nothing is sent again.
        assert!(matches!(
            h.poster.run_once().await,
            Err(RelayError::Rpc(_))
        ));
        assert_eq!(h.poster.run_once().await.unwrap(), Some(RewardState::Submitted));
        assert_eq!(h.chain.sent().len(), 1);
        assert_eq!(result(&h, 1), info);
    }

    #[tokio::test]
    async fn test_mined_original_after_replacement_is_finalized() {
        let mut h = harness(vec![batch(1), batch(2)], 2);
        h.poster.run_once().await.unwrap();
        let original = result(&h, 1);

        h.chain.advance(31);
        h.poster.check_status().await.unwrap();
        let replacement = result(&h, 1);
        assert_ne!(replacement.hash, original.hash);

        // The original wins the nonce; the replacement is gone.
        h.chain.mine(original.hash, true);
        let mined_at = h.chain.current_block();
        h.chain.advance(12);

        assert_eq!(h.poster.check_status().await.unwrap(), Some(RewardState::Finalized));
        let info = result(&h, 1);
        assert_eq!(info.hash, original.hash);
        assert_eq!(info.include_block, mined_at);
        assert_eq!(h.chain.sent().len(), 2);

        // The pipeline moves on to the next batch.
        assert_eq!(h.poster.check_status().await.unwrap(), Some(RewardState::Submitted));
        assert_eq!(h.poster.ledger().state(2), Some(RewardState::Submitted));
    }

    #[tokio::test]
    async fn test_untracked_post_is_skipped_instead_of_replaced() {
        let mut h = harness(vec![batch(1)], 2);
        h.poster.run_once().await.unwrap();

        h.chain
            .set_reward_poster(batch(1).root, Address::repeat_byte(0x42));
        h.chain.advance(31);

        assert_eq!(h.poster.check_status().await.unwrap(), Some(RewardState::Skipped));
        assert_eq!(h.chain.sent().len(), 1);
        assert!(!h.poster.ledger().is_pending(1));
        assert_eq!(h.poster.ledger().state(1), Some(RewardState::Skipped));
    }
}
