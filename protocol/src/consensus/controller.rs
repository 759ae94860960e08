//! # The dPoS Controller
//!
//! The session layer wrapped around the voter agent. The voter is a pure
//! state machine; everything impure lives here:
//!
//! - **Authentication** — incoming wire votes carry a public key and a
//!   signature over the salted signing hash. The controller verifies the
//!   signature, resolves the key against the committee registered at the
//!   vote's referenced tip, and only then hands the vote to the voter as an
//!   authenticated committee member.
//! - **Signing** — votes the voter emits are unsigned. The controller signs
//!   them with the local operator key, persists them, and broadcasts them.
//! - **Persistence & replay** — accepted records are appended to the
//!   [`VotingStore`] verbatim. On startup they are replayed into a fresh
//!   voter; if the replayed state fails verification, startup aborts with a
//!   reindex instruction rather than running on a broken foundation.
//! - **Timing** — a background tick services fetch requests from the
//!   mempool, fires the round-timeout PASS, decays the back-pressure
//!   timers, and garbage-collects tips that fell out of the keep window.
//! - **Block assembly** — when the voter reports a quorum, the controller
//!   collects the matching signatures out of its received-vote map into the
//!   block's aggregate slot and hands the block to the chain processor.
//!
//! Concurrency model: one `parking_lot::Mutex` serializes every touch of
//! the voter and the received-record maps. Peer handlers and the tick
//! contend for it; nothing holds it across a sleep or a network send.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    INITIAL_SYNC_DELAY_SECS, MAX_BLOCKS_TO_KEEP, MAX_TIP_AGE_SECS, POLLING_PERIOD_MS,
    RELAY_TTL_SECS, ROUND_BUDGET_MS, TEAM_SIZE,
};
use crate::consensus::committee::CommitteeView;
use crate::consensus::messages::{
    BlockHash, BlockToSubmit, Decision, FetchRequest, MemberId, Round, RoundVote, SignedRoundVote,
    SignedTxVote, Transaction, TxId, TxVote, ViceBlock, ZERO_HASH,
};
use crate::consensus::voter::{Voter, VoterOutput, WorldView};
use crate::crypto::keys::OperatorKeypair;
use crate::storage::db::{StoreError, VotingStore};

/// Cap on queued fetch requests, so a vote flood cannot balloon the
/// request set without bound.
const MAX_PENDING_REQUESTS: usize = 50_000;

// ---------------------------------------------------------------------------
// External services
// ---------------------------------------------------------------------------

/// The controller's read/submit window onto the PoW chain.
pub trait ChainAdapter {
    /// The current best chain tip.
    fn best_tip(&self) -> BlockHash;
    /// Height of the best tip.
    fn best_height(&self) -> u64;
    /// Height of `hash` if it is on the active chain within `max_depth`
    /// blocks of the tip; `None` for unknown or too-deep hashes.
    fn height_of(&self, hash: &BlockHash, max_depth: u32) -> Option<u64>;
    /// Block time (seconds) of a known block.
    fn block_time(&self, hash: &BlockHash) -> i64;
    /// Whether the dPoS chain upgrade is active at this height.
    fn upgrade_active_at(&self, height: u64) -> bool;
    /// Whether the node is still in initial block download.
    fn is_initial_block_download(&self) -> bool;
    /// Hand a finalized block (signature slot filled) to the chain
    /// processor. Returns `false` if the processor rejects it.
    fn submit_block(&self, block: &ViceBlock) -> bool;
}

/// Read access to the node's mempool, for servicing fetch requests.
pub trait MempoolView {
    fn lookup(&self, txid: &TxId) -> Option<Transaction>;
}

/// Outbound half of the p2p transport.
pub trait Relay {
    fn broadcast_vice_block(&self, block: &ViceBlock);
    fn broadcast_tx_vote(&self, vote: &SignedTxVote);
    fn broadcast_round_vote(&self, vote: &SignedRoundVote);
    /// Send targeted getdata-style requests to peers.
    fn request(&self, requests: &[FetchRequest]);
}

// ---------------------------------------------------------------------------
// Outcomes & errors
// ---------------------------------------------------------------------------

/// Denial-of-service score to apply to the peer that sent a message.
/// Zero means the message was fine (or merely useless).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerPenalty(pub u32);

impl PeerPenalty {
    pub const NONE: Self = Self(0);
    /// Mild: invalid-but-explicable (stale tip, voter-reported error).
    pub const MILD: Self = Self(1);
    /// The key verified but is not in the committee at the referenced tip.
    pub const NOT_A_MEMBER: Self = Self(10);
    /// Signature verification failed. Signatures are cheap to check, so a
    /// bad one is clearly hostile.
    pub const AUTH_FAILURE: Self = Self(100);
}

/// Fatal startup conditions. Persisted voting state that cannot be trusted
/// is not recovered from — the operator reindexes.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("dPoS store is corrupted (reading {0}); restart with --reindex to recover")]
    Corrupted(&'static str),

    #[error("replayed voting state failed verification; restart with --reindex to recover")]
    InconsistentState,

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Node-local controller tunables. Safety does not depend on any of these.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Expected committee size; dPoS is disabled at tips where the actual
    /// committee disagrees.
    pub team_size: usize,
    /// Wall-clock budget per voting round before the timeout PASS.
    pub round_budget_ms: i64,
    /// Background tick period.
    pub polling_period_ms: u64,
    /// How long to keep voting suspended after initial block download.
    pub initial_sync_delay_secs: i64,
    /// Maximum wall-clock lead over the tip's block time before voting is
    /// suspended as "behind".
    pub max_tip_age_secs: i64,
    /// Relay de-duplication cache lifetime.
    pub relay_ttl_secs: i64,
    /// Keep window: tips farther than this from the best tip are erased.
    pub max_keep_depth: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            team_size: TEAM_SIZE,
            round_budget_ms: ROUND_BUDGET_MS,
            polling_period_ms: POLLING_PERIOD_MS,
            initial_sync_delay_secs: INITIAL_SYNC_DELAY_SECS,
            max_tip_age_secs: MAX_TIP_AGE_SECS,
            relay_ttl_secs: RELAY_TTL_SECS,
            max_keep_depth: MAX_BLOCKS_TO_KEEP,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Everything behind the single serializing mutex: the voter plus the
/// controller's own record maps and timing state.
struct Inner<W> {
    voter: Voter<W>,
    /// Accepted wire tx votes by identity hash. BTreeMap so signature
    /// assembly iterates deterministically.
    received_tx_votes: BTreeMap<[u8; 32], SignedTxVote>,
    /// Accepted wire round votes by identity hash.
    received_round_votes: BTreeMap<[u8; 32], SignedRoundVote>,
    /// Identity hash → expiry (ms) for recently relayed/accepted items.
    relay_cache: BTreeMap<[u8; 32], i64>,
    /// Outstanding fetch requests, serviced by the tick.
    pending_requests: BTreeSet<FetchRequest>,
    /// True until the post-sync delay elapses; voting stays off and
    /// unknown-ancestor messages go unpunished while set.
    initial_votes_download: bool,
    /// When initial block download was first observed complete (ms), 0 if
    /// not yet.
    ibd_done_at_ms: i64,
    /// The round the timeout clock is measuring, and since when.
    observed_round: Round,
    round_started_at_ms: i64,
}

/// The session layer above one voter agent. See the module docs.
pub struct Controller<W: WorldView> {
    inner: Mutex<Inner<W>>,
    config: ControllerConfig,
    /// The local operator key; `None` for observer nodes, which relay and
    /// count votes but never sign any.
    keypair: Option<OperatorKeypair>,
    committee: Arc<dyn CommitteeView + Send + Sync>,
    chain: Arc<dyn ChainAdapter + Send + Sync>,
    mempool: Arc<dyn MempoolView + Send + Sync>,
    relay: Arc<dyn Relay + Send + Sync>,
    store: VotingStore,
}

impl<W: WorldView> Controller<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        voter: Voter<W>,
        keypair: Option<OperatorKeypair>,
        committee: Arc<dyn CommitteeView + Send + Sync>,
        chain: Arc<dyn ChainAdapter + Send + Sync>,
        mempool: Arc<dyn MempoolView + Send + Sync>,
        relay: Arc<dyn Relay + Send + Sync>,
        store: VotingStore,
        config: ControllerConfig,
    ) -> Self {
        info!(
            team_size = config.team_size,
            quorum = voter.params().min_quorum,
            signer = keypair.is_some(),
            "dpos controller initialized"
        );
        Self {
            inner: Mutex::new(Inner {
                voter,
                received_tx_votes: BTreeMap::new(),
                received_round_votes: BTreeMap::new(),
                relay_cache: BTreeMap::new(),
                pending_requests: BTreeSet::new(),
                initial_votes_download: true,
                ibd_done_at_ms: 0,
                observed_round: 1,
                round_started_at_ms: 0,
            }),
            config,
            keypair,
            committee,
            chain,
            mempool,
            relay,
            store,
        }
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Replay the persisted stores into the voter.
    ///
    /// Every record's identity hash is re-checked against its content;
    /// votes are re-authenticated against committee history. Fails fast on
    /// any inconsistency — see [`StartupError`].
    pub fn load_from_store(&self) -> Result<(), StartupError> {
        let mut inner = self.inner.lock();

        for (key, block) in self.store.vice_blocks()? {
            if block.hash() != key {
                return Err(StartupError::Corrupted("vice-blocks"));
            }
            inner.voter.insert_vice_block(block);
        }

        for (key, wire) in self.store.round_votes()? {
            if wire.identity_hash() != key {
                return Err(StartupError::Corrupted("round votes"));
            }
            if let Some(member) = self.resolve_signer_round(&wire) {
                let vote = RoundVote {
                    voter: member,
                    round: wire.round,
                    tip: wire.tip,
                    choice: wire.choice,
                };
                inner.voter.insert_round_vote(vote);
                inner.received_round_votes.insert(key, wire);
            }
        }

        for (key, wire) in self.store.tx_votes()? {
            if wire.identity_hash() != key {
                return Err(StartupError::Corrupted("tx votes"));
            }
            if let Some(member) = self.resolve_signer_tx(&wire) {
                for choice in &wire.choices {
                    inner.voter.insert_tx_vote(TxVote {
                        voter: member,
                        round: wire.round,
                        tip: wire.tip,
                        choice: *choice,
                    });
                }
                inner.received_tx_votes.insert(key, wire);
            }
        }

        if !inner.voter.verify_voting_state() {
            return Err(StartupError::InconsistentState);
        }

        info!(
            round_votes = inner.received_round_votes.len(),
            tx_votes = inner.received_tx_votes.len(),
            "replayed dpos store"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Peer entry points
    // -----------------------------------------------------------------------

    /// Ingest a vice-block from a peer (or the local proposer).
    pub fn process_vice_block(&self, block: ViceBlock) -> PeerPenalty {
        let hash = block.hash();
        let mut inner = self.inner.lock();
        inner.pending_requests.remove(&FetchRequest::ViceBlock(hash));

        if inner.relay_cache.contains_key(&hash) {
            return PeerPenalty::NONE;
        }

        let out = inner.voter.apply_vice_block(block.clone());
        let penalty = self.handle_output(&mut inner, out);
        if penalty == PeerPenalty::NONE {
            if let Err(e) = self.store.put_vice_block(&block) {
                warn!(error = %e, "failed to persist vice-block");
            }
            self.cache_and_relay_block(&mut inner, &block, hash);
        }
        penalty
    }

    /// Ingest an instant transaction (from the mempool sync or a peer).
    pub fn process_tx(&self, tx: Transaction) {
        let mut inner = self.inner.lock();
        inner.pending_requests.remove(&FetchRequest::Tx(tx.txid()));
        let out = inner.voter.apply_tx(tx);
        self.handle_output(&mut inner, out);
    }

    /// Ingest a signed transaction vote from a peer.
    pub fn process_tx_vote(&self, wire: SignedTxVote) -> PeerPenalty {
        let id = wire.identity_hash();
        let mut inner = self.inner.lock();
        if inner.received_tx_votes.contains_key(&id) {
            return PeerPenalty::NONE;
        }
        // Exactly one choice per vote: partially-applied multi-choice votes
        // would leave the doublesign rule ambiguous.
        if wire.choices.len() != 1 {
            debug!("dropping tx vote with {} choices", wire.choices.len());
            return PeerPenalty::NONE;
        }

        let member = match self.authenticate_tx(&wire, inner.initial_votes_download) {
            Ok(member) => member,
            Err(penalty) => return penalty,
        };

        let vote = TxVote {
            voter: member,
            round: wire.round,
            tip: wire.tip,
            choice: wire.choices[0],
        };
        let out = inner.voter.apply_tx_vote(vote);
        let penalty = self.handle_output(&mut inner, out);
        if penalty == PeerPenalty::NONE {
            if let Err(e) = self.store.put_tx_vote(&wire) {
                warn!(error = %e, "failed to persist tx vote");
            }
            self.relay.broadcast_tx_vote(&wire);
            let expiry = self.now_ms(&inner) + self.config.relay_ttl_secs * 1000;
            inner.relay_cache.insert(id, expiry);
            inner.received_tx_votes.insert(id, wire);
        }
        penalty
    }

    /// Ingest a signed round vote from a peer.
    pub fn process_round_vote(&self, wire: SignedRoundVote) -> PeerPenalty {
        let id = wire.identity_hash();
        let mut inner = self.inner.lock();
        if inner.received_round_votes.contains_key(&id) {
            return PeerPenalty::NONE;
        }

        let member = match self.authenticate_round(&wire, inner.initial_votes_download) {
            Ok(member) => member,
            Err(penalty) => return penalty,
        };

        // Insert into the received map *before* applying: this very vote
        // can complete a quorum, and signature assembly must find it.
        inner.received_round_votes.insert(id, wire.clone());

        let vote = RoundVote {
            voter: member,
            round: wire.round,
            tip: wire.tip,
            choice: wire.choice,
        };
        let out = inner.voter.apply_round_vote(vote);
        let penalty = self.handle_output(&mut inner, out);
        if penalty == PeerPenalty::NONE {
            if let Err(e) = self.store.put_round_vote(&wire) {
                warn!(error = %e, "failed to persist round vote");
            }
            self.relay.broadcast_round_vote(&wire);
            let expiry = self.now_ms(&inner) + self.config.relay_ttl_secs * 1000;
            inner.relay_cache.insert(id, expiry);
        } else {
            inner.received_round_votes.remove(&id);
        }
        penalty
    }

    /// React to a new best chain tip.
    pub fn on_chain_tip_updated(&self, tip: BlockHash) {
        let mut inner = self.inner.lock();
        self.tip_updated_locked(&mut inner, tip);
    }

    // -----------------------------------------------------------------------
    // Gating
    // -----------------------------------------------------------------------

    /// Is dPoS enabled at this tip right now? Requires the chain upgrade,
    /// a full-size committee, and a reasonably fresh tip.
    pub fn is_enabled(&self, now_secs: i64, tip: &BlockHash) -> bool {
        let Some(height) = self.chain.height_of(tip, self.config.max_keep_depth) else {
            return false;
        };
        if !self.chain.upgrade_active_at(height) {
            return false;
        }
        let team = self
            .committee
            .committee_at(tip)
            .map(|c| c.len())
            .unwrap_or(0);
        if team != self.config.team_size {
            return false;
        }
        now_secs < self.chain.block_time(tip) + self.config.max_tip_age_secs
    }

    // -----------------------------------------------------------------------
    // Background tick
    // -----------------------------------------------------------------------

    /// One polling quantum: IBD gating, fetch servicing, round timeout,
    /// timer decay, relay-cache expiry, and garbage collection.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        let now = self.now_ms(&inner);

        // Leave initial-votes-download once the chain has been synced for
        // the configured delay.
        if inner.ibd_done_at_ms == 0 && !self.chain.is_initial_block_download() {
            inner.ibd_done_at_ms = now;
        }
        if inner.initial_votes_download
            && inner.ibd_done_at_ms > 0
            && now - inner.ibd_done_at_ms > self.config.initial_sync_delay_secs * 1000
        {
            info!("initial votes download complete, enabling voting");
            inner.initial_votes_download = false;
            let tip = self.chain.best_tip();
            self.tip_updated_locked(&mut inner, tip);
        }

        // Service fetch requests from the mempool first; whatever is left
        // goes to peers as targeted requests.
        let tx_requests: Vec<TxId> = inner
            .pending_requests
            .iter()
            .filter_map(|req| match req {
                FetchRequest::Tx(txid) => Some(*txid),
                FetchRequest::ViceBlock(_) => None,
            })
            .collect();
        for txid in tx_requests {
            if let Some(tx) = self.mempool.lookup(&txid) {
                inner.pending_requests.remove(&FetchRequest::Tx(txid));
                let out = inner.voter.apply_tx(tx);
                self.handle_output(&mut inner, out);
            }
        }
        if !inner.pending_requests.is_empty() {
            let requests: Vec<FetchRequest> = inner.pending_requests.iter().copied().collect();
            self.relay.request(&requests);
        }

        // Round timeout: if the round hasn't moved within the budget, cast
        // the PASS that breaks a silent quorum.
        let round = inner.voter.current_round();
        if round != inner.observed_round || inner.round_started_at_ms == 0 {
            inner.observed_round = round;
            inner.round_started_at_ms = now;
        } else if now - inner.round_started_at_ms > self.config.round_budget_ms {
            let out = inner.voter.on_round_too_long();
            self.handle_output(&mut inner, out);
            inner.round_started_at_ms = now;
        }

        // Decay the back-pressure timers; the skip timer runs 5x faster.
        inner.voter.skip_blocks_timer = (inner.voter.skip_blocks_timer - 5).max(0);
        inner.voter.no_voting_timer = (inner.voter.no_voting_timer - 1).max(0);

        // Expire the relay cache.
        inner.relay_cache.retain(|_, expiry| *expiry > now);

        self.collect_garbage(&mut inner);
    }

    /// Run the controller loop until a shutdown signal arrives.
    ///
    /// This is the node's long-lived dPoS task: tick, sleep, repeat. The
    /// shutdown channel is checked at every iteration boundary and during
    /// the sleep, so exit latency is bounded by neither.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("dpos controller loop starting");
        loop {
            if *shutdown.borrow() {
                info!("dpos controller received shutdown signal, exiting cleanly");
                return;
            }

            self.tick();

            tokio::select! {
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(
                    self.config.polling_period_ms,
                )) => {}
                _ = shutdown.changed() => {
                    info!("dpos controller shutting down during sleep");
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries (RPC / wallet / miner surface)
    // -----------------------------------------------------------------------

    /// Committed instant transactions at the current tip.
    pub fn list_committed_transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner.voter.committed_txs().txs.into_values().collect()
    }

    /// Is this transaction committed within the lookup window?
    pub fn is_committed_tx(&self, txid: &TxId, max_depth: u32) -> bool {
        let inner = self.inner.lock();
        let tip = *inner.voter.tip();
        inner.voter.is_committed_tx(txid, tip, max_depth)
    }

    /// Is this transaction provably unable to commit?
    pub fn is_not_committable_tx(&self, txid: &TxId) -> bool {
        self.inner.lock().voter.is_not_committable_tx(txid)
    }

    /// Should the local miner keep this transaction out of block templates?
    pub fn exclude_tx_from_block(&self, tx: &Transaction) -> bool {
        self.inner.lock().voter.should_exclude_from_block(tx)
    }

    /// The round the committee is currently voting in, or 0 when dPoS is
    /// disabled at the current tip.
    pub fn current_voting_round(&self, now_secs: i64) -> Round {
        let inner = self.inner.lock();
        let tip = *inner.voter.tip();
        if tip != ZERO_HASH && self.is_enabled(now_secs, &tip) {
            inner.voter.lowest_not_occupied_round()
        } else {
            0
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn now_ms(&self, inner: &Inner<W>) -> i64 {
        inner.voter.world().time_millis()
    }

    fn tip_updated_locked(&self, inner: &mut Inner<W>, tip: BlockHash) {
        let now_secs = self.now_ms(inner) / 1000;
        if !self.is_enabled(now_secs, &tip) {
            debug!(tip = %hex::encode(tip), "dpos disabled at tip");
            return;
        }

        // Resolve our own seat in the committee at this tip.
        let my_seat: Option<MemberId> = self.keypair.as_ref().and_then(|kp| {
            self.committee
                .committee_at(&tip)?
                .member_by_key(&kp.public_key())
        });

        match my_seat {
            Some(member) if !inner.initial_votes_download && !inner.voter.am_i_voter() => {
                info!(member = %hex::encode(member), "joined the committee, enabling voting");
                inner.voter.set_voting(true, member);
            }
            None if inner.voter.am_i_voter() => {
                info!("left the committee, disabling voting");
                inner.voter.set_voting(false, [0u8; 32]);
            }
            _ => {}
        }

        inner.voter.update_tip(tip);
        let mut out = inner.voter.request_missing_txs();
        out += inner.voter.do_txs_voting();
        out += inner.voter.do_round_voting();
        self.handle_output(inner, out);

        self.collect_garbage(inner);
    }

    /// Translate a voter output into the world: penalties for errors, or
    /// signing + persistence + relay + submission for everything else.
    fn handle_output(&self, inner: &mut Inner<W>, out: VoterOutput) -> PeerPenalty {
        if !out.errors.is_empty() {
            for error in &out.errors {
                warn!(%error, "voter rejected peer message");
            }
            return if inner.initial_votes_download {
                PeerPenalty::NONE
            } else {
                PeerPenalty::MILD
            };
        }
        if out.is_empty() {
            return PeerPenalty::NONE;
        }

        // Sign and publish our own votes. Round votes first: a round vote
        // of ours may complete the quorum the block submission below needs.
        if let Some(keypair) = &self.keypair {
            for vote in &out.round_votes {
                let mut wire = SignedRoundVote::unsigned(vote, keypair.public_key());
                wire.signature = keypair.sign(&wire.signing_hash());
                let id = wire.identity_hash();
                if let Err(e) = self.store.put_round_vote(&wire) {
                    warn!(error = %e, "failed to persist own round vote");
                }
                self.relay.broadcast_round_vote(&wire);
                let expiry = self.now_ms(inner) + self.config.relay_ttl_secs * 1000;
                inner.relay_cache.insert(id, expiry);
                inner.received_round_votes.insert(id, wire);
            }
            for vote in &out.tx_votes {
                let mut wire = SignedTxVote::unsigned(vote, keypair.public_key());
                wire.signature = keypair.sign(&wire.signing_hash());
                let id = wire.identity_hash();
                if let Err(e) = self.store.put_tx_vote(&wire) {
                    warn!(error = %e, "failed to persist own tx vote");
                }
                self.relay.broadcast_tx_vote(&wire);
                let expiry = self.now_ms(inner) + self.config.relay_ttl_secs * 1000;
                inner.relay_cache.insert(id, expiry);
                inner.received_tx_votes.insert(id, wire);
            }
        } else if !out.round_votes.is_empty() || !out.tx_votes.is_empty() {
            warn!("voter emitted votes but no operator key is configured");
        }

        // Queue fetch requests, bounded.
        for txid in out.tx_requests {
            if inner.pending_requests.len() >= MAX_PENDING_REQUESTS {
                break;
            }
            inner.pending_requests.insert(FetchRequest::Tx(txid));
        }
        for hash in out.vice_block_requests {
            if inner.pending_requests.len() >= MAX_PENDING_REQUESTS {
                break;
            }
            inner.pending_requests.insert(FetchRequest::ViceBlock(hash));
        }

        if let Some(submit) = out.block_to_submit {
            self.assemble_and_submit(inner, submit);
        }

        PeerPenalty::NONE
    }

    /// Fill the block's aggregate-signature slot from the received round
    /// votes and hand it to the chain processor.
    fn assemble_and_submit(&self, inner: &mut Inner<W>, submit: BlockToSubmit) {
        let mut block = submit.block;
        let hash = block.hash();
        let min_quorum = inner.voter.params().min_quorum;

        let mut signatures = 0usize;
        for wire in inner.received_round_votes.values() {
            if wire.round != block.round
                || wire.choice.decision != Decision::Yes
                || wire.choice.subject != hash
            {
                continue;
            }
            if !wire.signature.is_well_formed() {
                continue;
            }
            if self.resolve_signer_round(wire).is_none() {
                continue;
            }
            block.signatures.extend_from_slice(wire.signature.as_bytes());
            signatures += 1;
        }

        if signatures < min_quorum {
            warn!(
                block = %hex::encode(hash),
                signatures,
                min_quorum,
                "cannot submit block: missing signatures"
            );
            return;
        }

        info!(
            block = %hex::encode(hash),
            signatures,
            approved_by = submit.approved_by.len(),
            "submitting finalized block to chain processor"
        );
        if !self.chain.submit_block(&block) {
            warn!(block = %hex::encode(hash), "chain processor rejected the block");
        }
    }

    /// Drop every tip (and all records keyed on it) that fell out of the
    /// keep window.
    fn collect_garbage(&self, inner: &mut Inner<W>) {
        let best_height = self.chain.best_height();
        let max_keep = self.config.max_keep_depth;

        for tip in inner.voter.voting_tips() {
            let stale = match self.chain.height_of(&tip, max_keep * 2) {
                Some(height) => best_height.saturating_sub(height) > u64::from(max_keep),
                None => true,
            };
            if !stale {
                continue;
            }

            let block_hashes: Vec<[u8; 32]> = inner
                .voter
                .voting_at(&tip)
                .map(|state| state.vice_blocks.keys().copied().collect())
                .unwrap_or_default();

            let round_vote_ids: Vec<[u8; 32]> = inner
                .received_round_votes
                .iter()
                .filter(|(_, wire)| wire.tip == tip)
                .map(|(id, _)| *id)
                .collect();
            let tx_vote_ids: Vec<[u8; 32]> = inner
                .received_tx_votes
                .iter()
                .filter(|(_, wire)| wire.tip == tip)
                .map(|(id, _)| *id)
                .collect();

            debug!(
                tip = %hex::encode(tip),
                vice_blocks = block_hashes.len(),
                round_votes = round_vote_ids.len(),
                tx_votes = tx_vote_ids.len(),
                "garbage-collecting stale voting"
            );

            if let Err(e) = self.store.erase_vice_blocks(&block_hashes) {
                warn!(error = %e, "failed to erase vice-blocks");
            }
            if let Err(e) = self.store.erase_round_votes(&round_vote_ids) {
                warn!(error = %e, "failed to erase round votes");
            }
            if let Err(e) = self.store.erase_tx_votes(&tx_vote_ids) {
                warn!(error = %e, "failed to erase tx votes");
            }
            for id in round_vote_ids {
                inner.received_round_votes.remove(&id);
            }
            for id in tx_vote_ids {
                inner.received_tx_votes.remove(&id);
            }
            inner.voter.forget_voting(&tip);
        }
    }

    fn cache_and_relay_block(&self, inner: &mut Inner<W>, block: &ViceBlock, hash: [u8; 32]) {
        let expiry = self.now_ms(inner) + self.config.relay_ttl_secs * 1000;
        inner.relay_cache.insert(hash, expiry);
        self.relay.broadcast_vice_block(block);
    }

    /// Verify a round vote's signature and resolve the signer to a seat.
    fn authenticate_round(
        &self,
        wire: &SignedRoundVote,
        during_ibd: bool,
    ) -> Result<MemberId, PeerPenalty> {
        if !wire.public_key.verify(&wire.signing_hash(), &wire.signature) {
            return Err(PeerPenalty::AUTH_FAILURE);
        }
        self.resolve_member(&wire.tip, &wire.public_key, during_ibd)
    }

    fn authenticate_tx(
        &self,
        wire: &SignedTxVote,
        during_ibd: bool,
    ) -> Result<MemberId, PeerPenalty> {
        if !wire.public_key.verify(&wire.signing_hash(), &wire.signature) {
            return Err(PeerPenalty::AUTH_FAILURE);
        }
        self.resolve_member(&wire.tip, &wire.public_key, during_ibd)
    }

    fn resolve_member(
        &self,
        tip: &BlockHash,
        key: &crate::crypto::keys::OperatorPublicKey,
        during_ibd: bool,
    ) -> Result<MemberId, PeerPenalty> {
        let Some(committee) = self.committee.committee_at(tip) else {
            // Unknown block: tolerated during sync, mildly punished after.
            return Err(if during_ibd {
                PeerPenalty::NONE
            } else {
                PeerPenalty::MILD
            });
        };
        committee
            .member_by_key(key)
            .ok_or(PeerPenalty::NOT_A_MEMBER)
    }

    /// Signature-validity-only resolution for replay and assembly paths,
    /// where a failure means "skip", not "punish".
    fn resolve_signer_round(&self, wire: &SignedRoundVote) -> Option<MemberId> {
        if !wire.public_key.verify(&wire.signing_hash(), &wire.signature) {
            return None;
        }
        self.committee
            .committee_at(&wire.tip)?
            .member_by_key(&wire.public_key)
    }

    fn resolve_signer_tx(&self, wire: &SignedTxVote) -> Option<MemberId> {
        if !wire.public_key.verify(&wire.signing_hash(), &wire.signature) {
            return None;
        }
        self.committee
            .committee_at(&wire.tip)?
            .member_by_key(&wire.public_key)
    }

    /// Whether voting is still suspended for initial sync. Exposed for the
    /// node's status surface.
    pub fn is_initial_votes_download(&self) -> bool {
        self.inner.lock().initial_votes_download
    }

    /// Force the initial-votes-download gate (tests and devnet harnesses
    /// that have no real sync phase).
    pub fn set_initial_votes_download(&self, value: bool) {
        self.inner.lock().initial_votes_download = value;
    }
}
