//! # The Voter Agent
//!
//! The deterministic state machine at the center of the dPoS layer. One
//! instance runs per operator. It ingests four kinds of messages — new
//! transactions, new vice-blocks, transaction votes, round votes — against
//! a current chain tip, and emits votes to broadcast, fetch requests for
//! data it lacks, at most one assembled block per call, and structured
//! errors identifying misbehaving peers.
//!
//! ## What the voter guarantees
//!
//! - **Safety**: it never votes YES on two transactions spending the same
//!   input at one tip, and never casts more than one round-YES per round.
//!   Combined with the quorum overlap (`2 * MIN_QUORUM > TEAM_SIZE`), no
//!   two conflicting transactions commit and no two blocks win a round.
//! - **Liveness**: a round that provably cannot elect a block — even if
//!   every silent voter showed up — is a stalemate, and the round counter
//!   advances past it.
//! - **Bounded memory**: per-tip state is dropped by the controller once a
//!   tip falls out of the keep window, and transaction bodies leave when
//!   the tip changes and they are finalized.
//!
//! ## What the voter deliberately is not
//!
//! It is NOT thread-safe, does no I/O, holds no clocks, and never talks to
//! another voter. The controller owns the single serializing mutex; tests
//! own fleets of voters and shuttle outputs between them by hand. Chain
//! access happens exclusively through the [`WorldView`] hooks handed in at
//! construction — unit tests supply a toy ledger and get the full state
//! machine under deterministic control.
//!
//! Missing data is never an error here. A vote on an unseen transaction is
//! accepted and counted — quorum math runs on subjects, not bodies — and a
//! fetch request is emitted so the controller can find the bytes.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    GUARANTEES_MEMORY, MAX_NOT_VOTED_TXS_TO_KEEP, MAX_TX_VOTES_FROM_VOTER, MIN_QUORUM, TEAM_SIZE,
    TX_EXPIRING_SOON_THRESHOLD, VOTING_MEMORY,
};
use crate::consensus::messages::{
    BlockHash, BlockToSubmit, Decision, MemberId, OutPoint, Round, RoundVote, Transaction, TxId,
    TxVote, ViceBlock, VoteChoice, ZERO_HASH,
};
use crate::consensus::state::{InsertOutcome, TipVotingState};
use crate::consensus::tally::{self, QuorumParams};

// ---------------------------------------------------------------------------
// World hooks
// ---------------------------------------------------------------------------

/// The voter's window onto everything it does not own: the UTXO validator,
/// the chain index, and the wall clock. Handed in at construction; the
/// voter has no other way to observe the world.
///
/// Production wires these to the chain validator; tests model a toy ledger.
/// Every hook is synchronous and must not call back into the voter.
pub trait WorldView {
    /// Cheap structural + consensus check on a single transaction. Excludes
    /// non-instant, shielded, and protocol-metadata transactions, and
    /// transactions expiring within `expiring_soon_threshold` blocks.
    fn pre_validate_tx(&self, tx: &Transaction, expiring_soon_threshold: u32) -> bool;

    /// Whole-set validity against the current chain view: no input conflict
    /// within the set, nor with the chain.
    fn validate_tx_set(&self, txs: &BTreeMap<TxId, Transaction>) -> bool;

    /// Contextual block check against a committed transaction set. With
    /// `full_check = false` only the header is examined.
    fn validate_block(
        &self,
        block: &ViceBlock,
        committed: &BTreeMap<TxId, Transaction>,
        full_check: bool,
    ) -> bool;

    /// Whether ancillary data tied to this ancestor is still worth keeping.
    fn allow_archiving(&self, tip: &BlockHash) -> bool;

    /// Walk back by one block. Returns [`ZERO_HASH`] when unknown.
    fn prev_block(&self, block: &BlockHash) -> BlockHash;

    /// Wall-clock in milliseconds. The voter itself never reads this; it is
    /// threaded through for the controller's benefit.
    fn time_millis(&self) -> i64;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A structured reason for rejecting a peer message. These ride in
/// [`VoterOutput::errors`]; the controller grades them into peer penalties.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoterError {
    #[error("malformed vice-block: {0}")]
    MalformedViceBlock(&'static str),

    #[error("malformed transaction vote: {0}")]
    MalformedTxVote(&'static str),

    #[error("malformed round vote: {0}")]
    MalformedRoundVote(&'static str),

    #[error("vice-block failed header validation")]
    InvalidViceBlock,

    #[error("transaction doublesign by {}", hex::encode(.voter))]
    TxDoublesign { voter: MemberId },

    #[error("round doublesign by {}", hex::encode(.voter))]
    RoundDoublesign { voter: MemberId },

    #[error("message references unknown ancestor {}", hex::encode(.tip))]
    UnknownAncestor { tip: BlockHash },
}

// ---------------------------------------------------------------------------
// Output accumulator
// ---------------------------------------------------------------------------

/// Everything one voter call wants the outside world to do.
///
/// Sub-operations communicate exclusively by returning one of these and
/// merging it into the caller's accumulator with `+=` — there is no other
/// side channel, which is what keeps replaying a call sequence an exact
/// science.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoterOutput {
    /// Unsigned transaction votes to sign and broadcast.
    pub tx_votes: Vec<TxVote>,
    /// Unsigned round votes to sign and broadcast.
    pub round_votes: Vec<RoundVote>,
    /// Transaction bodies to fetch.
    pub tx_requests: Vec<TxId>,
    /// Vice-blocks to fetch.
    pub vice_block_requests: Vec<BlockHash>,
    /// A vice-block that reached quorum, ready for signature assembly.
    pub block_to_submit: Option<BlockToSubmit>,
    /// Peer misbehavior detected while processing.
    pub errors: Vec<VoterError>,
}

impl VoterOutput {
    /// True when the call produced nothing at all.
    pub fn is_empty(&self) -> bool {
        self.tx_votes.is_empty()
            && self.round_votes.is_empty()
            && self.tx_requests.is_empty()
            && self.vice_block_requests.is_empty()
            && self.block_to_submit.is_none()
            && self.errors.is_empty()
    }

    fn error(err: VoterError) -> Self {
        Self {
            errors: vec![err],
            ..Self::default()
        }
    }
}

impl std::ops::AddAssign for VoterOutput {
    fn add_assign(&mut self, rhs: Self) {
        self.tx_votes.extend(rhs.tx_votes);
        self.round_votes.extend(rhs.round_votes);
        self.tx_requests.extend(rhs.tx_requests);
        self.vice_block_requests.extend(rhs.vice_block_requests);
        self.errors.extend(rhs.errors);
        if rhs.block_to_submit.is_some() {
            self.block_to_submit = rhs.block_to_submit;
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The four message kinds the voter ingests, as one tagged variant for
/// callers that route a mixed stream.
#[derive(Debug, Clone)]
pub enum VoterInput {
    Tx(Transaction),
    ViceBlock(ViceBlock),
    TxVote(TxVote),
    RoundVote(RoundVote),
}

// ---------------------------------------------------------------------------
// Parameters & query results
// ---------------------------------------------------------------------------

/// Committee sizing and backpressure bounds for one voter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoterParams {
    /// Committee seats.
    pub num_of_voters: usize,
    /// YES votes needed on a subject.
    pub min_quorum: usize,
    /// Tx votes accepted from one member at one tip before dropping.
    pub max_tx_votes_from_voter: usize,
    /// Unvoted transaction bodies kept before dropping new ones.
    pub max_not_voted_txs_to_keep: usize,
}

impl Default for VoterParams {
    fn default() -> Self {
        Self {
            num_of_voters: TEAM_SIZE,
            min_quorum: MIN_QUORUM,
            max_tx_votes_from_voter: MAX_TX_VOTES_FROM_VOTER,
            max_not_voted_txs_to_keep: MAX_NOT_VOTED_TXS_TO_KEEP,
        }
    }
}

/// The committed transaction set within a lookup window. `missing` lists
/// transactions known to be committed whose bodies we have not seen —
/// possible after a reindex, and the reason vice-block validation treats
/// the committed list as a lower bound rather than gospel.
#[derive(Debug, Clone, Default)]
pub struct CommittedTxs {
    pub txs: BTreeMap<TxId, Transaction>,
    pub missing: BTreeSet<TxId>,
}

/// Transactions this operator has pledged itself to (YES votes within the
/// voting-memory window), with bodies resolved where possible.
#[derive(Debug, Default)]
struct MyPledge {
    txs: BTreeMap<TxId, Transaction>,
    missing: BTreeSet<TxId>,
}

// ---------------------------------------------------------------------------
// The voter
// ---------------------------------------------------------------------------

/// The per-operator dPoS state machine. See the module docs for the
/// contract; see [`WorldView`] for the only dependencies it has.
pub struct Voter<W> {
    world: W,
    params: VoterParams,

    me: MemberId,
    am_i_voter: bool,
    tip: BlockHash,

    /// Voting state per tip. Created on first ingest for a tip, erased by
    /// the controller's garbage collection.
    votings: BTreeMap<BlockHash, TipVotingState>,
    /// Transaction bodies by txid.
    txs: BTreeMap<TxId, Transaction>,
    /// Outpoints claimed by transactions I voted YES on. Functional: one
    /// txid per outpoint, which is exactly invariant P3.
    pledged_inputs: BTreeMap<OutPoint, TxId>,

    /// Back-pressure counter decayed by the controller tick (5x faster than
    /// `no_voting_timer`). No consensus meaning.
    pub skip_blocks_timer: i32,
    /// While positive, the voter abstains from casting new round-YES votes.
    /// Liveness throttle only; vote acceptance is unaffected.
    pub no_voting_timer: i32,
}

impl<W: WorldView> Voter<W> {
    /// A fresh voter with no tip and voting disabled. Call
    /// [`update_tip`](Self::update_tip) and [`set_voting`](Self::set_voting)
    /// before feeding it messages.
    pub fn new(world: W, params: VoterParams) -> Self {
        Self {
            world,
            params,
            me: [0u8; 32],
            am_i_voter: false,
            tip: ZERO_HASH,
            votings: BTreeMap::new(),
            txs: BTreeMap::new(),
            pledged_inputs: BTreeMap::new(),
            skip_blocks_timer: 0,
            no_voting_timer: 0,
        }
    }

    /// Enable or disable active voting. `me` is this operator's committee
    /// member ID at the current tip; ignored while disabled.
    pub fn set_voting(&mut self, am_i_voter: bool, me: MemberId) {
        self.am_i_voter = am_i_voter;
        self.me = me;
    }

    /// The current chain tip.
    pub fn tip(&self) -> &BlockHash {
        &self.tip
    }

    /// Whether this instance votes or merely observes.
    pub fn am_i_voter(&self) -> bool {
        self.am_i_voter
    }

    /// The sizing this voter runs with.
    pub fn params(&self) -> VoterParams {
        self.params
    }

    /// The world hooks this voter was constructed with. The controller
    /// reads the clock through here so core and session share one time
    /// source.
    pub fn world(&self) -> &W {
        &self.world
    }

    fn quorum(&self) -> QuorumParams {
        QuorumParams {
            num_of_voters: self.params.num_of_voters,
            min_quorum: self.params.min_quorum,
        }
    }

    // -----------------------------------------------------------------------
    // Message ingestion
    // -----------------------------------------------------------------------

    /// Route a tagged input to its handler.
    pub fn apply(&mut self, input: VoterInput) -> VoterOutput {
        match input {
            VoterInput::Tx(tx) => self.apply_tx(tx),
            VoterInput::ViceBlock(block) => self.apply_vice_block(block),
            VoterInput::TxVote(vote) => self.apply_tx_vote(vote),
            VoterInput::RoundVote(vote) => self.apply_round_vote(vote),
        }
    }

    /// Move to a new chain tip.
    ///
    /// Transaction bodies finalized at the old tip — committed or provably
    /// not committable — are pruned, along with their pledge entries. The
    /// per-tip voting state is untouched: the old tip may still be voted on
    /// by laggards, and archival is the controller's job.
    pub fn update_tip(&mut self, new_tip: BlockHash) {
        info!(
            from = %hex::encode(self.tip),
            to = %hex::encode(new_tip),
            "changing current tip"
        );
        if self.tip != ZERO_HASH && self.tip != new_tip {
            self.prune_finished_txs();
        }
        self.tip = new_tip;
    }

    /// Ingest a vice-block proposal.
    pub fn apply_vice_block(&mut self, block: ViceBlock) -> VoterOutput {
        if block.round == 0 {
            return VoterOutput::error(VoterError::MalformedViceBlock("round must be positive"));
        }
        if !block.signatures.is_empty() {
            return VoterOutput::error(VoterError::MalformedViceBlock(
                "signature slot must be empty before quorum",
            ));
        }
        if !self.world.validate_block(&block, &BTreeMap::new(), false) {
            return VoterOutput::error(VoterError::InvalidViceBlock);
        }

        let hash = block.hash();
        if block.prev != self.tip && !self.world.allow_archiving(&block.prev) {
            debug!(block = %hex::encode(hash), "dropping vice-block for unknown ancestor");
            return VoterOutput::error(VoterError::UnknownAncestor { tip: block.prev });
        }

        let prev = block.prev;
        let round = block.round;
        if !self.votings.entry(prev).or_default().insert_vice_block(block) {
            debug!(block = %hex::encode(hash), "ignoring duplicate vice-block");
            return VoterOutput::default();
        }

        debug!(block = %hex::encode(hash), round, "stored vice-block");
        if prev == self.tip && round == self.current_round() {
            self.do_round_voting()
        } else {
            debug!(block = %hex::encode(hash), "vice-block targets a non-current round");
            VoterOutput::default()
        }
    }

    /// Ingest a transaction body.
    ///
    /// Invalid or non-instant transactions are dropped without penalty —
    /// the sender may legitimately disagree with our chain view. A body we
    /// previously only knew from votes ("lost" tx) unblocks both voting
    /// axes, so both are re-run.
    pub fn apply_tx(&mut self, tx: Transaction) -> VoterOutput {
        let txid = tx.txid();

        if !tx.instant || !self.world.pre_validate_tx(&tx, TX_EXPIRING_SOON_THRESHOLD) {
            debug!(tx = %hex::encode(txid), "dropping non-instant or pre-invalid tx");
            return VoterOutput::default();
        }
        let single = BTreeMap::from([(txid, tx.clone())]);
        if !self.world.validate_tx_set(&single) {
            debug!(tx = %hex::encode(txid), "dropping invalid tx");
            return VoterOutput::default();
        }

        let had_body = self.txs.contains_key(&txid);
        let has_votes = self
            .votings
            .get(&self.tip)
            .is_some_and(|state| state.tx_has_any_vote(&txid));

        if !had_body
            && !has_votes
            && self.count_unvoted_txs() >= self.params.max_not_voted_txs_to_keep
        {
            warn!(tx = %hex::encode(txid), "dropping tx: unvoted-tx budget exhausted");
            return VoterOutput::default();
        }

        let was_lost = !had_body && has_votes;
        self.txs.insert(txid, tx.clone());

        let mut out = VoterOutput::default();
        if was_lost {
            debug!(tx = %hex::encode(txid), "recovered a lost tx, re-running voting");
            if self.is_yes_by_me(&txid) {
                // Re-materialize the pledge entries this body implies; they
                // could not be recorded while the body was missing.
                for input in &tx.inputs {
                    self.pledged_inputs.insert(*input, txid);
                }
            }
            out += self.do_txs_voting();
            out += self.do_round_voting();
        } else {
            out += self.vote_for_tx(&tx);
        }
        out
    }

    /// Ingest an authenticated transaction vote.
    pub fn apply_tx_vote(&mut self, vote: TxVote) -> VoterOutput {
        if vote.round == 0 {
            return VoterOutput::error(VoterError::MalformedTxVote("round must be positive"));
        }
        if vote.tip != self.tip && !self.world.allow_archiving(&vote.tip) {
            debug!(tip = %hex::encode(vote.tip), "dropping tx vote for unknown ancestor");
            return VoterOutput::error(VoterError::UnknownAncestor { tip: vote.tip });
        }

        let state = self.votings.entry(vote.tip).or_default();
        if state.tx_votes_from(&vote.voter) >= self.params.max_tx_votes_from_voter {
            // Flooding, not provable misbehavior: drop quietly.
            debug!(voter = %hex::encode(vote.voter), "dropping tx vote: per-voter budget exhausted");
            return VoterOutput::default();
        }

        let txid = vote.choice.subject;
        let voter = vote.voter;
        let for_current_tip = vote.tip == self.tip;
        match state.insert_tx_vote(vote) {
            InsertOutcome::Doublesign => {
                warn!(voter = %hex::encode(voter), tx = %hex::encode(txid), "tx-vote doublesign");
                return VoterOutput::error(VoterError::TxDoublesign { voter });
            }
            InsertOutcome::Duplicate => {
                debug!("ignoring duplicate tx vote");
                return VoterOutput::default();
            }
            InsertOutcome::Inserted => {}
        }

        // A vote pinned to another (archivable) tip changed nothing we act on.
        if !for_current_tip {
            return VoterOutput::default();
        }

        let mut out = VoterOutput::default();
        if !self.txs.contains_key(&txid) {
            out.tx_requests.push(txid);
        }
        out += self.do_round_voting();
        out
    }

    /// Ingest an authenticated round vote.
    pub fn apply_round_vote(&mut self, vote: RoundVote) -> VoterOutput {
        if vote.round == 0 {
            return VoterOutput::error(VoterError::MalformedRoundVote("round must be positive"));
        }
        match vote.choice.decision {
            Decision::No => {
                return VoterOutput::error(VoterError::MalformedRoundVote(
                    "NO is not a round decision",
                ));
            }
            Decision::Pass if vote.choice.subject != ZERO_HASH => {
                return VoterOutput::error(VoterError::MalformedRoundVote(
                    "PASS must carry a zero subject",
                ));
            }
            _ => {}
        }
        if vote.tip != self.tip && !self.world.allow_archiving(&vote.tip) {
            debug!(tip = %hex::encode(vote.tip), "dropping round vote for unknown ancestor");
            return VoterOutput::error(VoterError::UnknownAncestor { tip: vote.tip });
        }

        let voter = vote.voter;
        let round = vote.round;
        let choice = vote.choice;
        let for_current_tip = vote.tip == self.tip;
        match self.votings.entry(vote.tip).or_default().insert_round_vote(vote) {
            InsertOutcome::Doublesign => {
                warn!(voter = %hex::encode(voter), round, "round-vote doublesign");
                return VoterOutput::error(VoterError::RoundDoublesign { voter });
            }
            InsertOutcome::Duplicate => {
                debug!("ignoring duplicate round vote");
                return VoterOutput::default();
            }
            InsertOutcome::Inserted => {}
        }

        if !for_current_tip {
            return VoterOutput::default();
        }

        let mut out = VoterOutput::default();
        let tally = self.round_tally_at(&self.tip, round);
        if tally::is_round_stalemate(&tally, self.quorum()) {
            // This vote just proved its round unelectable; transaction votes
            // parked behind "already voted this round" get a fresh round.
            info!(new_round = self.current_round(), "round stalemate proven, advancing");
            out += self.do_txs_voting();
        }
        out += self.do_round_voting();
        if choice.decision == Decision::Yes {
            out += self.try_to_submit_block(&choice.subject);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Local policy
    // -----------------------------------------------------------------------

    /// Decide and cast this operator's vote on one transaction.
    fn vote_for_tx(&mut self, tx: &Transaction) -> VoterOutput {
        if !self.am_i_voter {
            return VoterOutput::default();
        }
        let txid = tx.txid();
        let round = self.current_round();
        let mut out = VoterOutput::default();

        if self.was_voted_by_me_tx(&txid, round) {
            debug!(tx = %hex::encode(txid), "tx already voted by me");
            return out;
        }

        let pledge = self.my_pledge();
        if !pledge.missing.is_empty() {
            // Voting blind against my own pledge set is how accidental
            // doublesigns happen. Fetch the bodies first.
            out.tx_requests.extend(pledge.missing.iter().copied());
            return out;
        }

        let mut decision = Decision::Yes;

        // Fast path: an input already pledged to a different transaction can
        // never get my YES; skip the set hooks entirely.
        if tx
            .inputs
            .iter()
            .any(|input| self.pledged_inputs.get(input).is_some_and(|t| *t != txid))
        {
            decision = Decision::No;
        }

        if decision == Decision::Yes {
            let mut mine = pledge.txs.clone();
            mine.insert(txid, tx.clone());
            if !self.world.validate_tx_set(&mine) {
                decision = Decision::No;
            } else {
                // Strictly, checking against my own list is enough; checking
                // against the committed set as well converges faster. The
                // committed list may be incomplete, which is fine.
                let mut committed = self.committed_txs().txs;
                committed.insert(txid, tx.clone());
                if !self.world.validate_tx_set(&committed) {
                    decision = Decision::No;
                }
            }
        }

        // Don't mix fresh commitments into an election already in flight:
        // once I have round-voted (or a current-round proposal is viable),
        // new transactions wait out the round.
        if decision == Decision::Yes && self.was_voted_by_me_round(round) {
            decision = Decision::Pass;
        }
        if decision == Decision::Yes && self.any_vice_block_valid(round) {
            decision = Decision::Pass;
        }

        if decision == Decision::Yes {
            for input in &tx.inputs {
                self.pledged_inputs.insert(*input, txid);
            }
        }

        let choice = VoteChoice {
            subject: txid,
            decision,
        };
        let vote = TxVote {
            voter: self.me,
            round,
            tip: self.tip,
            choice,
        };
        info!(tx = %hex::encode(txid), ?decision, round, "casting tx vote");
        out.tx_votes.push(vote.clone());
        out += self.apply_tx_vote(vote);
        out
    }

    /// Vote on every known transaction. Run after anything that could
    /// change a decision: a new tip, a recovered tx, a new round.
    pub fn do_txs_voting(&mut self) -> VoterOutput {
        if !self.am_i_voter {
            return VoterOutput::default();
        }
        let mut out = VoterOutput::default();
        let pending: Vec<Transaction> = self.txs.values().cloned().collect();
        for tx in pending {
            out += self.vote_for_tx(&tx);
        }
        out
    }

    /// Try to cast this operator's round vote for the best viable
    /// vice-block at the current round.
    pub fn do_round_voting(&mut self) -> VoterOutput {
        if !self.am_i_voter {
            return VoterOutput::default();
        }
        let mut out = VoterOutput::default();
        let round = self.current_round();

        if self.no_voting_timer > 0 {
            debug!(round, "round voting suppressed by back-pressure timer");
            return out;
        }

        let pledge = self.my_pledge();
        if !pledge.missing.is_empty() {
            out.tx_requests.extend(pledge.missing.iter().copied());
            return out;
        }

        // Every transaction I pledged must be finalized (committed or
        // provably dead) before I help elect a block, or the block could
        // strand one of my pledges half-voted.
        let quorum = self.quorum();
        let unfinished = pledge
            .txs
            .keys()
            .filter(|txid| {
                let tally = self.tx_tally_at(&self.tip, txid, round);
                !(tally::is_committed(&tally, quorum)
                    || tally::is_not_committable(&tally, quorum))
            })
            .count();
        if unfinished > 0 {
            debug!(unfinished, round, "round voting deferred: pledged txs not finalized");
            return out;
        }

        if self.was_voted_by_me_round(round) {
            debug!(round, "round already voted by me");
            return out;
        }

        // Rank candidates: most round-YES votes first, block hash ascending
        // as the deterministic tie-break; vote for the best one that is
        // pinned to this round and validates against the committed set.
        let committed = self.committed_txs().txs;
        let mut chosen: Option<BlockHash> = None;
        let mut candidates = 0usize;
        if let Some(state) = self.votings.get(&self.tip) {
            let stats = tally::round_tally(state, round);
            let mut ranked: Vec<(usize, BlockHash)> = state
                .vice_blocks
                .keys()
                .map(|hash| (stats.pro_for(hash), *hash))
                .collect();
            ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            candidates = ranked.len();

            for (_, hash) in ranked {
                let block = &state.vice_blocks[&hash];
                if block.round == round && self.world.validate_block(block, &committed, true) {
                    chosen = Some(hash);
                    break;
                }
            }
        }

        match chosen {
            Some(hash) => {
                info!(block = %hex::encode(hash), round, "voting YES for vice-block");
                let vote = RoundVote {
                    voter: self.me,
                    round,
                    tip: self.tip,
                    choice: VoteChoice::yes(hash),
                };
                out.round_votes.push(vote.clone());
                out += self.apply_round_vote(vote);
            }
            None => {
                debug!(candidates, round, "no suitable vice-block this round");
            }
        }
        out
    }

    /// Emit the block if it has quorum at the current round and validates
    /// against the committed set.
    pub fn try_to_submit_block(&mut self, block_hash: &BlockHash) -> VoterOutput {
        let mut out = VoterOutput::default();
        let round = self.current_round();
        let stats = self.round_tally_at(&self.tip, round);

        if stats.pro_for(block_hash) < self.params.min_quorum {
            return out;
        }

        let Some(state) = self.votings.get(&self.tip) else {
            return out;
        };
        let Some(block) = state.vice_blocks.get(block_hash) else {
            // Quorum on a block whose bytes we lack: fetch it.
            out.vice_block_requests.push(*block_hash);
            return out;
        };
        if block.round != round {
            return out;
        }
        // The committed list may be incomplete, which is fine: validation
        // treats it as a lower bound.
        let committed = self.committed_txs().txs;
        if !self.world.validate_block(block, &committed, true) {
            return out;
        }

        let approved_by: Vec<MemberId> = state
            .round_votes_at(round)
            .map(|votes| {
                votes
                    .values()
                    .filter(|vote| {
                        vote.choice.decision == Decision::Yes
                            && vote.choice.subject == *block_hash
                    })
                    .map(|vote| vote.voter)
                    .collect()
            })
            .unwrap_or_default();

        info!(
            block = %hex::encode(block_hash),
            votes = approved_by.len(),
            quorum = self.params.min_quorum,
            "vice-block reached quorum, submitting"
        );
        out.block_to_submit = Some(BlockToSubmit {
            block: block.clone(),
            approved_by,
        });
        out
    }

    /// Externally ticked when the wall clock exceeds the round budget. A
    /// voter that has not voted this round casts a PASS — the only
    /// mechanism that breaks a silent quorum.
    pub fn on_round_too_long(&mut self) -> VoterOutput {
        if !self.am_i_voter {
            return VoterOutput::default();
        }
        let round = self.current_round();
        let mut out = VoterOutput::default();
        if !self.was_voted_by_me_round(round) {
            info!(round, "round budget exceeded, passing");
            let vote = RoundVote {
                voter: self.me,
                round,
                tip: self.tip,
                choice: VoteChoice::pass(),
            };
            out.round_votes.push(vote.clone());
            out += self.apply_round_vote(vote);
        }
        out
    }

    /// Re-emit fetch requests for every transaction that has votes at the
    /// current tip but no body. Driven by the controller on tip changes.
    pub fn request_missing_txs(&self) -> VoterOutput {
        let mut out = VoterOutput::default();
        if let Some(state) = self.votings.get(&self.tip) {
            for txid in state.voted_tx_ids() {
                if !self.txs.contains_key(&txid) {
                    out.tx_requests.push(txid);
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Replay inserts (controller startup)
    // -----------------------------------------------------------------------

    /// Insert a vice-block with no policy side effects. Startup replay only;
    /// [`verify_voting_state`](Self::verify_voting_state) runs afterwards.
    pub fn insert_vice_block(&mut self, block: ViceBlock) {
        self.votings.entry(block.prev).or_default().insert_vice_block(block);
    }

    /// Insert a transaction vote with no policy side effects.
    pub fn insert_tx_vote(&mut self, vote: TxVote) {
        self.votings.entry(vote.tip).or_default().insert_tx_vote(vote);
    }

    /// Insert a round vote with no policy side effects.
    pub fn insert_round_vote(&mut self, vote: RoundVote) {
        self.votings.entry(vote.tip).or_default().insert_round_vote(vote);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The current voting round at this tip: lowest non-stalemated round.
    /// Non-decreasing within a tip — votes only accumulate.
    pub fn current_round(&self) -> Round {
        self.votings
            .get(&self.tip)
            .map(|state| tally::current_round(state, self.quorum()))
            .unwrap_or(1)
    }

    /// The lowest round nobody has voted in at the current tip. Block
    /// proposers pin fresh vice-blocks here.
    pub fn lowest_not_occupied_round(&self) -> Round {
        self.votings
            .get(&self.tip)
            .map(tally::lowest_not_occupied_round)
            .unwrap_or(1)
    }

    /// Committed transactions visible from `vot`, walking up to `max_depth`
    /// ancestors (0 = `vot` itself).
    pub fn list_committed_txs(&self, vot: BlockHash, max_depth: u32) -> CommittedTxs {
        let quorum = self.quorum();
        let mut result = CommittedTxs::default();
        let mut cursor = vot;
        for _ in 0..=max_depth {
            if cursor == ZERO_HASH {
                break;
            }
            if let Some(state) = self.votings.get(&cursor) {
                for txid in state.voted_tx_ids() {
                    let tally = tally::tx_tally(state, &txid, 0);
                    if tally::is_committed(&tally, quorum) {
                        match self.txs.get(&txid) {
                            Some(tx) => {
                                result.txs.insert(txid, tx.clone());
                            }
                            None => {
                                result.missing.insert(txid);
                            }
                        }
                    }
                }
            }
            cursor = self.world.prev_block(&cursor);
        }
        result
    }

    /// Committed transactions at the current tip within the guarantees
    /// window. What vice-blocks are validated against.
    pub fn committed_txs(&self) -> CommittedTxs {
        self.list_committed_txs(self.tip, GUARANTEES_MEMORY)
    }

    /// Is this transaction committed anywhere in the lookup window?
    pub fn is_committed_tx(&self, txid: &TxId, vot: BlockHash, max_depth: u32) -> bool {
        let quorum = self.quorum();
        let mut cursor = vot;
        for _ in 0..=max_depth {
            if cursor == ZERO_HASH {
                break;
            }
            if let Some(state) = self.votings.get(&cursor) {
                if tally::is_committed(&tally::tx_tally(state, txid, 0), quorum) {
                    return true;
                }
            }
            cursor = self.world.prev_block(&cursor);
        }
        false
    }

    /// Is this transaction provably unable to commit at the current tip?
    /// Wallet-facing: a NO answer here means "stop waiting, resubmit".
    pub fn is_not_committable_tx(&self, txid: &TxId) -> bool {
        let tally = self.tx_tally_at(&self.tip, txid, self.current_round());
        tally::is_not_committable(&tally, self.quorum())
    }

    /// Has this operator pledged itself to the transaction (YES within the
    /// voting-memory window), body present or not?
    pub fn is_tx_approved_by_me(&self, txid: &TxId) -> bool {
        let pledge = self.my_pledge();
        pledge.txs.contains_key(txid) || pledge.missing.contains(txid)
    }

    /// Should the local miner leave this transaction out of block
    /// templates? True when any of its inputs is pledged — mining it could
    /// conflict with an in-flight instant commitment.
    pub fn should_exclude_from_block(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.pledged_inputs.contains_key(input))
    }

    /// The outpoints currently pledged by this operator's YES votes.
    pub fn pledged_outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.pledged_inputs.keys()
    }

    /// The transaction body cache. Exposed for the controller's fetch
    /// servicing and the RPC surface above it.
    pub fn known_tx(&self, txid: &TxId) -> Option<&Transaction> {
        self.txs.get(txid)
    }

    /// Number of transaction bodies currently held.
    pub fn known_tx_count(&self) -> usize {
        self.txs.len()
    }

    /// Every tip with voting state, for the controller's GC sweep.
    pub fn voting_tips(&self) -> Vec<BlockHash> {
        self.votings.keys().copied().collect()
    }

    /// Voting state at a tip, if any.
    pub fn voting_at(&self, vot: &BlockHash) -> Option<&TipVotingState> {
        self.votings.get(vot)
    }

    /// Drop all state for a tip. Archival (invariant 5): the controller
    /// calls this for tips beyond the keep window, together with erasing
    /// the persisted records keyed on them.
    pub fn forget_voting(&mut self, vot: &BlockHash) {
        self.votings.remove(vot);
    }

    /// Full internal consistency check. `false` means the state (and with
    /// it, whatever storage it was replayed from) cannot be trusted; the
    /// caller must reindex rather than limp on with broken safety
    /// invariants.
    pub fn verify_voting_state(&self) -> bool {
        for (vot, state) in &self.votings {
            for (round, by_tx) in &state.tx_votes {
                if *round == 0 {
                    return false;
                }
                for (txid, votes) in by_tx {
                    for (voter, vote) in votes {
                        if vote.round != *round
                            || vote.tip != *vot
                            || vote.choice.subject != *txid
                            || vote.voter != *voter
                        {
                            return false;
                        }
                    }
                }
            }
            for (round, votes) in &state.round_votes {
                if *round == 0 {
                    return false;
                }
                for (voter, vote) in votes {
                    if vote.round != *round || vote.tip != *vot || vote.voter != *voter {
                        return false;
                    }
                    match vote.choice.decision {
                        Decision::No => return false,
                        Decision::Pass if vote.choice.subject != ZERO_HASH => return false,
                        _ => {}
                    }
                }
            }
            for (hash, block) in &state.vice_blocks {
                if block.hash() != *hash || block.prev != *vot || block.round == 0 {
                    return false;
                }
                if !block.signatures.is_empty() {
                    return false;
                }
            }
        }

        // Pledge consistency: functional by construction (it's a map); every
        // entry with a known body must actually spend the outpoint.
        for (outpoint, txid) in &self.pledged_inputs {
            if let Some(tx) = self.txs.get(txid) {
                if !tx.inputs.contains(outpoint) {
                    return false;
                }
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn tx_tally_at(&self, vot: &BlockHash, txid: &TxId, probe_round: Round) -> tally::TxVoteTally {
        self.votings
            .get(vot)
            .map(|state| tally::tx_tally(state, txid, probe_round))
            .unwrap_or_default()
    }

    fn round_tally_at(&self, vot: &BlockHash, round: Round) -> tally::RoundVoteTally {
        self.votings
            .get(vot)
            .map(|state| tally::round_tally(state, round))
            .unwrap_or_default()
    }

    /// Did I already declare myself on this tx? YES and NO bind across
    /// rounds; PASS only blocks the round it was cast in.
    fn was_voted_by_me_tx(&self, txid: &TxId, round: Round) -> bool {
        let Some(state) = self.votings.get(&self.tip) else {
            return false;
        };
        for (vote_round, by_tx) in &state.tx_votes {
            let Some(mine) = by_tx.get(txid).and_then(|votes| votes.get(&self.me)) else {
                continue;
            };
            if mine.choice.decision != Decision::Pass || *vote_round == round {
                return true;
            }
        }
        false
    }

    fn was_voted_by_me_round(&self, round: Round) -> bool {
        self.votings
            .get(&self.tip)
            .and_then(|state| state.round_votes_at(round))
            .is_some_and(|votes| votes.contains_key(&self.me))
    }

    /// Did I vote YES on this tx at the current tip, in any round?
    fn is_yes_by_me(&self, txid: &TxId) -> bool {
        let Some(state) = self.votings.get(&self.tip) else {
            return false;
        };
        state.tx_votes.values().any(|by_tx| {
            by_tx
                .get(txid)
                .and_then(|votes| votes.get(&self.me))
                .is_some_and(|vote| vote.choice.decision == Decision::Yes)
        })
    }

    /// Everything I voted YES on within the voting-memory window, walking
    /// ancestors through the chain hook. Missing bodies are reported, not
    /// skipped — voting around them risks an accidental doublesign.
    fn my_pledge(&self) -> MyPledge {
        let mut pledge = MyPledge::default();
        let mut cursor = self.tip;
        for _ in 0..=VOTING_MEMORY {
            if cursor == ZERO_HASH {
                break;
            }
            if let Some(state) = self.votings.get(&cursor) {
                for by_tx in state.tx_votes.values() {
                    for (txid, votes) in by_tx {
                        let Some(mine) = votes.get(&self.me) else {
                            continue;
                        };
                        if mine.choice.decision != Decision::Yes {
                            continue;
                        }
                        match self.txs.get(txid) {
                            Some(tx) => {
                                pledge.txs.insert(*txid, tx.clone());
                            }
                            None => {
                                pledge.missing.insert(*txid);
                            }
                        }
                    }
                }
            }
            cursor = self.world.prev_block(&cursor);
        }
        pledge
    }

    /// Is any current-round vice-block viable against the committed set?
    fn any_vice_block_valid(&self, round: Round) -> bool {
        let Some(state) = self.votings.get(&self.tip) else {
            return false;
        };
        if state.vice_blocks.is_empty() {
            return false;
        }
        let committed = self.committed_txs().txs;
        state
            .vice_blocks_at(round)
            .any(|(_, block)| self.world.validate_block(block, &committed, true))
    }

    fn count_unvoted_txs(&self) -> usize {
        let state = self.votings.get(&self.tip);
        self.txs
            .keys()
            .filter(|txid| state.map_or(true, |s| !s.tx_has_any_vote(txid)))
            .count()
    }

    /// Drop transaction bodies finalized at the (still current) old tip,
    /// together with their pledge entries.
    fn prune_finished_txs(&mut self) {
        let quorum = self.quorum();
        let finished: Vec<TxId> = self
            .txs
            .keys()
            .filter(|txid| {
                let tally = self.tx_tally_at(&self.tip, txid, 0);
                tally::is_committed(&tally, quorum) || tally::is_not_committable(&tally, quorum)
            })
            .copied()
            .collect();
        for txid in &finished {
            self.txs.remove(txid);
            self.pledged_inputs.retain(|_, pledged| pledged != txid);
        }
        if !finished.is_empty() {
            debug!(pruned = finished.len(), "pruned finalized txs on tip change");
        }
    }
}
