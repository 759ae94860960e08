//! Multi-voter storm scenarios.
//!
//! A fleet of voter agents, a randomized message schedule, and a toy ledger
//! that tracks mined transactions and spent inputs. The harness owns every
//! voter and shuttles outputs between them along a tick axis — no voter
//! ever references another. Schedules are driven by a seeded `StdRng`, so
//! every run of these tests replays the exact same storm.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lumen_protocol::config::GUARANTEES_MEMORY;
use lumen_protocol::consensus::{
    BlockHash, BlockToSubmit, MemberId, OutPoint, Transaction, ViceBlock, Voter, VoterInput,
    VoterOutput, VoterParams, WorldView, ZERO_HASH,
};
use lumen_protocol::crypto::hash::blake3_hash;

// ---------------------------------------------------------------------------
// Toy ledger world
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerState {
    mined_txs: BTreeMap<[u8; 32], Transaction>,
    used_inputs: BTreeSet<OutPoint>,
    block_to_height: BTreeMap<BlockHash, u64>,
    height_to_block: BTreeMap<u64, BlockHash>,
}

/// Shared by all voters in a storm: conflicts are judged against what the
/// simulated chain has already mined.
#[derive(Clone)]
struct StormWorld {
    ledger: Arc<RwLock<LedgerState>>,
}

impl StormWorld {
    fn new(genesis: BlockHash) -> Self {
        let mut state = LedgerState::default();
        state.block_to_height.insert(genesis, 0);
        state.height_to_block.insert(0, genesis);
        Self {
            ledger: Arc::new(RwLock::new(state)),
        }
    }

    fn tx_ok(&self, state: &LedgerState, tx: &Transaction) -> bool {
        if state.mined_txs.contains_key(&tx.txid()) {
            return false;
        }
        tx.inputs.iter().all(|input| !state.used_inputs.contains(input))
    }
}

impl WorldView for StormWorld {
    fn pre_validate_tx(&self, tx: &Transaction, _threshold: u32) -> bool {
        tx.instant
    }

    fn validate_tx_set(&self, txs: &BTreeMap<[u8; 32], Transaction>) -> bool {
        let state = self.ledger.read();
        let mut seen = BTreeSet::new();
        for tx in txs.values() {
            if !self.tx_ok(&state, tx) {
                return false;
            }
            for input in &tx.inputs {
                if !seen.insert(*input) {
                    return false;
                }
            }
        }
        true
    }

    fn validate_block(
        &self,
        block: &ViceBlock,
        committed: &BTreeMap<[u8; 32], Transaction>,
        full_check: bool,
    ) -> bool {
        if !full_check {
            return true;
        }
        let state = self.ledger.read();
        let mut seen = BTreeSet::new();
        for tx in &block.txs {
            if !self.tx_ok(&state, tx) {
                return false;
            }
            for input in &tx.inputs {
                if !seen.insert(*input) {
                    return false;
                }
            }
        }
        // A block that drops a committed transaction is not electable.
        committed
            .keys()
            .all(|txid| block.txs.iter().any(|tx| tx.txid() == *txid))
    }

    fn allow_archiving(&self, _tip: &BlockHash) -> bool {
        true
    }

    fn prev_block(&self, block: &BlockHash) -> BlockHash {
        let state = self.ledger.read();
        match state.block_to_height.get(block) {
            Some(0) | None => ZERO_HASH,
            Some(height) => state
                .height_to_block
                .get(&(height - 1))
                .copied()
                .unwrap_or(ZERO_HASH),
        }
    }

    fn time_millis(&self) -> i64 {
        0
    }
}

// ---------------------------------------------------------------------------
// Storm suit
// ---------------------------------------------------------------------------

const MAX_PROBABILITY: u32 = 50_000;

/// Sentinel offsets added to `max_tick` by [`StormSuit::run`] on failure.
const NO_BLOCK_FOUND: i64 = 404;
const FINALITY_SPLIT: i64 = 2;
const STATE_CORRUPT: i64 = 3;
const DUPLICATE_TX: i64 = 4;
const DOUBLESPEND: i64 = 5;
const COMMIT_DROPPED: i64 = 6;

struct StormSuit {
    voters: Vec<Voter<StormWorld>>,
    world: StormWorld,
    txs: Vec<Transaction>,
    txs_non_instant: Vec<Transaction>,
    rng: StdRng,
    /// Message-delay spread in ticks; models gossip ping.
    rand_range: i64,
    max_tick: i64,
    prob_block_generation: u32,
    prob_disconnection: u32,
    disconnection_period: i64,
    /// Every this many ticks the harness plays the controller's round
    /// timeout, making silent voters PASS. Liveness lever, not safety.
    round_timeout_ticks: i64,
}

impl StormSuit {
    fn new(seed: u64, genesis: BlockHash) -> Self {
        Self {
            voters: Vec::new(),
            world: StormWorld::new(genesis),
            txs: Vec::new(),
            txs_non_instant: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            rand_range: 1,
            max_tick: 100,
            prob_block_generation: MAX_PROBABILITY / 100,
            prob_disconnection: 0,
            disconnection_period: 5,
            round_timeout_ticks: 50,
        }
    }

    fn add_voters(&mut self, team: usize, quorum: usize, online: usize) {
        let tip = *self.world.ledger.read().height_to_block.get(&0).unwrap();
        for i in 0..team {
            let params = VoterParams {
                num_of_voters: team,
                min_quorum: quorum,
                max_tx_votes_from_voter: 60,
                max_not_voted_txs_to_keep: 600,
            };
            let mut voter = Voter::new(self.world.clone(), params);
            voter.update_tip(tip);
            voter.set_voting(i < online, member(i as u64));
            self.voters.push(voter);
        }
    }

    /// Evaluate one storm: schedule the transactions, run the tick loop,
    /// then mine the elected block into the toy ledger. Returns the number
    /// of ticks elapsed, or `max_tick` plus a failure sentinel.
    fn run(&mut self) -> i64 {
        let mut trace: BTreeMap<i64, BTreeMap<usize, Vec<VoterInput>>> = BTreeMap::new();

        // Schedule the instant transactions with randomized arrival.
        for tx in &self.txs {
            for voter_id in 0..self.voters.len() {
                let tick = self.rng.gen_range(0..self.rand_range.max(1));
                trace
                    .entry(tick)
                    .or_default()
                    .entry(voter_id)
                    .or_default()
                    .push(VoterInput::Tx(tx.clone()));
            }
        }

        let mut block_to_submit: Option<BlockToSubmit> = None;
        let mut found_at: i64 = -1;
        let mut t: i64 = 0;

        // After a block is found, idle out the ping spread to prove no
        // second, different block can win.
        while !((found_at >= 0 && t - found_at >= 3 * self.rand_range) || t > self.max_tick) {
            for voter_id in 0..self.voters.len() {
                let scheduled = trace
                    .entry(t)
                    .or_default()
                    .remove(&voter_id)
                    .unwrap_or_default();

                let mut out = VoterOutput::default();
                for input in scheduled {
                    out += self.voters[voter_id].apply(input);
                }
                if t == 0 {
                    out += self.voters[voter_id].do_txs_voting();
                    out += self.voters[voter_id].do_round_voting();
                }
                if t > 0 && t % self.round_timeout_ticks == 0 {
                    out += self.voters[voter_id].on_round_too_long();
                }

                assert!(
                    out.errors.is_empty(),
                    "honest voter flagged errors: {:?}",
                    out.errors
                );

                if let Some(submit) = out.block_to_submit.take() {
                    if let Some(existing) = &block_to_submit {
                        if existing.block.hash() != submit.block.hash() {
                            return self.max_tick + FINALITY_SPLIT;
                        }
                    } else {
                        found_at = t;
                        block_to_submit = Some(submit);
                    }
                }

                let mut outgoing: Vec<VoterInput> = Vec::new();
                outgoing.extend(out.round_votes.into_iter().map(VoterInput::RoundVote));
                outgoing.extend(out.tx_votes.into_iter().map(VoterInput::TxVote));

                // Maybe act as the external proposer for this voter's view.
                if self.rng.gen_range(0..MAX_PROBABILITY) < self.prob_block_generation {
                    outgoing.push(VoterInput::ViceBlock(self.generate_vice_block(voter_id)));
                }

                // Gossip everything to everyone, ping-delayed.
                for item in outgoing {
                    for target in 0..self.voters.len() {
                        let tick = t + 1 + self.rng.gen_range(0..self.rand_range.max(1));
                        trace
                            .entry(tick)
                            .or_default()
                            .entry(target)
                            .or_default()
                            .push(item.clone());
                    }
                }

                // Maybe disconnect this voter: everything it would have
                // received in the next few ticks arrives in one late burst.
                if self.prob_disconnection > 0
                    && self.rng.gen_range(0..MAX_PROBABILITY) < self.prob_disconnection
                {
                    let mut delayed: Vec<VoterInput> = Vec::new();
                    for tick in (t + 1)..(t + 1 + self.disconnection_period) {
                        if let Some(per_voter) = trace.get_mut(&tick) {
                            if let Some(items) = per_voter.remove(&voter_id) {
                                delayed.extend(items);
                            }
                        }
                    }
                    trace
                        .entry(t + 1 + self.disconnection_period)
                        .or_default()
                        .entry(voter_id)
                        .or_default()
                        .extend(delayed);
                }

                // Back-pressure timer decay; the skip timer runs 5x faster.
                let voter = &mut self.voters[voter_id];
                voter.skip_blocks_timer = (voter.skip_blocks_timer - 5).max(0);
                voter.no_voting_timer = (voter.no_voting_timer - 1).max(0);

                if !self.voters[voter_id].verify_voting_state() {
                    return self.max_tick + STATE_CORRUPT;
                }
            }
            t += 1;
        }

        let Some(submit) = block_to_submit else {
            return self.max_tick + NO_BLOCK_FOUND;
        };

        // The committed view at the winning tip, before anyone moves on.
        let old_tip = *self.voters[0].tip();
        let committed = self.voters[0].list_committed_txs(old_tip, GUARANTEES_MEMORY);

        // Mine the block: every tx exactly once, every input spent once.
        let new_tip = submit.block.hash();
        {
            let mut state = self.world.ledger.write();
            let height = state.block_to_height[&submit.block.prev] + 1;
            state.block_to_height.insert(new_tip, height);
            state.height_to_block.insert(height, new_tip);
            for tx in &submit.block.txs {
                if state.mined_txs.insert(tx.txid(), tx.clone()).is_some() {
                    return self.max_tick + DUPLICATE_TX;
                }
                for input in &tx.inputs {
                    if !state.used_inputs.insert(*input) {
                        return self.max_tick + DOUBLESPEND;
                    }
                }
            }
        }
        for voter in &mut self.voters {
            voter.update_tip(new_tip);
        }

        // Every committed transaction made it into the chain.
        let state = self.world.ledger.read();
        for txid in committed.txs.keys().chain(committed.missing.iter()) {
            if !state.mined_txs.contains_key(txid) {
                return self.max_tick + COMMIT_DROPPED;
            }
        }

        t
    }

    /// Fabricate a vice-block from one voter's current view — the job of
    /// the external proposer, played here by the harness.
    fn generate_vice_block(&mut self, voter_id: usize) -> ViceBlock {
        let voter = &self.voters[voter_id];
        let tip = *voter.tip();
        let mut txs: Vec<Transaction> = voter
            .list_committed_txs(tip, GUARANTEES_MEMORY)
            .txs
            .into_values()
            .collect();
        {
            let state = self.world.ledger.read();
            for tx in &self.txs_non_instant {
                if self.world.tx_ok(&state, tx) && !voter.should_exclude_from_block(tx) {
                    txs.push(tx.clone());
                }
            }
        }
        ViceBlock {
            prev: tip,
            time: self.rng.gen_range(0..i64::MAX),
            round: voter.lowest_not_occupied_round(),
            txs,
            signatures: Vec::new(),
        }
    }
}

fn member(i: u64) -> MemberId {
    let mut id = [0u8; 32];
    id[..8].copy_from_slice(&i.to_le_bytes());
    id
}

fn instant_tx(tag: u8, inputs: Vec<OutPoint>) -> Transaction {
    Transaction {
        instant: true,
        inputs,
        lock_time: u32::from(tag),
        expiry_height: 0,
        payload: vec![],
    }
}

fn non_instant_tx(inputs: Vec<OutPoint>) -> Transaction {
    Transaction {
        instant: false,
        inputs,
        lock_time: 0xFFFF,
        expiry_height: 0,
        payload: vec![],
    }
}

fn outpoint(tag: u8, index: u32) -> OutPoint {
    OutPoint {
        tx: [tag; 32],
        index,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Ten non-conflicting instant transactions, instant ping, zero
/// disconnections: one block is elected within ten ticks, every
/// transaction commits, and the mined inputs partition cleanly.
#[test]
fn optimistic_storm() {
    let genesis = blake3_hash(b"B101");
    let mut suit = StormSuit::new(7, genesis);
    suit.add_voters(32, 23, 32);

    for i in 0..10u8 {
        suit.txs.push(instant_tx(i, vec![outpoint(i, 0)]));
    }

    suit.rand_range = 1;
    suit.max_tick = 10;
    suit.prob_block_generation = MAX_PROBABILITY / 10;
    suit.prob_disconnection = 0;

    let ticks = suit.run();
    assert!(
        ticks <= suit.max_tick,
        "storm did not finalize a block: sentinel {ticks}"
    );

    // All ten transactions are committed and mined.
    let state = suit.world.ledger.read();
    assert_eq!(state.mined_txs.len(), 10);
    assert_eq!(state.used_inputs.len(), 10);
}

/// Conflicting transaction pairs under disconnections and real ping. The
/// run itself enforces the mined-input partition; here we additionally
/// check that no conflicting pair ever co-commits. Full participation, so
/// every transaction provably finalizes one way or the other once all
/// votes land.
#[test]
fn pessimistic_storm_with_conflicts() {
    let genesis = blake3_hash(b"B101");
    let mut suit = StormSuit::new(11, genesis);
    suit.add_voters(32, 23, 32);

    // txs 0/1 and 1/2 conflict; 3 conflicts with a non-instant tx.
    suit.txs.push(instant_tx(0, vec![outpoint(0, 0)]));
    suit.txs.push(instant_tx(1, vec![outpoint(0, 0), outpoint(1, 0)]));
    suit.txs.push(instant_tx(2, vec![outpoint(1, 0), outpoint(2, 0)]));
    suit.txs.push(instant_tx(3, vec![outpoint(3, 0)]));
    suit.txs.push(instant_tx(4, vec![outpoint(4, 0)]));
    suit.txs.push(instant_tx(5, vec![outpoint(5, 0)]));
    suit.txs_non_instant.push(non_instant_tx(vec![outpoint(3, 0)]));
    suit.txs_non_instant.push(non_instant_tx(vec![outpoint(9, 0)]));

    suit.rand_range = 10;
    suit.max_tick = 1000;
    suit.prob_block_generation = MAX_PROBABILITY / 100;
    suit.prob_disconnection = MAX_PROBABILITY / 2000;
    suit.round_timeout_ticks = 40;

    let ticks = suit.run();
    assert!(
        ticks <= suit.max_tick,
        "storm did not finalize a block: sentinel {ticks}"
    );

    // At most one side of each conflicting pair made it into the chain.
    let state = suit.world.ledger.read();
    let mined = |tx: &Transaction| state.mined_txs.contains_key(&tx.txid());
    assert!(!(mined(&suit.txs[0]) && mined(&suit.txs[1])));
    assert!(!(mined(&suit.txs[1]) && mined(&suit.txs[2])));
    assert!(!(mined(&suit.txs[3]) && mined(&suit.txs_non_instant[0])));
}

/// With only 22 of 32 members online, no quorum of 23 is possible: no
/// block is ever elected, nothing commits, and the run times out with the
/// no-block sentinel.
#[test]
fn impossible_quorum_storm() {
    let genesis = blake3_hash(b"B101");
    let mut suit = StormSuit::new(13, genesis);
    suit.add_voters(32, 23, 22);

    suit.txs.push(instant_tx(0, vec![outpoint(0, 0)]));
    suit.txs.push(instant_tx(1, vec![outpoint(1, 0)]));

    suit.rand_range = 5;
    suit.max_tick = 100;
    suit.prob_block_generation = MAX_PROBABILITY / 200;
    suit.round_timeout_ticks = 30;

    let ticks = suit.run();
    assert_eq!(ticks, suit.max_tick + NO_BLOCK_FOUND);

    let state = suit.world.ledger.read();
    assert!(state.mined_txs.is_empty());
    let tip = blake3_hash(b"B101");
    let committed = suit.voters[0].list_committed_txs(tip, GUARANTEES_MEMORY);
    assert!(committed.txs.is_empty() && committed.missing.is_empty());
}

/// Back-to-back storms across consecutive heights: each run starts from
/// the tip the previous one mined, exercising pledge pruning and fresh
/// per-tip voting.
#[test]
fn consecutive_heights_storm() {
    let genesis = blake3_hash(b"B101");
    let mut suit = StormSuit::new(17, genesis);
    suit.add_voters(32, 23, 32);

    suit.rand_range = 1;
    suit.max_tick = 10;
    suit.prob_block_generation = MAX_PROBABILITY / 10;

    for height in 0..3u8 {
        suit.txs = vec![
            instant_tx(height * 2, vec![outpoint(0x40 + height * 2, 0)]),
            instant_tx(height * 2 + 1, vec![outpoint(0x40 + height * 2 + 1, 0)]),
        ];
        let ticks = suit.run();
        assert!(
            ticks <= suit.max_tick,
            "no block at height {}: sentinel {ticks}",
            height + 1
        );
    }

    let state = suit.world.ledger.read();
    // Three blocks mined, six transactions across them.
    assert_eq!(state.height_to_block.len(), 4);
    assert_eq!(state.mined_txs.len(), 6);
}
