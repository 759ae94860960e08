//! # Per-Tip Voting State
//!
//! Everything the committee has said about one chain tip: round votes by
//! round and voter, transaction votes by round, subject and voter, and the
//! vice-block proposals themselves.
//!
//! All containers are `BTreeMap`s on purpose. Iteration order feeds directly
//! into voter outputs (vice-block tie-breaks, committed-set enumeration),
//! and the determinism property — identical inputs produce byte-identical
//! outputs — is much easier to keep when the storage layer simply cannot
//! iterate in two different orders.
//!
//! Records are inserted once and never mutated. A second insert with the
//! same key either is a byte-identical duplicate (ignored) or differs — and
//! a differing record under the same (voter, round, subject) key is a
//! doublesign, which the voter reports as peer misbehavior.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consensus::messages::{BlockHash, MemberId, Round, RoundVote, TxId, TxVote, ViceBlock};

/// What happened when a record was offered to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was new and is now stored.
    Inserted,
    /// A byte-identical record was already present. Nothing changed.
    Duplicate,
    /// A *different* record from the same voter for the same (round,
    /// subject) slot is already present. Nothing changed; the caller
    /// reports the doublesign.
    Doublesign,
}

/// Voting state at a single block hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TipVotingState {
    /// Round votes: round → voter → vote. One slot per voter per round.
    pub round_votes: BTreeMap<Round, BTreeMap<MemberId, RoundVote>>,
    /// Transaction votes: round → txid → voter → vote.
    pub tx_votes: BTreeMap<Round, BTreeMap<TxId, BTreeMap<MemberId, TxVote>>>,
    /// Vice-block proposals by block hash.
    pub vice_blocks: BTreeMap<BlockHash, ViceBlock>,
    /// How many transaction votes each member has placed at this tip.
    /// Backpressure bookkeeping for the vote-flooding bound.
    pub tx_vote_counts: BTreeMap<MemberId, usize>,
}

impl TipVotingState {
    /// True when nothing has been recorded at this tip.
    pub fn is_empty(&self) -> bool {
        self.round_votes.is_empty() && self.tx_votes.is_empty() && self.vice_blocks.is_empty()
    }

    /// Offer a transaction vote. The (round, subject, voter) slot is
    /// write-once; see [`InsertOutcome`].
    pub fn insert_tx_vote(&mut self, vote: TxVote) -> InsertOutcome {
        let slot = self
            .tx_votes
            .entry(vote.round)
            .or_default()
            .entry(vote.choice.subject)
            .or_default();

        match slot.get(&vote.voter) {
            Some(existing) if *existing == vote => InsertOutcome::Duplicate,
            Some(_) => InsertOutcome::Doublesign,
            None => {
                *self.tx_vote_counts.entry(vote.voter).or_default() += 1;
                slot.insert(vote.voter, vote);
                InsertOutcome::Inserted
            }
        }
    }

    /// Offer a round vote. The (round, voter) slot is write-once.
    pub fn insert_round_vote(&mut self, vote: RoundVote) -> InsertOutcome {
        let slot = self.round_votes.entry(vote.round).or_default();

        match slot.get(&vote.voter) {
            Some(existing) if *existing == vote => InsertOutcome::Duplicate,
            Some(_) => InsertOutcome::Doublesign,
            None => {
                slot.insert(vote.voter, vote);
                InsertOutcome::Inserted
            }
        }
    }

    /// Offer a vice-block. Returns `true` if it was new.
    pub fn insert_vice_block(&mut self, block: ViceBlock) -> bool {
        let hash = block.hash();
        if self.vice_blocks.contains_key(&hash) {
            return false;
        }
        self.vice_blocks.insert(hash, block);
        true
    }

    /// The votes for a transaction at a specific round, if any.
    pub fn tx_votes_at(&self, round: Round, txid: &TxId) -> Option<&BTreeMap<MemberId, TxVote>> {
        self.tx_votes.get(&round).and_then(|by_tx| by_tx.get(txid))
    }

    /// The round votes at a specific round, if any.
    pub fn round_votes_at(&self, round: Round) -> Option<&BTreeMap<MemberId, RoundVote>> {
        self.round_votes.get(&round)
    }

    /// All txids that have at least one vote at this tip, in sorted order.
    pub fn voted_tx_ids(&self) -> impl Iterator<Item = TxId> + '_ {
        let mut seen = std::collections::BTreeSet::new();
        self.tx_votes
            .values()
            .flat_map(|by_tx| by_tx.iter())
            .filter_map(move |(txid, votes)| {
                (!votes.is_empty() && seen.insert(*txid)).then_some(*txid)
            })
    }

    /// Whether the given txid has any vote from anyone at this tip.
    pub fn tx_has_any_vote(&self, txid: &TxId) -> bool {
        self.tx_votes
            .values()
            .any(|by_tx| by_tx.get(txid).is_some_and(|votes| !votes.is_empty()))
    }

    /// Vice-blocks proposed for a specific round, in hash order.
    pub fn vice_blocks_at(&self, round: Round) -> impl Iterator<Item = (&BlockHash, &ViceBlock)> {
        self.vice_blocks
            .iter()
            .filter(move |(_, block)| block.round == round)
    }

    /// How many transaction votes this member has placed at this tip.
    pub fn tx_votes_from(&self, voter: &MemberId) -> usize {
        self.tx_vote_counts.get(voter).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::messages::{Decision, VoteChoice};

    fn member(i: u8) -> MemberId {
        [i; 32]
    }

    fn tx_vote(voter: u8, round: Round, subject: [u8; 32]) -> TxVote {
        TxVote {
            voter: member(voter),
            round,
            tip: [0xBB; 32],
            choice: VoteChoice::yes(subject),
        }
    }

    #[test]
    fn insert_then_duplicate_then_doublesign() {
        let mut state = TipVotingState::default();
        let vote = tx_vote(1, 1, [7u8; 32]);

        assert_eq!(state.insert_tx_vote(vote.clone()), InsertOutcome::Inserted);
        assert_eq!(state.insert_tx_vote(vote.clone()), InsertOutcome::Duplicate);

        // Same voter, same round, same subject, different decision.
        let mut conflicting = vote;
        conflicting.choice = VoteChoice::no([7u8; 32]);
        assert_eq!(
            state.insert_tx_vote(conflicting),
            InsertOutcome::Doublesign
        );

        // The doublesign did not overwrite the original.
        let stored = state.tx_votes_at(1, &[7u8; 32]).unwrap();
        assert_eq!(stored[&member(1)].choice.decision, Decision::Yes);
    }

    #[test]
    fn round_vote_slot_is_per_round() {
        let mut state = TipVotingState::default();
        let vote_r1 = RoundVote {
            voter: member(1),
            round: 1,
            tip: [0xBB; 32],
            choice: VoteChoice::yes([1u8; 32]),
        };
        let vote_r2 = RoundVote {
            round: 2,
            ..vote_r1.clone()
        };

        assert_eq!(state.insert_round_vote(vote_r1), InsertOutcome::Inserted);
        // A vote in a different round is a new slot, not a doublesign.
        assert_eq!(state.insert_round_vote(vote_r2), InsertOutcome::Inserted);
    }

    #[test]
    fn vote_counts_track_inserts_only() {
        let mut state = TipVotingState::default();
        let vote = tx_vote(1, 1, [7u8; 32]);

        state.insert_tx_vote(vote.clone());
        state.insert_tx_vote(vote.clone()); // duplicate
        let mut conflicting = vote;
        conflicting.choice = VoteChoice::no([7u8; 32]);
        state.insert_tx_vote(conflicting); // doublesign

        assert_eq!(state.tx_votes_from(&member(1)), 1);
    }

    #[test]
    fn voted_tx_ids_deduplicates_across_rounds() {
        let mut state = TipVotingState::default();
        state.insert_tx_vote(tx_vote(1, 1, [7u8; 32]));
        state.insert_tx_vote(tx_vote(2, 2, [7u8; 32]));
        state.insert_tx_vote(tx_vote(1, 1, [8u8; 32]));

        let ids: Vec<TxId> = state.voted_tx_ids().collect();
        assert_eq!(ids, vec![[7u8; 32], [8u8; 32]]);
    }

    #[test]
    fn vice_block_dedup_by_hash() {
        let mut state = TipVotingState::default();
        let block = ViceBlock {
            prev: [0xBB; 32],
            time: 0,
            round: 1,
            txs: vec![],
            signatures: Vec::new(),
        };
        assert!(state.insert_vice_block(block.clone()));
        assert!(!state.insert_vice_block(block));
    }
}
