//! # Tally Engine
//!
//! Pure counting over a [`TipVotingState`]: vote distributions, quorum
//! tests, stalemate detection, and not-committable proofs.
//!
//! The arithmetic leans on one idea throughout: a subject can be written
//! off as soon as it *provably* cannot reach quorum, even if every voter we
//! have not heard from yet were to vote for it. `unknown = numOfVoters −
//! votes_seen` is the optimist's allowance; when `best_case + unknown <
//! minQuorum`, no future message can change the outcome.
//!
//! Everything here is a pure function of the state — no clocks, no I/O,
//! no randomness. The voter calls these on every ingest, so they stay
//! allocation-light.

use std::collections::BTreeMap;

use crate::consensus::messages::{BlockHash, Decision, Round, TxId};
use crate::consensus::state::TipVotingState;

/// Vote distribution for one transaction at a tip.
///
/// YES and NO are permanent declarations, so they are counted across every
/// round; PASS is a per-round abstention and only counts at the round being
/// probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxVoteTally {
    /// YES votes, all rounds.
    pub pro: usize,
    /// NO votes, all rounds.
    pub contra: usize,
    /// PASS votes at the probed round only.
    pub abstentions: usize,
}

impl TxVoteTally {
    /// Total distinct declarations seen.
    pub fn total(&self) -> usize {
        self.pro + self.contra + self.abstentions
    }
}

/// Vote distribution for the round axis at one (tip, round).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundVoteTally {
    /// YES votes per vice-block hash.
    pub pro: BTreeMap<BlockHash, usize>,
    /// PASS votes this round.
    pub abstentions: usize,
}

impl RoundVoteTally {
    /// Total votes cast this round.
    pub fn total(&self) -> usize {
        self.pro.values().sum::<usize>() + self.abstentions
    }

    /// The YES count of the best-supported vice-block this round.
    pub fn best(&self) -> usize {
        self.pro.values().copied().max().unwrap_or(0)
    }

    /// YES count for a specific vice-block.
    pub fn pro_for(&self, block: &BlockHash) -> usize {
        self.pro.get(block).copied().unwrap_or(0)
    }
}

/// Committee sizing handed to every predicate. Carried separately from the
/// state because the same state is probed with the same sizing everywhere —
/// the voter owns one of these and threads it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumParams {
    /// Committee seats.
    pub num_of_voters: usize,
    /// YES votes needed on a subject.
    pub min_quorum: usize,
}

impl QuorumParams {
    /// Voters we have not heard from, given `total` votes seen. Clamped at
    /// zero: during committee handovers a tip can briefly hold more votes
    /// than the current team size.
    fn unknown(&self, total: usize) -> usize {
        self.num_of_voters.saturating_sub(total)
    }
}

/// Count the transaction-vote distribution for `txid` at this tip.
///
/// `probe_round` only affects the PASS count. Pass 0 (an invalid round, so
/// nothing matches) to count permanent declarations alone.
pub fn tx_tally(state: &TipVotingState, txid: &TxId, probe_round: Round) -> TxVoteTally {
    let mut tally = TxVoteTally::default();

    for (round, by_tx) in &state.tx_votes {
        let Some(votes) = by_tx.get(txid) else {
            continue;
        };
        for vote in votes.values() {
            debug_assert_eq!(vote.round, *round);
            debug_assert_eq!(vote.choice.subject, *txid);
            match vote.choice.decision {
                Decision::Yes => tally.pro += 1,
                Decision::No => tally.contra += 1,
                Decision::Pass => {
                    if *round == probe_round {
                        tally.abstentions += 1;
                    }
                }
            }
        }
    }

    tally
}

/// Count the round-vote distribution at (tip, `round`).
pub fn round_tally(state: &TipVotingState, round: Round) -> RoundVoteTally {
    let mut tally = RoundVoteTally::default();

    let Some(votes) = state.round_votes_at(round) else {
        return tally;
    };
    for vote in votes.values() {
        debug_assert_eq!(vote.round, round);
        match vote.choice.decision {
            Decision::Yes => *tally.pro.entry(vote.choice.subject).or_default() += 1,
            Decision::Pass => tally.abstentions += 1,
            // Round votes are screened on ingest; NO never lands in state.
            Decision::No => debug_assert!(false, "NO round vote in state"),
        }
    }

    tally
}

/// Is the transaction committed — at or beyond quorum?
pub fn is_committed(tally: &TxVoteTally, params: QuorumParams) -> bool {
    tally.pro >= params.min_quorum
}

/// Is the transaction provably unable to commit?
///
/// True when even a YES from every silent voter could not reach quorum.
/// This is what lets the voter finalize and prune rejected transactions
/// without waiting for explicit NOs from everyone.
pub fn is_not_committable(tally: &TxVoteTally, params: QuorumParams) -> bool {
    tally.pro + params.unknown(tally.total()) < params.min_quorum
}

/// Is the round a stalemate — no block can win it, ever?
///
/// True when the best-supported vice-block plus every silent voter still
/// falls short of quorum. Once true it stays true (votes only accumulate),
/// which is what makes `current_round` monotonic.
pub fn is_round_stalemate(tally: &RoundVoteTally, params: QuorumParams) -> bool {
    tally.best() + params.unknown(tally.total()) < params.min_quorum
}

/// The current voting round at this tip: the lowest round that is not a
/// proven stalemate.
///
/// Terminates because an untouched round has no votes at all, and
/// `0 + num_of_voters >= min_quorum` holds by the sizing invariant.
pub fn current_round(state: &TipVotingState, params: QuorumParams) -> Round {
    debug_assert!(params.num_of_voters >= 1);
    debug_assert!(params.min_quorum <= params.num_of_voters);

    let mut round = 1;
    loop {
        let tally = round_tally(state, round);
        if !is_round_stalemate(&tally, params) {
            return round;
        }
        round += 1;
    }
}

/// The lowest round nobody has voted in yet. Block proposers target this
/// round so their vice-block lands where the election is still open.
pub fn lowest_not_occupied_round(state: &TipVotingState) -> Round {
    let mut round = 1;
    while state
        .round_votes_at(round)
        .is_some_and(|votes| !votes.is_empty())
    {
        round += 1;
    }
    round
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::messages::{MemberId, RoundVote, TxVote, VoteChoice};

    const PARAMS: QuorumParams = QuorumParams {
        num_of_voters: 32,
        min_quorum: 23,
    };

    fn member(i: u8) -> MemberId {
        [i; 32]
    }

    fn seed_tx_votes(state: &mut TipVotingState, decision: Decision, round: Round, n: u8) {
        let subject = [7u8; 32];
        for i in 0..n {
            let choice = match decision {
                Decision::Yes => VoteChoice::yes(subject),
                Decision::No => VoteChoice::no(subject),
                Decision::Pass => VoteChoice {
                    subject,
                    decision: Decision::Pass,
                },
            };
            state.insert_tx_vote(TxVote {
                voter: member(i),
                round,
                tip: [0xBB; 32],
                choice,
            });
        }
    }

    #[test]
    fn yes_counts_across_rounds_pass_does_not() {
        let mut state = TipVotingState::default();
        seed_tx_votes(&mut state, Decision::Yes, 1, 5);
        // Different voters pass in round 2.
        for i in 10..13u8 {
            state.insert_tx_vote(TxVote {
                voter: member(i),
                round: 2,
                tip: [0xBB; 32],
                choice: VoteChoice {
                    subject: [7u8; 32],
                    decision: Decision::Pass,
                },
            });
        }

        let probe_r1 = tx_tally(&state, &[7u8; 32], 1);
        assert_eq!(probe_r1.pro, 5);
        assert_eq!(probe_r1.abstentions, 0);

        let probe_r2 = tx_tally(&state, &[7u8; 32], 2);
        assert_eq!(probe_r2.pro, 5);
        assert_eq!(probe_r2.abstentions, 3);
    }

    #[test]
    fn committed_at_quorum() {
        let mut state = TipVotingState::default();
        seed_tx_votes(&mut state, Decision::Yes, 1, 23);
        let tally = tx_tally(&state, &[7u8; 32], 1);
        assert!(is_committed(&tally, PARAMS));

        let mut below = tally;
        below.pro = 22;
        assert!(!is_committed(&below, PARAMS));
    }

    #[test]
    fn not_committable_when_silent_voters_cannot_save_it() {
        // 10 NOs: 22 voters unheard, best case 0 + 22 < 23.
        let tally = TxVoteTally {
            pro: 0,
            contra: 10,
            abstentions: 0,
        };
        assert!(is_not_committable(&tally, PARAMS));

        // 9 NOs: 23 unheard could still commit it.
        let tally = TxVoteTally {
            pro: 0,
            contra: 9,
            abstentions: 0,
        };
        assert!(!is_not_committable(&tally, PARAMS));
    }

    #[test]
    fn unknown_clamps_when_votes_exceed_team() {
        // More votes on record than the current team size (committee
        // handover). unknown must clamp to 0, not underflow.
        let tally = TxVoteTally {
            pro: 1,
            contra: 40,
            abstentions: 0,
        };
        assert!(is_not_committable(&tally, PARAMS));
    }

    #[test]
    fn stalemate_arithmetic() {
        // 10 voters passed, nobody YES: best 0 + 22 unknown < 23 → stalemate.
        let tally = RoundVoteTally {
            pro: BTreeMap::new(),
            abstentions: 10,
        };
        assert!(is_round_stalemate(&tally, PARAMS));

        // 9 passed: 0 + 23 = 23 >= 23, still winnable.
        let tally = RoundVoteTally {
            pro: BTreeMap::new(),
            abstentions: 9,
        };
        assert!(!is_round_stalemate(&tally, PARAMS));
    }

    #[test]
    fn current_round_advances_past_stalemates() {
        let mut state = TipVotingState::default();
        assert_eq!(current_round(&state, PARAMS), 1);

        // All 32 voters pass round 1: proven stalemate.
        for i in 0..32u8 {
            state.insert_round_vote(RoundVote {
                voter: member(i),
                round: 1,
                tip: [0xBB; 32],
                choice: VoteChoice::pass(),
            });
        }
        assert_eq!(current_round(&state, PARAMS), 2);
    }

    #[test]
    fn round_tally_groups_by_subject() {
        let mut state = TipVotingState::default();
        for i in 0..5u8 {
            state.insert_round_vote(RoundVote {
                voter: member(i),
                round: 1,
                tip: [0xBB; 32],
                choice: VoteChoice::yes([1u8; 32]),
            });
        }
        for i in 5..8u8 {
            state.insert_round_vote(RoundVote {
                voter: member(i),
                round: 1,
                tip: [0xBB; 32],
                choice: VoteChoice::yes([2u8; 32]),
            });
        }
        state.insert_round_vote(RoundVote {
            voter: member(8),
            round: 1,
            tip: [0xBB; 32],
            choice: VoteChoice::pass(),
        });

        let tally = round_tally(&state, 1);
        assert_eq!(tally.pro_for(&[1u8; 32]), 5);
        assert_eq!(tally.pro_for(&[2u8; 32]), 3);
        assert_eq!(tally.abstentions, 1);
        assert_eq!(tally.total(), 9);
        assert_eq!(tally.best(), 5);
    }

    #[test]
    fn lowest_not_occupied_round_skips_voted_rounds() {
        let mut state = TipVotingState::default();
        assert_eq!(lowest_not_occupied_round(&state), 1);

        state.insert_round_vote(RoundVote {
            voter: member(0),
            round: 1,
            tip: [0xBB; 32],
            choice: VoteChoice::pass(),
        });
        assert_eq!(lowest_not_occupied_round(&state), 2);
    }
}
