// Voter-agent benchmarks for the LUMEN dPoS layer.
//
// Covers vote signing-hash computation and verification, vote ingestion
// into a fresh voter, and the quorum path from vice-block arrival to an
// assembled block-to-submit.

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lumen_protocol::consensus::{
    BlockHash, MemberId, RoundVote, SignedRoundVote, Transaction, TxId, TxVote, ViceBlock, Voter,
    VoterParams, VoteChoice, WorldView, ZERO_HASH,
};
use lumen_protocol::crypto::hash::blake3_hash;
use lumen_protocol::crypto::keys::OperatorKeypair;

/// Accept-everything hooks: benchmarks measure the voter, not a ledger.
#[derive(Clone, Default)]
struct OpenWorld;

impl WorldView for OpenWorld {
    fn pre_validate_tx(&self, tx: &Transaction, _threshold: u32) -> bool {
        tx.instant
    }
    fn validate_tx_set(&self, _txs: &BTreeMap<TxId, Transaction>) -> bool {
        true
    }
    fn validate_block(
        &self,
        _block: &ViceBlock,
        _committed: &BTreeMap<TxId, Transaction>,
        _full: bool,
    ) -> bool {
        true
    }
    fn allow_archiving(&self, _tip: &BlockHash) -> bool {
        true
    }
    fn prev_block(&self, _block: &BlockHash) -> BlockHash {
        ZERO_HASH
    }
    fn time_millis(&self) -> i64 {
        0
    }
}

fn member(i: u64) -> MemberId {
    let mut id = [0u8; 32];
    id[..8].copy_from_slice(&i.to_le_bytes());
    id
}

fn fresh_voter(team: usize, quorum: usize, tip: BlockHash) -> Voter<OpenWorld> {
    let params = VoterParams {
        num_of_voters: team,
        min_quorum: quorum,
        ..VoterParams::default()
    };
    let mut voter = Voter::new(OpenWorld, params);
    voter.update_tip(tip);
    voter.set_voting(true, member(0));
    voter
}

fn bench_vote_sign_and_verify(c: &mut Criterion) {
    let keypair = OperatorKeypair::generate();
    let vote = RoundVote {
        voter: member(1),
        round: 1,
        tip: blake3_hash(b"B101"),
        choice: VoteChoice::yes([0xAB; 32]),
    };
    let mut wire = SignedRoundVote::unsigned(&vote, keypair.public_key());
    wire.signature = keypair.sign(&wire.signing_hash());

    c.bench_function("voting/vote_sign", |b| {
        b.iter(|| keypair.sign(&wire.signing_hash()));
    });
    c.bench_function("voting/vote_verify", |b| {
        b.iter(|| wire.public_key.verify(&wire.signing_hash(), &wire.signature));
    });
}

fn bench_tx_vote_ingest(c: &mut Criterion) {
    let tip = blake3_hash(b"B101");
    let subject = [0x11u8; 32];

    let mut group = c.benchmark_group("voting/tx_vote_ingest");
    for team in [8usize, 32] {
        let quorum = team * 2 / 3 + 1;
        group.throughput(Throughput::Elements(team as u64));
        group.bench_with_input(BenchmarkId::from_parameter(team), &team, |b, &team| {
            b.iter_with_setup(
                || {
                    let votes: Vec<TxVote> = (1..=team as u64)
                        .map(|i| TxVote {
                            voter: member(i),
                            round: 1,
                            tip,
                            choice: VoteChoice::yes(subject),
                        })
                        .collect();
                    (fresh_voter(team, quorum, tip), votes)
                },
                |(mut voter, votes)| {
                    for vote in votes {
                        voter.apply_tx_vote(vote);
                    }
                },
            );
        });
    }
    group.finish();
}

fn bench_block_quorum_path(c: &mut Criterion) {
    let tip = blake3_hash(b"B101");
    let team = 32usize;
    let quorum = 23usize;

    c.bench_function("voting/block_quorum_path", |b| {
        b.iter_with_setup(
            || {
                let block = ViceBlock {
                    prev: tip,
                    time: 0,
                    round: 1,
                    txs: vec![],
                    signatures: Vec::new(),
                };
                let votes: Vec<RoundVote> = (1..=quorum as u64)
                    .map(|i| RoundVote {
                        voter: member(i),
                        round: 1,
                        tip,
                        choice: VoteChoice::yes(block.hash()),
                    })
                    .collect();
                // An observing voter: counts the quorum, emits the block.
                let mut voter = fresh_voter(team, quorum, tip);
                voter.set_voting(false, member(0));
                (voter, block, votes)
            },
            |(mut voter, block, votes)| {
                voter.apply_vice_block(block);
                let mut submitted = None;
                for vote in votes {
                    let out = voter.apply_round_vote(vote);
                    if out.block_to_submit.is_some() {
                        submitted = out.block_to_submit;
                    }
                }
                assert!(submitted.is_some());
            },
        );
    });
}

criterion_group!(
    benches,
    bench_vote_sign_and_verify,
    bench_tx_vote_ingest,
    bench_block_quorum_path,
);
criterion_main!(benches);
