//! # Consensus Message Types
//!
//! The vocabulary of the dPoS layer: vote choices, transaction votes, round
//! votes, vice-blocks, and the signed wire records that cross the network.
//!
//! Two hash flavors exist per wire record and they are deliberately not the
//! same thing:
//!
//! - the **identity hash** covers the whole record (signature included) and
//!   keys relay caches and persistent stores. Equal identity hashes mean
//!   duplicate messages.
//! - the **signing hash** covers `(tip, round, choices)` plus a fixed
//!   16-byte per-type salt, and is what the operator key signs. The salt
//!   makes cross-type replay impossible: a transaction-vote signature can
//!   never pass as a round-vote signature over the same bytes.

use serde::{Deserialize, Serialize};

use crate::config::{ROUND_VOTE_SALT, TX_VOTE_SALT, WIRE_VOTE_VERSION};
use crate::crypto::hash::{domain_separated_hash, merkle_root};
use crate::crypto::keys::{OperatorPublicKey, VoteSignature};

/// Voting round number. Rounds start at 1; a zero round is malformed.
pub type Round = u32;

/// Transaction identifier — a BLAKE3 digest of the canonical encoding.
pub type TxId = [u8; 32];

/// Block hash on the underlying PoW chain (or of a vice-block).
pub type BlockHash = [u8; 32];

/// Committee member identifier, assigned by the committee-selection policy.
pub type MemberId = [u8; 32];

/// The all-zero hash: "no subject" on PASS votes, "unknown block" from the
/// ancestor-walking hook.
pub const ZERO_HASH: [u8; 32] = [0u8; 32];

// ---------------------------------------------------------------------------
// Vote choices
// ---------------------------------------------------------------------------

/// A voter's decision on a subject.
///
/// On the transaction axis YES and NO are permanent for a tip ("I have
/// pledged myself" / "this can never commit here"), while PASS abstains for
/// a single round. On the round axis only YES and PASS are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i8)]
pub enum Decision {
    Yes = 1,
    Pass = 2,
    No = 3,
}

/// A (subject, decision) pair. PASS must carry an all-zero subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteChoice {
    /// 32-byte hash of the thing being voted on: a txid on the transaction
    /// axis, a vice-block hash on the round axis, all-zero for PASS.
    pub subject: [u8; 32],
    /// The decision.
    pub decision: Decision,
}

impl VoteChoice {
    /// A YES on a concrete subject.
    pub fn yes(subject: [u8; 32]) -> Self {
        Self {
            subject,
            decision: Decision::Yes,
        }
    }

    /// A NO on a concrete subject.
    pub fn no(subject: [u8; 32]) -> Self {
        Self {
            subject,
            decision: Decision::No,
        }
    }

    /// A PASS. Always subject-less.
    pub fn pass() -> Self {
        Self {
            subject: ZERO_HASH,
            decision: Decision::Pass,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal (authenticated) votes
// ---------------------------------------------------------------------------

/// A transaction vote after authentication: the controller has resolved the
/// signer to a committee member at the referenced tip. This is what the
/// voter agent stores and reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxVote {
    /// The committee member who cast this vote.
    pub voter: MemberId,
    /// Round the vote was cast in. Matters for PASS; YES/NO outlive rounds.
    pub round: Round,
    /// The chain tip this vote is pinned to.
    pub tip: BlockHash,
    /// Subject txid + decision.
    pub choice: VoteChoice,
}

/// A round (vice-block) vote after authentication. One YES per voter per
/// round; NO does not exist on this axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundVote {
    pub voter: MemberId,
    pub round: Round,
    pub tip: BlockHash,
    pub choice: VoteChoice,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// A reference to a spendable output of a prior transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// The funding transaction.
    pub tx: TxId,
    /// Output index within it.
    pub index: u32,
}

/// The slice of a chain transaction the consensus layer cares about.
///
/// Full transaction semantics (scripts, amounts, shielded data) live in the
/// external UTXO validator; the voter only needs the instant flag, the
/// spent inputs for conflict tracking, and stable identity bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Whether this transaction opted into instant confirmation. Non-instant
    /// transactions ride in vice-blocks but are never voted individually.
    pub instant: bool,
    /// The outpoints this transaction spends.
    pub inputs: Vec<OutPoint>,
    /// Chain lock-time field, carried through verbatim.
    pub lock_time: u32,
    /// Height after which the transaction is no longer minable; 0 = never.
    pub expiry_height: u32,
    /// Opaque remainder of the transaction body.
    pub payload: Vec<u8>,
}

impl Transaction {
    /// The transaction ID: a domain-separated BLAKE3 digest of the canonical
    /// bincode encoding. Pure function of content.
    pub fn txid(&self) -> TxId {
        let bytes = bincode::serialize(self).unwrap_or_default();
        domain_separated_hash("lumen/tx-id", &bytes)
    }
}

// ---------------------------------------------------------------------------
// Vice-blocks
// ---------------------------------------------------------------------------

/// A block proposal awaiting quorum signatures, pinned to (tip, round).
///
/// Produced by an external proposer. Its transaction list is expected to
/// contain at least the currently committed instant transactions, plus any
/// non-instant transactions the proposer chose. The `signatures` slot stays
/// empty until the block wins its round — a proposal arriving with a
/// pre-filled slot is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViceBlock {
    /// The chain tip this proposal builds on.
    pub prev: BlockHash,
    /// Proposer's timestamp, seconds.
    pub time: i64,
    /// The voting round this proposal targets. Rounds start at 1.
    pub round: Round,
    /// Transaction list.
    pub txs: Vec<Transaction>,
    /// Aggregate signature slot: `MIN_QUORUM`-or-more fixed-size operator
    /// signatures, concatenated. Empty until finalization.
    pub signatures: Vec<u8>,
}

impl ViceBlock {
    /// The block hash. Covers everything *except* the signature slot, so
    /// filling the slot at finalization time preserves the block's identity
    /// (and with it every round vote cast for it).
    pub fn hash(&self) -> BlockHash {
        let tx_root = merkle_root(&self.txs.iter().map(|tx| tx.txid()).collect::<Vec<_>>());
        let header = (self.prev, self.time, self.round, tx_root);
        let bytes = bincode::serialize(&header).unwrap_or_default();
        domain_separated_hash("lumen/vice-block-id", &bytes)
    }
}

/// A vice-block that reached quorum, ready for signature assembly and
/// submission to the chain processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockToSubmit {
    /// The winning vice-block (signature slot still empty; the controller
    /// fills it from its received-vote map).
    pub block: ViceBlock,
    /// The committee members whose round-YES named this block this round.
    pub approved_by: Vec<MemberId>,
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// A transaction vote as it crosses the network: unauthenticated, carrying
/// the signer's public key and signature instead of a member ID.
///
/// `choices` is a vector for wire-format headroom, but the controller only
/// accepts votes with exactly one choice — partially-applied multi-choice
/// votes are a can of worms nobody wants open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTxVote {
    pub version: i32,
    pub tip: BlockHash,
    pub round: Round,
    pub choices: Vec<VoteChoice>,
    pub public_key: OperatorPublicKey,
    pub signature: VoteSignature,
}

impl SignedTxVote {
    /// Build an unsigned wire record from a voter-emitted vote; the
    /// signature is attached by the controller.
    pub fn unsigned(vote: &TxVote, public_key: OperatorPublicKey) -> Self {
        Self {
            version: WIRE_VOTE_VERSION,
            tip: vote.tip,
            round: vote.round,
            choices: vec![vote.choice],
            public_key,
            signature: VoteSignature::from_bytes(Vec::new()),
        }
    }

    /// Identity hash over the full record. Keys stores and relay caches.
    pub fn identity_hash(&self) -> [u8; 32] {
        let bytes = bincode::serialize(self).unwrap_or_default();
        domain_separated_hash("lumen/txvote-id", &bytes)
    }

    /// The digest the operator key signs: salt ‖ (tip, round, choices).
    pub fn signing_hash(&self) -> [u8; 32] {
        signing_hash(&TX_VOTE_SALT, &self.tip, self.round, &self.choices)
    }
}

/// A round vote as it crosses the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRoundVote {
    pub version: i32,
    pub tip: BlockHash,
    pub round: Round,
    pub choice: VoteChoice,
    pub public_key: OperatorPublicKey,
    pub signature: VoteSignature,
}

impl SignedRoundVote {
    pub fn unsigned(vote: &RoundVote, public_key: OperatorPublicKey) -> Self {
        Self {
            version: WIRE_VOTE_VERSION,
            tip: vote.tip,
            round: vote.round,
            choice: vote.choice,
            public_key,
            signature: VoteSignature::from_bytes(Vec::new()),
        }
    }

    pub fn identity_hash(&self) -> [u8; 32] {
        let bytes = bincode::serialize(self).unwrap_or_default();
        domain_separated_hash("lumen/rvote-id", &bytes)
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        signing_hash(
            &ROUND_VOTE_SALT,
            &self.tip,
            self.round,
            std::slice::from_ref(&self.choice),
        )
    }
}

/// Shared signing-hash construction: the per-type salt followed by the
/// canonical encoding of what the vote asserts. The signature deliberately
/// does not cover the version field or the key itself.
fn signing_hash(
    salt: &[u8; 16],
    tip: &BlockHash,
    round: Round,
    choices: &[VoteChoice],
) -> [u8; 32] {
    let body = bincode::serialize(&(tip, round, choices)).unwrap_or_default();
    let mut bytes = Vec::with_capacity(salt.len() + body.len());
    bytes.extend_from_slice(salt);
    bytes.extend_from_slice(&body);
    domain_separated_hash("lumen/vote-sig", &bytes)
}

// ---------------------------------------------------------------------------
// Fetch requests
// ---------------------------------------------------------------------------

/// A getdata-style request for something a vote referenced but we lack.
///
/// Missing inputs are never errors — the voter keeps counting quorum on
/// unseen subjects and asks the controller to fetch the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FetchRequest {
    /// A transaction body, by txid.
    Tx(TxId),
    /// A vice-block, by block hash.
    ViceBlock(BlockHash),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::OperatorKeypair;

    fn sample_tx(lock_time: u32) -> Transaction {
        Transaction {
            instant: true,
            inputs: vec![OutPoint {
                tx: [1u8; 32],
                index: 0,
            }],
            lock_time,
            expiry_height: 0,
            payload: vec![],
        }
    }

    #[test]
    fn txid_is_content_addressed() {
        let a = sample_tx(1);
        let b = sample_tx(1);
        let c = sample_tx(2);
        assert_eq!(a.txid(), b.txid());
        assert_ne!(a.txid(), c.txid());
    }

    #[test]
    fn vice_block_hash_ignores_signature_slot() {
        let mut block = ViceBlock {
            prev: [9u8; 32],
            time: 1_700_000_000,
            round: 1,
            txs: vec![sample_tx(1)],
            signatures: Vec::new(),
        };
        let before = block.hash();
        block.signatures = vec![0xAB; 64];
        // Filling the aggregate slot must not change the block's identity,
        // or every vote cast for it would dangle.
        assert_eq!(before, block.hash());
    }

    #[test]
    fn vice_block_hash_covers_txs() {
        let block_a = ViceBlock {
            prev: [9u8; 32],
            time: 0,
            round: 1,
            txs: vec![],
            signatures: Vec::new(),
        };
        let block_b = ViceBlock {
            txs: vec![sample_tx(1)],
            ..block_a.clone()
        };
        assert_ne!(block_a.hash(), block_b.hash());
    }

    #[test]
    fn signing_hashes_are_type_separated() {
        let tx_vote = TxVote {
            voter: [0u8; 32],
            round: 1,
            tip: [5u8; 32],
            choice: VoteChoice::yes([7u8; 32]),
        };
        let round_vote = RoundVote {
            voter: [0u8; 32],
            round: 1,
            tip: [5u8; 32],
            choice: VoteChoice::yes([7u8; 32]),
        };
        let kp = OperatorKeypair::generate();
        let wire_tx = SignedTxVote::unsigned(&tx_vote, kp.public_key());
        let wire_round = SignedRoundVote::unsigned(&round_vote, kp.public_key());

        // Identical (tip, round, subject, decision), different message type:
        // the salts must force different signing hashes.
        assert_ne!(wire_tx.signing_hash(), wire_round.signing_hash());
    }

    #[test]
    fn signing_hash_binds_round_and_tip() {
        let vote = RoundVote {
            voter: [0u8; 32],
            round: 1,
            tip: [5u8; 32],
            choice: VoteChoice::yes([7u8; 32]),
        };
        let kp = OperatorKeypair::generate();
        let base = SignedRoundVote::unsigned(&vote, kp.public_key());

        let mut other_round = base.clone();
        other_round.round = 2;
        assert_ne!(base.signing_hash(), other_round.signing_hash());

        let mut other_tip = base.clone();
        other_tip.tip = [6u8; 32];
        assert_ne!(base.signing_hash(), other_tip.signing_hash());
    }

    #[test]
    fn identity_hash_changes_with_signature() {
        let vote = RoundVote {
            voter: [0u8; 32],
            round: 1,
            tip: [5u8; 32],
            choice: VoteChoice::pass(),
        };
        let kp = OperatorKeypair::generate();
        let mut wire = SignedRoundVote::unsigned(&vote, kp.public_key());
        let unsigned_id = wire.identity_hash();
        wire.signature = kp.sign(&wire.signing_hash());
        // Identity covers the signature; signing hash does not.
        assert_ne!(unsigned_id, wire.identity_hash());
    }

    #[test]
    fn pass_choice_is_subjectless() {
        assert_eq!(VoteChoice::pass().subject, ZERO_HASH);
        assert_eq!(VoteChoice::pass().decision, Decision::Pass);
    }
}
