//! # Consensus Module
//!
//! The instant-finality dPoS layer. A fixed-size committee of operators
//! votes on two axes at every chain tip:
//!
//! - **transaction axis** — YES/NO/PASS on individual instant transactions.
//!   YES and NO are permanent for a tip; PASS is per-round. A transaction
//!   with `MIN_QUORUM` YES votes is *committed* and irrevocable at that tip.
//! - **round axis** — YES/PASS on proposed vice-blocks, one YES per voter
//!   per round. A vice-block with `MIN_QUORUM` YES votes at the current
//!   round is submitted to the PoW chain with the voters' signatures
//!   aggregated into its signature slot.
//!
//! A round that provably cannot elect a block (not even if every silent
//! voter showed up) is a stalemate, and the round counter advances. That is
//! the only way rounds move — no timeouts inside the core, no leader clocks.
//!
//! The module split mirrors the dataflow: [`messages`] defines what travels,
//! [`state`] stores it per tip, [`tally`] counts it, [`voter`] decides,
//! [`committee`] says who may vote, and [`controller`] glues the voter to
//! signatures, storage, and the network.

pub mod committee;
pub mod controller;
pub mod messages;
pub mod state;
pub mod tally;
pub mod voter;

pub use committee::{Committee, CommitteeView, StaticCommittee};
pub use controller::{
    ChainAdapter, Controller, ControllerConfig, MempoolView, PeerPenalty, Relay, StartupError,
};
pub use messages::{
    BlockHash, BlockToSubmit, Decision, FetchRequest, MemberId, OutPoint, Round, RoundVote,
    SignedRoundVote, SignedTxVote, Transaction, TxId, TxVote, ViceBlock, VoteChoice, ZERO_HASH,
};
pub use state::TipVotingState;
pub use tally::{RoundVoteTally, TxVoteTally};
pub use voter::{
    CommittedTxs, Voter, VoterError, VoterInput, VoterOutput, VoterParams, WorldView,
};
