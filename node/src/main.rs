// Copyright (c) 2026 The LUMEN developers. MIT License.
// See LICENSE for details.

//! # LUMEN Devnet Node
//!
//! Entry point for the `lumen-node` binary: a self-contained devnet that
//! runs a whole dPoS committee in one process.
//!
//! Every operator gets a full controller (voter + signing key + voting
//! store); a loopback message bus plays the p2p transport, an in-memory
//! stub plays the PoW chain, and the harness itself plays the external
//! block proposer. One vice-block is proposed at round 1, the committee
//! votes, and the run ends when the block comes back out of a controller
//! with its aggregate-signature slot filled.
//!
//! None of the stand-ins leak into the library: they implement the same
//! `ChainAdapter` / `MempoolView` / `Relay` traits a production node wires
//! to its real chain, mempool, and gossip layers.

mod cli;
mod logging;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, warn};

use lumen_protocol::config::SIGNATURE_LENGTH;
use lumen_protocol::consensus::{
    BlockHash, ChainAdapter, Committee, Controller, ControllerConfig, FetchRequest, MempoolView,
    Relay, SignedRoundVote, SignedTxVote, StaticCommittee, Transaction, TxId, ViceBlock, Voter,
    VoterParams, WorldView, ZERO_HASH,
};
use lumen_protocol::crypto::hash::blake3_hash;
use lumen_protocol::crypto::keys::OperatorKeypair;
use lumen_protocol::storage::VotingStore;

use cli::Cli;
use logging::LogFormat;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Devnet stand-ins
// ---------------------------------------------------------------------------

/// Accept-everything chain hooks. The devnet has no UTXO set to validate
/// against; a production node wires the real validator here.
#[derive(Clone, Default)]
struct DevWorld;

impl WorldView for DevWorld {
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
        now_millis()
    }
}

/// A one-block chain: genesis is the tip, and finalized blocks are simply
/// collected for the run summary.
struct DevChain {
    genesis: BlockHash,
    submitted: Mutex<Vec<ViceBlock>>,
}

impl ChainAdapter for DevChain {
    fn best_tip(&self) -> BlockHash {
        self.genesis
    }
    fn best_height(&self) -> u64 {
        0
    }
    fn height_of(&self, hash: &BlockHash, _max_depth: u32) -> Option<u64> {
        (*hash == self.genesis).then_some(0)
    }
    fn block_time(&self, _hash: &BlockHash) -> i64 {
        now_millis() / 1000
    }
    fn upgrade_active_at(&self, _height: u64) -> bool {
        true
    }
    fn is_initial_block_download(&self) -> bool {
        false
    }
    fn submit_block(&self, block: &ViceBlock) -> bool {
        let mut submitted = self.submitted.lock();
        if submitted.iter().all(|b| b.hash() != block.hash()) {
            submitted.push(block.clone());
        }
        true
    }
}

/// The devnet proposes its own block; there is nothing to fetch.
struct EmptyMempool;

impl MempoolView for EmptyMempool {
    fn lookup(&self, _txid: &TxId) -> Option<Transaction> {
        None
    }
}

/// Everything every operator broadcasts, tagged with the sender's index so
/// the pump can skip the echo.
enum BusMessage {
    ViceBlock(ViceBlock),
    TxVote(SignedTxVote),
    RoundVote(SignedRoundVote),
}

#[derive(Default)]
struct Bus {
    queue: Mutex<VecDeque<(usize, BusMessage)>>,
}

/// One operator's handle onto the shared bus.
struct BusRelay {
    bus: Arc<Bus>,
    me: usize,
}

impl Relay for BusRelay {
    fn broadcast_vice_block(&self, block: &ViceBlock) {
        self.bus
            .queue
            .lock()
            .push_back((self.me, BusMessage::ViceBlock(block.clone())));
    }
    fn broadcast_tx_vote(&self, vote: &SignedTxVote) {
        self.bus
            .queue
            .lock()
            .push_back((self.me, BusMessage::TxVote(vote.clone())));
    }
    fn broadcast_round_vote(&self, vote: &SignedRoundVote) {
        self.bus
            .queue
            .lock()
            .push_back((self.me, BusMessage::RoundVote(vote.clone())));
    }
    fn request(&self, requests: &[FetchRequest]) {
        // Nobody to ask on a loopback devnet.
        if !requests.is_empty() {
            warn!(count = requests.len(), "unserviceable fetch requests");
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, LogFormat::from_str_lossy(&cli.log_format));

    let quorum = cli.effective_quorum();
    ensure!(cli.operators >= 1, "need at least one operator");
    ensure!(
        quorum >= 1 && quorum <= cli.operators,
        "quorum {} does not fit a committee of {}",
        quorum,
        cli.operators
    );

    info!(operators = cli.operators, quorum, "starting devnet committee");

    // Deterministic devnet identities: seat i signs with seed i+1.
    let keypairs: Vec<OperatorKeypair> = (0..cli.operators)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
            OperatorKeypair::from_seed(&seed)
        })
        .collect();
    let mut committee = Committee::new();
    for (i, kp) in keypairs.iter().enumerate() {
        let mut member = [0u8; 32];
        member[..8].copy_from_slice(&(i as u64).to_le_bytes());
        committee.insert(member, kp.public_key());
    }
    let committee_view = Arc::new(StaticCommittee::new(committee.clone()));

    let genesis = blake3_hash(b"lumen-devnet-genesis");
    let chain = Arc::new(DevChain {
        genesis,
        submitted: Mutex::new(Vec::new()),
    });
    let bus = Arc::new(Bus::default());
    let mempool = Arc::new(EmptyMempool);

    let mut controllers: Vec<Arc<Controller<DevWorld>>> = Vec::with_capacity(cli.operators);
    for (i, keypair) in keypairs.iter().enumerate() {
        let store = match &cli.data_dir {
            Some(dir) => VotingStore::open(dir.join(format!("operator-{i}")))
                .with_context(|| format!("opening voting store for operator {i}"))?,
            None => VotingStore::open_temporary().context("opening temporary voting store")?,
        };
        store
            .put_committee(0, &committee)
            .context("persisting the genesis committee snapshot")?;

        let params = VoterParams {
            num_of_voters: cli.operators,
            min_quorum: quorum,
            ..VoterParams::default()
        };
        let controller = Controller::new(
            Voter::new(DevWorld, params),
            Some(keypair.clone()),
            committee_view.clone(),
            chain.clone() as Arc<dyn ChainAdapter + Send + Sync>,
            mempool.clone() as Arc<dyn MempoolView + Send + Sync>,
            Arc::new(BusRelay {
                bus: bus.clone(),
                me: i,
            }) as Arc<dyn Relay + Send + Sync>,
            store,
            ControllerConfig {
                team_size: cli.operators,
                ..ControllerConfig::default()
            },
        );
        controller
            .load_from_store()
            .context("replaying persisted voting state")?;
        // A devnet has no sync phase to wait out.
        controller.set_initial_votes_download(false);
        controller.on_chain_tip_updated(genesis);
        controllers.push(Arc::new(controller));
    }

    // Run every controller's background loop, as a production node would.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();
    for controller in &controllers {
        let controller = Arc::clone(controller);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            controller.run(shutdown).await;
        }));
    }

    // Play the external proposer: one empty vice-block at round 1.
    let proposal = ViceBlock {
        prev: genesis,
        time: now_millis() / 1000,
        round: 1,
        txs: vec![],
        signatures: Vec::new(),
    };
    info!(block = %hex::encode(proposal.hash()), "proposing devnet vice-block");
    for controller in &controllers {
        controller.process_vice_block(proposal.clone());
    }

    // Pump the bus until a block is finalized (or we give up).
    let mut iterations = 0usize;
    loop {
        let batch: Vec<(usize, BusMessage)> = bus.queue.lock().drain(..).collect();
        for (from, message) in batch {
            for (target, controller) in controllers.iter().enumerate() {
                if target == from {
                    continue;
                }
                match &message {
                    BusMessage::ViceBlock(block) => {
                        controller.process_vice_block(block.clone());
                    }
                    BusMessage::TxVote(vote) => {
                        controller.process_tx_vote(vote.clone());
                    }
                    BusMessage::RoundVote(vote) => {
                        controller.process_round_vote(vote.clone());
                    }
                }
            }
        }

        if !chain.submitted.lock().is_empty() {
            break;
        }
        iterations += 1;
        if iterations > cli.max_iterations {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    let submitted = chain.submitted.lock();
    let Some(block) = submitted.first() else {
        anyhow::bail!(
            "devnet did not finalize a block within {} iterations",
            cli.max_iterations
        );
    };

    info!(
        block = %hex::encode(block.hash()),
        signatures = block.signatures.len() / SIGNATURE_LENGTH,
        "devnet finalized its vice-block"
    );
    println!(
        "{}",
        serde_json::json!({
            "finalized": true,
            "block": hex::encode(block.hash()),
            "signatures": block.signatures.len() / SIGNATURE_LENGTH,
            "operators": cli.operators,
            "quorum": quorum,
        })
    );

    Ok(())
}
