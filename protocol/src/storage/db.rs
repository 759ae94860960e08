//! # VotingStore — Persistent dPoS Records
//!
//! The on-disk side of the dPoS layer, built on sled's embedded key-value
//! store. Three trees hold the consensus records keyed by identity hash,
//! one holds committee snapshots keyed by height:
//!
//! | Tree           | Key                  | Value                       |
//! |----------------|----------------------|-----------------------------|
//! | `vice_blocks`  | block hash (32B)     | `bincode(ViceBlock)`        |
//! | `round_votes`  | identity hash (32B)  | `bincode(SignedRoundVote)`  |
//! | `tx_votes`     | identity hash (32B)  | `bincode(SignedTxVote)`     |
//! | `committees`   | height (8B BE)       | `bincode(Committee)`        |
//!
//! Heights are big-endian so sled's lexicographic ordering matches numeric
//! ordering and range scans over committee history work naturally.
//!
//! Writes are append-style: a record is stored once under its identity hash
//! and never mutated. The only deletes are the controller's batched erases
//! when a tip falls out of the keep window.

use sled::{Batch, Db, Tree};
use std::path::Path;

use crate::consensus::committee::Committee;
use crate::consensus::messages::{SignedRoundVote, SignedTxVote, ViceBlock};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// VotingStore
// ---------------------------------------------------------------------------

/// Persistent storage for dPoS votes, vice-blocks, and committee snapshots.
///
/// # Thread Safety
///
/// sled is inherently thread-safe — all trees support lock-free concurrent
/// reads and serialized writes. `VotingStore` can be shared across threads
/// via `Arc<VotingStore>` without external synchronization.
#[derive(Debug, Clone)]
pub struct VotingStore {
    db: Db,
    vice_blocks: Tree,
    round_votes: Tree,
    tx_votes: Tree,
    committees: Tree,
}

impl VotingStore {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A temporary in-memory store, cleaned up on drop. Ideal for tests —
    /// no filesystem side effects, no cleanup needed.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let vice_blocks = db.open_tree("vice_blocks")?;
        let round_votes = db.open_tree("round_votes")?;
        let tx_votes = db.open_tree("tx_votes")?;
        let committees = db.open_tree("committees")?;

        Ok(Self {
            db,
            vice_blocks,
            round_votes,
            tx_votes,
            committees,
        })
    }

    // -- Vice-blocks --------------------------------------------------------

    /// Persist a vice-block under its block hash.
    pub fn put_vice_block(&self, block: &ViceBlock) -> StoreResult<()> {
        self.vice_blocks.insert(block.hash(), encode(block)?)?;
        Ok(())
    }

    /// All persisted vice-blocks, with their stored keys. The caller is
    /// expected to re-check `key == block.hash()` during replay — a
    /// mismatch means on-disk corruption.
    pub fn vice_blocks(&self) -> StoreResult<Vec<([u8; 32], ViceBlock)>> {
        self.load_all(&self.vice_blocks)
    }

    /// Erase a batch of vice-blocks by block hash.
    pub fn erase_vice_blocks(&self, hashes: &[[u8; 32]]) -> StoreResult<()> {
        Self::erase_batch(&self.vice_blocks, hashes)
    }

    // -- Round votes --------------------------------------------------------

    /// Persist a signed round vote under its identity hash.
    pub fn put_round_vote(&self, vote: &SignedRoundVote) -> StoreResult<()> {
        self.round_votes.insert(vote.identity_hash(), encode(vote)?)?;
        Ok(())
    }

    pub fn round_votes(&self) -> StoreResult<Vec<([u8; 32], SignedRoundVote)>> {
        self.load_all(&self.round_votes)
    }

    pub fn erase_round_votes(&self, hashes: &[[u8; 32]]) -> StoreResult<()> {
        Self::erase_batch(&self.round_votes, hashes)
    }

    // -- Tx votes -----------------------------------------------------------

    /// Persist a signed transaction vote under its identity hash.
    pub fn put_tx_vote(&self, vote: &SignedTxVote) -> StoreResult<()> {
        self.tx_votes.insert(vote.identity_hash(), encode(vote)?)?;
        Ok(())
    }

    pub fn tx_votes(&self) -> StoreResult<Vec<([u8; 32], SignedTxVote)>> {
        self.load_all(&self.tx_votes)
    }

    pub fn erase_tx_votes(&self, hashes: &[[u8; 32]]) -> StoreResult<()> {
        Self::erase_batch(&self.tx_votes, hashes)
    }

    // -- Committee snapshots ------------------------------------------------

    /// Persist the committee that became authoritative at `height`.
    pub fn put_committee(&self, height: u64, committee: &Committee) -> StoreResult<()> {
        self.committees
            .insert(height.to_be_bytes(), encode(committee)?)?;
        Ok(())
    }

    /// The committee snapshot at exactly `height`, if stored.
    pub fn get_committee(&self, height: u64) -> StoreResult<Option<Committee>> {
        match self.committees.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop committee snapshots below `height`. GC companion to the vote
    /// erases.
    pub fn prune_committees_below(&self, height: u64) -> StoreResult<()> {
        let mut batch = Batch::default();
        for entry in self.committees.range(..height.to_be_bytes().to_vec()) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        self.committees.apply_batch(batch)?;
        Ok(())
    }

    // -- Maintenance --------------------------------------------------------

    /// Flush everything to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn load_all<T: serde::de::DeserializeOwned>(
        &self,
        tree: &Tree,
    ) -> StoreResult<Vec<([u8; 32], T)>> {
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let key: [u8; 32] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Serialization("malformed 32-byte key".to_string()))?;
            out.push((key, decode(&value)?));
        }
        Ok(out)
    }

    fn erase_batch(tree: &Tree, hashes: &[[u8; 32]]) -> StoreResult<()> {
        let mut batch = Batch::default();
        for hash in hashes {
            batch.remove(hash);
        }
        tree.apply_batch(batch)?;
        Ok(())
    }
}
