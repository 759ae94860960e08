//! # Protocol Configuration & Constants
//!
//! Every magic number in LUMEN lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these are consensus parameters: changing them after launch is a
//! hard fork. The timing values at the bottom are node-local and merely
//! affect liveness, not safety.

// ---------------------------------------------------------------------------
// Committee Sizing
// ---------------------------------------------------------------------------

/// Number of seats in the dPoS committee ("team"). The committee is re-read
/// from the chain view at every tip; voting is suspended whenever the actual
/// team size disagrees with this constant.
pub const TEAM_SIZE: usize = 32;

/// Minimum number of YES votes on a subject for safety-tolerant agreement.
/// Must satisfy `MIN_QUORUM <= TEAM_SIZE`. With 23 of 32, two conflicting
/// subjects can never both reach quorum: 23 + 23 > 32.
pub const MIN_QUORUM: usize = 23;

// ---------------------------------------------------------------------------
// Memory Windows
// ---------------------------------------------------------------------------

/// How many blocks back an operator's own YES votes keep pledging inputs.
/// Within this window a voter will not vote YES on any transaction spending
/// an outpoint it has already pledged.
pub const VOTING_MEMORY: u32 = 4;

/// How many blocks back committed-transaction lookups walk. A transaction
/// committed at a recent ancestor is still treated as committed at the
/// current tip, so a vice-block cannot silently drop it.
pub const GUARANTEES_MEMORY: u32 = 8;

/// Ancestor distance beyond which per-tip voting state and all records keyed
/// on that tip are garbage-collected. Messages referencing tips outside this
/// window are discarded on arrival.
pub const MAX_BLOCKS_TO_KEEP: u32 = 16;

// ---------------------------------------------------------------------------
// Vote-flooding Bounds
// ---------------------------------------------------------------------------

/// Upper bound on transaction votes accepted from a single committee member
/// at one tip. Anything past this is dropped without penalty — flooding is
/// a resource problem, not a safety problem.
pub const MAX_TX_VOTES_FROM_VOTER: usize = 60;

/// Upper bound on transaction bodies kept around that nobody has voted on
/// yet. New unvoted transactions are dropped once this is reached.
pub const MAX_NOT_VOTED_TXS_TO_KEEP: usize = 600;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes. The block-assembly path
/// counts signatures by dividing the aggregate slot by this.
pub const SIGNATURE_LENGTH: usize = 64;

/// Hash output length in bytes. BLAKE3 produces 32-byte digests.
pub const HASH_OUTPUT_LENGTH: usize = 32;

/// Domain-separation salt mixed into the signing hash of transaction votes.
/// Distinct per message type so a signature can never be replayed across
/// types. 16 bytes, fixed at build time.
pub const TX_VOTE_SALT: [u8; 16] = *b"lumen/txvote/v1\0";

/// Domain-separation salt for round votes.
pub const ROUND_VOTE_SALT: [u8; 16] = *b"lumen/rvote/v1\0\0";

/// Wire schema version carried by signed votes.
pub const WIRE_VOTE_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Timing (node-local; liveness only)
// ---------------------------------------------------------------------------

/// Wall-clock budget for a voting round. When exceeded and this operator has
/// not voted yet, the controller makes the voter cast a round-PASS — the only
/// mechanism that breaks a silent quorum.
pub const ROUND_BUDGET_MS: i64 = 10_000;

/// Period of the controller's background tick: fetch-request servicing,
/// round-timeout checks, and garbage collection.
pub const POLLING_PERIOD_MS: u64 = 1_000;

/// Seconds to keep voting suspended after initial block download completes.
/// Votes observed during catch-up may reference tips we can't judge yet.
pub const INITIAL_SYNC_DELAY_SECS: i64 = 60;

/// dPoS is disabled when the wall-clock is further than this ahead of the
/// tip's block time — a stale tip means we're behind and shouldn't vote.
pub const MAX_TIP_AGE_SECS: i64 = 3_600;

/// How long relayed items stay in the de-duplication cache.
pub const RELAY_TTL_SECS: i64 = 15 * 60;

/// Expiry window (in blocks) passed to the transaction pre-validation hook.
/// Transactions expiring within this many blocks are rejected up front:
/// committing a transaction that dies before it can be mined helps nobody.
pub const TX_EXPIRING_SOON_THRESHOLD: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_fits_team() {
        assert!(MIN_QUORUM <= TEAM_SIZE);
        assert!(TEAM_SIZE >= 1);
    }

    #[test]
    fn quorum_majority_overlap() {
        // Two quorums must always share at least one honest voter, otherwise
        // two conflicting subjects could both commit.
        assert!(2 * MIN_QUORUM > TEAM_SIZE);
    }

    #[test]
    fn memory_windows_ordered() {
        // Pledges live shorter than commit guarantees, which live shorter
        // than raw storage.
        assert!(VOTING_MEMORY <= GUARANTEES_MEMORY);
        assert!(GUARANTEES_MEMORY <= MAX_BLOCKS_TO_KEEP);
    }

    #[test]
    fn vote_salts_are_distinct() {
        // If these collide, a tx-vote signature doubles as a round-vote
        // signature and the domain separation is theater.
        assert_ne!(TX_VOTE_SALT, ROUND_VOTE_SALT);
    }
}
