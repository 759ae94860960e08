//! # CLI Interface
//!
//! Command-line argument structure for `lumen-node` using `clap` derive.

use clap::Parser;
use std::path::PathBuf;

/// LUMEN dPoS devnet harness.
///
/// Spins up a committee of in-process operators wired through a loopback
/// message bus, proposes one vice-block, and runs the instant-finality
/// protocol until the committee finalizes it. The PoW chain, the p2p
/// transport, and the UTXO validator are all played by in-memory stand-ins;
/// a production node replaces them with the real services.
#[derive(Parser, Debug)]
#[command(name = "lumen-node", about = "LUMEN dPoS devnet harness", version)]
pub struct Cli {
    /// Number of in-process operators (committee seats).
    #[arg(long, default_value_t = 4)]
    pub operators: usize,

    /// Quorum threshold. Defaults to 2/3 of the committee plus one.
    #[arg(long)]
    pub quorum: Option<usize>,

    /// Data directory for the per-operator voting stores. A throwaway
    /// in-memory store is used when omitted.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Maximum message-bus pump iterations before giving up.
    #[arg(long, default_value_t = 200)]
    pub max_iterations: usize,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Cli {
    /// The effective quorum: explicit flag or 2/3 + 1.
    pub fn effective_quorum(&self) -> usize {
        self.quorum.unwrap_or(self.operators * 2 / 3 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_quorum_is_two_thirds_plus_one() {
        let cli = Cli::parse_from(["lumen-node", "--operators", "32"]);
        assert_eq!(cli.effective_quorum(), 22);

        let cli = Cli::parse_from(["lumen-node", "--operators", "4"]);
        assert_eq!(cli.effective_quorum(), 3);
    }

    #[test]
    fn explicit_quorum_wins() {
        let cli = Cli::parse_from(["lumen-node", "--operators", "32", "--quorum", "23"]);
        assert_eq!(cli.effective_quorum(), 23);
    }
}
