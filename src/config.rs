use std::path::PathBuf;

use clap::Parser;

use crate::blockchain::chain::{LedgerConfig, DEFAULT_MINING_REWARD};
use crate::blockchain::crypto::DEFAULT_KEY_BITS;
use crate::blockchain::verification::DEFAULT_DIFFICULTY;

/// Command line configuration of a ledger node
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct NodeConfig {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on; also names this node's ledger and wallet files
    #[arg(short, long, default_value_t = 5000)]
    pub port: u16,

    /// Directory holding the ledger record and wallet key file
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Leading zero hex digits required of a proof hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY as u8, value_parser = clap::value_parser!(u8).range(0..=64))]
    pub difficulty: u8,

    /// Coins credited to the miner of each block
    #[arg(long, default_value_t = DEFAULT_MINING_REWARD, value_parser = parse_reward)]
    pub mining_reward: f64,

    /// RSA modulus size for newly created wallets
    #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,
}

/// Parses a mining reward, which must be a finite, non-negative amount
fn parse_reward(value: &str) -> Result<f64, String> {
    let reward: f64 = value
        .parse()
        .map_err(|e| format!("invalid amount `{}`: {}", value, e))?;
    if !reward.is_finite() || reward < 0.0 {
        return Err(format!("reward must be a finite, non-negative amount, got {}", value));
    }
    Ok(reward)
}

impl NodeConfig {
    /// Path of this node's ledger record
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(format!("blockchain-{}.txt", self.port))
    }

    /// Path of this node's wallet key file
    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallet-{}.txt", self.port))
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            difficulty: usize::from(self.difficulty),
            mining_reward: self.mining_reward,
        }
    }
}
