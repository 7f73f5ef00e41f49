use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::hash::{self, HashError};
use super::transaction::Transaction;

/// Placeholder proof carried by the genesis block
pub const GENESIS_PROOF: u64 = 100;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Hash of the previous block (empty for the genesis block)
    pub previous_hash: String,

    /// List of transactions included in this block, reward last
    pub transactions: Vec<Transaction>,

    /// Proof of work (nonce)
    pub proof: u64,

    /// Seconds since the Unix epoch when the block was created
    pub timestamp: i64,
}

impl Block {
    /// Creates a new block stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `previous_hash` - The hash of the previous block
    /// * `transactions` - The list of transactions to include in the block
    /// * `proof` - The proof of work (nonce)
    pub fn new(index: u64, previous_hash: String, transactions: Vec<Transaction>, proof: u64) -> Self {
        Block {
            index,
            previous_hash,
            transactions,
            proof,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Creates the genesis block
    ///
    /// Every field is fixed, so all nodes agree on its hash.
    pub fn genesis() -> Self {
        Block {
            index: 0,
            previous_hash: String::new(),
            transactions: Vec::new(),
            proof: GENESIS_PROOF,
            timestamp: 0,
        }
    }

    /// Calculates the canonical SHA-256 hash of the block
    pub fn hash(&self) -> Result<String, HashError> {
        hash::hash(self)
    }

    /// Transactions covered by the proof of work: all but the trailing reward
    pub fn proof_transactions(&self) -> &[Transaction] {
        match self.transactions.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }
}
