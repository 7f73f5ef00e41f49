use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::hash::HashError;

/// Sender marker for block reward transactions
pub const MINING_SENDER: &str = "MINING";

/// Represents a transfer of coins between two accounts
///
/// Accounts are identified by their hex encoded public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Sender's public key, or `MINING` for a block reward
    pub sender: String,

    /// Recipient's public key
    pub recipient: String,

    /// Hex encoded signature over the transaction content (empty for rewards)
    #[serde(default)]
    pub signature: String,

    /// Amount being transferred
    pub amount: f64,
}

/// The signed part of a transaction, in its fixed field order
#[derive(Debug, Serialize)]
pub struct TransactionContent<'a> {
    pub sender: &'a str,
    pub recipient: &'a str,
    pub amount: f64,
}

impl<'a> TransactionContent<'a> {
    pub fn new(sender: &'a str, recipient: &'a str, amount: f64) -> Self {
        TransactionContent {
            sender,
            recipient,
            amount,
        }
    }

    /// Serializes the content to the bytes that get signed
    pub fn to_bytes(&self) -> Result<Vec<u8>, HashError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Transaction {
    /// Creates a new transaction
    ///
    /// # Arguments
    ///
    /// * `sender` - The public key of the sender
    /// * `recipient` - The public key of the recipient
    /// * `signature` - The sender's signature over the content
    /// * `amount` - The amount to transfer
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        signature: impl Into<String>,
        amount: f64,
    ) -> Self {
        Transaction {
            sender: sender.into(),
            recipient: recipient.into(),
            signature: signature.into(),
            amount,
        }
    }

    /// Creates an unsigned mining reward transaction
    pub fn new_reward(recipient: impl Into<String>, amount: f64) -> Self {
        Transaction {
            sender: MINING_SENDER.to_string(),
            recipient: recipient.into(),
            signature: String::new(),
            amount,
        }
    }

    /// Checks if the transaction is a block reward
    pub fn is_reward(&self) -> bool {
        self.sender == MINING_SENDER
    }

    /// Gets the signed content of the transaction
    pub fn content(&self) -> TransactionContent<'_> {
        TransactionContent::new(&self.sender, &self.recipient, self.amount)
    }

    /// Converts the transaction content to bytes for signing
    pub fn signing_payload(&self) -> Result<Vec<u8>, HashError> {
        self.content().to_bytes()
    }
}

/// Serializes a sequence of transactions without their signatures
///
/// This is the transaction part of the proof-of-work input.
pub fn canonical_transactions(transactions: &[Transaction]) -> Result<String, HashError> {
    let contents: Vec<TransactionContent<'_>> =
        transactions.iter().map(Transaction::content).collect();
    Ok(serde_json::to_string(&contents)?)
}
