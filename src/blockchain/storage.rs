use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use super::block::Block;
use super::transaction::Transaction;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Malformed ledger record: {0}")]
    MalformedRecord(String),
}

/// Everything a node persists between runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub chain: Vec<Block>,
    pub open_transactions: Vec<Transaction>,
    pub peer_nodes: Vec<String>,
}

/// File-backed storage for a node's ledger state
///
/// The record is three newline separated JSON documents: the chain, the open
/// transactions and the peer nodes. Writes are not atomic across the three
/// sections, so loading treats any malformed record as absent.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    /// Creates a store writing to `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        LedgerStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the snapshot, replacing any previous record
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StorageError> {
        let mut contents = serde_json::to_string(&snapshot.chain)?;
        contents.push('\n');
        contents.push_str(&serde_json::to_string(&snapshot.open_transactions)?);
        contents.push('\n');
        contents.push_str(&serde_json::to_string(&snapshot.peer_nodes)?);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, contents)?;
        Ok(())
    }

    /// Reads the record back
    pub fn load(&self) -> Result<LedgerSnapshot, StorageError> {
        let contents = fs::read_to_string(&self.path)?;
        let mut lines = contents.lines();

        let mut section = |name: &str| {
            lines
                .next()
                .ok_or_else(|| StorageError::MalformedRecord(format!("missing {} section", name)))
        };

        let chain: Vec<Block> = serde_json::from_str(section("chain")?)?;
        let open_transactions: Vec<Transaction> = serde_json::from_str(section("transactions")?)?;
        let peer_nodes: Vec<String> = serde_json::from_str(section("peers")?)?;

        if chain.first() != Some(&Block::genesis()) {
            return Err(StorageError::MalformedRecord(
                "chain does not start at the genesis block".to_string(),
            ));
        }

        Ok(LedgerSnapshot {
            chain,
            open_transactions,
            peer_nodes,
        })
    }

    /// Reads the record, treating any failure as "no prior state"
    pub fn load_or_empty(&self) -> Option<LedgerSnapshot> {
        match self.load() {
            Ok(snapshot) => Some(snapshot),
            Err(StorageError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    "Ignoring unreadable ledger record at {}: {}",
                    self.path.display(),
                    err
                );
                None
            }
        }
    }
}
