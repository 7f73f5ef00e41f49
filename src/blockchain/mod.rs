// Blockchain module
//
// This module contains the ledger engine:
// - Canonical hashing
// - Transaction and block structures
// - RSA wallets and transaction signatures
// - Stateless verification rules
// - The ledger itself (mining, admission, conflict resolution)
// - File persistence and the peer gateway

pub mod block;
pub mod chain;
pub mod crypto;
pub mod hash;
pub mod peer;
pub mod storage;
pub mod transaction;
pub mod verification;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{BlockReception, Blockchain, BlockchainError, LedgerConfig};
pub use crypto::Wallet;
pub use peer::{HttpPeerGateway, PeerGateway};
pub use storage::LedgerStore;
pub use transaction::Transaction;
pub use verification::Verification;
