use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use log::{debug, error, info, warn};
use thiserror::Error;

use super::block::Block;
use super::crypto::Wallet;
use super::hash::HashError;
use super::peer::{PeerError, PeerGateway, PeerResponse};
use super::storage::{LedgerSnapshot, LedgerStore};
use super::transaction::{Transaction, MINING_SENDER};
use super::verification::{BalanceLookup, Verification, DEFAULT_DIFFICULTY};

/// Default amount credited to the miner of a block
pub const DEFAULT_MINING_REWARD: f64 = 10.0;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("No wallet identity configured for this node")]
    NoIdentity,

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("Reward transactions can only be created by mining")]
    RewardNotAllowed,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Transaction rejected by peers: {}", .0.join(", "))]
    PeerRejected(Vec<String>),

    #[error("Open transaction with an invalid signature, mining aborted")]
    InvalidPendingSignature,

    #[error("Chain changed while mining, block discarded")]
    StaleMiningAttempt,

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Hash error: {0}")]
    HashError(#[from] HashError),

    #[error("Mining worker failed: {0}")]
    MiningWorker(String),
}

impl BlockchainError {
    /// Whether the error is a rejected input rather than a node fault
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            BlockchainError::InvalidAmount(_)
                | BlockchainError::RewardNotAllowed
                | BlockchainError::InvalidSignature
                | BlockchainError::InsufficientFunds { .. }
                | BlockchainError::InvalidPendingSignature
                | BlockchainError::InvalidBlock(_)
        )
    }
}

/// Parameters a ledger is created with
#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// Number of leading zero hex digits a proof hash must have
    pub difficulty: usize,

    /// Amount credited to the miner of each block
    pub mining_reward: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: DEFAULT_MINING_REWARD,
        }
    }
}

/// Outcome of a block relayed by a peer
#[derive(Debug)]
pub enum BlockReception {
    /// The block extended the local tip and was appended
    Added,

    /// The block claimed to extend the local tip but failed validation
    Invalid(BlockchainError),

    /// The peer is ahead of this node; conflicts are flagged for resolution
    AheadOfLocal,

    /// The block is not newer than the local tip
    Stale,
}

/// Mutable state of a node, guarded by a single lock
#[derive(Debug)]
struct LedgerState {
    chain: Vec<Block>,
    open_transactions: Vec<Transaction>,
    peer_nodes: BTreeSet<String>,
    identity: Option<String>,
    resolve_conflicts: bool,
}

impl LedgerState {
    fn from_snapshot(snapshot: Option<LedgerSnapshot>) -> Self {
        let snapshot = snapshot.unwrap_or_else(|| LedgerSnapshot {
            chain: vec![Block::genesis()],
            ..LedgerSnapshot::default()
        });

        LedgerState {
            chain: snapshot.chain,
            open_transactions: snapshot.open_transactions,
            peer_nodes: snapshot.peer_nodes.into_iter().collect(),
            identity: None,
            resolve_conflicts: false,
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            chain: self.chain.clone(),
            open_transactions: self.open_transactions.clone(),
            peer_nodes: self.peer_nodes.iter().cloned().collect(),
        }
    }

    fn last_block(&self) -> Result<&Block, BlockchainError> {
        self.chain
            .last()
            .ok_or_else(|| BlockchainError::InvalidChain("chain has no genesis block".to_string()))
    }

    fn peers(&self) -> Vec<String> {
        self.peer_nodes.iter().cloned().collect()
    }

    /// Credits minus debits over the mined blocks only
    ///
    /// Scans the whole chain: O(chain length x block size) per call.
    fn mined_balance(&self, account: &str) -> f64 {
        let mined = self.chain.iter().flat_map(|block| block.transactions.iter());

        let mut balance = 0.0;
        for transaction in mined {
            if transaction.recipient == account {
                balance += transaction.amount;
            }
            if transaction.sender == account {
                balance -= transaction.amount;
            }
        }
        balance
    }
}

impl BalanceLookup for LedgerState {
    /// Mined credits minus mined and pending debits
    fn balance_of(&self, account: &str) -> f64 {
        let pending_debits: f64 = self
            .open_transactions
            .iter()
            .filter(|transaction| transaction.sender == account)
            .map(|transaction| transaction.amount)
            .sum();

        self.mined_balance(account) - pending_debits
    }
}

impl LedgerState {
    fn open_transactions_valid(&self) -> bool {
        Verification::verify_transactions(&self.open_transactions, &|account: &str| {
            self.mined_balance(account)
        })
    }

    /// Drops open transactions the mined balances no longer cover
    ///
    /// Transactions are replayed in pool order, so an earlier spend keeps
    /// priority over a later one from the same sender.
    fn prune_unaffordable(&mut self) -> usize {
        let pending = std::mem::take(&mut self.open_transactions);
        let mut debited: HashMap<String, f64> = HashMap::new();
        let mut dropped = 0;

        for transaction in pending {
            let spent = debited.get(&transaction.sender).copied().unwrap_or(0.0);
            let available = self.mined_balance(&transaction.sender) - spent;
            if Verification::verify_transaction(&transaction, &|_: &str| available) {
                *debited.entry(transaction.sender.clone()).or_insert(0.0) += transaction.amount;
                self.open_transactions.push(transaction);
            } else {
                warn!(
                    "Dropping open transaction of {} from {}: no longer covered",
                    transaction.amount, transaction.sender
                );
                dropped += 1;
            }
        }

        dropped
    }
}

/// Work captured under the lock before the nonce search starts
#[derive(Debug)]
struct MiningJob {
    identity: String,
    last_block: Block,
    last_hash: String,
    transactions: Vec<Transaction>,
}

/// A node's ledger: the chain, the open transaction pool and the peer set
///
/// All mutations go through this type and are serialized by one lock. Read
/// accessors return copies.
pub struct Blockchain {
    state: Mutex<LedgerState>,
    verification: Verification,
    mining_reward: f64,
    gateway: Arc<dyn PeerGateway>,
    store: Option<LedgerStore>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("verification", &self.verification)
            .field("mining_reward", &self.mining_reward)
            .field("store", &self.store)
            .finish()
    }
}

impl Blockchain {
    /// Creates an in-memory blockchain holding only the genesis block
    pub fn new(config: LedgerConfig, gateway: Arc<dyn PeerGateway>) -> Self {
        Self::build(config, gateway, None, None)
    }

    /// Creates a blockchain mirrored to `store`, resuming from its record if readable
    pub fn with_storage(config: LedgerConfig, gateway: Arc<dyn PeerGateway>, store: LedgerStore) -> Self {
        let snapshot = store.load_or_empty();
        match &snapshot {
            Some(snapshot) => info!(
                "Loaded ledger from {} ({} blocks, {} open transactions, {} peers)",
                store.path().display(),
                snapshot.chain.len(),
                snapshot.open_transactions.len(),
                snapshot.peer_nodes.len()
            ),
            None => info!(
                "No usable ledger at {}, starting from genesis",
                store.path().display()
            ),
        }

        Self::build(config, gateway, Some(store), snapshot)
    }

    fn build(
        config: LedgerConfig,
        gateway: Arc<dyn PeerGateway>,
        store: Option<LedgerStore>,
        snapshot: Option<LedgerSnapshot>,
    ) -> Self {
        Blockchain {
            state: Mutex::new(LedgerState::from_snapshot(snapshot)),
            verification: Verification::new(config.difficulty),
            mining_reward: config.mining_reward,
            gateway,
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirrors the state to disk; failures are logged and never undo the mutation
    fn persist(&self, state: &LedgerState) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(&state.snapshot()) {
                error!("Failed to save ledger to {}: {}", store.path().display(), err);
            }
        }
    }

    /// Gets the rule set this ledger validates with
    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    /// Gets the account identity of the hosting wallet
    pub fn identity(&self) -> Option<String> {
        self.lock().identity.clone()
    }

    /// Sets the account identity of the hosting wallet
    pub fn set_identity(&self, identity: Option<String>) {
        self.lock().identity = identity;
    }

    /// Gets a copy of the entire chain
    pub fn get_chain(&self) -> Vec<Block> {
        self.lock().chain.clone()
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> Block {
        let state = self.lock();
        match state.chain.last() {
            Some(block) => block.clone(),
            None => Block::genesis(),
        }
    }

    /// Gets a copy of the transactions awaiting inclusion in a block
    pub fn get_open_transactions(&self) -> Vec<Transaction> {
        self.lock().open_transactions.clone()
    }

    /// Gets the known peer nodes
    pub fn get_peer_nodes(&self) -> Vec<String> {
        self.lock().peers()
    }

    /// Whether a peer reported a conflict that [`Blockchain::resolve`] has not handled yet
    pub fn resolve_conflicts(&self) -> bool {
        self.lock().resolve_conflicts
    }

    /// Validates the local chain
    pub fn is_valid(&self) -> bool {
        let chain = self.get_chain();
        self.verification.verify_chain(&chain)
    }

    /// Checks that every open transaction is signed and that each sender's
    /// mined balance covers all of its pending debits
    pub fn verify_open_transactions(&self) -> bool {
        self.lock().open_transactions_valid()
    }

    /// Gets the balance of `account`, or of this node's identity when omitted
    ///
    /// Pending debits are subtracted, pending credits are not.
    ///
    /// # Returns
    ///
    /// `None` if no account is given and this node has no identity
    pub fn get_balance(&self, account: Option<&str>) -> Option<f64> {
        let state = self.lock();
        let account = match account {
            Some(account) => account.to_string(),
            None => state.identity.clone()?,
        };
        Some(state.balance_of(&account))
    }

    /// Adds a transaction to the open transactions
    ///
    /// # Arguments
    ///
    /// * `sender` - The public key of the sender
    /// * `recipient` - The public key of the recipient
    /// * `signature` - The sender's signature over the content
    /// * `amount` - The amount to transfer
    /// * `is_relayed` - Whether a peer relayed the transaction; relayed
    ///   transactions are not broadcast again
    ///
    /// # Returns
    ///
    /// The accepted transaction. The transaction stays in the pool even when
    /// a peer rejects the broadcast, which is reported as
    /// [`BlockchainError::PeerRejected`].
    pub async fn add_transaction(
        &self,
        sender: &str,
        recipient: &str,
        signature: &str,
        amount: f64,
        is_relayed: bool,
    ) -> Result<Transaction, BlockchainError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(BlockchainError::InvalidAmount(amount));
        }
        if sender == MINING_SENDER {
            return Err(BlockchainError::RewardNotAllowed);
        }

        let transaction = Transaction::new(sender, recipient, signature, amount);
        if !Wallet::verify_transaction(&transaction) {
            return Err(BlockchainError::InvalidSignature);
        }

        let peers = {
            let mut state = self.lock();
            if !Verification::verify_transaction(&transaction, &*state) {
                return Err(BlockchainError::InsufficientFunds {
                    required: amount,
                    available: state.balance_of(sender),
                });
            }

            state.open_transactions.push(transaction.clone());
            self.persist(&state);
            state.peers()
        };
        debug!("Accepted transaction of {} to {}", amount, recipient);

        if is_relayed {
            return Ok(transaction);
        }

        let responses = join_all(
            peers
                .iter()
                .map(|peer| self.gateway.broadcast_transaction(peer, &transaction)),
        )
        .await;

        let mut rejected = Vec::new();
        for (peer, response) in peers.into_iter().zip(responses) {
            match response {
                Ok(PeerResponse::Accepted) => {}
                Ok(response) => {
                    warn!("Peer {} refused transaction: {:?}", peer, response);
                    rejected.push(peer);
                }
                Err(err) => debug!("Skipping peer: {}", err),
            }
        }

        if rejected.is_empty() {
            Ok(transaction)
        } else {
            Err(BlockchainError::PeerRejected(rejected))
        }
    }

    /// Mines a new block with the open transactions and broadcasts it
    ///
    /// The nonce search runs on a blocking worker without holding the lock.
    /// Transactions arriving during the search stay in the pool for the next
    /// block. If the chain tip changes meanwhile, the block is discarded.
    ///
    /// # Returns
    ///
    /// The newly mined block
    pub async fn mine_block(&self) -> Result<Block, BlockchainError> {
        let job = self.prepare_mining()?;

        let verification = self.verification;
        let prefix = Verification::proof_prefix(&job.transactions, &job.last_hash)?;
        let proof = tokio::task::spawn_blocking(move || proof_of_work(&verification, &prefix))
            .await
            .map_err(|e| BlockchainError::MiningWorker(e.to_string()))?;

        let (block, peers) = self.commit_mined(job, proof)?;
        info!(
            "Mined block {} with {} transactions (proof {})",
            block.index,
            block.transactions.len(),
            proof
        );

        let responses = join_all(
            peers
                .iter()
                .map(|peer| self.gateway.broadcast_block(peer, &block)),
        )
        .await;

        for (peer, response) in peers.iter().zip(responses) {
            match response {
                Ok(PeerResponse::Accepted) => {}
                Ok(PeerResponse::Conflict) => {
                    warn!("Peer {} reported a conflict for block {}", peer, block.index);
                    self.lock().resolve_conflicts = true;
                }
                Ok(PeerResponse::Rejected) => {
                    warn!("Peer {} rejected block {}", peer, block.index)
                }
                Err(err) => debug!("Skipping peer: {}", err),
            }
        }

        Ok(block)
    }

    fn prepare_mining(&self) -> Result<MiningJob, BlockchainError> {
        let state = self.lock();
        let identity = state.identity.clone().ok_or(BlockchainError::NoIdentity)?;
        let last_block = state.last_block()?.clone();
        let transactions = state.open_transactions.clone();
        drop(state);

        if transactions
            .iter()
            .any(|transaction| !Wallet::verify_transaction(transaction))
        {
            return Err(BlockchainError::InvalidPendingSignature);
        }

        let last_hash = last_block.hash()?;
        Ok(MiningJob {
            identity,
            last_block,
            last_hash,
            transactions,
        })
    }

    fn commit_mined(&self, job: MiningJob, proof: u64) -> Result<(Block, Vec<String>), BlockchainError> {
        let mut transactions = job.transactions;
        let mined = transactions.len();
        transactions.push(Transaction::new_reward(job.identity, self.mining_reward));
        let block = Block::new(job.last_block.index + 1, job.last_hash, transactions, proof);

        let mut state = self.lock();
        if state.last_block()? != &job.last_block
            || state.open_transactions.len() < mined
            || state.open_transactions[..mined] != block.transactions[..mined]
        {
            return Err(BlockchainError::StaleMiningAttempt);
        }

        state.open_transactions.drain(..mined);
        state.chain.push(block.clone());
        self.persist(&state);

        Ok((block, state.peers()))
    }

    /// Appends a block mined by a peer
    ///
    /// The block must extend the local tip and carry a valid proof over its
    /// transactions minus the reward. Open transactions included in the block
    /// are removed from the pool, as are those the new block leaves unfunded.
    pub fn add_block(&self, block: Block) -> Result<(), BlockchainError> {
        let mut state = self.lock();
        let tip = state.last_block()?;

        if block.index != tip.index + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "index {} does not follow tip {}",
                block.index, tip.index
            )));
        }
        if block.previous_hash != tip.hash()? {
            return Err(BlockchainError::InvalidBlock(
                "previous hash does not match tip".to_string(),
            ));
        }
        if !self
            .verification
            .valid_proof(block.proof_transactions(), &block.previous_hash, block.proof)
        {
            return Err(BlockchainError::InvalidBlock("invalid proof of work".to_string()));
        }

        state
            .open_transactions
            .retain(|pending| !block.transactions.contains(pending));
        info!("Added block {} from peer", block.index);
        state.chain.push(block);
        let dropped = state.prune_unaffordable();
        if dropped > 0 {
            info!("Dropped {} open transactions left unfunded by the new block", dropped);
        }
        self.persist(&state);

        Ok(())
    }

    /// Handles a block broadcast by a peer
    pub fn receive_block(&self, block: Block) -> BlockReception {
        let tip_index = self.last_block().index;

        if block.index == tip_index + 1 {
            match self.add_block(block) {
                Ok(()) => BlockReception::Added,
                Err(err) => {
                    warn!("Rejected block from peer: {}", err);
                    BlockReception::Invalid(err)
                }
            }
        } else if block.index > tip_index + 1 {
            info!(
                "Peer block {} is ahead of local tip {}, flagging conflict",
                block.index, tip_index
            );
            self.lock().resolve_conflicts = true;
            BlockReception::AheadOfLocal
        } else {
            BlockReception::Stale
        }
    }

    /// Replaces the local chain with the longest valid chain among peers
    ///
    /// Peers are consulted in order and the first strictly longest valid
    /// chain wins. On replacement the open transactions are dropped, not
    /// replayed against the new chain. Unreachable peers are skipped.
    ///
    /// # Returns
    ///
    /// true if the local chain was replaced
    pub async fn resolve(&self) -> bool {
        let (peers, local_length) = {
            let state = self.lock();
            (state.peers(), state.chain.len())
        };

        let chains = join_all(peers.iter().map(|peer| self.gateway.fetch_chain(peer))).await;

        let mut winner: Option<Vec<Block>> = None;
        let mut max_length = local_length;
        for (peer, chain) in peers.iter().zip(chains) {
            match chain {
                Ok(chain) if chain.len() > max_length => {
                    if self.verification.verify_chain(&chain) {
                        max_length = chain.len();
                        winner = Some(chain);
                    } else {
                        warn!("Ignoring invalid chain of length {} from {}", chain.len(), peer);
                    }
                }
                Ok(_) => {}
                Err(PeerError::Unreachable { .. }) => debug!("Skipping unreachable peer {}", peer),
                Err(err) => warn!("Skipping peer {}: {}", peer, err),
            }
        }

        let mut state = self.lock();
        let replaced = match winner {
            Some(chain) if chain.len() > state.chain.len() => {
                info!(
                    "Replacing local chain of length {} with peer chain of length {}",
                    state.chain.len(),
                    chain.len()
                );
                state.chain = chain;
                state.open_transactions.clear();
                true
            }
            _ => false,
        };
        state.resolve_conflicts = false;
        self.persist(&state);

        replaced
    }

    /// Adds a peer node; returns false if it was already known
    pub fn add_peer_node(&self, node: &str) -> bool {
        let mut state = self.lock();
        let added = state.peer_nodes.insert(node.to_string());
        self.persist(&state);
        added
    }

    /// Removes a peer node; returns false if it was not known
    pub fn remove_peer_node(&self, node: &str) -> bool {
        let mut state = self.lock();
        let removed = state.peer_nodes.remove(node);
        self.persist(&state);
        removed
    }
}

/// Searches for a proof by incrementing from zero until the difficulty is met
///
/// Unbounded: at difficulty `d` this takes 16^d attempts on average.
fn proof_of_work(verification: &Verification, prefix: &str) -> u64 {
    let mut proof = 0;
    while !verification.valid_proof_with_prefix(prefix, proof) {
        proof += 1;
    }
    proof
}
