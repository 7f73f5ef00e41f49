use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use actix_web::{web, HttpResponse, Responder};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::peer::BlockEnvelope;
use crate::blockchain::{Block, BlockReception, Blockchain, BlockchainError, Transaction, Wallet};

/// Everything the HTTP handlers share: the ledger and the hosting wallet
pub struct NodeState {
    pub blockchain: Blockchain,
    pub wallet: RwLock<Option<Wallet>>,
    pub wallet_path: PathBuf,
    pub key_bits: usize,
}

impl NodeState {
    pub fn new(blockchain: Blockchain, wallet: Option<Wallet>, wallet_path: PathBuf, key_bits: usize) -> Self {
        blockchain.set_identity(wallet.as_ref().map(|w| w.public_key().to_string()));
        NodeState {
            blockchain,
            wallet: RwLock::new(wallet),
            wallet_path,
            key_bits,
        }
    }

    fn current_wallet(&self) -> Option<Wallet> {
        self.wallet
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install_wallet(&self, wallet: Wallet) {
        self.blockchain
            .set_identity(Some(wallet.public_key().to_string()));
        *self.wallet.write().unwrap_or_else(PoisonError::into_inner) = Some(wallet);
    }
}

/// Data structure for the node state
pub type NodeData = web::Data<NodeState>;

fn error_response(status: actix_web::http::StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "message": message.into() }))
}

/// Response for the wallet endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's public key, which is its account identity
    pub public_key: String,

    /// The wallet's private key (hex encoded PKCS#8)
    pub private_key: String,

    /// The wallet's current balance
    pub funds: Option<f64>,
}

/// Response for the balance endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    /// The account the balance belongs to
    pub account: String,

    /// The spendable balance of the account
    pub funds: f64,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The recipient's public key
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,
}

/// Response for the transaction endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The accepted transaction
    pub transaction: Transaction,

    /// The sender's balance after the transaction
    pub funds: Option<f64>,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,

    /// The miner's balance after mining
    pub funds: Option<f64>,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    /// Whether every block links to its predecessor with a valid proof
    pub chain: bool,

    /// Whether every open transaction is signed and affordable
    pub open_transactions: bool,
}

/// Request for the add node endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct NodeRequest {
    /// Address of the peer, e.g. `localhost:5001`
    pub node: String,
}

/// Response for the node endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct NodesResponse {
    /// All known peer nodes
    pub all_nodes: Vec<String>,
}

/// Create a new wallet
///
/// Generates a keypair, saves it to this node's key file and makes it the node identity
#[utoipa::path(
    post,
    path = "/wallet",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse),
        (status = 500, description = "Saving the keys failed")
    )
)]
pub async fn create_wallet(node: NodeData) -> impl Responder {
    let key_bits = node.key_bits;
    let created = web::block(move || Wallet::with_key_bits(key_bits))
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| result.map_err(|e| e.to_string()));
    let wallet = match created {
        Ok(wallet) => wallet,
        Err(err) => {
            return error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create wallet: {}", err),
            )
        }
    };

    if let Err(err) = wallet.save_keys(&node.wallet_path) {
        error!("Failed to save wallet to {}: {}", node.wallet_path.display(), err);
        return error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Saving the keys failed",
        );
    }

    info!("Created wallet {}", wallet.public_key());
    let response = WalletResponse {
        public_key: wallet.public_key().to_string(),
        private_key: wallet.private_key().to_string(),
        funds: None,
    };
    node.install_wallet(wallet);

    HttpResponse::Created().json(WalletResponse {
        funds: node.blockchain.get_balance(None),
        ..response
    })
}

/// Load the wallet
///
/// Loads the keypair from this node's key file and makes it the node identity
#[utoipa::path(
    get,
    path = "/wallet",
    responses(
        (status = 200, description = "Wallet loaded successfully", body = WalletResponse),
        (status = 500, description = "Loading the keys failed")
    )
)]
pub async fn load_wallet(node: NodeData) -> impl Responder {
    match Wallet::load_keys(&node.wallet_path) {
        Ok(wallet) => {
            let response = WalletResponse {
                public_key: wallet.public_key().to_string(),
                private_key: wallet.private_key().to_string(),
                funds: None,
            };
            node.install_wallet(wallet);

            HttpResponse::Ok().json(WalletResponse {
                funds: node.blockchain.get_balance(None),
                ..response
            })
        }
        Err(err) => {
            warn!("Failed to load wallet from {}: {}", node.wallet_path.display(), err);
            error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Loading the keys failed",
            )
        }
    }
}

/// Get this node's balance
#[utoipa::path(
    get,
    path = "/balance",
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 500, description = "No wallet set up")
    )
)]
pub async fn get_balance(node: NodeData) -> impl Responder {
    match (node.blockchain.identity(), node.blockchain.get_balance(None)) {
        (Some(account), Some(funds)) => HttpResponse::Ok().json(BalanceResponse { account, funds }),
        _ => error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Loading balance failed, no wallet set up",
        ),
    }
}

/// Get the balance of any account
#[utoipa::path(
    get,
    path = "/balance/{account}",
    params(
        ("account" = String, Path, description = "Public key of the account")
    ),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse)
    )
)]
pub async fn get_account_balance(node: NodeData, account: web::Path<String>) -> impl Responder {
    let account = account.into_inner();
    let funds = node.blockchain.get_balance(Some(&account)).unwrap_or_default();

    HttpResponse::Ok().json(BalanceResponse { account, funds })
}

/// Receive a transaction relayed by a peer
#[utoipa::path(
    post,
    path = "/broadcast-transaction",
    request_body = Transaction,
    responses(
        (status = 201, description = "Transaction added"),
        (status = 400, description = "Transaction failed verification"),
        (status = 500, description = "Creating a transaction failed")
    )
)]
pub async fn broadcast_transaction(node: NodeData, transaction: web::Json<Transaction>) -> impl Responder {
    let transaction = transaction.into_inner();
    let result = node
        .blockchain
        .add_transaction(
            &transaction.sender,
            &transaction.recipient,
            &transaction.signature,
            transaction.amount,
            true,
        )
        .await;

    match result {
        Ok(transaction) => HttpResponse::Created().json(serde_json::json!({
            "message": "Successfully added transaction",
            "transaction": transaction
        })),
        Err(err) => transaction_error(err),
    }
}

/// Receive a block relayed by a peer
#[utoipa::path(
    post,
    path = "/broadcast-block",
    request_body = BlockEnvelope,
    responses(
        (status = 201, description = "Block added"),
        (status = 200, description = "Peer chain is ahead, conflict flagged"),
        (status = 409, description = "Block invalid or behind the local chain")
    )
)]
pub async fn broadcast_block(node: NodeData, envelope: web::Json<BlockEnvelope>) -> impl Responder {
    match node.blockchain.receive_block(envelope.into_inner().block) {
        BlockReception::Added => HttpResponse::Created().json(serde_json::json!({
            "message": "Block added"
        })),
        BlockReception::Invalid(err) => error_response(
            actix_web::http::StatusCode::CONFLICT,
            format!("Block seems invalid: {}", err),
        ),
        BlockReception::AheadOfLocal => HttpResponse::Ok().json(serde_json::json!({
            "message": "Blockchain seems to differ from local blockchain"
        })),
        BlockReception::Stale => error_response(
            actix_web::http::StatusCode::CONFLICT,
            "Blockchain seems to be shorter, block not added",
        ),
    }
}

/// Create a new transaction
///
/// Signs a transfer from this node's wallet and adds it to the open transactions
#[utoipa::path(
    post,
    path = "/transaction",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = TransactionResponse),
        (status = 400, description = "No wallet set up or invalid transaction"),
        (status = 500, description = "Creating a transaction failed")
    )
)]
pub async fn new_transaction(node: NodeData, request: web::Json<TransactionRequest>) -> impl Responder {
    let wallet = match node.current_wallet() {
        Some(wallet) => wallet,
        None => {
            return error_response(actix_web::http::StatusCode::BAD_REQUEST, "No wallet set up")
        }
    };

    let signature = match wallet.sign_transaction(wallet.public_key(), &request.recipient, request.amount) {
        Ok(signature) => signature,
        Err(err) => {
            return error_response(
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to sign transaction: {}", err),
            )
        }
    };

    let result = node
        .blockchain
        .add_transaction(
            wallet.public_key(),
            &request.recipient,
            &signature,
            request.amount,
            false,
        )
        .await;

    match result {
        Ok(transaction) => HttpResponse::Created().json(TransactionResponse {
            message: "Successfully added transaction".to_string(),
            transaction,
            funds: node.blockchain.get_balance(None),
        }),
        Err(err) => transaction_error(err),
    }
}

fn transaction_error(err: BlockchainError) -> HttpResponse {
    if err.is_validation_failure() {
        error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            format!("Transaction rejected: {}", err),
        )
    } else {
        error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("Creating a transaction failed: {}", err),
        )
    }
}

/// Mine a new block
///
/// Creates a new block with all open transactions and a reward for this node
#[utoipa::path(
    post,
    path = "/mine",
    responses(
        (status = 201, description = "Block mined successfully", body = MineResponse),
        (status = 400, description = "No wallet set up or invalid open transactions"),
        (status = 409, description = "Conflicts must be resolved first, or the chain changed while mining"),
        (status = 500, description = "Mining failed")
    )
)]
pub async fn mine_block(node: NodeData) -> impl Responder {
    if node.blockchain.resolve_conflicts() {
        return error_response(
            actix_web::http::StatusCode::CONFLICT,
            "Resolve conflicts first, block not added",
        );
    }

    match node.blockchain.mine_block().await {
        Ok(block) => HttpResponse::Created().json(MineResponse {
            message: "Block added successfully".to_string(),
            block,
            funds: node.blockchain.get_balance(None),
        }),
        Err(err) => mine_error(err),
    }
}

fn mine_error(err: BlockchainError) -> HttpResponse {
    match err {
        BlockchainError::NoIdentity => {
            error_response(actix_web::http::StatusCode::BAD_REQUEST, err.to_string())
        }
        BlockchainError::StaleMiningAttempt => {
            error_response(actix_web::http::StatusCode::CONFLICT, err.to_string())
        }
        err if err.is_validation_failure() => {
            error_response(actix_web::http::StatusCode::BAD_REQUEST, err.to_string())
        }
        err => error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("Adding a block failed: {}", err),
        ),
    }
}

/// Resolve conflicts with peers
///
/// Replaces the local chain with the longest valid peer chain
#[utoipa::path(
    post,
    path = "/resolve-conflicts",
    responses(
        (status = 200, description = "Resolution finished")
    )
)]
pub async fn resolve_conflicts(node: NodeData) -> impl Responder {
    let message = if node.blockchain.resolve().await {
        "Chain was replaced!"
    } else {
        "Local chain kept!"
    };

    HttpResponse::Ok().json(serde_json::json!({ "message": message }))
}

/// Get all open transactions
#[utoipa::path(
    get,
    path = "/transactions",
    responses(
        (status = 200, description = "Open transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_open_transactions(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.blockchain.get_open_transactions())
}

/// Get the full blockchain
///
/// Returns the plain block array, the format peers fetch during resolution
#[utoipa::path(
    get,
    path = "/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = Vec<Block>)
    )
)]
pub async fn get_chain(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.blockchain.get_chain())
}

/// Check if the blockchain and the open transactions are valid
#[utoipa::path(
    get,
    path = "/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(ValidationResponse {
        chain: node.blockchain.is_valid(),
        open_transactions: node.blockchain.verify_open_transactions(),
    })
}

/// Add a peer node
#[utoipa::path(
    post,
    path = "/node",
    request_body = NodeRequest,
    responses(
        (status = 201, description = "Node added", body = NodesResponse),
        (status = 400, description = "No node data found")
    )
)]
pub async fn add_node(node: NodeData, request: web::Json<NodeRequest>) -> impl Responder {
    let peer = request.node.trim();
    if peer.is_empty() {
        return error_response(actix_web::http::StatusCode::BAD_REQUEST, "No node data found");
    }

    node.blockchain.add_peer_node(peer);
    HttpResponse::Created().json(NodesResponse {
        all_nodes: node.blockchain.get_peer_nodes(),
    })
}

/// Remove a peer node
#[utoipa::path(
    delete,
    path = "/node/{node_url}",
    params(
        ("node_url" = String, Path, description = "Address of the peer to remove")
    ),
    responses(
        (status = 200, description = "Node removed", body = NodesResponse),
        (status = 400, description = "No node found")
    )
)]
pub async fn remove_node(node: NodeData, node_url: web::Path<String>) -> impl Responder {
    let peer = node_url.into_inner();
    if peer.trim().is_empty() {
        return error_response(actix_web::http::StatusCode::BAD_REQUEST, "No node found");
    }

    node.blockchain.remove_peer_node(peer.trim());
    HttpResponse::Ok().json(NodesResponse {
        all_nodes: node.blockchain.get_peer_nodes(),
    })
}

/// Get all peer nodes
#[utoipa::path(
    get,
    path = "/nodes",
    responses(
        (status = 200, description = "Peer nodes retrieved successfully", body = NodesResponse)
    )
)]
pub async fn get_nodes(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(NodesResponse {
        all_nodes: node.blockchain.get_peer_nodes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::crypto::test_support::wallet;
    use crate::blockchain::{HttpPeerGateway, LedgerConfig};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn node_state(wallet: Option<Wallet>, dir: &tempfile::TempDir) -> NodeData {
        let blockchain = Blockchain::new(LedgerConfig::default(), Arc::new(HttpPeerGateway::new()));
        web::Data::new(NodeState::new(
            blockchain,
            wallet,
            dir.path().join("wallet.txt"),
            1024,
        ))
    }

    #[actix_web::test]
    async fn test_mine_and_fetch_chain() {
        let dir = tempfile::tempdir().unwrap();
        let state = node_state(Some(wallet(0).clone()), &dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;

        let response = test::call_service(&app, test::TestRequest::post().uri("/mine").to_request()).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let chain: Vec<Block> =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/chain").to_request()).await;
        assert_eq!(chain.len(), 2);

        let balance: BalanceResponse =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/balance").to_request()).await;
        assert_eq!(balance.funds, 10.0);

        let validation: ValidationResponse =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/validate").to_request()).await;
        assert!(validation.chain);
        assert!(validation.open_transactions);
    }

    #[actix_web::test]
    async fn test_mine_without_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let state = node_state(None, &dir);
        let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let response = test::call_service(&app, test::TestRequest::post().uri("/mine").to_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = test::call_service(&app, test::TestRequest::get().uri("/balance").to_request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn test_transaction_flow() {
        let dir = tempfile::tempdir().unwrap();
        let state = node_state(Some(wallet(0).clone()), &dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;

        let overdraft = test::TestRequest::post()
            .uri("/transaction")
            .set_json(TransactionRequest {
                recipient: wallet(1).public_key().to_string(),
                amount: 5.0,
            })
            .to_request();
        assert_eq!(test::call_service(&app, overdraft).await.status(), StatusCode::BAD_REQUEST);

        test::call_service(&app, test::TestRequest::post().uri("/mine").to_request()).await;

        let request = test::TestRequest::post()
            .uri("/transaction")
            .set_json(TransactionRequest {
                recipient: wallet(1).public_key().to_string(),
                amount: 5.0,
            })
            .to_request();
        let response: TransactionResponse = test::call_and_read_body_json(&app, request).await;
        assert_eq!(response.funds, Some(5.0));

        let open: Vec<Transaction> =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/transactions").to_request())
                .await;
        assert_eq!(open.len(), 1);
    }

    #[actix_web::test]
    async fn test_broadcast_block_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Blockchain::new(LedgerConfig::default(), Arc::new(HttpPeerGateway::new()));
        miner.set_identity(Some(wallet(0).public_key().to_string()));
        let first = miner.mine_block().await.unwrap();
        let second = miner.mine_block().await.unwrap();

        let state = node_state(None, &dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;

        let post = |block: Block| {
            test::TestRequest::post()
                .uri("/broadcast-block")
                .set_json(BlockEnvelope { block })
                .to_request()
        };

        assert_eq!(test::call_service(&app, post(first.clone())).await.status(), StatusCode::CREATED);
        assert_eq!(test::call_service(&app, post(first)).await.status(), StatusCode::CONFLICT);

        let mut skipped = second.clone();
        skipped.index = 5;
        assert_eq!(test::call_service(&app, post(skipped)).await.status(), StatusCode::OK);
        assert!(state.blockchain.resolve_conflicts());

        // Mining is refused until conflicts are resolved
        let response = test::call_service(&app, test::TestRequest::post().uri("/mine").to_request()).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[::core::prelude::v1::test]
    fn test_mine_error_statuses() {
        assert_eq!(mine_error(BlockchainError::NoIdentity).status(), StatusCode::BAD_REQUEST);
        assert_eq!(mine_error(BlockchainError::StaleMiningAttempt).status(), StatusCode::CONFLICT);
        assert_eq!(
            mine_error(BlockchainError::InvalidPendingSignature).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            mine_error(BlockchainError::MiningWorker("cancelled".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let state = node_state(None, &dir);
        let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let request = test::TestRequest::post()
            .uri("/node")
            .set_json(NodeRequest {
                node: "localhost:5001".to_string(),
            })
            .to_request();
        let nodes: NodesResponse = test::call_and_read_body_json(&app, request).await;
        assert_eq!(nodes.all_nodes, vec!["localhost:5001".to_string()]);

        let request = test::TestRequest::post()
            .uri("/node")
            .set_json(NodeRequest { node: " ".to_string() })
            .to_request();
        assert_eq!(test::call_service(&app, request).await.status(), StatusCode::BAD_REQUEST);

        let request = test::TestRequest::delete().uri("/node/localhost:5001").to_request();
        let nodes: NodesResponse = test::call_and_read_body_json(&app, request).await;
        assert!(nodes.all_nodes.is_empty());
    }

    #[actix_web::test]
    async fn test_wallet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        wallet(2).save_keys(dir.path().join("wallet.txt")).unwrap();
        let state = node_state(None, &dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;

        let loaded: WalletResponse =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/wallet").to_request()).await;
        assert_eq!(loaded.public_key, wallet(2).public_key());
        assert_eq!(loaded.funds, Some(0.0));
        assert_eq!(state.blockchain.identity().as_deref(), Some(wallet(2).public_key()));
    }
}
