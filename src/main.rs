use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use api::NodeState;
use blockchain::{Blockchain, HttpPeerGateway, LedgerStore, Wallet};
use config::NodeConfig;

// Build the node state from the files in the data directory
fn initialize_node(config: &NodeConfig) -> anyhow::Result<NodeState> {
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;

    let blockchain = Blockchain::with_storage(
        config.ledger_config(),
        Arc::new(HttpPeerGateway::new()),
        LedgerStore::new(config.ledger_path()),
    );
    info!(
        "Ledger at {} has {} blocks",
        config.ledger_path().display(),
        blockchain.get_chain().len()
    );

    let wallet = match Wallet::load_keys(config.wallet_path()) {
        Ok(wallet) => {
            info!("Loaded wallet {}", wallet.public_key());
            Some(wallet)
        }
        Err(err) => {
            warn!(
                "No wallet loaded from {} ({}); create one with POST /wallet",
                config.wallet_path().display(),
                err
            );
            None
        }
    };

    Ok(NodeState::new(
        blockchain,
        wallet,
        config.wallet_path(),
        config.key_bits,
    ))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::mine_block,
        api::handlers::resolve_conflicts,
        api::handlers::get_open_transactions,
        api::handlers::new_transaction,
        api::handlers::broadcast_transaction,
        api::handlers::broadcast_block,
        api::handlers::create_wallet,
        api::handlers::load_wallet,
        api::handlers::get_balance,
        api::handlers::get_account_balance,
        api::handlers::add_node,
        api::handlers::remove_node,
        api::handlers::get_nodes,
        api::handlers::validate_chain
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::peer::BlockEnvelope,
            api::handlers::WalletResponse,
            api::handlers::BalanceResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineResponse,
            api::handlers::ValidationResponse,
            api::handlers::NodeRequest,
            api::handlers::NodesResponse
        )
    ),
    tags(
        (name = "ledger", description = "Proof-of-work ledger node endpoints")
    ),
    info(
        title = "PoW Ledger API",
        version = "0.1.0",
        description = "A minimal proof-of-work ledger node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::parse();
    let node = web::Data::new(initialize_node(&config)?);

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(node.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?
    .run()
    .await?;

    Ok(())
}
