use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// Peers call `/chain`, `/broadcast-transaction` and `/broadcast-block`
/// at the root, so the node API is not scoped.
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/chain", web::get().to(handlers::get_chain))
        .route("/mine", web::post().to(handlers::mine_block))
        .route("/resolve-conflicts", web::post().to(handlers::resolve_conflicts))
        .route("/transactions", web::get().to(handlers::get_open_transactions))
        .route("/transaction", web::post().to(handlers::new_transaction))
        .route("/broadcast-transaction", web::post().to(handlers::broadcast_transaction))
        .route("/broadcast-block", web::post().to(handlers::broadcast_block))
        .route("/wallet", web::post().to(handlers::create_wallet))
        .route("/wallet", web::get().to(handlers::load_wallet))
        .route("/balance", web::get().to(handlers::get_balance))
        .route("/balance/{account}", web::get().to(handlers::get_account_balance))
        .route("/node", web::post().to(handlers::add_node))
        .route("/node/{node_url}", web::delete().to(handlers::remove_node))
        .route("/nodes", web::get().to(handlers::get_nodes))
        .route("/validate", web::get().to(handlers::validate_chain));
}
