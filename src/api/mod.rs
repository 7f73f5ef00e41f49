// API module
//
// This module exposes the ledger node over HTTP

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use handlers::NodeState;
pub use routes::configure_routes;
