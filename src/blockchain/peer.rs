use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::block::Block;
use super::transaction::Transaction;

/// Errors that can occur when talking to a peer
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {peer} is unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Invalid response from peer {peer}: {reason}")]
    InvalidResponse { peer: String, reason: String },
}

/// How a peer answered a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerResponse {
    /// The peer accepted the payload
    Accepted,

    /// The peer refused the payload (failed its own verification)
    Rejected,

    /// The block does not extend the peer's tip
    Conflict,
}

impl PeerResponse {
    /// Maps an HTTP status from a peer to a response
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::CONFLICT {
            PeerResponse::Conflict
        } else if status.is_client_error() || status.is_server_error() {
            PeerResponse::Rejected
        } else {
            PeerResponse::Accepted
        }
    }
}

/// Body of a relayed block
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlockEnvelope {
    pub block: Block,
}

/// Network boundary the ledger uses to reach other nodes
///
/// Implementations report an unreachable peer as [`PeerError::Unreachable`];
/// the ledger skips such peers.
#[async_trait]
pub trait PeerGateway: Send + Sync {
    /// Relays a newly accepted transaction to a peer
    async fn broadcast_transaction(
        &self,
        peer: &str,
        transaction: &Transaction,
    ) -> Result<PeerResponse, PeerError>;

    /// Relays a newly mined block to a peer
    async fn broadcast_block(&self, peer: &str, block: &Block) -> Result<PeerResponse, PeerError>;

    /// Fetches a peer's full chain
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, PeerError>;
}

/// Peer gateway speaking the node's own HTTP API
#[derive(Debug, Clone, Default)]
pub struct HttpPeerGateway {
    client: Client,
}

impl HttpPeerGateway {
    pub fn new() -> Self {
        HttpPeerGateway {
            client: Client::new(),
        }
    }

    /// Builds the URL of `path` on `peer`, defaulting to plain HTTP
    pub fn url(peer: &str, path: &str) -> String {
        let base = peer.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}/{}", base, path)
        } else {
            format!("http://{}/{}", base, path)
        }
    }

    fn unreachable(peer: &str, err: reqwest::Error) -> PeerError {
        PeerError::Unreachable {
            peer: peer.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl PeerGateway for HttpPeerGateway {
    async fn broadcast_transaction(
        &self,
        peer: &str,
        transaction: &Transaction,
    ) -> Result<PeerResponse, PeerError> {
        let response = self
            .client
            .post(Self::url(peer, "broadcast-transaction"))
            .json(transaction)
            .send()
            .await
            .map_err(|e| Self::unreachable(peer, e))?;

        Ok(PeerResponse::from_status(response.status()))
    }

    async fn broadcast_block(&self, peer: &str, block: &Block) -> Result<PeerResponse, PeerError> {
        let envelope = BlockEnvelope {
            block: block.clone(),
        };
        let response = self
            .client
            .post(Self::url(peer, "broadcast-block"))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| Self::unreachable(peer, e))?;

        Ok(PeerResponse::from_status(response.status()))
    }

    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, PeerError> {
        let response = self
            .client
            .get(Self::url(peer, "chain"))
            .send()
            .await
            .map_err(|e| Self::unreachable(peer, e))?;

        if !response.status().is_success() {
            return Err(PeerError::InvalidResponse {
                peer: peer.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        response
            .json::<Vec<Block>>()
            .await
            .map_err(|e| PeerError::InvalidResponse {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        assert_eq!(
            HttpPeerGateway::url("localhost:5001", "chain"),
            "http://localhost:5001/chain"
        );
        assert_eq!(
            HttpPeerGateway::url("https://node.example/", "broadcast-block"),
            "https://node.example/broadcast-block"
        );
    }

    #[test]
    fn test_response_from_status() {
        assert_eq!(PeerResponse::from_status(StatusCode::CREATED), PeerResponse::Accepted);
        assert_eq!(PeerResponse::from_status(StatusCode::OK), PeerResponse::Accepted);
        assert_eq!(PeerResponse::from_status(StatusCode::CONFLICT), PeerResponse::Conflict);
        assert_eq!(PeerResponse::from_status(StatusCode::BAD_REQUEST), PeerResponse::Rejected);
        assert_eq!(
            PeerResponse::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            PeerResponse::Rejected
        );
    }

    #[tokio::test]
    async fn test_unusable_peer_address_is_unreachable() {
        // Rejected while building the request, before any connection attempt
        let gateway = HttpPeerGateway::new();
        let result = gateway.fetch_chain("not a host").await;

        assert!(matches!(result, Err(PeerError::Unreachable { .. })));
    }
}
