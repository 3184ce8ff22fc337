//! Session transport between nodes
//!
//! Defines the abstract channel the flows run over. A session is ordered,
//! reliable and authenticated: `peer()` is the name the transport vouches
//! for, not something the remote side claims. Only the in-process simulated
//! network is provided here.

pub mod simulated;

pub use simulated::{SimEndpoint, SimNetwork, SimSession};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("No endpoint named {0}")]
    UnknownPeer(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}

/// One open channel to a peer, carrying a single protocol run.
#[async_trait]
pub trait Session: Send + Sync {
    fn session_id(&self) -> Uuid;

    /// Authenticated name of the other side.
    fn peer(&self) -> &str;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Next message from the peer. Messages the peer sent before closing are
    /// still delivered; after that this returns `Disconnected`.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// A node's attachment point: opens sessions to peers by name and accepts
/// sessions opened by them.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_name(&self) -> &str;

    async fn open_session(&self, peer: &str) -> Result<Box<dyn Session>, TransportError>;

    async fn accept(&self) -> Result<Box<dyn Session>, TransportError>;
}
