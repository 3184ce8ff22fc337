// Confidential Identities - key mapping between well-known and anonymous parties

pub mod config;
pub mod flows;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use config::NodeConfig;
pub use flows::{ConfidentialIdentity, FlowError, Node, SyncReport, SyncTarget};
pub use identity::{AbstractParty, AnonymousParty, NodeIdentity, Party, PublicKey};
pub use protocol::KeyRequest;
pub use registry::{KeyRegistry, SignedKeyMapping, TrustStore};
