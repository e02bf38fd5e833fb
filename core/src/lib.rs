// dmail core — anonymous store-and-forward email over a DHT
//
// Emails are split into fragments, encrypted to the recipient's identity and
// published into the DHT next to an index packet keyed by the recipient.
// Recipients poll their index, fetch and delete what is addressed to them.
// Senders can hide behind a chain of relay peers.

pub mod config;
pub mod crypto;
pub mod dht;
pub mod email;
pub mod engine;
pub mod identity;
pub mod network;
pub mod packet;
pub mod relay;
pub mod service;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use crypto::{Hash256, SchemeId};
pub use dht::{DhtStorage, MemoryDht};
pub use email::Email;
pub use engine::{EngineError, MailEngine};
pub use identity::{EmailDestination, EmailIdentity, IdentityStore};
pub use service::CheckOutcome;
pub use transport::{Destination, LocalNetwork, NetworkStatus, NodeKeys};

use std::time::{SystemTime, UNIX_EPOCH};

/// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

/// Seconds since the Unix epoch
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
