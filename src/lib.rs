//! Establishes and keeps the best available channel to every peer.
//!
//! A [`ConnectionManager`] owns the channels and a set of providers ranked by
//! level. [`ConnectionManager::lift`] first gets any channel to a peer from a
//! provider able to start from nothing (the relay) and then climbs to the
//! best level the other providers can reach, closing what became redundant.

pub mod auth;
pub mod channel;
pub mod config;
mod error;
pub mod extend;
mod manager;
pub mod multiplex;
pub mod pinger;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod reliable;
pub mod scheduler;

pub use config::{ManagerConfig, NatConfig, RelayConfig, TcpConfig};
pub use error::{Error, Result};
pub use manager::ConnectionManager;
pub use protocol::peer_id::PeerId;
pub use protocol::{ChannelId, Level};

use tokio::task::JoinHandle;

pub(crate) struct OwnedJoinHandle {
    handle: JoinHandle<()>,
}

impl OwnedJoinHandle {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
