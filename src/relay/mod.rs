use crate::error::Result;
use crate::protocol::peer_id::PeerId;
use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;

/// What the presence/messaging service reports.
#[derive(Clone, Debug)]
pub enum RelayEvent {
    Message { from: PeerId, body: Bytes },
    Online(PeerId),
    Offline(PeerId),
}

/// Sending side of a presence/messaging service.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    async fn send(&self, to: &PeerId, body: Bytes) -> Result<()>;
}
