use crate::auth::Authentication;
use crate::channel::secure::SecureMode;
use crate::channel::BoxChannel;
use crate::error::{Error, Result};
use crate::multiplex::Component;
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::protocol::Level;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

pub mod nat;
pub mod relay;
pub mod tcp;
#[cfg(test)]
pub(crate) mod testing;

/// Sends datagrams to a peer over its best channel.
pub trait Messenger: Send + Sync + 'static {
    fn send_to(&self, peer: &PeerId, datagram: &Datagram) -> Result<()>;
    fn channel_level(&self, peer: &PeerId) -> Level;
}

pub enum ProviderEvent {
    /// A channel built on request of the remote side.
    ChannelCreated {
        peer: PeerId,
        channel: BoxChannel,
        level: Level,
    },
    PeerOffline(PeerId),
}

/// Everything a provider gets from the manager it is registered with.
#[derive(Clone)]
pub struct ProviderContext {
    pub level: Level,
    pub messenger: Arc<dyn Messenger>,
    pub events: UnboundedSender<ProviderEvent>,
}

impl ProviderContext {
    pub fn channel_created(&self, peer: PeerId, channel: BoxChannel) {
        let event = ProviderEvent::ChannelCreated {
            peer,
            channel,
            level: self.level,
        };
        if self.events.send(event).is_err() {
            log::warn!("inbound channel dropped, manager is gone");
        }
    }

    pub fn peer_offline(&self, peer: PeerId) {
        _ = self.events.send(ProviderEvent::PeerOffline(peer));
    }
}

/// Builds channels of one kind.
#[async_trait]
pub trait ChannelProvider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether channels can be built without any existing channel to the peer.
    fn provides_initial_channels(&self) -> bool;

    /// Component handling the provider's coordination commands.
    fn component(&self) -> Option<Arc<dyn Component>> {
        None
    }

    fn set_host_id(&self, id: PeerId);

    fn attach(&self, ctx: ProviderContext);

    async fn create_channel(&self, peer: &PeerId, timeout: Duration) -> Result<BoxChannel>;
}

/// Fraction of the time left until `deadline`.
pub(crate) fn lasting(deadline: Instant, fraction: f64) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .mul_f64(fraction)
}

/// Certificates when the node authenticates peers, anonymous key agreement
/// otherwise.
pub(crate) fn secure_mode(auth: &Option<Arc<Authentication>>) -> SecureMode {
    match auth {
        Some(_) => SecureMode::X509,
        None => SecureMode::Dh,
    }
}

pub(crate) fn require<T: Clone>(value: &parking_lot::RwLock<Option<T>>) -> Result<T> {
    value.read().clone().ok_or(Error::NotInitialized)
}
