use crate::channel::secure::{SecureLayer, SecureMode};
use crate::channel::BoxChannel;
use crate::error::{Error, Result};
use crate::multiplex::Component;
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::protocol::{ChannelId, Level};
use crate::provider::{Messenger, ProviderContext, ProviderEvent};
use crate::registry::Incoming;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Hands datagrams straight to the other side's component.
pub(crate) struct Loopback {
    me: PeerId,
    other: Mutex<Option<Arc<dyn Component>>>,
}

impl Loopback {
    pub(crate) fn new(me: &str) -> Arc<Self> {
        Arc::new(Self {
            me: me.into(),
            other: Mutex::new(None),
        })
    }

    pub(crate) fn connect(&self, component: Arc<dyn Component>) {
        self.other.lock().replace(component);
    }
}

impl Messenger for Loopback {
    fn send_to(&self, _peer: &PeerId, datagram: &Datagram) -> Result<()> {
        let target = self.other.lock().clone().ok_or(Error::ConnectionError)?;
        let (cmd, fields) = datagram.command()?;
        target.handle(&Incoming {
            from: self.me.clone(),
            channel: ChannelId(0),
            cmd,
            fields,
            content: datagram.content().clone(),
        })
    }

    fn channel_level(&self, _peer: &PeerId) -> Level {
        1
    }
}

pub(crate) fn context(
    level: Level,
    messenger: Arc<dyn Messenger>,
) -> (ProviderContext, UnboundedReceiver<ProviderEvent>) {
    let (events, receiver) = unbounded_channel();
    let ctx = ProviderContext {
        level,
        messenger,
        events,
    };
    (ctx, receiver)
}

/// Passes channels through and remembers every handshake it was asked for.
#[derive(Default)]
pub(crate) struct RecordingLayer {
    pub(crate) handshakes: Mutex<Vec<(&'static str, SecureMode)>>,
}

#[async_trait]
impl SecureLayer for RecordingLayer {
    async fn client_handshake(
        &self,
        channel: BoxChannel,
        mode: SecureMode,
        _timeout: Duration,
    ) -> Result<BoxChannel> {
        self.handshakes.lock().push(("client", mode));
        Ok(channel)
    }

    async fn server_handshake(
        &self,
        channel: BoxChannel,
        mode: SecureMode,
        _timeout: Duration,
    ) -> Result<BoxChannel> {
        self.handshakes.lock().push(("server", mode));
        Ok(channel)
    }
}
