use crate::auth::AuthHandshake;
use crate::channel::{BoxChannel, Channel, ChannelInfo, ChannelState, Inbox};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::command::{Command, CreateChannel};
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::provider::{require, ChannelProvider, ProviderContext};
use crate::relay::{RelayEvent, RelayTransport};
use crate::OwnedJoinHandle;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

struct RelayLink {
    peer: PeerId,
    inbox: Inbox,
    outgoing: UnboundedSender<(PeerId, Bytes)>,
}

/// Channel whose datagrams travel as relay messages.
pub struct RelayChannel {
    link: Arc<RelayLink>,
}

impl Channel for RelayChannel {
    fn error(&self) -> Option<Error> {
        self.link.inbox.error()
    }
    fn state(&self) -> ChannelState {
        self.link.inbox.state()
    }
    fn write(&self, data: Bytes) -> Result<()> {
        if let Some(e) = self.link.inbox.error() {
            return Err(e);
        }
        self.link
            .outgoing
            .send((self.link.peer.clone(), data))
            .map_err(|_| Error::ConnectionError)
    }
    fn read(&self, max: usize) -> Bytes {
        self.link.inbox.read(max)
    }
    fn close(&self) {
        self.link.inbox.fail(Error::Closed);
    }
    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            stack: vec!["relay"],
            is_virtual: true,
            remote_addr: Some(self.link.peer.to_string()),
            ..Default::default()
        }
    }
    fn changed(&self) -> Arc<Notify> {
        self.link.inbox.notify()
    }
}

struct RelayInner {
    host_id: RwLock<Option<PeerId>>,
    ctx: RwLock<Option<ProviderContext>>,
    links: DashMap<PeerId, Arc<RelayLink>>,
    outgoing: UnboundedSender<(PeerId, Bytes)>,
    config: RelayConfig,
    _tasks: Vec<OwnedJoinHandle>,
}

/// Channels over the presence/messaging service. Always the fallback.
#[derive(Clone)]
pub struct RelayProvider {
    inner: Arc<RelayInner>,
}

impl RelayProvider {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        events: UnboundedReceiver<RelayEvent>,
        config: RelayConfig,
    ) -> Self {
        let (outgoing, outgoing_receiver) = unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<RelayInner>| {
            let send = tokio::spawn(send_loop(transport, outgoing_receiver, weak.clone()));
            let recv = tokio::spawn(event_loop(events, weak.clone()));
            RelayInner {
                host_id: RwLock::new(None),
                ctx: RwLock::new(None),
                links: DashMap::new(),
                outgoing,
                config,
                _tasks: vec![OwnedJoinHandle::new(send), OwnedJoinHandle::new(recv)],
            }
        });
        Self { inner }
    }

    fn new_link(&self, peer: PeerId) -> Arc<RelayLink> {
        let link = Arc::new(RelayLink {
            peer: peer.clone(),
            inbox: Inbox::new(ChannelState::Connected),
            outgoing: self.inner.outgoing.clone(),
        });
        if let Some(old) = self.inner.links.insert(peer, link.clone()) {
            old.inbox.fail(Error::ConnectionReset);
        }
        link
    }
}

impl RelayInner {
    fn on_event(self: &Arc<Self>, event: RelayEvent) {
        match event {
            RelayEvent::Message { from, body } => self.on_message(from, body),
            RelayEvent::Online(peer) => log::debug!("{peer} online"),
            RelayEvent::Offline(peer) => {
                log::info!("{peer} went offline");
                if let Some((_, link)) = self.links.remove(&peer) {
                    link.inbox.fail(Error::ConnectionReset);
                }
                if let Some(ctx) = self.ctx.read().as_ref() {
                    ctx.peer_offline(peer);
                }
            }
        }
    }

    fn on_message(self: &Arc<Self>, from: PeerId, body: Bytes) {
        let is_create = Datagram::decode_from(&body)
            .and_then(|(d, _)| d.command())
            .map(|(name, _)| name == CreateChannel::NAME)
            .unwrap_or(false);
        if is_create {
            self.on_create_channel(from, body);
            return;
        }
        match self.links.get(&from) {
            Some(link) if link.inbox.error().is_none() => link.inbox.push(&body),
            _ => log::debug!("relay message from {from} without channel dropped"),
        }
    }

    fn on_create_channel(self: &Arc<Self>, from: PeerId, body: Bytes) {
        let (Some(me), Some(ctx)) = (self.host_id.read().clone(), self.ctx.read().clone()) else {
            log::debug!("relay channel request from {from} before init");
            return;
        };
        let provider = RelayProvider {
            inner: self.clone(),
        };
        let link = provider.new_link(from.clone());
        link.inbox.push(&body);
        let timeout = self.config.passive_timeout;
        tokio::spawn(async move {
            let channel = RelayChannel { link };
            let result = AuthHandshake::new(&channel, me)
                .passive(Some(&from), timeout)
                .await;
            match result {
                Ok(_) => ctx.channel_created(from, Box::new(channel)),
                Err(e) => {
                    log::warn!("passive relay handshake with {from} failed {e:?}");
                    channel.close();
                }
            }
        });
    }
}

async fn send_loop(
    transport: Arc<dyn RelayTransport>,
    mut receiver: UnboundedReceiver<(PeerId, Bytes)>,
    inner: Weak<RelayInner>,
) {
    while let Some((to, body)) = receiver.recv().await {
        if let Err(e) = transport.send(&to, body).await {
            log::warn!("relay send to {to} {e:?}");
            if let Some(inner) = inner.upgrade() {
                if let Some(link) = inner.links.get(&to) {
                    link.inbox.fail(e);
                }
            }
        }
    }
}

async fn event_loop(mut events: UnboundedReceiver<RelayEvent>, inner: Weak<RelayInner>) {
    while let Some(event) = events.recv().await {
        match inner.upgrade() {
            Some(inner) => inner.on_event(event),
            None => return,
        }
    }
    log::info!("relay event stream ended");
}

#[async_trait]
impl ChannelProvider for RelayProvider {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn provides_initial_channels(&self) -> bool {
        true
    }

    fn set_host_id(&self, id: PeerId) {
        self.inner.host_id.write().replace(id);
    }

    fn attach(&self, ctx: ProviderContext) {
        self.inner.ctx.write().replace(ctx);
    }

    async fn create_channel(&self, peer: &PeerId, timeout: Duration) -> Result<BoxChannel> {
        let me = require(&self.inner.host_id)?;
        let channel = RelayChannel {
            link: self.new_link(peer.clone()),
        };
        if let Err(e) = AuthHandshake::new(&channel, me).connect(peer, timeout).await {
            log::debug!("relay handshake with {peer} failed {e:?}");
            channel.close();
            return Err(e);
        }
        Ok(Box::new(channel))
    }
}
