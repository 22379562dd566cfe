use crate::error::{Error, Result};
use crate::protocol::peer_id::PeerId;
use crate::relay::{RelayEvent, RelayTransport};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// In-process relay service, every member sees every other member online.
#[derive(Clone, Default)]
pub struct RelayHub {
    members: Arc<DashMap<PeerId, UnboundedSender<RelayEvent>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, id: PeerId) -> (MemoryTransport, UnboundedReceiver<RelayEvent>) {
        let (sender, receiver) = unbounded_channel();
        let others: Vec<(PeerId, UnboundedSender<RelayEvent>)> = self
            .members
            .iter()
            .map(|m| (m.key().clone(), m.value().clone()))
            .collect();
        for (other, other_sender) in others {
            _ = other_sender.send(RelayEvent::Online(id.clone()));
            _ = sender.send(RelayEvent::Online(other));
        }
        self.members.insert(id.clone(), sender);
        let transport = MemoryTransport {
            hub: self.clone(),
            me: id,
        };
        (transport, receiver)
    }

    pub fn leave(&self, id: &PeerId) {
        if self.members.remove(id).is_none() {
            return;
        }
        let others: Vec<UnboundedSender<RelayEvent>> =
            self.members.iter().map(|m| m.value().clone()).collect();
        for other in others {
            _ = other.send(RelayEvent::Offline(id.clone()));
        }
    }
}

pub struct MemoryTransport {
    hub: RelayHub,
    me: PeerId,
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn send(&self, to: &PeerId, body: Bytes) -> Result<()> {
        let member = self
            .hub
            .members
            .get(to)
            .map(|m| m.value().clone())
            .ok_or(Error::CouldNotConnectHost)?;
        member
            .send(RelayEvent::Message {
                from: self.me.clone(),
                body,
            })
            .map_err(|_| Error::ConnectionError)
    }
}
