use crate::error::Error;
use crate::manager::lift::LiftAttempt;
use crate::multiplex::CommandMultiplexer;
use crate::pinger::ChannelPinger;
use crate::provider::ProviderEvent;
use crate::registry::{ChannelRegistry, RegistryEvent};
use crate::scheduler::AsyncOpScheduler;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Single consumer of registry events, so components see datagrams in order.
pub async fn dispatch_loop(
    events: flume::Receiver<RegistryEvent>,
    multiplexer: Arc<CommandMultiplexer>,
    pinger: Arc<ChannelPinger>,
) {
    while let Ok(event) = events.recv_async().await {
        match event {
            RegistryEvent::Datagram(incoming) => {
                if let Err(e) = multiplexer.dispatch(&incoming) {
                    log::debug!("{} from {} not handled {e:?}", incoming.cmd, incoming.from);
                }
            }
            RegistryEvent::Pong { channel, id } => pinger.on_pong(channel, id),
            RegistryEvent::ChannelChanged(peer) => multiplexer.dist_channel_change(&peer),
        }
    }
}

pub async fn provider_event_loop(
    mut events: UnboundedReceiver<ProviderEvent>,
    registry: ChannelRegistry,
    lift_ops: AsyncOpScheduler<LiftAttempt>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProviderEvent::ChannelCreated {
                peer,
                channel,
                level,
            } => {
                let id = registry.add(channel, peer.clone(), false, level);
                log::info!("inbound channel {id} from {peer} on level {level}");
            }
            ProviderEvent::PeerOffline(peer) => {
                lift_ops.cancel_group(&peer, Error::Canceled);
                registry.close_all_to_host(&peer);
            }
        }
    }
}
