use crate::error::Error;
use crate::protocol::command::Ping;
use crate::protocol::datagram::Datagram;
use crate::protocol::{ChannelId, OpId};
use crate::registry::ChannelRegistry;
use crate::scheduler::{AsyncOp, AsyncOpScheduler};
use std::time::Duration;
use tokio::time::Instant;

struct OpenPing {
    channel: ChannelId,
    sent: Instant,
}

impl AsyncOp for OpenPing {
    fn kind(&self) -> &'static str {
        "ping"
    }
    fn cancel(self, reason: Error) {
        log::debug!("ping on {} dropped: {reason:?}", self.channel);
    }
}

/// Round trip measurement on direct channels.
pub struct ChannelPinger {
    registry: ChannelRegistry,
    open: AsyncOpScheduler<OpenPing>,
    timeout: Duration,
}

impl ChannelPinger {
    pub fn new(registry: ChannelRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            open: AsyncOpScheduler::new(),
            timeout,
        }
    }

    /// Pings every open non-relayed channel, returns the number of pings sent.
    pub fn ping_all(&self) -> usize {
        let mut sent = 0;
        for channel in self.registry.direct_channels() {
            let id = self.open.gen_id();
            let now = Instant::now();
            self.open.add_with_id(
                id,
                OpenPing { channel, sent: now },
                now + self.timeout,
                None,
            );
            let result = Datagram::from_cmd(&Ping { id })
                .and_then(|d| self.registry.send(channel, &d, false));
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    log::debug!("ping on {channel} {e:?}");
                    self.open.take_ready(id);
                }
            }
        }
        sent
    }

    /// A pong on another channel than its ping leaves the ping open.
    pub fn on_pong(&self, channel: ChannelId, id: OpId) {
        match self.open.with_op(id, |ping| ping.channel) {
            Some(expected) if expected == channel => {
                let Some(ping) = self.open.take_ready(id) else {
                    return;
                };
                let rtt = ping.sent.elapsed();
                log::debug!("rtt on {channel} {rtt:?}");
                if let Err(e) = self.registry.add_ping_measure(channel, rtt) {
                    log::debug!("ping measure on {channel} {e:?}");
                }
            }
            Some(expected) => {
                log::warn!("pong {id} on {channel}, expected on {expected}");
            }
            None => log::debug!("late pong {id} on {channel}"),
        }
    }

    pub fn open_pings(&self) -> usize {
        self.open.len()
    }
}
