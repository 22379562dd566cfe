use crate::channel::{BoxChannel, Channel, ChannelInfo, ChannelState};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::protocol::command::{CloseChannel, Command, Ping, Pong};
use crate::protocol::datagram::{Datagram, DatagramReader};
use crate::protocol::peer_id::PeerId;
use crate::protocol::{ChannelId, Level, OpId};
use crate::scheduler::{AsyncOp, AsyncOpScheduler};
use crate::OwnedJoinHandle;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

mod filter;

pub use filter::SmoothingFilter;

/// A high level datagram received from a peer.
#[derive(Clone, Debug)]
pub struct Incoming {
    pub from: PeerId,
    pub channel: ChannelId,
    pub cmd: String,
    pub fields: Value,
    pub content: Bytes,
}

#[derive(Debug)]
pub enum RegistryEvent {
    Datagram(Incoming),
    Pong { channel: ChannelId, id: OpId },
    ChannelChanged(PeerId),
}

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub id: ChannelId,
    pub level: Level,
    pub requested: bool,
    pub info: ChannelInfo,
    pub delay: Option<Duration>,
}

struct ChannelRecord {
    peer: PeerId,
    level: Level,
    requested: bool,
    channel: BoxChannel,
    closing: Option<OpId>,
    last_activity: Instant,
    rtt: SmoothingFilter,
    reader: DatagramReader,
    _pump: Option<OwnedJoinHandle>,
}

#[derive(Default)]
struct PeerRecord {
    best_level: Level,
    best_channel: Option<ChannelId>,
    channels: BTreeMap<Level, ChannelId>,
}

struct RegistryState {
    host_id: Option<PeerId>,
    next_id: u64,
    channels: HashMap<ChannelId, ChannelRecord>,
    peers: HashMap<PeerId, PeerRecord>,
}

struct RegistryShared {
    state: Mutex<RegistryState>,
    close_ops: AsyncOpScheduler<CloseOp>,
    events: flume::Sender<RegistryEvent>,
    close_timeout: Duration,
    idle_timeout: Duration,
}

/// Waits for the peer to acknowledge a `closeChannel`.
struct CloseOp {
    channel: ChannelId,
    registry: Weak<RegistryShared>,
}

impl AsyncOp for CloseOp {
    fn kind(&self) -> &'static str {
        "close channel"
    }
    fn cancel(self, reason: Error) {
        if let Some(shared) = self.registry.upgrade() {
            log::debug!("close of {} not acknowledged: {reason:?}", self.channel);
            ChannelRegistry { shared }.remove_channel(self.channel);
        }
    }
}

/// Owner of every established channel.
///
/// At most one non-closing channel exists per (peer, level); the best level
/// of a peer always equals the highest level among its non-closing channels.
#[derive(Clone)]
pub struct ChannelRegistry {
    shared: Arc<RegistryShared>,
}

impl ChannelRegistry {
    pub fn new(config: &ManagerConfig) -> (Self, flume::Receiver<RegistryEvent>) {
        let (events, receiver) = flume::unbounded();
        let shared = Arc::new(RegistryShared {
            state: Mutex::new(RegistryState {
                host_id: None,
                next_id: 1,
                channels: HashMap::new(),
                peers: HashMap::new(),
            }),
            close_ops: AsyncOpScheduler::new(),
            events,
            close_timeout: config.close_timeout,
            idle_timeout: config.channel_idle_timeout,
        });
        (Self { shared }, receiver)
    }

    pub fn set_host_id(&self, id: PeerId) {
        self.shared.state.lock().host_id.replace(id);
    }

    pub fn host_id(&self) -> Option<PeerId> {
        self.shared.state.lock().host_id.clone()
    }

    /// Takes ownership of `channel`. When the (peer, level) slot is taken
    /// the glare rule decides which channel survives; a rejected channel is
    /// closed at once and its id is still returned.
    pub fn add(&self, channel: BoxChannel, peer: PeerId, requested: bool, level: Level) -> ChannelId {
        let notify = channel.changed();
        let mut state = self.shared.state.lock();
        let id = ChannelId(state.next_id);
        state.next_id += 1;
        let existing = state
            .peers
            .get(&peer)
            .and_then(|p| p.channels.get(&level))
            .copied();
        state.channels.insert(
            id,
            ChannelRecord {
                peer: peer.clone(),
                level,
                requested,
                channel,
                closing: None,
                last_activity: Instant::now(),
                rtt: SmoothingFilter::default(),
                reader: DatagramReader::new(),
                _pump: None,
            },
        );
        let handle = tokio::spawn(pump(Arc::downgrade(&self.shared), id, notify));
        if let Some(record) = state.channels.get_mut(&id) {
            record._pump.replace(OwnedJoinHandle::new(handle));
        }

        if let Some(old) = existing {
            let old_had_error = state
                .channels
                .get(&old)
                .map(|r| r.channel.error().is_some())
                .unwrap_or(true);
            let me = state.host_id.as_ref().map(|h| h.as_str()).unwrap_or("");
            let target = peer.as_str();
            if !old_had_error && ((requested && me < target) || (!requested && me > target)) {
                log::info!("glare with {peer} on level {level}, keeping {old} and closing new {id}");
                if let Err(e) = self.close_locked(&mut state, id) {
                    log::warn!("close of rejected channel {id} {e:?}");
                }
                return id;
            }
            log::info!("replacing {old} to {peer} on level {level} by {id}");
            if let Err(e) = self.close_locked(&mut state, old) {
                log::warn!("close of replaced channel {old} {e:?}");
            }
        }

        let record = state.peers.entry(peer.clone()).or_default();
        record.channels.insert(level, id);
        if level > record.best_level {
            record.best_level = level;
            record.best_channel = Some(id);
        }
        log::debug!("added channel {id} to {peer} level={level} requested={requested}");
        self.emit(RegistryEvent::ChannelChanged(peer));
        id
    }

    /// Starts the close handshake. Closing a closing channel is rejected
    /// with `ExistsAlready` and sends nothing.
    pub fn close(&self, id: ChannelId) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.close_locked(&mut state, id)
    }

    pub fn close_all_to_host(&self, peer: &PeerId) {
        let mut state = self.shared.state.lock();
        let ids: Vec<ChannelId> = state
            .peers
            .get(peer)
            .map(|p| p.channels.values().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if let Err(e) = self.close_locked(&mut state, id) {
                log::debug!("close {id} to {peer} {e:?}");
            }
        }
    }

    /// Closes everything but the best channel to `peer`.
    pub fn close_redundant(&self, peer: &PeerId) {
        let mut state = self.shared.state.lock();
        let ids: Vec<ChannelId> = match state.peers.get(peer) {
            Some(p) => p
                .channels
                .values()
                .filter(|id| Some(**id) != p.best_channel)
                .copied()
                .collect(),
            None => return,
        };
        for id in ids {
            log::debug!("closing redundant channel {id} to {peer}");
            if let Err(e) = self.close_locked(&mut state, id) {
                log::debug!("close {id} to {peer} {e:?}");
            }
        }
    }

    /// Tells every peer and drops every channel without waiting for acks.
    pub fn force_clear(&self) {
        let (records, peers) = {
            let mut state = self.shared.state.lock();
            let records: Vec<ChannelRecord> = state.channels.drain().map(|(_, r)| r).collect();
            let peers: Vec<PeerId> = state.peers.drain().map(|(p, _)| p).collect();
            (records, peers)
        };
        for record in &records {
            if record.closing.is_none() {
                if let Err(e) = send_close(&*record.channel) {
                    log::debug!("close to {} on clear {e:?}", record.peer);
                }
            }
            record.channel.close();
        }
        drop(records);
        self.shared.close_ops.cancel_all(Error::Canceled);
        for peer in peers {
            self.emit(RegistryEvent::ChannelChanged(peer));
        }
    }

    pub fn find_channel(&self, peer: &PeerId, level: Level) -> Option<ChannelId> {
        let state = self.shared.state.lock();
        state.peers.get(peer)?.channels.get(&level).copied()
    }

    pub fn best_channel(&self, peer: &PeerId) -> Option<ChannelId> {
        let state = self.shared.state.lock();
        state.peers.get(peer)?.best_channel
    }

    pub fn best_level(&self, peer: &PeerId) -> Level {
        let state = self.shared.state.lock();
        state.peers.get(peer).map(|p| p.best_level).unwrap_or(0)
    }

    pub fn is_closing(&self, id: ChannelId) -> Option<bool> {
        let state = self.shared.state.lock();
        state.channels.get(&id).map(|r| r.closing.is_some())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.state.lock();
        state
            .peers
            .values()
            .flat_map(|p| p.channels.values())
            .filter_map(|id| connection_info(&state, *id))
            .collect()
    }

    pub fn connection_info(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        let state = self.shared.state.lock();
        match state.peers.get(peer) {
            Some(p) => p
                .channels
                .values()
                .filter_map(|id| connection_info(&state, *id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Open, non-relayed channels.
    pub fn direct_channels(&self) -> Vec<ChannelId> {
        let state = self.shared.state.lock();
        state
            .channels
            .iter()
            .filter(|(_, r)| r.closing.is_none() && r.channel.state() == ChannelState::Connected)
            .filter(|(_, r)| !r.channel.info().is_virtual)
            .map(|(id, _)| *id)
            .collect()
    }

    /// High level traffic refreshes the idle timestamp of the channel.
    pub fn send(&self, id: ChannelId, datagram: &Datagram, high_level: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        let record = state.channels.get_mut(&id).ok_or(Error::NotFound)?;
        if record.closing.is_some() {
            return Err(Error::Closed);
        }
        let encoded = datagram.encode()?;
        if high_level {
            record.last_activity = Instant::now();
        }
        record.channel.write(encoded)
    }

    pub fn send_to_best(&self, peer: &PeerId, datagram: &Datagram) -> Result<()> {
        let id = self.best_channel(peer).ok_or(Error::ConnectionError)?;
        self.send(id, datagram, true)
    }

    pub fn add_ping_measure(&self, id: ChannelId, rtt: Duration) -> Result<()> {
        let mut state = self.shared.state.lock();
        let record = state.channels.get_mut(&id).ok_or(Error::NotFound)?;
        if record.closing.is_some() {
            return Err(Error::Closed);
        }
        record.rtt.add(rtt.as_secs_f64());
        Ok(())
    }

    /// Closes channels without high level traffic for longer than the idle timeout.
    pub fn check_idle(&self) {
        let mut state = self.shared.state.lock();
        let timeout = self.shared.idle_timeout;
        let idle: Vec<ChannelId> = state
            .channels
            .iter()
            .filter(|(_, r)| r.closing.is_none() && r.last_activity.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            log::info!("closing idle channel {id}");
            if let Err(e) = self.close_locked(&mut state, id) {
                log::debug!("close idle {id} {e:?}");
            }
        }
    }

    pub(crate) fn remove_channel(&self, id: ChannelId) {
        let mut state = self.shared.state.lock();
        self.remove_locked(&mut state, id);
    }

    fn close_locked(&self, state: &mut RegistryState, id: ChannelId) -> Result<()> {
        let record = state.channels.get(&id).ok_or(Error::NotFound)?;
        if record.closing.is_some() {
            return Err(Error::ExistsAlready);
        }
        let (peer, level) = (record.peer.clone(), record.level);
        let sent = send_close(&*record.channel);
        self.remove_peer_connection(state, &peer, id, level);
        if let Err(e) = sent {
            log::debug!("could not send close on {id} {e:?}");
            self.remove_locked(state, id);
            return Ok(());
        }
        let op = self.shared.close_ops.gen_id();
        if let Some(record) = state.channels.get_mut(&id) {
            record.closing = Some(op);
        }
        self.shared.close_ops.add_with_id(
            op,
            CloseOp {
                channel: id,
                registry: Arc::downgrade(&self.shared),
            },
            Instant::now() + self.shared.close_timeout,
            None,
        );
        Ok(())
    }

    fn remove_locked(&self, state: &mut RegistryState, id: ChannelId) {
        let Some(record) = state.channels.remove(&id) else {
            return;
        };
        if let Some(op) = record.closing {
            self.shared.close_ops.take_ready(op);
        }
        self.remove_peer_connection(state, &record.peer, id, record.level);
        log::debug!("removed channel {id} to {}", record.peer);
        record.channel.close();
    }

    fn remove_peer_connection(
        &self,
        state: &mut RegistryState,
        peer: &PeerId,
        id: ChannelId,
        level: Level,
    ) {
        let Some(record) = state.peers.get_mut(peer) else {
            return;
        };
        if record.channels.get(&level) != Some(&id) {
            return;
        }
        record.channels.remove(&level);
        match record.channels.iter().next_back() {
            Some((level, id)) => {
                record.best_level = *level;
                record.best_channel = Some(*id);
            }
            None => {
                state.peers.remove(peer);
            }
        }
        self.emit(RegistryEvent::ChannelChanged(peer.clone()));
    }

    /// Drains and handles everything the channel has buffered. Returns false
    /// once the channel is gone.
    fn on_channel_change(&self, id: ChannelId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(record) = state.channels.get_mut(&id) else {
            return false;
        };
        let mut datagrams = Vec::new();
        let mut failure = None;
        loop {
            match record.reader.read(&*record.channel) {
                Ok(datagram) => datagrams.push(datagram),
                Err(Error::NotEnough) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let failure = failure.or_else(|| record.channel.error());
        for datagram in datagrams {
            if !state.channels.contains_key(&id) {
                break;
            }
            self.handle_datagram(&mut state, id, datagram);
        }
        if let Some(e) = failure {
            if state.channels.contains_key(&id) {
                log::info!("channel {id} failed {e:?}");
                self.remove_locked(&mut state, id);
            }
        }
        state.channels.contains_key(&id)
    }

    fn handle_datagram(&self, state: &mut RegistryState, id: ChannelId, datagram: Datagram) {
        let (cmd, fields) = match datagram.command() {
            Ok(command) => command,
            Err(e) => {
                log::warn!("malformed datagram on {id} {e:?}");
                self.remove_locked(state, id);
                return;
            }
        };
        let Some(record) = state.channels.get_mut(&id) else {
            return;
        };
        if cmd == CloseChannel::NAME {
            self.on_received_close(state, id);
        } else if cmd == Ping::NAME {
            match serde_json::from_value::<Ping>(fields) {
                Ok(ping) => {
                    let sent = Datagram::from_cmd(&Pong { id: ping.id })
                        .and_then(|d| d.encode())
                        .and_then(|buf| record.channel.write(buf));
                    if let Err(e) = sent {
                        log::debug!("pong on {id} {e:?}");
                    }
                }
                Err(e) => log::warn!("bad ping on {id} {e:?}"),
            }
        } else if cmd == Pong::NAME {
            match serde_json::from_value::<Pong>(fields) {
                Ok(pong) => self.emit(RegistryEvent::Pong {
                    channel: id,
                    id: pong.id,
                }),
                Err(e) => log::warn!("bad pong on {id} {e:?}"),
            }
        } else {
            record.last_activity = Instant::now();
            let incoming = Incoming {
                from: record.peer.clone(),
                channel: id,
                cmd,
                fields,
                content: datagram.content().clone(),
            };
            self.emit(RegistryEvent::Datagram(incoming));
        }
    }

    fn on_received_close(&self, state: &mut RegistryState, id: ChannelId) {
        let Some(record) = state.channels.get(&id) else {
            return;
        };
        if record.closing.is_none() {
            if let Err(e) = send_close(&*record.channel) {
                log::debug!("close reply on {id} {e:?}");
            }
        }
        self.remove_locked(state, id);
    }

    fn emit(&self, event: RegistryEvent) {
        if self.shared.events.send(event).is_err() {
            log::debug!("registry event dropped, no listener");
        }
    }
}

fn send_close(channel: &dyn Channel) -> Result<()> {
    let buf = Datagram::from_cmd(&CloseChannel {})?.encode()?;
    channel.write(buf)
}

fn connection_info(state: &RegistryState, id: ChannelId) -> Option<ConnectionInfo> {
    let record = state.channels.get(&id)?;
    let mut info = record.channel.info();
    let delay = record.rtt.avg().map(Duration::from_secs_f64);
    if delay.is_some() {
        info.delay = delay;
    }
    Some(ConnectionInfo {
        peer: record.peer.clone(),
        id,
        level: record.level,
        requested: record.requested,
        info,
        delay,
    })
}

async fn pump(shared: Weak<RegistryShared>, id: ChannelId, notify: Arc<Notify>) {
    loop {
        match shared.upgrade() {
            Some(shared) => {
                if !(ChannelRegistry { shared }).on_channel_change(id) {
                    return;
                }
            }
            None => return,
        }
        notify.notified().await;
    }
}

impl crate::provider::Messenger for ChannelRegistry {
    fn send_to(&self, peer: &PeerId, datagram: &Datagram) -> Result<()> {
        self.send_to_best(peer, datagram)
    }
    fn channel_level(&self, peer: &PeerId) -> Level {
        self.best_level(peer)
    }
}
