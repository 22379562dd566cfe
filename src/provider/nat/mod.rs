use crate::auth::{AuthHandshake, Authentication};
use crate::channel::secure::SecureLayer;
use crate::channel::stream::StreamChannel;
use crate::channel::{BoxChannel, ChannelInfo};
use crate::config::NatConfig;
use crate::error::{Error, Result};
use crate::extend::addr::advertised_or_local;
use crate::multiplex::Component;
use crate::protocol::command::{Command, RequestUdtConnect, RequestUdtConnectReply};
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::protocol::OpId;
use crate::provider::{lasting, require, secure_mode, ChannelProvider, ProviderContext};
use crate::registry::Incoming;
use crate::reliable::KcpStream;
use crate::scheduler::{AsyncOpScheduler, Pending};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;

pub mod echo;
mod punch;

use punch::{candidates, Punch};

const COMPONENT: &str = "udt-connect";

/// KCP conversation id shared by both ends of a punched path.
fn conversation(connector_op: OpId, responder_op: OpId) -> u32 {
    (((connector_op & 0xffff) << 16) | ((responder_op & 0xff) << 8) | 0x4b) as u32
}

/// Addresses this side announces for one attempt.
struct LocalCandidates {
    intern: Vec<SocketAddr>,
    extern_addr: Option<SocketAddr>,
    echo_result: Option<String>,
}

struct NatInner {
    this: Weak<NatInner>,
    host_id: RwLock<Option<PeerId>>,
    ctx: RwLock<Option<ProviderContext>>,
    config: NatConfig,
    secure: Arc<dyn SecureLayer>,
    auth: Option<Arc<Authentication>>,
    requests: AsyncOpScheduler<Pending<RequestUdtConnectReply>>,
}

/// Channels over UDP hole punching with KCP on top.
///
/// The connecting side sends `requestUDTConnect` over an existing channel,
/// both sides then punch towards each other's candidates until one
/// `punchUDPReply` or `ackUDP` confirms the path.
#[derive(Clone)]
pub struct NatProvider {
    inner: Arc<NatInner>,
}

impl NatProvider {
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: NatConfig,
        secure: Arc<dyn SecureLayer>,
        auth: Option<Arc<Authentication>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| NatInner {
            this: this.clone(),
            host_id: RwLock::new(None),
            ctx: RwLock::new(None),
            config,
            secure,
            auth,
            requests: AsyncOpScheduler::new(),
        });
        Self { inner }
    }
}

impl NatInner {
    async fn local_candidates(&self, socket: &UdpSocket, deadline: Instant) -> LocalCandidates {
        let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
        let intern = advertised_or_local(&self.config.advertised)
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        let echo = match &self.config.echo_server {
            Some(server) => match echo::resolve(server).await {
                Ok(server) => echo::query(socket, server, lasting(deadline, 0.3)).await,
                Err(e) => Err(e),
            },
            None => Err(Error::NotInitialized),
        };
        match echo {
            Ok(addr) => LocalCandidates {
                intern,
                extern_addr: Some(addr),
                echo_result: None,
            },
            Err(e) => {
                log::debug!("no external address {e:?}");
                LocalCandidates {
                    intern,
                    extern_addr: None,
                    echo_result: Some(e.name().to_string()),
                }
            }
        }
    }

    /// KCP plus secure layer over the punched path.
    async fn open_channel(
        &self,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        conv: u32,
        client: bool,
        deadline: Instant,
    ) -> Result<BoxChannel> {
        let (input_sender, input) = tokio::sync::mpsc::channel(128);
        tokio::spawn(recv_loop(socket.clone(), remote, input_sender));
        let info = ChannelInfo {
            stack: vec!["udp", "kcp"],
            local_addr: socket.local_addr().ok().map(|a| a.to_string()),
            remote_addr: Some(remote.to_string()),
            ..Default::default()
        };
        let stream = KcpStream::new(conv, socket, remote, input, self.config.link_timeout);
        let channel: BoxChannel = Box::new(StreamChannel::new(stream, info));
        let timeout = lasting(deadline, 1.0);
        if client {
            self.secure
                .client_handshake(channel, secure_mode(&self.auth), timeout)
                .await
        } else {
            self.secure
                .server_handshake(channel, secure_mode(&self.auth), timeout)
                .await
        }
    }

    async fn respond(self: Arc<Self>, from: PeerId, request: RequestUdtConnect) -> Result<()> {
        let me = require(&self.host_id)?;
        let ctx = require(&self.ctx)?;
        let deadline = Instant::now() + self.config.remote_timeout;
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        let local = self.local_candidates(&socket, deadline).await;
        let local_id = self.requests.gen_id();
        let reply = RequestUdtConnectReply {
            id: request.id,
            local_id,
            intern_addrs: local.intern,
            extern_addr: local.extern_addr,
            echo_result: local.echo_result,
        };
        ctx.messenger.send_to(&from, &Datagram::from_cmd(&reply)?)?;

        let punch = Punch {
            me: me.clone(),
            target: from.clone(),
            my_op: local_id,
            other_op: request.id,
            candidates: candidates(&request.intern_addrs, request.extern_addr),
            max_tries: self.config.max_punch_tries,
            interval: self.config.punch_retry_interval,
        };
        let remote = tokio::time::timeout_at(deadline, punch.run(&socket)).await??;
        let conv = conversation(request.id, local_id);
        let channel = self
            .open_channel(Arc::new(socket), remote, conv, false, deadline)
            .await?;
        let result = AuthHandshake::new(&*channel, me)
            .with_authentication(self.auth.clone())
            .passive(Some(&from), lasting(deadline, 1.0))
            .await;
        match result {
            Ok(peer) => {
                log::info!("udt channel from {peer} at {remote}");
                ctx.channel_created(peer, channel);
                Ok(())
            }
            Err(e) => {
                channel.close();
                Err(e)
            }
        }
    }
}

/// Feeds KCP with everything the peer sends that is not punch traffic.
async fn recv_loop(socket: Arc<UdpSocket>, remote: SocketAddr, input: Sender<BytesMut>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, from) = tokio::select! {
            _ = input.closed() => return,
            rs = socket.recv_from(&mut buf) => match rs {
                Ok(rs) => rs,
                Err(e) => {
                    log::debug!("udt recv {e:?}");
                    continue;
                }
            },
        };
        if from != remote || len == 0 || buf[0] == b'{' {
            continue;
        }
        if input.send(buf[..len].into()).await.is_err() {
            return;
        }
    }
}

impl Component for NatInner {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![RequestUdtConnect::NAME, RequestUdtConnectReply::NAME]
    }

    fn handle(&self, incoming: &Incoming) -> Result<()> {
        if incoming.cmd == RequestUdtConnect::NAME {
            let request: RequestUdtConnect = serde_json::from_value(incoming.fields.clone())?;
            let inner = self.this.upgrade().ok_or(Error::Closed)?;
            let from = incoming.from.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.respond(from.clone(), request).await {
                    log::info!("udt connect from {from} failed {e:?}");
                }
            });
        } else {
            let reply: RequestUdtConnectReply = serde_json::from_value(incoming.fields.clone())?;
            match self.requests.take_ready(reply.id) {
                Some(op) => op.complete(Ok(reply)),
                None => log::debug!("late udt reply from {}", incoming.from),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelProvider for NatProvider {
    fn name(&self) -> &'static str {
        "udt"
    }

    fn provides_initial_channels(&self) -> bool {
        false
    }

    fn component(&self) -> Option<Arc<dyn Component>> {
        Some(self.inner.clone())
    }

    fn set_host_id(&self, id: PeerId) {
        self.inner.host_id.write().replace(id);
    }

    fn attach(&self, ctx: ProviderContext) {
        self.inner.ctx.write().replace(ctx);
    }

    async fn create_channel(&self, peer: &PeerId, timeout: Duration) -> Result<BoxChannel> {
        let inner = &self.inner;
        let me = require(&inner.host_id)?;
        let ctx = require(&inner.ctx)?;
        let deadline = Instant::now() + timeout;
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        let local = inner.local_candidates(&socket, deadline).await;

        let (op, result) = Pending::new("udt connect");
        let id = inner.requests.gen_id();
        inner.requests.add_with_id(id, op, deadline, Some(peer.clone()));
        let request = RequestUdtConnect {
            id,
            intern_addrs: local.intern,
            extern_addr: local.extern_addr,
            echo_result: local.echo_result,
        };
        if let Err(e) = ctx.messenger.send_to(peer, &Datagram::from_cmd(&request)?) {
            inner.requests.take_ready(id);
            return Err(e);
        }
        let reply = result.wait().await?;
        if let Some(e) = &reply.echo_result {
            log::debug!("{peer} has no external address: {e}");
        }

        let punch = Punch {
            me: me.clone(),
            target: peer.clone(),
            my_op: id,
            other_op: reply.local_id,
            candidates: candidates(&reply.intern_addrs, reply.extern_addr),
            max_tries: inner.config.max_punch_tries,
            interval: inner.config.punch_retry_interval,
        };
        let remote = tokio::time::timeout_at(deadline, punch.run(&socket)).await??;
        let conv = conversation(id, reply.local_id);
        let channel = inner
            .open_channel(Arc::new(socket), remote, conv, true, deadline)
            .await?;
        let result = AuthHandshake::new(&*channel, me)
            .with_authentication(inner.auth.clone())
            .connect(peer, lasting(deadline, 1.0))
            .await;
        if let Err(e) = result {
            channel.close();
            return Err(e);
        }
        log::info!("udt channel to {peer} at {remote}");
        Ok(channel)
    }
}
