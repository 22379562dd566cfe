use crate::auth::{AuthHandshake, Authentication};
use crate::channel::secure::SecureLayer;
use crate::channel::stream::StreamChannel;
use crate::channel::{BoxChannel, ChannelInfo};
use crate::config::TcpConfig;
use crate::error::{Error, Result};
use crate::extend::addr::advertised_or_local;
use crate::multiplex::Component;
use crate::protocol::command::{Command, ConnectDetailsReply, RequestConnectDetails};
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::provider::{lasting, require, secure_mode, ChannelProvider, ProviderContext};
use crate::registry::Incoming;
use crate::scheduler::{AsyncOpScheduler, Pending};
use crate::OwnedJoinHandle;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

const COMPONENT: &str = "tcp-connect-details";

struct TcpInner {
    host_id: RwLock<Option<PeerId>>,
    ctx: RwLock<Option<ProviderContext>>,
    config: TcpConfig,
    secure: Arc<dyn SecureLayer>,
    auth: Option<Arc<Authentication>>,
    details: AsyncOpScheduler<Pending<ConnectDetailsReply>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<OwnedJoinHandle>>,
}

/// Direct TCP channels. Peers learn each other's listening addresses over
/// an existing channel, then connect straight to them.
#[derive(Clone)]
pub struct TcpProvider {
    inner: Arc<TcpInner>,
}

impl TcpProvider {
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: TcpConfig,
        secure: Arc<dyn SecureLayer>,
        auth: Option<Arc<Authentication>>,
    ) -> Self {
        let inner = TcpInner {
            host_id: RwLock::new(None),
            ctx: RwLock::new(None),
            config,
            secure,
            auth,
            details: AsyncOpScheduler::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Binds the listener and starts accepting channels.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.inner.local_addr.lock().is_some() {
            return Err(Error::WrongState);
        }
        let listener = TcpListener::bind(self.inner.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("tcp provider listening on {local_addr}");
        let handle = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner)));
        self.inner.local_addr.lock().replace(local_addr);
        self.inner
            .accept_task
            .lock()
            .replace(OwnedJoinHandle::new(handle));
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }
}

async fn accept_loop(listener: TcpListener, inner: Weak<TcpInner>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(rs) => rs,
            Err(e) => {
                log::warn!("tcp accept {e:?}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = inner.on_accepted(stream, addr).await {
                log::debug!("inbound tcp channel from {addr} failed {e:?}");
            }
        });
    }
}

fn stream_info(stream: &TcpStream, remote: SocketAddr) -> ChannelInfo {
    ChannelInfo {
        stack: vec!["tcp"],
        local_addr: stream.local_addr().ok().map(|a| a.to_string()),
        remote_addr: Some(remote.to_string()),
        ..Default::default()
    }
}

impl TcpInner {
    async fn on_accepted(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (Some(me), Some(ctx)) = (self.host_id.read().clone(), self.ctx.read().clone()) else {
            log::debug!("ignoring tcp connection from {addr}, no host id");
            return Ok(());
        };
        stream.set_nodelay(true)?;
        let deadline = Instant::now() + self.config.timeout;
        let info = stream_info(&stream, addr);
        let channel: BoxChannel = Box::new(StreamChannel::new(stream, info));
        let channel = self
            .secure
            .server_handshake(channel, secure_mode(&self.auth), lasting(deadline, 1.0))
            .await?;
        let result = AuthHandshake::new(&*channel, me)
            .with_authentication(self.auth.clone())
            .passive(None, lasting(deadline, 1.0))
            .await;
        match result {
            Ok(peer) => {
                log::info!("tcp channel from {peer} at {addr}");
                ctx.channel_created(peer, channel);
                Ok(())
            }
            Err(e) => {
                channel.close();
                Err(e)
            }
        }
    }

    async fn connect_one(
        &self,
        addr: SocketAddr,
        peer: &PeerId,
        me: PeerId,
        timeout: Duration,
    ) -> Result<BoxChannel> {
        let deadline = Instant::now() + timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        let info = stream_info(&stream, addr);
        let channel: BoxChannel = Box::new(StreamChannel::new(stream, info));
        let channel = self
            .secure
            .client_handshake(channel, secure_mode(&self.auth), lasting(deadline, 1.0))
            .await?;
        let result = AuthHandshake::new(&*channel, me)
            .with_authentication(self.auth.clone())
            .connect(peer, lasting(deadline, 1.0))
            .await;
        if let Err(e) = result {
            channel.close();
            return Err(e);
        }
        Ok(channel)
    }

    fn details_reply(&self, id: u64) -> ConnectDetailsReply {
        let port = self.local_addr.lock().map(|a| a.port());
        match port {
            Some(port) => ConnectDetailsReply {
                id,
                port,
                addresses: advertised_or_local(&self.config.advertised),
                error: None,
            },
            None => ConnectDetailsReply {
                id,
                port: 0,
                addresses: Vec::new(),
                error: Some(Error::NotInitialized.name().to_string()),
            },
        }
    }
}

impl Component for TcpInner {
    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![RequestConnectDetails::NAME, ConnectDetailsReply::NAME]
    }

    fn handle(&self, incoming: &Incoming) -> Result<()> {
        if incoming.cmd == RequestConnectDetails::NAME {
            let request: RequestConnectDetails = serde_json::from_value(incoming.fields.clone())?;
            let ctx = require(&self.ctx)?;
            let reply = self.details_reply(request.id);
            ctx.messenger
                .send_to(&incoming.from, &Datagram::from_cmd(&reply)?)
        } else {
            let reply: ConnectDetailsReply = serde_json::from_value(incoming.fields.clone())?;
            match self.details.take_ready(reply.id) {
                Some(op) => op.complete(Ok(reply)),
                None => log::debug!("late connect details from {}", incoming.from),
            }
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelProvider for TcpProvider {
    fn name(&self) -> &'static str {
        "tcp"
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
        let me = require(&self.inner.host_id)?;
        let ctx = require(&self.inner.ctx)?;
        let deadline = Instant::now() + timeout;

        let details = &self.inner.details;
        let (op, result) = Pending::new("connect details");
        let id = details.gen_id();
        details.add_with_id(id, op, Instant::now() + lasting(deadline, 0.5), Some(peer.clone()));
        let request = Datagram::from_cmd(&RequestConnectDetails { id })?;
        if let Err(e) = ctx.messenger.send_to(peer, &request) {
            details.take_ready(id);
            return Err(e);
        }
        let reply = result.wait().await?;
        if let Some(e) = reply.error {
            log::debug!("{peer} has no tcp details: {e}");
            return Err(Error::from_name(&e));
        }

        let mut auth_failed = false;
        for ip in reply.addresses {
            let addr = SocketAddr::new(ip, reply.port);
            match self
                .inner
                .connect_one(addr, peer, me.clone(), lasting(deadline, 0.66))
                .await
            {
                Ok(channel) => {
                    log::info!("tcp channel to {peer} at {addr}");
                    return Ok(channel);
                }
                Err(e) => {
                    log::debug!("tcp connect to {peer} at {addr} failed {e:?}");
                    if matches!(e, Error::AuthError | Error::BadProtocol(_)) {
                        auth_failed = true;
                    }
                }
            }
        }
        Err(if auth_failed {
            Error::AuthError
        } else {
            Error::CouldNotConnectHost
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::secure::PlainLayer;
    use crate::channel::secure::SecureMode;
    use crate::provider::testing::{context, Loopback, RecordingLayer};
    use crate::provider::ProviderEvent;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config() -> TcpConfig {
        TcpConfig::default()
            .set_bind_addr("127.0.0.1:0".parse().unwrap())
            .set_advertised(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
            .set_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn connects_over_loopback() {
        let alice = TcpProvider::new(loopback_config(), Arc::new(PlainLayer), None);
        let bob = TcpProvider::new(loopback_config(), Arc::new(PlainLayer), None);
        alice.set_host_id("alice".into());
        bob.set_host_id("bob".into());
        bob.start().await.unwrap();

        let to_bob = Loopback::new("alice");
        let to_alice = Loopback::new("bob");
        to_bob.connect(bob.component().unwrap());
        to_alice.connect(alice.component().unwrap());
        let (alice_ctx, _alice_events) = context(11, to_bob);
        let (bob_ctx, mut bob_events) = context(11, to_alice);
        alice.attach(alice_ctx);
        bob.attach(bob_ctx);

        let channel = alice
            .create_channel(&"bob".into(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(channel.info().stack, vec!["tcp"]);
        match bob_events.recv().await {
            Some(ProviderEvent::ChannelCreated { peer, level, .. }) => {
                assert_eq!(peer.as_str(), "alice");
                assert_eq!(level, 11);
            }
            _ => panic!("expected inbound channel"),
        }
    }

    #[tokio::test]
    async fn anonymous_handshake_without_authentication() {
        let alice_layer = Arc::new(RecordingLayer::default());
        let bob_layer = Arc::new(RecordingLayer::default());
        let alice = TcpProvider::new(loopback_config(), alice_layer.clone(), None);
        let bob = TcpProvider::new(loopback_config(), bob_layer.clone(), None);
        alice.set_host_id("alice".into());
        bob.set_host_id("bob".into());
        bob.start().await.unwrap();
        let to_bob = Loopback::new("alice");
        let to_alice = Loopback::new("bob");
        to_bob.connect(bob.component().unwrap());
        to_alice.connect(alice.component().unwrap());
        alice.attach(context(11, to_bob).0);
        let (bob_ctx, mut bob_events) = context(11, to_alice);
        bob.attach(bob_ctx);

        alice
            .create_channel(&"bob".into(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(bob_events.recv().await.is_some());
        assert_eq!(*alice_layer.handshakes.lock(), vec![("client", SecureMode::Dh)]);
        assert_eq!(*bob_layer.handshakes.lock(), vec![("server", SecureMode::Dh)]);
    }

    #[test]
    fn certificates_select_x509() {
        assert_eq!(secure_mode(&None), SecureMode::Dh);
        let auth = Some(Arc::new(Authentication::new()));
        assert_eq!(secure_mode(&auth), SecureMode::X509);
    }

    #[tokio::test]
    async fn not_listening_reports_not_initialized() {
        let alice = TcpProvider::new(loopback_config(), Arc::new(PlainLayer), None);
        let bob = TcpProvider::new(loopback_config(), Arc::new(PlainLayer), None);
        alice.set_host_id("alice".into());
        bob.set_host_id("bob".into());
        let to_bob = Loopback::new("alice");
        let to_alice = Loopback::new("bob");
        to_bob.connect(bob.component().unwrap());
        to_alice.connect(alice.component().unwrap());
        alice.attach(context(11, to_bob).0);
        bob.attach(context(11, to_alice).0);

        let r = alice
            .create_channel(&"bob".into(), Duration::from_secs(1))
            .await;
        assert!(matches!(r, Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn unanswered_details_time_out() {
        let alice = TcpProvider::new(loopback_config(), Arc::new(PlainLayer), None);
        alice.set_host_id("alice".into());
        struct Void;
        impl Component for Void {
            fn name(&self) -> &'static str {
                "void"
            }
            fn commands(&self) -> Vec<&'static str> {
                vec![]
            }
            fn handle(&self, _incoming: &Incoming) -> Result<()> {
                Ok(())
            }
        }
        let to_nobody = Loopback::new("alice");
        to_nobody.connect(Arc::new(Void));
        alice.attach(context(11, to_nobody).0);
        let started = Instant::now();
        let r = alice
            .create_channel(&"bob".into(), Duration::from_millis(200))
            .await;
        assert!(matches!(r, Err(Error::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
