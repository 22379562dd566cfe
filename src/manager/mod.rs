use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::multiplex::{CommandMultiplexer, Component};
use crate::pinger::ChannelPinger;
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::protocol::Level;
use crate::provider::{ChannelProvider, ProviderContext, ProviderEvent};
use crate::registry::{ChannelRegistry, ConnectionInfo};
use crate::scheduler::AsyncOpScheduler;
use async_shutdown::ShutdownManager;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

mod lift;
mod maintain;

use lift::LiftAttempt;

/// Entry point: owns the registry, the providers and the background loops.
///
/// Dropping the manager stops every loop and drops all channels.
pub struct ConnectionManager {
    config: ManagerConfig,
    registry: ChannelRegistry,
    multiplexer: Arc<CommandMultiplexer>,
    providers: RwLock<BTreeMap<Level, Arc<dyn ChannelProvider>>>,
    lift_ops: AsyncOpScheduler<LiftAttempt>,
    provider_events: UnboundedSender<ProviderEvent>,
    ping_enabled: Arc<AtomicBool>,
    shutdown_manager: ShutdownManager<()>,
}

impl ConnectionManager {
    /// Must be called inside a tokio runtime.
    pub fn new(config: ManagerConfig) -> Self {
        let (registry, registry_events) = ChannelRegistry::new(&config);
        let multiplexer = Arc::new(CommandMultiplexer::new());
        let pinger = Arc::new(ChannelPinger::new(registry.clone(), config.ping_timeout));
        let lift_ops = AsyncOpScheduler::new();
        let (provider_events, provider_receiver) = tokio::sync::mpsc::unbounded_channel();
        let ping_enabled = Arc::new(AtomicBool::new(config.enable_ping));

        let mut join_set = maintain::start_task(
            &config,
            &registry,
            registry_events,
            provider_receiver,
            multiplexer.clone(),
            pinger,
            lift_ops.clone(),
            ping_enabled.clone(),
        );
        let shutdown_manager = ShutdownManager::<()>::new();
        let fut = shutdown_manager
            .wrap_cancel(async move { while join_set.join_next().await.is_some() {} });
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: built-in maintain tasks are shutdown");
            }
        });
        Self {
            config,
            registry,
            multiplexer,
            providers: RwLock::new(BTreeMap::new()),
            lift_ops,
            provider_events,
            ping_enabled,
            shutdown_manager,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Registers `provider` at `level`; higher levels are preferred.
    pub fn add_provider(&self, provider: Arc<dyn ChannelProvider>, level: Level) -> Result<()> {
        if level == 0 {
            return Err(Error::InvalidArgument("level 0 means no channel".into()));
        }
        let mut providers = self.providers.write();
        if providers.contains_key(&level) {
            return Err(Error::ExistsAlready);
        }
        if let Some(component) = provider.component() {
            self.multiplexer.add_component(component)?;
        }
        provider.attach(ProviderContext {
            level,
            messenger: Arc::new(self.registry.clone()),
            events: self.provider_events.clone(),
        });
        if let Some(id) = self.registry.host_id() {
            provider.set_host_id(id);
        }
        log::info!("provider {} on level {level}", provider.name());
        providers.insert(level, provider);
        Ok(())
    }

    pub fn set_host_id(&self, id: PeerId) {
        self.registry.set_host_id(id.clone());
        for provider in self.providers.read().values() {
            provider.set_host_id(id.clone());
        }
    }

    pub fn host_id(&self) -> Option<PeerId> {
        self.registry.host_id()
    }

    pub fn close_channel(&self, peer: &PeerId, level: Level) -> Result<()> {
        let id = self
            .registry
            .find_channel(peer, level)
            .ok_or(Error::NotFound)?;
        self.registry.close(id)
    }

    /// Level of the best channel to `peer`, 0 without any.
    pub fn channel_level(&self, peer: &PeerId) -> Level {
        self.registry.best_level(peer)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.connections()
    }

    pub fn connection_info(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.registry.connection_info(peer)
    }

    /// Sends over the best channel to `peer`.
    pub fn send(&self, peer: &PeerId, datagram: &Datagram) -> Result<()> {
        self.registry.send_to_best(peer, datagram)
    }

    pub fn send_many(&self, peers: &[PeerId], datagram: &Datagram) -> Result<()> {
        let errors = peers
            .iter()
            .filter_map(|peer| self.send(peer, datagram).err())
            .collect();
        Error::collect(errors)
    }

    pub fn add_component(&self, component: Arc<dyn Component>) -> Result<()> {
        self.multiplexer.add_component(component)
    }

    pub fn remove_component(&self, name: &str) -> Result<()> {
        self.multiplexer.remove_component(name)
    }

    /// Cancels every lift and drops every channel.
    pub fn clear(&self) {
        self.lift_ops.cancel_all(Error::Canceled);
        self.registry.force_clear();
    }

    /// Cancels the lifts of `peer` and closes its channels.
    pub fn clear_peer(&self, peer: &PeerId) {
        self.lift_ops.cancel_group(peer, Error::Canceled);
        self.registry.close_all_to_host(peer);
    }

    pub fn start_ping(&self) {
        self.ping_enabled.store(true, Ordering::Relaxed);
    }

    pub fn stop_ping(&self) {
        self.ping_enabled.store(false, Ordering::Relaxed);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::pair;
    use crate::channel::BoxChannel;
    use crate::registry::Incoming;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Provider handing out one end of a local pair, the other end is
    /// registered at the remote manager as inbound.
    struct PairProvider {
        name: &'static str,
        initial: bool,
        me: RwLock<Option<PeerId>>,
        remote: Option<Arc<ConnectionManager>>,
        level: Level,
        fail: bool,
        delay: Duration,
    }

    impl PairProvider {
        fn new(name: &'static str, level: Level, initial: bool) -> Self {
            Self {
                name,
                initial,
                me: RwLock::new(None),
                remote: None,
                level,
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ChannelProvider for PairProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        fn provides_initial_channels(&self) -> bool {
            self.initial
        }
        fn set_host_id(&self, id: PeerId) {
            self.me.write().replace(id);
        }
        fn attach(&self, _ctx: ProviderContext) {}
        async fn create_channel(&self, _peer: &PeerId, _timeout: Duration) -> Result<BoxChannel> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::CouldNotConnectHost);
            }
            let (near, far) = pair();
            if let (Some(remote), Some(me)) = (&self.remote, self.me.read().clone()) {
                remote.registry().add(Box::new(far), me, false, self.level);
            }
            Ok(Box::new(near))
        }
    }

    fn manager(me: &str) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(ManagerConfig::default());
        manager.set_host_id(me.into());
        Arc::new(manager)
    }

    #[tokio::test]
    async fn duplicate_level_is_rejected() {
        let m = manager("alice");
        m.add_provider(Arc::new(PairProvider::new("a", 1, true)), 1)
            .unwrap();
        let r = m.add_provider(Arc::new(PairProvider::new("b", 1, true)), 1);
        assert!(matches!(r, Err(Error::ExistsAlready)));
    }

    #[tokio::test]
    async fn no_initial_provider_fails() {
        let m = manager("alice");
        m.add_provider(Arc::new(PairProvider::new("direct", 11, false)), 11)
            .unwrap();
        let r = m.lift(&"bob".into(), Duration::from_secs(1)).await;
        assert!(matches!(r, Err(Error::CouldNotConnectHost)));
    }

    #[tokio::test]
    async fn lifts_to_best_and_closes_the_rest() {
        let bob = manager("bob");
        let alice = manager("alice");
        let mut relay = PairProvider::new("relay", 1, true);
        relay.remote = Some(bob.clone());
        let mut broken = PairProvider::new("broken", 11, false);
        broken.fail = true;
        let mut direct = PairProvider::new("direct", 10, false);
        direct.remote = Some(bob.clone());
        alice.add_provider(Arc::new(relay), 1).unwrap();
        alice.add_provider(Arc::new(broken), 11).unwrap();
        alice.add_provider(Arc::new(direct), 10).unwrap();

        let peer = PeerId::from("bob");
        let level = alice.lift(&peer, Duration::from_secs(2)).await.unwrap();
        assert_eq!(level, 10);
        assert_eq!(alice.channel_level(&peer), 10);
        let left = alice.registry().connection_info(&peer);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].level, 10);

        let again = alice.lift(&peer, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again, 10);
    }

    #[tokio::test]
    async fn min_level_not_reached() {
        let alice = manager("alice");
        alice
            .add_provider(Arc::new(PairProvider::new("relay", 1, true)), 1)
            .unwrap();
        let r = alice
            .lift_to_at_least(&"bob".into(), 5, Duration::from_secs(1))
            .await;
        assert!(matches!(r, Err(Error::CouldNotConnectHost)));
        assert_eq!(alice.channel_level(&"bob".into()), 1);
    }

    #[tokio::test]
    async fn clearing_the_peer_ends_a_running_lift() {
        let bob = manager("bob");
        let alice = manager("alice");
        let mut relay = PairProvider::new("relay", 1, true);
        relay.remote = Some(bob.clone());
        let mut slow = PairProvider::new("slow", 11, false);
        slow.remote = Some(bob.clone());
        slow.delay = Duration::from_secs(2);
        let mut direct = PairProvider::new("direct", 10, false);
        direct.remote = Some(bob.clone());
        alice.add_provider(Arc::new(relay), 1).unwrap();
        alice.add_provider(Arc::new(slow), 11).unwrap();
        alice.add_provider(Arc::new(direct), 10).unwrap();

        let peer = PeerId::from("bob");
        let lifting = {
            let alice = alice.clone();
            let peer = peer.clone();
            tokio::spawn(async move { alice.lift(&peer, Duration::from_secs(5)).await })
        };
        for _ in 0..50 {
            if alice.channel_level(&peer) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(alice.channel_level(&peer), 1);
        alice.clear_peer(&peer);

        let r = lifting.await.unwrap();
        assert!(matches!(r, Err(Error::Canceled)));
        assert_eq!(alice.channel_level(&peer), 0);
    }

    struct Echo {
        seen: parking_lot::Mutex<Vec<String>>,
    }

    impl Component for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn commands(&self) -> Vec<&'static str> {
            vec!["hello"]
        }
        fn handle(&self, incoming: &Incoming) -> Result<()> {
            self.seen.lock().push(incoming.from.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn datagrams_reach_components() {
        let bob = manager("bob");
        let alice = manager("alice");
        let echo = Arc::new(Echo {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        bob.add_component(echo.clone()).unwrap();
        let mut relay = PairProvider::new("relay", 1, true);
        relay.remote = Some(bob.clone());
        alice.add_provider(Arc::new(relay), 1).unwrap();
        let peer = PeerId::from("bob");
        alice.lift(&peer, Duration::from_secs(1)).await.unwrap();

        let hello = Datagram::new(bytes::Bytes::from_static(b"{\"hello\":{}}"), bytes::Bytes::new());
        alice.send(&peer, &hello).unwrap();
        let r = alice.send_many(&[peer.clone(), "carol".into(), "dave".into()], &hello);
        assert!(matches!(r, Err(Error::MultipleErrors(ref v)) if v.len() == 2));
        for _ in 0..50 {
            if echo.seen.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*echo.seen.lock(), vec!["alice".to_string(), "alice".to_string()]);
    }

    #[tokio::test]
    async fn clear_peer_closes_everything() {
        let bob = manager("bob");
        let alice = manager("alice");
        let mut relay = PairProvider::new("relay", 1, true);
        relay.remote = Some(bob.clone());
        alice.add_provider(Arc::new(relay), 1).unwrap();
        let peer = PeerId::from("bob");
        alice.lift(&peer, Duration::from_secs(1)).await.unwrap();
        alice.clear_peer(&peer);
        assert_eq!(alice.channel_level(&peer), 0);
        assert!(alice.close_channel(&peer, 1).is_err());
    }
}
