use crate::config::ManagerConfig;
use crate::manager::lift::LiftAttempt;
use crate::multiplex::CommandMultiplexer;
use crate::pinger::ChannelPinger;
use crate::provider::ProviderEvent;
use crate::registry::{ChannelRegistry, RegistryEvent};
use crate::scheduler::AsyncOpScheduler;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;

mod dispatch;
mod heartbeat;
mod idle;

#[allow(clippy::too_many_arguments)]
pub(crate) fn start_task(
    config: &ManagerConfig,
    registry: &ChannelRegistry,
    registry_events: flume::Receiver<RegistryEvent>,
    provider_events: UnboundedReceiver<ProviderEvent>,
    multiplexer: Arc<CommandMultiplexer>,
    pinger: Arc<ChannelPinger>,
    lift_ops: AsyncOpScheduler<LiftAttempt>,
    ping_enabled: Arc<AtomicBool>,
) -> JoinSet<()> {
    let mut join_set = JoinSet::new();
    join_set.spawn(dispatch::dispatch_loop(
        registry_events,
        multiplexer,
        pinger.clone(),
    ));
    join_set.spawn(dispatch::provider_event_loop(
        provider_events,
        registry.clone(),
        lift_ops,
    ));
    join_set.spawn(idle::idle_check_loop(
        registry.clone(),
        config.idle_check_interval,
    ));
    join_set.spawn(heartbeat::ping_loop(
        pinger,
        config.ping_interval,
        ping_enabled,
    ));
    join_set
}
