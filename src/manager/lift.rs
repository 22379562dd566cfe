use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::protocol::peer_id::PeerId;
use crate::protocol::Level;
use crate::provider::{lasting, ChannelProvider};
use crate::scheduler::Pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One provider working on a channel for a lift.
pub(crate) type LiftAttempt = Pending<()>;

const ATTEMPT_SHARE: f64 = 0.66;

impl ConnectionManager {
    /// Providers ordered from best to worst.
    fn ranked_providers(&self) -> Vec<(Level, Arc<dyn ChannelProvider>)> {
        self.providers
            .read()
            .iter()
            .rev()
            .map(|(level, provider)| (*level, provider.clone()))
            .collect()
    }

    /// Runs one `create_channel` as an op of `peer`'s group, registering the
    /// channel when it arrives in time.
    async fn attempt(
        &self,
        peer: &PeerId,
        level: Level,
        provider: Arc<dyn ChannelProvider>,
        timeout: Duration,
    ) -> Result<()> {
        log::debug!("lifting {peer} with {} on level {level}", provider.name());
        let (op, result) = LiftAttempt::new("lift attempt");
        let id = self
            .lift_ops
            .add(op, Instant::now() + timeout, Some(peer.clone()));
        let registry = self.registry.clone();
        let lift_ops = self.lift_ops.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let created = provider.create_channel(&peer, timeout).await;
            match (lift_ops.take_ready(id), created) {
                (Some(op), Ok(channel)) => {
                    let channel = registry.add(channel, peer, true, level);
                    log::debug!("lift attempt on level {level} gave {channel}");
                    op.complete(Ok(()));
                }
                (Some(op), Err(e)) => op.complete(Err(e)),
                (None, Ok(channel)) => {
                    log::debug!("late {} channel to {peer} dropped", provider.name());
                    channel.close();
                }
                (None, Err(_)) => {}
            }
        });
        result.wait().await
    }

    /// Builds a channel from the best provider able to start from nothing.
    async fn connect_initial(
        &self,
        peer: &PeerId,
        providers: &[(Level, Arc<dyn ChannelProvider>)],
        deadline: Instant,
    ) -> Result<()> {
        let mut last_tried = Level::MAX;
        loop {
            let next = providers
                .iter()
                .find(|(level, provider)| *level < last_tried && provider.provides_initial_channels());
            let Some((level, provider)) = next else {
                return Err(Error::CouldNotConnectHost);
            };
            last_tried = *level;
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            let timeout = lasting(deadline, ATTEMPT_SHARE);
            match self.attempt(peer, *level, provider.clone(), timeout).await {
                Err(Error::Canceled) => return Err(Error::Canceled),
                Ok(()) if self.registry.best_level(peer) > 0 => return Ok(()),
                Ok(()) => log::debug!("initial channel to {peer} on level {level} lost glare"),
                Err(e) => log::info!("initial channel to {peer} on level {level} failed {e:?}"),
            }
        }
    }

    /// Tries ever lower providers as long as they beat the current best
    /// level. Returns the best level reached, which is at least `min_level`.
    ///
    /// Clearing the peer while an attempt runs ends the lift with `Canceled`.
    pub async fn lift_to_at_least(
        &self,
        peer: &PeerId,
        min_level: Level,
        timeout: Duration,
    ) -> Result<Level> {
        let deadline = Instant::now() + timeout;
        let providers = self.ranked_providers();
        if self.registry.best_level(peer) == 0 {
            self.connect_initial(peer, &providers, deadline).await?;
        }

        let mut last_tried = Level::MAX;
        loop {
            let best = self.registry.best_level(peer);
            let Some((level, provider)) = providers.iter().find(|(level, _)| *level < last_tried)
            else {
                break;
            };
            if *level <= best {
                break;
            }
            last_tried = *level;
            if Instant::now() >= deadline {
                log::info!("lift of {peer} out of time at level {best}");
                break;
            }
            let timeout = lasting(deadline, ATTEMPT_SHARE);
            match self.attempt(peer, *level, provider.clone(), timeout).await {
                Ok(()) => {}
                Err(Error::Canceled) => {
                    log::info!("lift of {peer} canceled");
                    return Err(Error::Canceled);
                }
                Err(e) => log::info!("lift of {peer} to level {level} failed {e:?}"),
            }
        }

        let best = self.registry.best_level(peer);
        if best < min_level {
            return Err(Error::CouldNotConnectHost);
        }
        self.registry.close_redundant(peer);
        log::info!("{peer} lifted to level {best}");
        Ok(best)
    }

    /// Lifts to the best reachable level, any channel at all is a success.
    pub async fn lift(&self, peer: &PeerId, timeout: Duration) -> Result<Level> {
        self.lift_to_at_least(peer, 1, timeout).await
    }
}
