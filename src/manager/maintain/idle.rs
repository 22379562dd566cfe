use crate::registry::ChannelRegistry;
use std::time::Duration;

pub async fn idle_check_loop(registry: ChannelRegistry, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        registry.check_idle();
    }
}
