use crate::pinger::ChannelPinger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub async fn ping_loop(pinger: Arc<ChannelPinger>, interval: Duration, enabled: Arc<AtomicBool>) {
    loop {
        tokio::time::sleep(interval).await;
        if !enabled.load(Ordering::Relaxed) {
            continue;
        }
        let sent = pinger.ping_all();
        log::debug!("sent {sent} pings, {} open", pinger.open_pings());
    }
}
