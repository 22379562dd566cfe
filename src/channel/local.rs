use crate::channel::{Channel, ChannelInfo, ChannelState, Inbox};
use crate::error::{Error, Result};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// In-process channel; both ends live in the same address space.
pub struct LocalChannel {
    inbox: Arc<Inbox>,
    other: Weak<Inbox>,
    info: ChannelInfo,
}

pub fn pair() -> (LocalChannel, LocalChannel) {
    let info = ChannelInfo {
        stack: vec!["local"],
        ..Default::default()
    };
    pair_with(info)
}

pub fn pair_with(info: ChannelInfo) -> (LocalChannel, LocalChannel) {
    let a = Arc::new(Inbox::new(ChannelState::Connected));
    let b = Arc::new(Inbox::new(ChannelState::Connected));
    (
        LocalChannel {
            inbox: a.clone(),
            other: Arc::downgrade(&b),
            info: info.clone(),
        },
        LocalChannel {
            inbox: b,
            other: Arc::downgrade(&a),
            info,
        },
    )
}

impl Channel for LocalChannel {
    fn error(&self) -> Option<Error> {
        self.inbox.error()
    }
    fn state(&self) -> ChannelState {
        self.inbox.state()
    }
    fn write(&self, data: Bytes) -> Result<()> {
        if let Some(e) = self.inbox.error() {
            return Err(e);
        }
        match self.other.upgrade() {
            Some(other) if other.state() == ChannelState::Connected => {
                other.push(&data);
                Ok(())
            }
            _ => Err(Error::ConnectionReset),
        }
    }
    fn read(&self, max: usize) -> Bytes {
        self.inbox.read(max)
    }
    fn close(&self) {
        if let Some(other) = self.other.upgrade() {
            other.fail(Error::ConnectionReset);
        }
        self.inbox.fail(Error::Closed);
    }
    fn info(&self) -> ChannelInfo {
        self.info.clone()
    }
    fn changed(&self) -> Arc<Notify> {
        self.inbox.notify()
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if let Some(other) = self.other.upgrade() {
            other.fail(Error::ConnectionReset);
        }
    }
}
