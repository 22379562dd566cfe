use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub mod local;
pub mod secure;
pub mod stream;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
    Other,
}

/// Best-effort description of a channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelInfo {
    /// Transport layers from bottom to top, e.g. `["tcp", "tls"]`.
    pub stack: Vec<&'static str>,
    pub bandwidth: Option<f64>,
    pub delay: Option<Duration>,
    pub authenticated: bool,
    pub encrypted: bool,
    /// Relayed through a third party. Virtual channels are not pinged.
    pub is_virtual: bool,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
}

/// A duplex byte stream to one peer.
///
/// `write` never blocks: data is queued and errors surface later through
/// [`Channel::error`]. `read` only returns what is already buffered.
/// Implementations call `notify_one` on the [`Channel::changed`] handle
/// whenever data arrives, an error occurs or the state changes, so a
/// single consumer never misses a wakeup.
pub trait Channel: Send + Sync + 'static {
    fn error(&self) -> Option<Error>;
    fn state(&self) -> ChannelState;
    fn write(&self, data: Bytes) -> Result<()>;
    fn read(&self, max: usize) -> Bytes;
    fn close(&self);
    fn info(&self) -> ChannelInfo;
    fn changed(&self) -> Arc<Notify>;
}

pub type BoxChannel = Box<dyn Channel>;

/// Receive side shared by the channel implementations of this crate.
pub(crate) struct Inbox {
    buf: Mutex<BytesMut>,
    error: Mutex<Option<Error>>,
    state: Mutex<ChannelState>,
    notify: Arc<Notify>,
}

impl Inbox {
    pub(crate) fn new(state: ChannelState) -> Self {
        Self {
            buf: Mutex::new(BytesMut::new()),
            error: Mutex::new(None),
            state: Mutex::new(state),
            notify: Arc::new(Notify::new()),
        }
    }
    pub(crate) fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.buf.lock().extend_from_slice(data);
        self.notify.notify_one();
    }
    pub(crate) fn read(&self, max: usize) -> Bytes {
        let mut buf = self.buf.lock();
        let len = max.min(buf.len());
        buf.split_to(len).freeze()
    }
    pub(crate) fn fail(&self, error: Error) {
        {
            let mut guard = self.error.lock();
            if guard.is_none() {
                guard.replace(error);
            }
        }
        *self.state.lock() = ChannelState::Unconnected;
        self.notify.notify_one();
    }
    pub(crate) fn error(&self) -> Option<Error> {
        self.error.lock().clone()
    }
    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }
    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
        self.notify.notify_one();
    }
    pub(crate) fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
