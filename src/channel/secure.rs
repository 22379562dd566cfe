use crate::channel::BoxChannel;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecureMode {
    /// Certificate based, peers are authenticated.
    X509,
    /// Anonymous key agreement, encrypted only.
    Dh,
}

/// Opportunistic encryption over a freshly built channel.
///
/// Implementations wrap the given channel and report the outcome through
/// `ChannelInfo::authenticated` / `ChannelInfo::encrypted` of the returned one.
#[async_trait]
pub trait SecureLayer: Send + Sync + 'static {
    async fn client_handshake(
        &self,
        channel: BoxChannel,
        mode: SecureMode,
        timeout: Duration,
    ) -> Result<BoxChannel>;

    async fn server_handshake(
        &self,
        channel: BoxChannel,
        mode: SecureMode,
        timeout: Duration,
    ) -> Result<BoxChannel>;
}

/// Leaves the channel untouched.
#[derive(Copy, Clone, Debug, Default)]
pub struct PlainLayer;

#[async_trait]
impl SecureLayer for PlainLayer {
    async fn client_handshake(
        &self,
        channel: BoxChannel,
        _mode: SecureMode,
        _timeout: Duration,
    ) -> Result<BoxChannel> {
        Ok(channel)
    }

    async fn server_handshake(
        &self,
        channel: BoxChannel,
        _mode: SecureMode,
        _timeout: Duration,
    ) -> Result<BoxChannel> {
        Ok(channel)
    }
}
