pub mod command;
pub mod datagram;
pub mod peer_id;

/// Priority of a channel kind, higher is better. `0` means no channel.
pub type Level = u32;

/// Identifier of an asynchronous operation, unique per scheduler.
pub type OpId = u64;

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
