use crate::protocol::peer_id::PeerId;
use crate::protocol::OpId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// A record carried in a datagram header under its command name.
pub trait Command: Serialize + DeserializeOwned {
    const NAME: &'static str;
}

macro_rules! command {
    ($ty:ty, $name:literal) => {
        impl Command for $ty {
            const NAME: &'static str = $name;
        }
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannel {
    pub from: PeerId,
    pub to: PeerId,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_cert_fp: Option<String>,
}
command!(CreateChannel, "createChannel");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelAccept {
    pub from: PeerId,
    pub to: PeerId,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_cert_fp: Option<String>,
}
command!(CreateChannelAccept, "createChannelAccept");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelAccept {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
}
command!(ChannelAccept, "channelAccept");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelFail {
    pub error: String,
    #[serde(default)]
    pub msg: String,
}
command!(ChannelFail, "channelFail");

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseChannel {}
command!(CloseChannel, "closeChannel");

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: OpId,
}
command!(Ping, "ping");

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub id: OpId,
}
command!(Pong, "pong");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestConnectDetails {
    pub id: OpId,
}
command!(RequestConnectDetails, "requestConnectDetails");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectDetailsReply {
    pub id: OpId,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
command!(ConnectDetailsReply, "connectDetailsReply");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestUdtConnect {
    pub id: OpId,
    pub intern_addrs: Vec<SocketAddr>,
    pub extern_addr: Option<SocketAddr>,
    /// Name of the echo failure, `None` when the echo succeeded.
    pub echo_result: Option<String>,
}
command!(RequestUdtConnect, "requestUDTConnect");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestUdtConnectReply {
    pub id: OpId,
    pub local_id: OpId,
    pub intern_addrs: Vec<SocketAddr>,
    pub extern_addr: Option<SocketAddr>,
    pub echo_result: Option<String>,
}
command!(RequestUdtConnectReply, "requestUDTConnectReply");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PunchUdp {
    pub id: OpId,
    pub other_id: OpId,
    pub num: u32,
    pub local: PeerId,
    pub remote: PeerId,
}
command!(PunchUdp, "punchUDP");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PunchUdpReply {
    pub id: OpId,
    pub remote_id: OpId,
    pub num: u32,
    pub local: PeerId,
    pub remote: PeerId,
}
command!(PunchUdpReply, "punchUDPReply");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AckUdp {
    pub id: OpId,
    pub remote_id: OpId,
    pub num: u32,
    pub local: PeerId,
    pub remote: PeerId,
}
command!(AckUdp, "ackUDP");
