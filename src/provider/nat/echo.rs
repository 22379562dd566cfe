//! External address discovery.
//!
//! ```text
//! client -> server   condata TOKEN
//! server -> client   condataReply TOKEN IP PORT
//! ```

use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Asks the echo service at `server` which address it sees `socket` at.
pub async fn query(socket: &UdpSocket, server: SocketAddr, timeout: Duration) -> Result<SocketAddr> {
    let token = format!("{:016x}", rand::random::<u64>());
    socket
        .send_to(format!("condata {token}").as_bytes(), server)
        .await?;
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await??;
        if from != server {
            continue;
        }
        let text = String::from_utf8_lossy(&buf[..len]);
        match parse_reply(&text, &token) {
            Some(addr) => return Ok(addr),
            None => log::info!("invalid echo answer {text:?}"),
        }
    }
}

fn parse_reply(text: &str, token: &str) -> Option<SocketAddr> {
    let list: Vec<&str> = text.split_whitespace().collect();
    if list.len() != 4 || list[0] != "condataReply" || list[1] != token {
        return None;
    }
    let ip: IpAddr = list[2].parse().ok()?;
    let port: u16 = list[3].parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Echo service loop. Answers every `condata` request with the sender's address.
pub async fn serve(socket: UdpSocket) -> Result<()> {
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf[..len]);
        let Some(token) = text.strip_prefix("condata ") else {
            log::debug!("echo: unknown request from {from}");
            continue;
        };
        let reply = format!("condataReply {} {} {}", token.trim(), from.ip(), from.port());
        if let Err(e) = socket.send_to(reply.as_bytes(), from).await {
            log::warn!("echo reply to {from} {e:?}");
        }
    }
}

/// Resolves a configured `host:port` echo server.
pub(crate) async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::InvalidArgument(format!("echo server {server}")))
}
