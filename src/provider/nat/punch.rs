use crate::error::{Error, Result};
use crate::protocol::command::{AckUdp, Command, PunchUdp, PunchUdpReply};
use crate::protocol::datagram::Datagram;
use crate::protocol::peer_id::PeerId;
use crate::protocol::OpId;
use bytes::Bytes;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// One side of a hole punching attempt.
pub(crate) struct Punch {
    pub me: PeerId,
    pub target: PeerId,
    pub my_op: OpId,
    pub other_op: OpId,
    pub candidates: Vec<SocketAddr>,
    pub max_tries: usize,
    pub interval: Duration,
}

/// Internal and external candidates plus guesses around the external port.
pub(crate) fn candidates(intern: &[SocketAddr], extern_addr: Option<SocketAddr>) -> Vec<SocketAddr> {
    let mut all: Vec<SocketAddr> = intern.to_vec();
    if let Some(addr) = extern_addr {
        all.push(addr);
        for delta in [1i32, 2, 3, -1, -2] {
            let port = i32::from(addr.port()) + delta;
            if let Ok(port) = u16::try_from(port) {
                if port != 0 {
                    all.push(SocketAddr::new(addr.ip(), port));
                }
            }
        }
    }
    let mut unique = Vec::with_capacity(all.len());
    for addr in all {
        if !unique.contains(&addr) {
            unique.push(addr);
        }
    }
    unique
}

/// Header-only datagrams go out bare, the JSON object is the whole packet.
fn raw<C: Command>(cmd: &C) -> Result<Bytes> {
    Ok(Datagram::from_cmd(cmd)?.header().clone())
}

fn parse(buf: &[u8]) -> Option<(String, Value)> {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(buf) else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    map.into_iter().next()
}

impl Punch {
    fn matches(&self, local: &PeerId, remote: &PeerId) -> bool {
        *remote == self.me && *local == self.target
    }

    async fn send_to(&self, socket: &UdpSocket, buf: &[u8], addr: SocketAddr) {
        if let Err(e) = socket.send_to(buf, addr).await {
            log::debug!("punch send to {addr} {e:?}");
        }
    }

    /// Sends `punchUDP` rounds until the path is confirmed and returns the
    /// address the peer answered from.
    pub(crate) async fn run(&self, socket: &UdpSocket) -> Result<SocketAddr> {
        let mut rounds = 0;
        let mut buf = vec![0u8; 2048];
        loop {
            if rounds >= self.max_tries {
                log::info!("no punch reply from {} after {rounds} rounds", self.target);
                return Err(Error::CouldNotConnectHost);
            }
            rounds += 1;
            let punch = raw(&PunchUdp {
                id: self.my_op,
                other_id: self.other_op,
                num: rounds as u32,
                local: self.me.clone(),
                remote: self.target.clone(),
            })?;
            log::debug!("punch round {rounds} to {:?}", self.candidates);
            for addr in &self.candidates {
                self.send_to(socket, &punch, *addr).await;
            }

            let round_end = Instant::now() + self.interval;
            loop {
                let (len, from) =
                    match tokio::time::timeout_at(round_end, socket.recv_from(&mut buf)).await {
                        Err(_) => break,
                        Ok(Err(e)) => {
                            log::debug!("punch recv {e:?}");
                            continue;
                        }
                        Ok(Ok(rs)) => rs,
                    };
                let Some((name, fields)) = parse(&buf[..len]) else {
                    continue;
                };
                if name == PunchUdp::NAME {
                    let Ok(p) = serde_json::from_value::<PunchUdp>(fields) else {
                        continue;
                    };
                    if !self.matches(&p.local, &p.remote) || p.id != self.other_op {
                        log::debug!("foreign punch from {from}");
                        continue;
                    }
                    let reply = raw(&PunchUdpReply {
                        id: self.my_op,
                        remote_id: p.id,
                        num: p.num,
                        local: self.me.clone(),
                        remote: self.target.clone(),
                    })?;
                    self.send_to(socket, &reply, from).await;
                } else if name == PunchUdpReply::NAME || name == AckUdp::NAME {
                    let (local, remote, id, num) = if name == AckUdp::NAME {
                        let Ok(a) = serde_json::from_value::<AckUdp>(fields) else {
                            continue;
                        };
                        (a.local, a.remote, a.id, a.num)
                    } else {
                        let Ok(r) = serde_json::from_value::<PunchUdpReply>(fields) else {
                            continue;
                        };
                        (r.local, r.remote, r.id, r.num)
                    };
                    if !self.matches(&local, &remote) || id != self.other_op {
                        continue;
                    }
                    let ack = raw(&AckUdp {
                        id: self.my_op,
                        remote_id: id,
                        num,
                        local: self.me.clone(),
                        remote: self.target.clone(),
                    })?;
                    self.send_to(socket, &ack, from).await;
                    log::info!("punched to {} at {from} in round {rounds}", self.target);
                    return Ok(from);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn punch(me: &str, target: &str, my_op: OpId, other_op: OpId, candidates: Vec<SocketAddr>) -> Punch {
        Punch {
            me: me.into(),
            target: target.into(),
            my_op,
            other_op,
            candidates,
            max_tries: 5,
            interval: Duration::from_millis(30),
        }
    }

    #[test]
    fn guesses_around_external_port() {
        let intern: SocketAddr = "192.168.0.2:5000".parse().unwrap();
        let ext: SocketAddr = "1.2.3.4:6000".parse().unwrap();
        let all = candidates(&[intern], Some(ext));
        let ports: Vec<u16> = all.iter().map(|a| a.port()).collect();
        assert_eq!(ports, vec![5000, 6000, 6001, 6002, 6003, 5999, 5998]);
        assert_eq!(candidates(&[intern, intern], None), vec![intern]);
    }

    #[tokio::test]
    async fn silent_peer_gets_exactly_max_rounds() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, _)) = silent.recv_from(&mut buf).await {
                if let Some((name, _)) = parse(&buf[..len]) {
                    if name == PunchUdp::NAME {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let r = punch("alice", "bob", 1, 2, vec![silent_addr]).run(&socket).await;
        assert!(matches!(r, Err(Error::CouldNotConnectHost)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn both_sides_meet() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let left = punch("alice", "bob", 7, 9, vec![b_addr]);
        let right = punch("bob", "alice", 9, 7, vec![a_addr]);
        let (r1, r2) = tokio::join!(left.run(&a), right.run(&b));
        assert_eq!(r1.unwrap(), b_addr);
        assert_eq!(r2.unwrap(), a_addr);
    }

    #[tokio::test]
    async fn punches_for_someone_else_are_ignored() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let left = punch("alice", "bob", 7, 9, vec![b_addr]);
        let mallory = punch("bob", "carol", 9, 7, vec![a_addr]);
        let (r1, r2) = tokio::join!(left.run(&a), mallory.run(&b));
        assert!(matches!(r1, Err(Error::CouldNotConnectHost)));
        assert!(matches!(r2, Err(Error::CouldNotConnectHost)));
    }
}
