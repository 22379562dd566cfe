use bytes::{Buf, BytesMut};
use kcp::Kcp;
use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::Interval;
use tokio_util::sync::PollSender;

/// Longest time a shut down stream keeps running to get its queued
/// segments acknowledged.
const LINGER: Duration = Duration::from_secs(3);

/// Reliable byte stream over an already punched UDP path.
///
/// Raw datagrams from the remote address are fed through `input`; segments
/// produced by KCP go straight out of the shared socket. The stream ends
/// with an error once KCP gives up on the link or when data stays
/// unacknowledged with nothing heard from the peer for `dead_after`.
pub struct KcpStream {
    unread: Option<BytesMut>,
    received: Receiver<BytesMut>,
    to_send: PollSender<BytesMut>,
}

impl KcpStream {
    pub fn new(
        conv: u32,
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        input: Receiver<BytesMut>,
        dead_after: Duration,
    ) -> Self {
        let output = KcpOutput {
            addr: remote_addr,
            socket,
        };
        let mut kcp = Kcp::new_stream(conv, output);
        kcp.set_wndsize(128, 128);
        kcp.set_nodelay(true, 10, 2, true);
        let (received_sender, received) = tokio::sync::mpsc::channel(128);
        let (to_send_sender, to_send) = tokio::sync::mpsc::channel(128);
        tokio::spawn(async move {
            if let Err(e) = drive(kcp, input, to_send, received_sender, dead_after).await {
                log::debug!("kcp {conv:#x} with {remote_addr} ended {e:?}");
            }
        });
        Self {
            unread: None,
            received,
            to_send: PollSender::new(to_send_sender),
        }
    }
}

/// Copies as much of `src` as fits, returns what is left over.
fn copy_into(mut src: BytesMut, dst: &mut ReadBuf<'_>) -> Option<BytesMut> {
    let len = dst.remaining().min(src.len());
    dst.put_slice(&src[..len]);
    src.advance(len);
    (!src.is_empty()).then_some(src)
}

impl AsyncRead for KcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let next = match self.unread.take() {
            Some(unread) => unread,
            None => match self.received.poll_recv(cx) {
                Poll::Ready(Some(data)) => data,
                // eof
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            },
        };
        self.unread = copy_into(next, buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for KcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let reserved = std::task::ready!(self.to_send.poll_reserve(cx));
        if reserved.is_err() || self.to_send.send_item(buf.into()).is_err() {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.to_send.close();
        Poll::Ready(Ok(()))
    }
}

enum Step {
    Datagram(BytesMut),
    Write(BytesMut),
    /// The local side shut down its write half.
    Shutdown,
    Tick,
}

/// Waits for the next thing KCP must react to. Local writes are only taken
/// while `accepting`.
async fn next_step(
    input: &mut Receiver<BytesMut>,
    to_send: &mut Receiver<BytesMut>,
    ticker: &mut Interval,
    accepting: bool,
) -> io::Result<Step> {
    tokio::select! {
        datagram = input.recv() => datagram
            .map(Step::Datagram)
            .ok_or_else(|| io::ErrorKind::ConnectionAborted.into()),
        data = to_send.recv(), if accepting => Ok(data.map_or(Step::Shutdown, Step::Write)),
        _ = ticker.tick() => Ok(Step::Tick),
    }
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32
}

async fn drive(
    mut kcp: Kcp<KcpOutput>,
    mut input: Receiver<BytesMut>,
    mut to_send: Receiver<BytesMut>,
    received: Sender<BytesMut>,
    dead_after: Duration,
) -> io::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    let mut buf = vec![0; 65536];
    let mut received = Some(received);
    let mut last_input = Instant::now();
    let mut linger_until: Option<Instant> = None;
    loop {
        let accepting = linger_until.is_none() && kcp.wait_snd() < kcp.snd_wnd() as usize;
        let handled = match next_step(&mut input, &mut to_send, &mut ticker, accepting).await? {
            Step::Datagram(datagram) => {
                last_input = Instant::now();
                kcp.input(&datagram).map(|_| ())
            }
            Step::Write(data) => kcp.send(&data).map(|_| ()),
            Step::Shutdown => {
                linger_until = Some(Instant::now() + LINGER);
                kcp.flush()
            }
            Step::Tick => kcp.update(now_millis()),
        };
        handled.map_err(io::Error::other)?;

        if kcp.is_dead_link() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "kcp dead link"));
        }
        if kcp.wait_snd() > 0 && last_input.elapsed() > dead_after {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "peer silent"));
        }
        if let Some(until) = linger_until {
            if kcp.wait_snd() == 0 || Instant::now() >= until {
                return Ok(());
            }
        }

        while let Ok(len) = kcp.recv(&mut buf) {
            let Some(sender) = &received else {
                continue;
            };
            if sender.send(buf[..len].into()).await.is_err() {
                // reader gone, keep serving acks
                received = None;
            }
        }
    }
}

struct KcpOutput {
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.socket.try_send_to(buf, self.addr) {
            // kcp retransmits what the socket could not take
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn forward(socket: Arc<UdpSocket>, from: SocketAddr, input: Sender<BytesMut>) {
        let mut buf = vec![0; 65536];
        while let Ok((len, addr)) = socket.recv_from(&mut buf).await {
            if addr == from && input.send(buf[..len].into()).await.is_err() {
                return;
            }
        }
    }

    async fn socket() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Arc::new(socket), addr)
    }

    async fn linked() -> (KcpStream, KcpStream) {
        let (a, a_addr) = socket().await;
        let (b, b_addr) = socket().await;
        let (a_in, a_in_receiver) = tokio::sync::mpsc::channel(128);
        let (b_in, b_in_receiver) = tokio::sync::mpsc::channel(128);
        tokio::spawn(forward(a.clone(), b_addr, a_in));
        tokio::spawn(forward(b.clone(), a_addr, b_in));
        let timeout = Duration::from_secs(15);
        (
            KcpStream::new(0x1234, a, b_addr, a_in_receiver, timeout),
            KcpStream::new(0x1234, b, a_addr, b_in_receiver, timeout),
        )
    }

    #[tokio::test]
    async fn bytes_cross_loopback() {
        let (mut left, mut right) = linked().await;
        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        left.write_all(&payload).await.unwrap();
        let mut got = vec![0; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), right.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn last_write_before_shutdown_arrives() {
        let (mut left, mut right) = linked().await;
        left.write_all(b"closeChannel").await.unwrap();
        left.shutdown().await.unwrap();
        drop(left);
        let mut got = [0u8; 12];
        tokio::time::timeout(Duration::from_secs(2), right.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"closeChannel");
    }

    #[tokio::test]
    async fn silent_peer_ends_the_stream() {
        let (a, _) = socket().await;
        // bound but never read, nothing is ever acknowledged
        let (_b, b_addr) = socket().await;
        let (a_in, a_in_receiver) = tokio::sync::mpsc::channel(128);
        tokio::spawn(forward(a.clone(), b_addr, a_in));
        let mut left = KcpStream::new(0x1234, a, b_addr, a_in_receiver, Duration::from_millis(300));
        left.write_all(b"anyone there").await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(3), left.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }
}
