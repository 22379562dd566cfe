use crate::channel::{Channel, ChannelInfo, ChannelState, Inbox};
use crate::error::{Error, Result};
use crate::OwnedJoinHandle;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

enum WriterMsg {
    Data(Bytes),
    Close,
}

/// Channel over any async byte stream (TCP, KCP).
pub struct StreamChannel {
    inbox: Arc<Inbox>,
    writer: UnboundedSender<WriterMsg>,
    info: ChannelInfo,
    reader: Mutex<Option<OwnedJoinHandle>>,
}

impl StreamChannel {
    pub fn new<S>(stream: S, info: ChannelInfo) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let inbox = Arc::new(Inbox::new(ChannelState::Connected));
        let (writer, receiver) = unbounded_channel();
        tokio::spawn(write_loop(write, receiver, inbox.clone()));
        let handle = tokio::spawn(read_loop(read, inbox.clone()));
        Self {
            inbox,
            writer,
            info,
            reader: Mutex::new(Some(OwnedJoinHandle::new(handle))),
        }
    }
}

async fn read_loop<R: AsyncRead>(mut read: tokio::io::ReadHalf<R>, inbox: Arc<Inbox>) {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        buf.clear();
        match read.read_buf(&mut buf).await {
            Ok(0) => {
                log::debug!("stream channel eof");
                inbox.fail(Error::ConnectionReset);
                return;
            }
            Ok(_) => inbox.push(&buf),
            Err(e) => {
                log::debug!("stream channel read {e:?}");
                inbox.fail(e.into());
                return;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite>(
    mut write: tokio::io::WriteHalf<W>,
    mut receiver: UnboundedReceiver<WriterMsg>,
    inbox: Arc<Inbox>,
) {
    while let Some(msg) = receiver.recv().await {
        match msg {
            WriterMsg::Data(data) => {
                if let Err(e) = write.write_all(&data).await {
                    log::debug!("stream channel write {e:?}");
                    inbox.fail(e.into());
                    return;
                }
            }
            WriterMsg::Close => break,
        }
    }
    _ = write.shutdown().await;
}

impl Channel for StreamChannel {
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
        self.writer
            .send(WriterMsg::Data(data))
            .map_err(|_| Error::Closed)
    }
    fn read(&self, max: usize) -> Bytes {
        self.inbox.read(max)
    }
    fn close(&self) {
        _ = self.writer.send(WriterMsg::Close);
        self.reader.lock().take();
        self.inbox.fail(Error::Closed);
    }
    fn info(&self) -> ChannelInfo {
        self.info.clone()
    }
    fn changed(&self) -> Arc<Notify> {
        self.inbox.notify()
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        _ = self.writer.send(WriterMsg::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let a = StreamChannel::new(a, ChannelInfo::default());
        let b = StreamChannel::new(b, ChannelInfo::default());
        let changed = b.changed();
        a.write(Bytes::from_static(b"over the stream")).unwrap();
        let mut got = BytesMut::new();
        while got.len() < 15 {
            changed.notified().await;
            got.extend_from_slice(&b.read(64));
        }
        assert_eq!(&got[..], b"over the stream");
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (a, b) = tokio::io::duplex(1024);
        let a = StreamChannel::new(a, ChannelInfo::default());
        let b = StreamChannel::new(b, ChannelInfo::default());
        let changed = b.changed();
        a.close();
        while b.error().is_none() {
            changed.notified().await;
        }
        assert!(matches!(b.error(), Some(Error::ConnectionReset)));
    }
}
