use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::command::Command;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

/// Header and content lengths are 31 bit values.
pub const MAX_LEN: usize = 0x7fff_ffff;
pub const PREFIX_LEN: usize = 8;

/*
   0                                            31
   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5  6  7  8  9  0  1
  +-----------------------------------------------------------------------------------------------+
  |                                  header length (big endian)                                   |
  +-----------------------------------------------------------------------------------------------+
  |                                  content length (big endian)                                  |
  +-----------------------------------------------------------------------------------------------+
  |                              header (json, one key naming the command)                        |
  +-----------------------------------------------------------------------------------------------+
  |                                      content (opaque)                                         |
  +-----------------------------------------------------------------------------------------------+
*/
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Datagram {
    header: Bytes,
    content: Bytes,
}

impl Datagram {
    pub fn new(header: Bytes, content: Bytes) -> Self {
        Self { header, content }
    }
    pub fn from_cmd<C: Command>(cmd: &C) -> Result<Self> {
        let mut map = Map::with_capacity(1);
        map.insert(C::NAME.to_string(), serde_json::to_value(cmd)?);
        let header = serde_json::to_vec(&Value::Object(map))?;
        Ok(Self::new(header.into(), Bytes::new()))
    }
    pub fn with_content(mut self, content: Bytes) -> Self {
        self.content = content;
        self
    }
    pub fn header(&self) -> &Bytes {
        &self.header
    }
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.header.len() > MAX_LEN || self.content.len() > MAX_LEN {
            return Err(Error::TooMuch);
        }
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + self.header.len() + self.content.len());
        buf.put_u32(self.header.len() as u32);
        buf.put_u32(self.content.len() as u32);
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.content);
        Ok(buf.freeze())
    }

    /// Decodes one datagram from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(Datagram, usize)> {
        if buf.len() < PREFIX_LEN {
            return Err(Error::NotEnough);
        }
        let (header_len, content_len) = lengths(&buf[..PREFIX_LEN])?;
        let total = PREFIX_LEN + header_len + content_len;
        if buf.len() < total {
            return Err(Error::NotEnough);
        }
        let header = Bytes::copy_from_slice(&buf[PREFIX_LEN..PREFIX_LEN + header_len]);
        let content = Bytes::copy_from_slice(&buf[PREFIX_LEN + header_len..total]);
        Ok((Datagram::new(header, content), total))
    }

    /// Command name and fields of the header.
    pub fn command(&self) -> Result<(String, Value)> {
        match serde_json::from_slice::<Value>(&self.header)? {
            Value::Object(map) if map.len() == 1 => {
                let (name, fields) = map.into_iter().next().ok_or(Error::NotEnough)?;
                Ok((name, fields))
            }
            _ => Err(Error::BadProtocol("header is not a single command".into())),
        }
    }

    pub fn parse<C: Command>(&self) -> Result<C> {
        let (name, fields) = self.command()?;
        if name != C::NAME {
            return Err(Error::BadProtocol(format!(
                "expected {}, got {name}",
                C::NAME
            )));
        }
        Ok(serde_json::from_value(fields)?)
    }
}

fn lengths(mut prefix: &[u8]) -> Result<(usize, usize)> {
    let header_len = prefix.get_u32() as usize;
    let content_len = prefix.get_u32() as usize;
    if header_len > MAX_LEN || content_len > MAX_LEN {
        return Err(Error::TooMuch);
    }
    Ok((header_len, content_len))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReadState {
    WaitLengths,
    WaitHeader,
    WaitContent,
    Error,
}

/// Incremental datagram decoder bound to one channel.
///
/// Every call pulls at most the bytes still missing for the current part,
/// so data following a datagram stays buffered in the channel.
pub struct DatagramReader {
    state: ReadState,
    header_len: usize,
    content_len: usize,
    header: Bytes,
    pending: BytesMut,
}

impl Default for DatagramReader {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramReader {
    pub fn new() -> Self {
        Self {
            state: ReadState::WaitLengths,
            header_len: 0,
            content_len: 0,
            header: Bytes::new(),
            pending: BytesMut::new(),
        }
    }

    /// Returns the next complete datagram or `NotEnough`.
    pub fn read(&mut self, channel: &dyn Channel) -> Result<Datagram> {
        loop {
            match self.state {
                ReadState::Error => return Err(Error::WrongState),
                ReadState::WaitLengths => {
                    self.fill(channel, PREFIX_LEN)?;
                    match lengths(&self.pending) {
                        Ok((header_len, content_len)) => {
                            self.header_len = header_len;
                            self.content_len = content_len;
                            self.pending.clear();
                            self.state = ReadState::WaitHeader;
                        }
                        Err(e) => {
                            self.state = ReadState::Error;
                            return Err(e);
                        }
                    }
                }
                ReadState::WaitHeader => {
                    self.fill(channel, self.header_len)?;
                    self.header = self.pending.split().freeze();
                    self.state = ReadState::WaitContent;
                }
                ReadState::WaitContent => {
                    self.fill(channel, self.content_len)?;
                    let content = self.pending.split().freeze();
                    let header = std::mem::take(&mut self.header);
                    self.state = ReadState::WaitLengths;
                    return Ok(Datagram::new(header, content));
                }
            }
        }
    }

    fn fill(&mut self, channel: &dyn Channel, need: usize) -> Result<()> {
        if self.pending.len() < need {
            let data = channel.read(need - self.pending.len());
            self.pending.extend_from_slice(&data);
        }
        if self.pending.len() < need {
            return Err(Error::NotEnough);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::pair;
    use crate::protocol::command::{CloseChannel, Ping};

    #[test]
    fn encode_layout() {
        let d = Datagram::new(Bytes::from_static(b"abc"), Bytes::from_static(b"xy"));
        let buf = d.encode().unwrap();
        assert_eq!(&buf[..8], &[0, 0, 0, 3, 0, 0, 0, 2]);
        assert_eq!(&buf[8..], b"abcxy");
        let (back, used) = Datagram::decode_from(&buf).unwrap();
        assert_eq!(back, d);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn empty_datagram_round_trip() {
        let d = Datagram::default();
        let buf = d.encode().unwrap();
        assert_eq!(buf.len(), PREFIX_LEN);
        assert_eq!(Datagram::decode_from(&buf).unwrap().0, d);
    }

    #[test]
    fn oversized_lengths_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x8000_0000);
        buf.put_u32(0);
        assert!(matches!(Datagram::decode_from(&buf), Err(Error::TooMuch)));
    }

    #[test]
    fn command_header() {
        let d = Datagram::from_cmd(&Ping { id: 7 }).unwrap();
        assert_eq!(&d.header()[..], br#"{"ping":{"id":7}}"#);
        let (name, _) = d.command().unwrap();
        assert_eq!(name, "ping");
        assert_eq!(d.parse::<Ping>().unwrap(), Ping { id: 7 });
        assert!(matches!(
            d.parse::<CloseChannel>(),
            Err(Error::BadProtocol(_))
        ));
    }

    #[test]
    fn reader_handles_partial_input() {
        let (a, b) = pair();
        let first = Datagram::new(Bytes::from_static(b"head"), Bytes::from_static(b"body"));
        let second = Datagram::from_cmd(&CloseChannel {}).unwrap();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first.encode().unwrap());
        wire.extend_from_slice(&second.encode().unwrap());

        let mut reader = DatagramReader::new();
        assert!(matches!(reader.read(&b), Err(Error::NotEnough)));
        let wire = wire.freeze();
        for chunk in wire[..11].chunks(3) {
            a.write(Bytes::copy_from_slice(chunk)).unwrap();
            assert!(matches!(reader.read(&b), Err(Error::NotEnough)));
        }
        a.write(wire.slice(11..)).unwrap();
        assert_eq!(reader.read(&b).unwrap(), first);
        assert_eq!(reader.read(&b).unwrap(), second);
        assert!(matches!(reader.read(&b), Err(Error::NotEnough)));
    }

    #[test]
    fn reader_stays_failed_after_framing_error() {
        let (a, b) = pair();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u32(1);
        a.write(buf.freeze()).unwrap();
        let mut reader = DatagramReader::new();
        assert!(matches!(reader.read(&b), Err(Error::TooMuch)));
        assert!(matches!(reader.read(&b), Err(Error::WrongState)));
    }
}
