//! Length-prefixed [`Link`] over any `AsyncRead + AsyncWrite` byte stream
//! (e.g. a TCP socket), grounded on the teacher's framed stream transport.
//!
//! Each packet is written as a LEB128 varint length followed by that many
//! bytes of postcard-encoded [`Packet`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::LinkError;
use crate::link::Link;
use crate::packet::Packet;

/// Maximum accepted frame length, guarding against a corrupt or hostile
/// length prefix causing an unbounded allocation.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

fn encode_varint(mut n: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
        }
    }
}

/// A [`Link`] that frames [`Packet`]s over a single duplex byte stream.
#[derive(Debug)]
pub struct FramedLink<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
}

impl<S> FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> Link for FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    async fn send(&self, packet: Packet) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let payload = packet.encode();
        let mut frame = Vec::with_capacity(payload.len() + 5);
        encode_varint(payload.len() as u64, &mut frame);
        frame.extend_from_slice(&payload);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| LinkError::Io(e.to_string()))
    }

    async fn recv(&self) -> Result<Packet, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let len = match read_varint(&mut *reader).await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.closed.store(true, Ordering::Release);
                return Err(LinkError::Closed);
            }
            Err(e) => return Err(LinkError::Io(e.to_string())),
        };
        if len > MAX_FRAME_LEN {
            return Err(LinkError::Protocol(format!("frame of {len} bytes exceeds limit")));
        }
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        Packet::decode(&buf).map_err(|e| LinkError::Protocol(e.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_over_a_duplex_pair() {
        let (client, server) = tokio::io::duplex(4096);
        let client_link = FramedLink::new(client);
        let server_link = FramedLink::new(server);

        client_link
            .send(Packet::Data {
                channel_id: "c1".into(),
                seq: 7,
                payload: vec![9, 9, 9],
            })
            .await
            .unwrap();

        let got = server_link.recv().await.unwrap();
        assert_eq!(
            got,
            Packet::Data {
                channel_id: "c1".into(),
                seq: 7,
                payload: vec![9, 9, 9],
            }
        );
    }

    #[tokio::test]
    async fn closing_the_stream_surfaces_as_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let server_link = FramedLink::new(server);
        drop(client);
        assert_eq!(server_link.recv().await, Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn varint_roundtrip() {
        for n in [0u64, 1, 127, 128, 300, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(n, &mut buf);
            let mut cursor = std::io::Cursor::new(buf);
            assert_eq!(read_varint(&mut cursor).await.unwrap(), n);
        }
    }
}
