use crate::protocol::mysql::constants;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::Write;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// [PacketWriter] buffers one payload via [`std::io::Write`] and frames it on
/// [`end_packet`](PacketWriter::end_packet), chunking at the 16M boundary and
/// stamping sequence numbers. `into_inner` hands the transport back for the
/// raw forwarding phase.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    inner: W,
}

impl<W> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner,
        }
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Frame and send the buffered payload. A payload that is an exact
    /// multiple of `MAX_PAYLOAD_LEN` gets the zero-length terminator frame
    /// the protocol requires; an empty payload is a single empty frame.
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let payload = std::mem::take(&mut self.buf);
        let mut header = [0u8; constants::PACKET_HEADER_LEN];
        let mut offset = 0;
        loop {
            let chunk_len = (payload.len() - offset).min(constants::MAX_PAYLOAD_LEN);
            LittleEndian::write_u24(&mut header, chunk_len as u32);
            header[3] = self.seq;
            self.seq = self.seq.wrapping_add(1);
            self.inner.write_all(&header).await?;
            self.inner
                .write_all(&payload[offset..offset + chunk_len])
                .await?;
            offset += chunk_len;
            if offset == payload.len() && chunk_len < constants::MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
