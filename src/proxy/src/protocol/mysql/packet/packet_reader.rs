use crate::protocol::mysql::packet::{packet, Packet};

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use winnow::error::ErrMode;

const READ_BUFFER_SIZE: usize = 4096;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        $reader.next_async().await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "peer terminated connection",
            )
        })?
    }};
}

/// [PacketReader] pulls bytes off a transport and frames them into MySQL
/// [`Packet`]s. It also implements [`AsyncRead`]: once the handshake phase is
/// over the same value can be used as a plain byte source, draining whatever
/// it buffered past the last packet boundary first. That handover is what the
/// forwarding pipe relies on.
pub struct PacketReader<R> {
    buf: Vec<u8>,
    start: usize,
    remaining: usize,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            buf: Vec::new(),
            start: 0,
            remaining: 0,
            r,
        }
    }

    pub fn into_inner(self) -> R {
        self.r
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Next framed packet, or `None` on a clean EOF at a packet boundary.
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        loop {
            if self.remaining != 0 {
                let framed = {
                    let window = &self.buf[self.start..self.start + self.remaining];
                    match packet(window) {
                        Ok((rest, framed)) => Some(Ok((rest.into_inner().len(), framed))),
                        Err(ErrMode::Incomplete(_)) => None,
                        Err(e) => Some(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("malformed packet frame: {e:?}"),
                        ))),
                    }
                };
                if let Some(outcome) = framed {
                    let (rest_len, (seq, pkt)) = outcome?;
                    self.start += self.remaining - rest_len;
                    self.remaining = rest_len;
                    return Ok(Some((seq, pkt)));
                }
            }

            // compact, then pull more bytes from the transport
            self.buf.drain(..self.start);
            self.start = 0;
            let end = self.remaining;
            if self.buf.len() < end + READ_BUFFER_SIZE {
                self.buf.resize(end + READ_BUFFER_SIZE, 0);
            }
            let read = self.r.read(&mut self.buf[end..]).await?;
            self.remaining = end + read;
            if read == 0 {
                self.buf.truncate(self.remaining);
                return if self.remaining == 0 {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.remaining),
                    ))
                };
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PacketReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remaining != 0 {
            let take = this.remaining.min(buf.remaining());
            buf.put_slice(&this.buf[this.start..this.start + take]);
            this.start += take;
            this.remaining -= take;
            if this.remaining == 0 {
                this.buf.clear();
                this.start = 0;
            }
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut this.r).poll_read(cx, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn frames_two_packets() {
        let bytes = vec![0x01, 0, 0, 0, 0x0e, 0x02, 0, 0, 1, 0x03, 0x31];
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x0e][..]);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(&*pkt, &[0x03, 0x31][..]);
        assert!(reader.next_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_packet_is_an_error() {
        let bytes = vec![0x05, 0, 0, 0, 0x03];
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let err = reader.next_async().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn leftover_bytes_drain_through_async_read() {
        // one framed packet followed by raw bytes that belong to the pipe phase
        let bytes = vec![0x01, 0, 0, 0, 0x0e, 0xde, 0xad, 0xbe, 0xef];
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let _ = reader.next_async().await.unwrap().unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0xde, 0xad, 0xbe, 0xef]);
    }
}
