pub mod factory;
pub mod pool;

use crate::async_packet_read;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One authenticated backend MySQL session, command-phase ready. Exclusively
/// owned: by the pool while idle, then by exactly one worker, which must
/// close it. Sessions are never reused across clients.
pub struct BackendSession {
    reader: PacketReader<BoxedReader>,
    writer: PacketWriter<BoxedWriter>,
    peer: SocketAddr,
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl BackendSession {
    pub fn new(
        reader: PacketReader<BoxedReader>,
        writer: PacketWriter<BoxedWriter>,
        peer: SocketAddr,
    ) -> Self {
        Self {
            reader,
            writer,
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// COM_PING round trip. Anything but an OK packet counts as a dead
    /// session.
    pub async fn ping(&mut self) -> io::Result<()> {
        writers::write_com_ping(&mut self.writer).await?;
        let (_, pkt) = async_packet_read!(self.reader);
        if pkt.is_ok_packet() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "backend rejected liveness ping",
            ))
        }
    }

    pub async fn close(self) -> io::Result<()> {
        let mut writer = self.writer.into_inner();
        writer.shutdown().await
    }

    /// Hand the transport halves to the forwarding pipe. The reader keeps any
    /// bytes it buffered past the last packet boundary.
    pub fn into_parts(self) -> (PacketReader<BoxedReader>, BoxedWriter) {
        (self.reader, self.writer.into_inner())
    }
}

/// A pooled session plus the moment it was created, for age-based staleness.
pub struct PooledBackend {
    pub session: BackendSession,
    pub created_at: Instant,
}

impl PooledBackend {
    pub fn new(session: BackendSession) -> Self {
        Self {
            session,
            created_at: Instant::now(),
        }
    }
}

/// Opens one fresh authenticated backend session. The production
/// implementation is [`factory::BackendFactory`]; tests inject their own.
#[async_trait]
pub trait ConnFactory: Send + Sync {
    async fn new_conn(&self, ctx: &CancellationToken) -> io::Result<BackendSession>;
}
