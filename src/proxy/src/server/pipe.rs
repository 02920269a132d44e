use crate::backend::BackendSession;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::server::is_conn_close_err;

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub struct PipeOutcome {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    /// first non-benign error from either direction
    pub first_error: Option<io::Error>,
}

/// Bidirectional raw-byte forwarding between an authenticated client and its
/// backend session. Both directions run concurrently; the first one to end
/// (EOF, error, or `done` cancelled from outside) cancels the other, and each
/// direction half-closes its sink on the way out, so both sockets are dead by
/// the time this returns. Errors that only mean "peer hung up" are
/// suppressed.
pub async fn run_pipe(
    client_reader: PacketReader<OwnedReadHalf>,
    client_writer: OwnedWriteHalf,
    backend: BackendSession,
    done: CancellationToken,
) -> PipeOutcome {
    let (backend_reader, backend_writer) = backend.into_parts();

    let c2b = tokio::spawn(copy_direction(client_reader, backend_writer, done.clone()));
    let b2c = tokio::spawn(copy_direction(backend_reader, client_writer, done));
    let (c2b, b2c) = tokio::join!(c2b, b2c);

    let (client_to_backend, c2b_err) =
        c2b.unwrap_or_else(|e| (0, Some(io::Error::other(format!("pipe task failed: {e}")))));
    let (backend_to_client, b2c_err) =
        b2c.unwrap_or_else(|e| (0, Some(io::Error::other(format!("pipe task failed: {e}")))));

    let first_error = [c2b_err, b2c_err]
        .into_iter()
        .flatten()
        .find(|e| !is_conn_close_err(Some(e)));

    PipeOutcome {
        client_to_backend,
        backend_to_client,
        first_error,
    }
}

async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    done: CancellationToken,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    let error = loop {
        let read = tokio::select! {
            _ = done.cancelled() => break None,
            read = src.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    break Some(e);
                }
                total += n as u64;
            }
            Err(e) => break Some(e),
        }
    };
    // stop the opposite direction, then half-close our sink
    done.cancel();
    let _ = dst.shutdown().await;
    (total, error)
}
