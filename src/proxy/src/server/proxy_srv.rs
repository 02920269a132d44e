use crate::backend::pool::ConnPool;
use crate::config::Profile;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::{auth, is_conn_close_err, pipe};

use hashbrown::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long force-closed workers get to observe their cancelled sockets
/// before `run` returns anyway.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Read deadline for the courtesy error reply when no backend could be
/// borrowed.
const REJECT_READ_DEADLINE: Duration = Duration::from_secs(2);

/// Live-session record, kept from accept to worker exit.
pub struct TrackedSession {
    pub id: u64,
    pub client_addr: SocketAddr,
    pub backend_addr: Option<SocketAddr>,
    pub started_at: Instant,
    kill: CancellationToken,
}

/// One proxy server: a loopback listener, a bounded worker fleet and the pool
/// feeding it. `run` owns the whole lifecycle including drain and
/// force-close.
pub struct ProxyInstance {
    profile: Arc<Profile>,
    pool: Arc<ConnPool>,
    sessions: RwLock<HashMap<u64, TrackedSession>>,
    next_session_id: AtomicU64,
    conn_limit: Arc<Semaphore>,
    shutdown_timeout: Duration,
}

impl ProxyInstance {
    pub fn new(profile: Arc<Profile>, pool: Arc<ConnPool>, shutdown_timeout: Duration) -> Arc<Self> {
        let max_conns = profile.max_conns;
        Arc::new(Self {
            profile,
            pool,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
            conn_limit: Arc::new(Semaphore::new(max_conns)),
            shutdown_timeout,
        })
    }

    pub fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }

    pub async fn run(self: Arc<Self>, ctx: CancellationToken) -> io::Result<()> {
        let listen_addr = self
            .profile
            .listen_socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let listener = TcpListener::bind(listen_addr).await?;
        info!(
            profile = %self.profile.name,
            listen = %listen_addr,
            backend = %self.profile.backend_endpoint(),
            max_conns = self.profile.max_conns,
            db_user = %self.profile.db_user,
            "proxy server listening"
        );

        let workers = TaskTracker::new();
        loop {
            let accepted = tokio::select! {
                _ = ctx.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(profile = %self.profile.name, error = %e, "accept failed");
                    continue;
                }
            };
            let permit = tokio::select! {
                _ = ctx.cancelled() => {
                    drop(stream);
                    break;
                }
                permit = Arc::clone(&self.conn_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
            let kill = CancellationToken::new();
            self.track(id, peer, kill.clone());
            let me = Arc::clone(&self);
            workers.spawn(async move { me.handle_conn(id, stream, peer, kill, permit).await });
        }
        // stop accepting before draining
        drop(listener);

        workers.close();
        if tokio::time::timeout(self.shutdown_timeout, workers.wait())
            .await
            .is_err()
        {
            let (active_count, oldest_age_ms) = self.active_summary();
            warn!(
                profile = %self.profile.name,
                active_count,
                oldest_age_ms,
                "shutdown timeout elapsed; force closing live sessions"
            );
            let closed = self.force_close_all();
            debug!(profile = %self.profile.name, closed, "forced socket close");
            let _ = tokio::time::timeout(FORCE_CLOSE_GRACE, workers.wait()).await;
        }
        self.pool.close().await;
        info!(profile = %self.profile.name, "proxy server stopped");
        Ok(())
    }

    async fn handle_conn(
        self: Arc<Self>,
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        kill: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let started = Instant::now();
        info!(profile = %self.profile.name, session = id, client = %peer, "client connection accepted");

        let outcome = tokio::select! {
            _ = kill.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session force closed during shutdown",
            )),
            outcome = self.serve(id, stream, &kill) => outcome,
        };

        self.untrack(id);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((tx_bytes, rx_bytes)) => {
                info!(
                    profile = %self.profile.name,
                    session = id,
                    client = %peer,
                    tx_bytes,
                    rx_bytes,
                    elapsed_ms,
                    "client session closed"
                );
            }
            Err(e) => {
                warn!(
                    profile = %self.profile.name,
                    session = id,
                    client = %peer,
                    elapsed_ms,
                    error = %e,
                    "client session ended with error"
                );
            }
        }
        // slot released here even if the worker body bailed early
        drop(permit);
    }

    /// Worker body: local handshake, backend borrow, then the raw pipe.
    async fn serve(
        &self,
        id: u64,
        stream: TcpStream,
        kill: &CancellationToken,
    ) -> io::Result<(u64, u64)> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        auth::authenticate_client(&self.profile, id, &mut reader, &mut writer).await?;

        let backend = match self.pool.borrow(kill).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(
                    profile = %self.profile.name,
                    session = id,
                    error = %e,
                    "no backend session available"
                );
                reject_backend_unavailable(&mut reader, &mut writer).await;
                return Err(e);
            }
        };
        self.attach_backend(id, backend.peer());
        debug!(
            profile = %self.profile.name,
            session = id,
            backend = %backend.peer(),
            "forwarding started"
        );

        let outcome = pipe::run_pipe(reader, writer.into_inner(), backend, kill.child_token()).await;
        match outcome.first_error {
            Some(e) if !is_conn_close_err(Some(&e)) => Err(e),
            _ => Ok((outcome.client_to_backend, outcome.backend_to_client)),
        }
    }

    fn track(&self, id: u64, client_addr: SocketAddr, kill: CancellationToken) {
        self.sessions.write().unwrap().insert(
            id,
            TrackedSession {
                id,
                client_addr,
                backend_addr: None,
                started_at: Instant::now(),
                kill,
            },
        );
    }

    fn attach_backend(&self, id: u64, backend_addr: SocketAddr) {
        if let Some(session) = self.sessions.write().unwrap().get_mut(&id) {
            session.backend_addr = Some(backend_addr);
        }
    }

    fn untrack(&self, id: u64) {
        self.sessions.write().unwrap().remove(&id);
    }

    /// (live session count, age of the oldest one in milliseconds)
    pub fn active_summary(&self) -> (usize, u64) {
        let sessions = self.sessions.read().unwrap();
        let oldest_age_ms = sessions
            .values()
            .map(|s| s.started_at.elapsed().as_millis() as u64)
            .max()
            .unwrap_or(0);
        (sessions.len(), oldest_age_ms)
    }

    /// Cancel every live session's sockets. Returns how many sockets were
    /// told to close: client plus backend where one is attached. The snapshot
    /// is taken under the read lock; cancellation happens outside it.
    pub fn force_close_all(&self) -> usize {
        let snapshot: Vec<(CancellationToken, bool)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .map(|s| (s.kill.clone(), s.backend_addr.is_some()))
                .collect()
        };
        let mut closed = 0;
        for (kill, has_backend) in snapshot {
            kill.cancel();
            closed += 1 + usize::from(has_backend);
        }
        closed
    }
}

/// Best-effort protocol-correct refusal: give the client a moment to send
/// its first command, then answer it with an ERR packet instead of a bare
/// socket close.
async fn reject_backend_unavailable<R, W>(
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let first_command = tokio::time::timeout(REJECT_READ_DEADLINE, reader.next_async()).await;
    let seq = match first_command {
        Ok(Ok(Some((seq, _)))) => seq,
        _ => 0,
    };
    writer.set_seq(seq.wrapping_add(1));
    let _ = writers::write_err_packet(ErrorKind::ER_UNKNOWN_ERROR, b"backend unavailable", writer)
        .await;
}
