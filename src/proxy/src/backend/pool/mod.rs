use crate::backend::{BackendSession, ConnFactory, PooledBackend};

use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TrySendError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// prewarmed session target
    pub size: usize,
    /// sessions older than this are discarded on borrow
    pub max_session_age: Duration,
    /// per-refill attempt bound
    pub refill_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_session_age: Duration::from_secs(5 * 60),
            refill_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounded pool of prewarmed single-use backend sessions. Slots move through
/// a bounded channel in strictly non-blocking mode; every borrow consumes a
/// slot and queues one refill, so the pool drifts back toward its target
/// size. A borrowed session belongs to the caller, ping-verified, and must be
/// closed by the caller.
pub struct ConnPool {
    config: PoolConfig,
    factory: Arc<dyn ConnFactory>,
    slots_tx: mpsc::Sender<PooledBackend>,
    slots_rx: Mutex<mpsc::Receiver<PooledBackend>>,
    refill_scope: CancellationToken,
    closed: RwLock<bool>,
}

impl ConnPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnFactory>) -> Arc<Self> {
        let (slots_tx, slots_rx) = mpsc::channel(config.size.max(1));
        Arc::new(Self {
            config,
            factory,
            slots_tx,
            slots_rx: Mutex::new(slots_rx),
            refill_scope: CancellationToken::new(),
            closed: RwLock::new(false),
        })
    }

    /// Queue one refill attempt per slot.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.config.size {
            self.spawn_refill();
        }
    }

    fn spawn_refill(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.fill_one().await });
    }

    /// Single connect attempt; no retry. Failures are routine while the
    /// backend is sick and get one compact warning each.
    async fn fill_one(self: Arc<Self>) {
        if *self.closed.read().unwrap() {
            return;
        }
        let attempt = tokio::select! {
            _ = self.refill_scope.cancelled() => return,
            outcome = tokio::time::timeout(
                self.config.refill_timeout,
                self.factory.new_conn(&self.refill_scope),
            ) => outcome,
        };
        let session = match attempt {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "pool refill failed");
                return;
            }
            Err(_) => {
                warn!(timeout = ?self.config.refill_timeout, "pool refill timed out");
                return;
            }
        };
        if let Err(TrySendError::Full(rejected)) | Err(TrySendError::Closed(rejected)) =
            self.slots_tx.try_send(PooledBackend::new(session))
        {
            // lost the race for the last free slot
            let _ = rejected.session.close().await;
        }
    }

    fn try_take(&self) -> Option<PooledBackend> {
        match self.slots_rx.lock().unwrap().try_recv() {
            Ok(pooled) => Some(pooled),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Borrow one live session: fast path from the prewarmed slots, slow path
    /// straight through the factory when the pool is dry. Over-age or
    /// ping-dead slots are discarded and backfilled until a live one turns
    /// up.
    pub async fn borrow(self: &Arc<Self>, ctx: &CancellationToken) -> io::Result<BackendSession> {
        let mut stale_discarded = 0usize;
        let mut last_reason = String::new();
        let outcome = self
            .borrow_inner(ctx, &mut stale_discarded, &mut last_reason)
            .await;
        // exactly one aggregated line per borrow, and only when something
        // was thrown away
        if stale_discarded > 0 {
            info!(
                discarded = stale_discarded,
                last_reason = %last_reason,
                "refreshed stale pooled connections"
            );
        }
        outcome
    }

    async fn borrow_inner(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stale_discarded: &mut usize,
        last_reason: &mut String,
    ) -> io::Result<BackendSession> {
        loop {
            if ctx.is_cancelled() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "borrow cancelled",
                ));
            }
            let Some(mut pooled) = self.try_take() else {
                // pool is dry: pay for a connect inline
                return tokio::select! {
                    _ = ctx.cancelled() => Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "borrow cancelled",
                    )),
                    fresh = self.factory.new_conn(ctx) => fresh,
                };
            };
            if pooled.created_at.elapsed() > self.config.max_session_age {
                *stale_discarded += 1;
                *last_reason = "max session age exceeded".to_string();
                debug!(
                    age = ?pooled.created_at.elapsed(),
                    "discarding over-age pooled session"
                );
                let _ = pooled.session.close().await;
                self.spawn_refill();
                continue;
            }
            match pooled.session.ping().await {
                Ok(()) => {
                    // backfill the slot this borrow consumes
                    self.spawn_refill();
                    return Ok(pooled.session);
                }
                Err(e) => {
                    *stale_discarded += 1;
                    *last_reason = e.to_string();
                    debug!(error = %e, "discarding dead pooled session");
                    let _ = pooled.session.close().await;
                    self.spawn_refill();
                }
            }
        }
    }

    /// Idempotent: flips the closed flag, stops refills, drains and closes
    /// whatever is still pooled.
    pub async fn close(&self) {
        {
            let mut closed = self.closed.write().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.refill_scope.cancel();
        loop {
            let drained = self.slots_rx.lock().unwrap().try_recv();
            match drained {
                Ok(pooled) => {
                    let _ = pooled.session.close().await;
                }
                Err(_) => break,
            }
        }
        debug!("backend pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxedReader, BoxedWriter};
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use crate::protocol::mysql::packet::packet_writer::PacketWriter;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:3306".parse().unwrap()
    }

    /// Session wired to an in-memory duplex whose far end answers every
    /// COM_PING with OK (or stays silent when broken).
    fn scripted_session(answer_pings: bool) -> BackendSession {
        let (near, far) = duplex(1024);
        tokio::spawn(async move { ping_responder(far, answer_pings).await });
        let (r, w) = tokio::io::split(near);
        BackendSession::new(
            PacketReader::new(Box::new(r) as BoxedReader),
            PacketWriter::new(Box::new(w) as BoxedWriter),
            test_addr(),
        )
    }

    async fn ping_responder(mut far: DuplexStream, answer: bool) {
        let mut buf = [0u8; 64];
        loop {
            match far.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) if answer => {
                    // OK packet, seq 1
                    let ok = [0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
                    if far.write_all(&ok).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {
                    // broken backend: drop the connection instead of answering
                    return;
                }
            }
        }
    }

    struct ScriptedFactory {
        calls: AtomicUsize,
    }

    impl ScriptedFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnFactory for ScriptedFactory {
        async fn new_conn(&self, _ctx: &CancellationToken) -> io::Result<BackendSession> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(scripted_session(true))
        }
    }

    fn pool_of(size: usize, factory: Arc<ScriptedFactory>) -> Arc<ConnPool> {
        ConnPool::new(
            PoolConfig {
                size,
                max_session_age: Duration::from_secs(5 * 60),
                refill_timeout: Duration::from_secs(2),
            },
            factory,
        )
    }

    #[tokio::test]
    async fn borrow_from_empty_pool_goes_through_factory() {
        let factory = ScriptedFactory::new();
        let pool = pool_of(1, factory.clone());
        let ctx = CancellationToken::new();
        let session = pool.borrow(&ctx).await.unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn stale_slot_is_replaced_and_refilled() {
        let factory = ScriptedFactory::new();
        let pool = ConnPool::new(
            PoolConfig {
                size: 1,
                max_session_age: Duration::from_millis(50),
                refill_timeout: Duration::from_secs(2),
            },
            factory.clone(),
        );
        // seed one already-broken session, created far enough back to be
        // over-age by the time we borrow
        let created_at = Instant::now()
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or_else(Instant::now);
        pool.slots_tx
            .try_send(PooledBackend {
                session: scripted_session(false),
                created_at,
            })
            .ok()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let ctx = CancellationToken::new();
        let mut session = pool.borrow(&ctx).await.unwrap();
        // the stale seed was discarded; what we got is factory-fresh and live
        session.ping().await.unwrap();
        session.close().await.unwrap();

        // the discard queued a refill besides the inline connect
        tokio::time::timeout(Duration::from_secs(2), async {
            while factory.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("refill task never ran");
    }

    #[tokio::test]
    async fn dead_slot_ping_failure_counts_as_stale() {
        let factory = ScriptedFactory::new();
        let pool = pool_of(1, factory.clone());
        pool.slots_tx
            .try_send(PooledBackend::new(scripted_session(false)))
            .ok()
            .unwrap();

        let ctx = CancellationToken::new();
        let session = pool.borrow(&ctx).await.unwrap();
        session.close().await.unwrap();
        assert!(factory.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn cancelled_borrow_returns_interrupted() {
        let factory = ScriptedFactory::new();
        let pool = pool_of(1, factory);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = pool.borrow(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains() {
        let factory = ScriptedFactory::new();
        let pool = pool_of(2, factory);
        pool.slots_tx
            .try_send(PooledBackend::new(scripted_session(true)))
            .ok()
            .unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.try_take().is_none());
    }

    #[tokio::test]
    async fn prewarm_reaches_target_size() {
        let factory = ScriptedFactory::new();
        let pool = pool_of(2, factory.clone());
        pool.start();
        tokio::time::timeout(Duration::from_secs(2), async {
            while factory.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("prewarm never completed");
    }
}
