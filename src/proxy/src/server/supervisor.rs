use crate::auth_token::TokenSource;
use crate::backend::factory::BackendFactory;
use crate::backend::pool::{ConnPool, PoolConfig};
use crate::config::{self, Profile, ProxyTuning};
use crate::server::proxy_srv::ProxyInstance;

use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs one proxy server per selected profile under a single cancellation
/// scope. The first interrupt starts a graceful drain; a second one exits the
/// process with code 130. The first instance error cancels everything else
/// and becomes the supervisor's result.
pub struct Supervisor {
    profiles: Vec<Profile>,
    tuning: ProxyTuning,
    tokens: Arc<dyn TokenSource>,
}

impl Supervisor {
    pub fn new(profiles: Vec<Profile>, tuning: ProxyTuning, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            profiles,
            tuning,
            tokens,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let root = CancellationToken::new();
        spawn_signal_watcher(root.clone());
        self.run_scoped(root).await
    }

    /// Same as [`run`](Supervisor::run) but under a caller-owned scope; used
    /// directly by tests that drive shutdown programmatically.
    pub async fn run_scoped(self, root: CancellationToken) -> anyhow::Result<()> {
        self.tuning.validate()?;
        config::validate_profiles(&self.profiles)?;

        // build everything first so a bad profile means no partial launch
        let mut instances = Vec::with_capacity(self.profiles.len());
        for profile in self.profiles {
            let profile = Arc::new(profile);
            let factory = BackendFactory::new(
                Arc::clone(&profile),
                Arc::clone(&self.tokens),
                self.tuning.connect_timeout,
            )
            .with_context(|| format!("profile {:?}: backend factory setup failed", profile.name))?;
            let pool = ConnPool::new(
                PoolConfig {
                    size: self.tuning.pool_size,
                    max_session_age: self.tuning.max_session_age,
                    refill_timeout: self.tuning.refill_timeout,
                },
                Arc::new(factory),
            );
            let instance = ProxyInstance::new(profile, pool, self.tuning.shutdown_timeout);
            instances.push(instance);
        }

        let mut servers = JoinSet::new();
        for instance in instances {
            instance.pool().start();
            servers.spawn(instance.run(root.child_token()));
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(finished) = servers.join_next().await {
            let failure = match finished {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(anyhow::Error::from(e)),
                Err(join_error) => Some(anyhow::anyhow!("proxy server task failed: {join_error}")),
            };
            if let Some(e) = failure {
                error!(error = %e, "proxy server failed; shutting the rest down");
                root.cancel();
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("all proxy servers stopped");
                Ok(())
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
    }
}

fn spawn_signal_watcher(root: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("starting graceful shutdown; interrupt again to force exit");
        root.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; exiting immediately");
            std::process::exit(130);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_token::{CachedToken, TokenError};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct NoTokens;

    #[async_trait]
    impl TokenSource for NoTokens {
        async fn token(&self, _profile: &Profile) -> Result<CachedToken, TokenError> {
            unreachable!("supervisor tests never mint")
        }
    }

    fn test_profile(listen: &str) -> Profile {
        Profile {
            name: "dev".to_string(),
            listen_addr: listen.to_string(),
            max_conns: 4,
            proxy_user: "local_dev".to_string(),
            proxy_password: "secret".to_string(),
            backend_host: "db.example.internal".to_string(),
            backend_port: 3306,
            region: "eu-west-1".to_string(),
            db_user: "app_rw".to_string(),
            credential_profile: None,
            default_database: None,
            tls_ca_path: PathBuf::from("/nonexistent/bundle.pem"),
        }
    }

    #[tokio::test]
    async fn unreadable_trust_bundle_fails_before_any_launch() {
        let supervisor = Supervisor::new(
            vec![test_profile("127.0.0.1:0")],
            ProxyTuning::default(),
            Arc::new(NoTokens),
        );
        let err = supervisor
            .run_scoped(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("backend factory setup failed"));
    }

    #[tokio::test]
    async fn non_loopback_profile_is_startup_fatal() {
        let supervisor = Supervisor::new(
            vec![test_profile("0.0.0.0:3311")],
            ProxyTuning::default(),
            Arc::new(NoTokens),
        );
        let err = supervisor
            .run_scoped(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[tokio::test]
    async fn zero_pool_size_is_startup_fatal() {
        let supervisor = Supervisor::new(
            vec![test_profile("127.0.0.1:0")],
            ProxyTuning {
                pool_size: 0,
                ..ProxyTuning::default()
            },
            Arc::new(NoTokens),
        );
        assert!(supervisor
            .run_scoped(CancellationToken::new())
            .await
            .is_err());
    }
}
