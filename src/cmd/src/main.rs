use clap::Parser;
use proxy::auth_token::rds::{AwsProviderLoader, RdsTokenBuilder};
use proxy::auth_token::{TokenCache, TokenCacheConfig};
use proxy::config;
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::supervisor::Supervisor;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_args = ProxyServerArgs::parse();
    let log_level_string = proxy_args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    // setup tracing; the AWS crates are chatty at debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into())
        .add_directive("aws_config=WARN".parse().unwrap())
        .add_directive("aws_smithy_runtime=WARN".parse().unwrap())
        .add_directive("hyper=WARN".parse().unwrap())
        .add_directive("rustls=WARN".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RDS_PROXY")
        .worker_threads(proxy_args.works)
        .build()?;

    info!("rds-proxy starting, args={proxy_args:?}");
    let exit = runtime.block_on(async {
        let tuning = proxy_args.tuning();
        let profiles = config::load_profiles(&proxy_args.config)?;
        let selected = config::select_profiles(profiles, &proxy_args.profile)?;
        config::validate_profiles(&selected)?;
        info!(
            profiles = selected.len(),
            "profiles loaded and validated"
        );

        let tokens = Arc::new(TokenCache::new(
            Arc::new(AwsProviderLoader),
            Arc::new(RdsTokenBuilder),
            TokenCacheConfig {
                refresh_before: tuning.token_refresh_before,
                token_ttl: tuning.token_ttl,
            },
        ));

        Supervisor::new(selected, tuning, tokens).run().await
    });

    if let Err(e) = exit {
        error!(error = %e, "rds-proxy exited with fatal error");
        std::process::exit(1);
    }
    Ok(())
}
