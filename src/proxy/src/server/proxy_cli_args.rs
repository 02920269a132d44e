use crate::config::ProxyTuning;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "rds-proxy",
    version,
    about = "loopback MySQL proxy for IAM-authenticated cloud databases."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    /// YAML profile file
    #[clap(long, short = 'c', value_name = "CONFIG")]
    pub config: PathBuf,
    /// profile names to serve; repeatable, empty serves every profile
    #[clap(long, value_name = "PROFILE")]
    pub profile: Vec<String>,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    #[clap(long, default_value_t = 4)]
    pub pool_size: usize,
    #[clap(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub max_session_age: Duration,
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub refill_timeout: Duration,
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,
    /// re-mint tokens with less than this much lifetime left
    #[clap(long, default_value = "2m", value_parser = humantime::parse_duration)]
    pub token_refresh_before: Duration,
    /// local lifetime stamped onto minted tokens
    #[clap(long, default_value = "10m", value_parser = humantime::parse_duration)]
    pub token_ttl: Duration,
}

impl ProxyServerArgs {
    pub fn tuning(&self) -> ProxyTuning {
        ProxyTuning {
            pool_size: self.pool_size,
            max_session_age: self.max_session_age,
            refill_timeout: self.refill_timeout,
            connect_timeout: self.connect_timeout,
            shutdown_timeout: self.shutdown_timeout,
            token_refresh_before: self.token_refresh_before,
            token_ttl: self.token_ttl,
        }
    }
}
