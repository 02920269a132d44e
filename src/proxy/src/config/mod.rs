use itertools::Itertools;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `max_conns`, regardless of what the profile file asks for.
pub const MAX_CONNS_HARD_CAP: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read profile file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profile file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("profile {profile}: listen_addr {addr:?} is not a valid host:port address")]
    BadListenAddr { profile: String, addr: String },
    #[error("profile {profile}: listen_addr {addr} must be an IP loopback address")]
    NotLoopback { profile: String, addr: SocketAddr },
    #[error("profile {profile}: max_conns {value} out of range (1..={MAX_CONNS_HARD_CAP})")]
    MaxConnsRange { profile: String, value: usize },
    #[error("profile {profile}: proxy_user must differ from the backend db_user {user:?}")]
    UserClash { profile: String, user: String },
    #[error("duplicate profile name {0:?}")]
    DuplicateName(String),
    #[error("proxy_user {0:?} is used by more than one profile")]
    DuplicateProxyUser(String),
    #[error("listen_addr {0:?} is used by more than one profile")]
    DuplicateListenAddr(String),
    #[error("no profile named {0:?} in the profile file")]
    UnknownProfile(String),
    #[error("pool_size must be at least 1")]
    PoolSizeRange,
}

/// One proxy instance worth of configuration. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub name: String,
    /// loopback host:port the proxy listens on
    pub listen_addr: String,
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// static credentials desktop clients use against the proxy
    pub proxy_user: String,
    pub proxy_password: String,
    pub backend_host: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    pub region: String,
    /// database account authenticated with the minted token
    pub db_user: String,
    /// named credential profile for the SDK chain, if not the default one
    #[serde(default)]
    pub credential_profile: Option<String>,
    #[serde(default)]
    pub default_database: Option<String>,
    /// PEM bundle anchoring backend certificate verification
    pub tls_ca_path: PathBuf,
}

fn default_max_conns() -> usize {
    32
}

fn default_backend_port() -> u16 {
    3306
}

impl Profile {
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::BadListenAddr {
                profile: self.name.clone(),
                addr: self.listen_addr.clone(),
            })
    }

    pub fn backend_endpoint(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let addr = self.listen_socket_addr()?;
        if !addr.ip().is_loopback() {
            return Err(ConfigError::NotLoopback {
                profile: self.name.clone(),
                addr,
            });
        }
        if self.max_conns < 1 || self.max_conns > MAX_CONNS_HARD_CAP {
            return Err(ConfigError::MaxConnsRange {
                profile: self.name.clone(),
                value: self.max_conns,
            });
        }
        if self.proxy_user == self.db_user {
            return Err(ConfigError::UserClash {
                profile: self.name.clone(),
                user: self.db_user.clone(),
            });
        }
        Ok(())
    }
}

/// Knobs shared by every proxy instance in the process. Built from CLI flags;
/// the defaults match the managed-database token lifetime (15m) with headroom.
#[derive(Debug, Clone)]
pub struct ProxyTuning {
    pub pool_size: usize,
    pub max_session_age: Duration,
    pub refill_timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub token_refresh_before: Duration,
    pub token_ttl: Duration,
}

impl Default for ProxyTuning {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_session_age: Duration::from_secs(5 * 60),
            refill_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            token_refresh_before: Duration::from_secs(2 * 60),
            token_ttl: Duration::from_secs(10 * 60),
        }
    }
}

impl ProxyTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size < 1 {
            return Err(ConfigError::PoolSizeRange);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    profiles: Vec<Profile>,
}

pub fn load_profiles(path: &Path) -> Result<Vec<Profile>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ProfileFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.profiles)
}

/// Pick the named profiles out of `all`, keeping file order. An empty name
/// list selects everything.
pub fn select_profiles(all: Vec<Profile>, names: &[String]) -> Result<Vec<Profile>, ConfigError> {
    if names.is_empty() {
        return Ok(all);
    }
    for name in names {
        if !all.iter().any(|p| &p.name == name) {
            return Err(ConfigError::UnknownProfile(name.clone()));
        }
    }
    Ok(all
        .into_iter()
        .filter(|p| names.contains(&p.name))
        .collect())
}

/// Per-profile checks plus the cross-profile uniqueness rules. Any violation
/// is startup-fatal.
pub fn validate_profiles(profiles: &[Profile]) -> Result<(), ConfigError> {
    for profile in profiles {
        profile.validate()?;
    }
    if let Some(name) = profiles.iter().map(|p| &p.name).duplicates().next() {
        return Err(ConfigError::DuplicateName(name.clone()));
    }
    if let Some(user) = profiles.iter().map(|p| &p.proxy_user).duplicates().next() {
        return Err(ConfigError::DuplicateProxyUser(user.clone()));
    }
    if let Some(addr) = profiles.iter().map(|p| &p.listen_addr).duplicates().next() {
        return Err(ConfigError::DuplicateListenAddr(addr.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, listen: &str, proxy_user: &str) -> Profile {
        Profile {
            name: name.to_string(),
            listen_addr: listen.to_string(),
            max_conns: 16,
            proxy_user: proxy_user.to_string(),
            proxy_password: "secret".to_string(),
            backend_host: "db.cluster.eu-west-1.rds.amazonaws.com".to_string(),
            backend_port: 3306,
            region: "eu-west-1".to_string(),
            db_user: "app_rw".to_string(),
            credential_profile: None,
            default_database: None,
            tls_ca_path: PathBuf::from("/tmp/bundle.pem"),
        }
    }

    #[test]
    fn accepts_loopback() {
        let p = profile("dev", "127.0.0.1:3307", "local");
        assert!(validate_profiles(&[p]).is_ok());
    }

    #[test]
    fn rejects_non_loopback_listen_addr() {
        let p = profile("dev", "0.0.0.0:3307", "local");
        assert!(matches!(
            validate_profiles(&[p]),
            Err(ConfigError::NotLoopback { .. })
        ));
    }

    #[test]
    fn rejects_max_conns_above_hard_cap() {
        let mut p = profile("dev", "127.0.0.1:3307", "local");
        p.max_conns = MAX_CONNS_HARD_CAP + 1;
        assert!(matches!(
            validate_profiles(&[p]),
            Err(ConfigError::MaxConnsRange { .. })
        ));
    }

    #[test]
    fn rejects_zero_max_conns() {
        let mut p = profile("dev", "127.0.0.1:3307", "local");
        p.max_conns = 0;
        assert!(matches!(
            validate_profiles(&[p]),
            Err(ConfigError::MaxConnsRange { .. })
        ));
    }

    #[test]
    fn rejects_proxy_user_equal_to_db_user() {
        let mut p = profile("dev", "127.0.0.1:3307", "local");
        p.proxy_user = p.db_user.clone();
        assert!(matches!(
            validate_profiles(&[p]),
            Err(ConfigError::UserClash { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_proxy_users_across_profiles() {
        let a = profile("dev", "127.0.0.1:3307", "local");
        let b = profile("staging", "127.0.0.1:3308", "local");
        assert!(matches!(
            validate_profiles(&[a, b]),
            Err(ConfigError::DuplicateProxyUser(_))
        ));
    }

    #[test]
    fn rejects_duplicate_listen_addrs_across_profiles() {
        let a = profile("dev", "127.0.0.1:3307", "local-a");
        let b = profile("staging", "127.0.0.1:3307", "local-b");
        assert!(matches!(
            validate_profiles(&[a, b]),
            Err(ConfigError::DuplicateListenAddr(_))
        ));
    }

    #[test]
    fn select_rejects_unknown_name() {
        let all = vec![profile("dev", "127.0.0.1:3307", "local")];
        let err = select_profiles(all, &["prod".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProfile(_)));
    }

    #[test]
    fn parses_profile_yaml() {
        let yaml = r#"
profiles:
  - name: dev
    listen_addr: "127.0.0.1:3307"
    proxy_user: local_dev
    proxy_password: s3cret
    backend_host: db.cluster.eu-west-1.rds.amazonaws.com
    region: eu-west-1
    db_user: app_rw
    default_database: app
    tls_ca_path: /etc/pki/rds-bundle.pem
"#;
        let file: ProfileFile = serde_yaml::from_str(yaml).unwrap();
        let p = &file.profiles[0];
        assert_eq!(p.name, "dev");
        assert_eq!(p.backend_port, 3306);
        assert_eq!(p.max_conns, 32);
        assert_eq!(p.default_database.as_deref(), Some("app"));
        assert!(p.credential_profile.is_none());
    }
}
