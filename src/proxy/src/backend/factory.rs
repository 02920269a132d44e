use crate::async_packet_read;
use crate::auth_token::TokenSource;
use crate::backend::{BackendSession, BoxedReader, BoxedWriter, ConnFactory};
use crate::config::Profile;
use crate::protocol::mysql::charset::DEFAULT_COLLATION_ID;
use crate::protocol::mysql::constants::AuthPluginName;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::server::{default_capabilities, parse_err_packet_message};

use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::CapabilityFlags;
use mysql_common::io::ParseBuf;
use mysql_common::packets::{AuthPlugin, HandshakePacket, HandshakeResponse};
use mysql_common::proto::{MyDeserialize, MySerialize};
use mysql_common::scramble::scramble_native;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{rustls, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Per-profile helper that turns a cached auth token into a live TLS backend
/// session. Stateless across calls; the TLS client config is assembled once
/// at startup and fails fast when the trust bundle is unusable.
pub struct BackendFactory {
    profile: Arc<Profile>,
    tokens: Arc<dyn TokenSource>,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFactory")
            .field("profile", &self.profile)
            .field("server_name", &self.server_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl BackendFactory {
    pub fn new(
        profile: Arc<Profile>,
        tokens: Arc<dyn TokenSource>,
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        let pem = std::fs::read(&profile.tls_ca_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("cannot read trust bundle {}: {e}", profile.tls_ca_path.display()),
            )
        })?;
        let mut roots = RootCertStore::empty();
        let mut parsed = 0usize;
        for cert in rustls_pemfile::certs(&mut &pem[..]).flatten() {
            if roots.add(cert).is_ok() {
                parsed += 1;
            }
        }
        if parsed == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "trust bundle {} holds no usable certificates",
                    profile.tls_ca_path.display()
                ),
            ));
        }

        // TLS 1.2 is the floor; the parsed bundle is the only root set.
        let tls_config = ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_root_certificates(roots)
        .with_no_client_auth();

        let server_name = ServerName::try_from(profile.backend_host.clone()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("backend host {:?} is not a valid TLS server name", profile.backend_host),
            )
        })?;

        Ok(Self {
            profile,
            tokens,
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            connect_timeout,
        })
    }

    /// Capabilities offered to the backend: the proxy's base set intersected
    /// with what the server advertised. Query attributes and both compression
    /// schemes are never offered; negotiating them would put framing into the
    /// command phase that the raw byte pipe cannot follow.
    fn backend_capabilities(&self, server_caps: CapabilityFlags) -> CapabilityFlags {
        let mut flags = default_capabilities() & server_caps;
        flags.insert(
            CapabilityFlags::CLIENT_SSL
                | CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH,
        );
        flags.remove(
            CapabilityFlags::CLIENT_QUERY_ATTRIBUTES
                | CapabilityFlags::CLIENT_COMPRESS
                | CapabilityFlags::CLIENT_ZSTD_COMPRESSION_ALGORITHM
                | CapabilityFlags::CLIENT_CONNECT_ATTRS,
        );
        if self.profile.default_database.is_some() {
            flags.insert(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
        } else {
            flags.remove(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
        }
        flags
    }

    async fn open_session(&self, token: &str) -> io::Result<BackendSession> {
        let endpoint = self.profile.backend_endpoint();
        let mut tcp = TcpStream::connect(&endpoint).await?;
        let peer = tcp.peer_addr()?;

        // plaintext phase: greeting, then SSLRequest
        let (greeting_seq, greeting_pkt) = {
            let mut reader = PacketReader::new(&mut tcp);
            async_packet_read!(reader)
        };
        let greeting = HandshakePacket::deserialize((), &mut ParseBuf(&greeting_pkt))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad backend greeting: {e}")))?;
        let server_caps = greeting.capabilities();
        if !server_caps.contains(CapabilityFlags::CLIENT_SSL) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("backend {endpoint} does not offer TLS"),
            ));
        }
        let nonce = greeting.nonce();
        let client_flags = self.backend_capabilities(server_caps);
        {
            let mut writer = PacketWriter::new(&mut tcp);
            writer.set_seq(greeting_seq.wrapping_add(1));
            writer.write_u32::<LittleEndian>(client_flags.bits())?;
            writer.write_u32::<LittleEndian>(MAX_PACKET_SIZE)?;
            writer.write_u8(DEFAULT_COLLATION_ID)?;
            writer.write_all(&[0u8; 23])?;
            writer.end_packet().await?;
            writer.flush_all().await?;
        }

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        let (read_half, write_half) = tokio::io::split(tls);
        let mut reader = PacketReader::new(Box::new(read_half) as BoxedReader);
        let mut writer = PacketWriter::new(Box::new(write_half) as BoxedWriter);
        writer.set_seq(greeting_seq.wrapping_add(2));

        let scramble = scramble_native(&nonce, token.as_bytes());
        let response = HandshakeResponse::new(
            scramble.as_ref().map(|s| &s[..]),
            (8, 0, 36),
            Some(self.profile.db_user.as_bytes()),
            self.profile.default_database.as_deref().map(str::as_bytes),
            Some(AuthPlugin::MysqlNativePassword),
            client_flags,
            None,
            MAX_PACKET_SIZE,
        );
        let mut payload = Vec::new();
        response.serialize(&mut payload);
        writer.write_all(&payload)?;
        writer.end_packet().await?;
        writer.flush_all().await?;

        self.finish_auth(&mut reader, &mut writer, token).await?;
        debug!(backend = %endpoint, "backend session established");
        Ok(BackendSession::new(reader, writer, peer))
    }

    /// Drive the authentication exchange to its OK packet, honoring auth
    /// switches. Managed IAM backends switch to `mysql_clear_password`, which
    /// is acceptable only because the channel is already TLS.
    async fn finish_auth(
        &self,
        reader: &mut PacketReader<BoxedReader>,
        writer: &mut PacketWriter<BoxedWriter>,
        token: &str,
    ) -> io::Result<()> {
        loop {
            let (seq, pkt) = async_packet_read!(reader);
            if pkt.is_ok_packet() {
                return Ok(());
            }
            if pkt.is_err_packet() {
                let message = parse_err_packet_message(&pkt);
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("backend refused authentication: {message}"),
                ));
            }
            if pkt.is_auth_switch_packet() {
                let (plugin, more_data) = parse_auth_switch(&pkt)?;
                writer.set_seq(seq.wrapping_add(1));
                if plugin == AuthPluginName::AuthClearPassword.as_ref().as_bytes() {
                    writer.write_all(token.as_bytes())?;
                    writer.write_u8(0x00)?;
                } else if plugin == AuthPluginName::AuthNativePassword.as_ref().as_bytes() {
                    if let Some(scramble) = scramble_native(more_data, token.as_bytes()) {
                        writer.write_all(&scramble)?;
                    }
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!(
                            "backend requested unsupported auth plugin {:?}",
                            String::from_utf8_lossy(plugin)
                        ),
                    ));
                }
                writer.end_packet().await?;
                writer.flush_all().await?;
                continue;
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected packet during backend authentication",
            ));
        }
    }
}

fn parse_auth_switch(pkt: &Packet) -> io::Result<(&[u8], &[u8])> {
    let body = &pkt[1..];
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed auth switch request"))?;
    let plugin = &body[..nul];
    let data = &body[nul + 1..];
    Ok((plugin, data.strip_suffix(&[0x00]).unwrap_or(data)))
}

#[async_trait]
impl ConnFactory for BackendFactory {
    async fn new_conn(&self, ctx: &CancellationToken) -> io::Result<BackendSession> {
        let token = self
            .tokens
            .token(&self.profile)
            .await
            .map_err(io::Error::other)?;
        tokio::select! {
            _ = ctx.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "backend connect cancelled",
            )),
            connected = tokio::time::timeout(self.connect_timeout, self.open_session(&token.token)) => {
                connected.map_err(|_| io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("backend connect to {} timed out", self.profile.backend_endpoint()),
                ))?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_token::{CachedToken, TokenError};
    use std::io::Write as _;
    use std::path::PathBuf;

    struct NoToken;

    #[async_trait]
    impl TokenSource for NoToken {
        async fn token(&self, _profile: &Profile) -> Result<CachedToken, TokenError> {
            unreachable!("factory construction never mints")
        }
    }

    fn profile_with_bundle(path: PathBuf) -> Arc<Profile> {
        Arc::new(Profile {
            name: "dev".to_string(),
            listen_addr: "127.0.0.1:3307".to_string(),
            max_conns: 16,
            proxy_user: "local_dev".to_string(),
            proxy_password: "secret".to_string(),
            backend_host: "db.cluster.eu-west-1.rds.amazonaws.com".to_string(),
            backend_port: 3306,
            region: "eu-west-1".to_string(),
            db_user: "app_rw".to_string(),
            credential_profile: None,
            default_database: None,
            tls_ca_path: path,
        })
    }

    #[test]
    fn rejects_bundle_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a pem bundle").unwrap();
        let err = BackendFactory::new(
            profile_with_bundle(file.path().to_path_buf()),
            Arc::new(NoToken),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_missing_bundle() {
        let err = BackendFactory::new(
            profile_with_bundle(PathBuf::from("/nonexistent/bundle.pem")),
            Arc::new(NoToken),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn auth_switch_parse_splits_plugin_and_nonce() {
        let mut raw = vec![0xfe];
        raw.extend_from_slice(b"mysql_clear_password\0");
        let pkt = Packet::from_vec(raw);
        let (plugin, data) = parse_auth_switch(&pkt).unwrap();
        assert_eq!(plugin, b"mysql_clear_password");
        assert!(data.is_empty());

        let mut raw = vec![0xfe];
        raw.extend_from_slice(b"mysql_native_password\0");
        raw.extend_from_slice(&[7u8; 20]);
        raw.push(0x00);
        let pkt = Packet::from_vec(raw);
        let (plugin, data) = parse_auth_switch(&pkt).unwrap();
        assert_eq!(plugin, b"mysql_native_password");
        assert_eq!(data, &[7u8; 20]);
    }
}
