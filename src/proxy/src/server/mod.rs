pub mod auth;
pub mod pipe;
pub mod proxy_cli_args;
pub mod proxy_srv;
pub mod supervisor;

use mysql_common::constants::CapabilityFlags;
use mysql_common::io::ParseBuf;
use mysql_common::packets::ErrPacket;
use mysql_common::proto::MyDeserialize;
use std::io;
use std::sync::OnceLock;

/// Version banner presented to local clients.
pub const DEFAULT_SERVER_VERSION: &[u8] = b"8.0.36-proxy";

static DEFAULT_CAPABILITIES_ONCE: OnceLock<CapabilityFlags> = OnceLock::new();

// CLIENT_QUERY_ATTRIBUTES, CLIENT_COMPRESS and CLIENT_ZSTD_COMPRESSION_ALGORITHM
// stay out of this set on purpose: all three change command-phase framing,
// and the forwarding pipe moves bytes without looking at them.
pub fn default_capabilities() -> CapabilityFlags {
    *DEFAULT_CAPABILITIES_ONCE.get_or_init(|| {
        CapabilityFlags::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_FOUND_ROWS
            | CapabilityFlags::CLIENT_IGNORE_SIGPIPE
            | CapabilityFlags::CLIENT_IGNORE_SPACE
            | CapabilityFlags::CLIENT_INTERACTIVE
            | CapabilityFlags::CLIENT_LOCAL_FILES
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS
            | CapabilityFlags::CLIENT_NO_SCHEMA
            | CapabilityFlags::CLIENT_ODBC
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_REMEMBER_OPTIONS
            | CapabilityFlags::CLIENT_RESERVED
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_TRANSACTIONS
    })
}

/// Human-readable message out of a server ERR packet, tolerant of payloads
/// that do not deserialize cleanly.
pub fn parse_err_packet_message(pkt: &[u8]) -> String {
    match ErrPacket::deserialize(default_capabilities(), &mut ParseBuf(pkt)) {
        Ok(err_packet) => err_packet.server_error().message_str().to_string(),
        Err(_) => String::from_utf8_lossy(pkt.get(1..).unwrap_or_default()).to_string(),
    }
}

/// Classify errors that merely mean "the other side went away" so a pipe
/// direction ending on one is treated as a clean close. Matching on the
/// message text is fragile across library versions, so the typed kinds are
/// checked first.
pub fn is_conn_close_err(err: Option<&io::Error>) -> bool {
    let Some(err) = err else {
        return false;
    };
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => return true,
        _ => {}
    }
    let message = err.to_string().to_ascii_lowercase();
    message == "eof"
        || message.contains("network closed")
        || message.contains("broken pipe")
        || message.contains("connection reset by peer")
        || message.contains("use of closed network connection")
        || message.contains("closed pipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_leave_pipe_hostile_flags_unset() {
        let caps = default_capabilities();
        assert!(!caps.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES));
        assert!(!caps.contains(CapabilityFlags::CLIENT_COMPRESS));
        assert!(!caps.contains(CapabilityFlags::CLIENT_ZSTD_COMPRESSION_ALGORITHM));
        assert!(caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn close_err_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(is_conn_close_err(Some(&eof)));

        let net_closed = io::Error::new(io::ErrorKind::NotConnected, "network closed");
        assert!(is_conn_close_err(Some(&net_closed)));

        let broken = io::Error::other("write failed: broken pipe");
        assert!(is_conn_close_err(Some(&broken)));

        let reset = io::Error::other("read: connection reset by peer");
        assert!(is_conn_close_err(Some(&reset)));

        let go_style = io::Error::other("use of closed network connection");
        assert!(is_conn_close_err(Some(&go_style)));

        let closed_pipe = io::Error::other("io: read/write on closed pipe");
        assert!(is_conn_close_err(Some(&closed_pipe)));

        let real = io::Error::other("unexpected protocol failure");
        assert!(!is_conn_close_err(Some(&real)));

        assert!(!is_conn_close_err(None));
    }
}
