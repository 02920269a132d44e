use crate::async_packet_read;
use crate::config::Profile;
use crate::protocol::mysql::basic::{client_handshake_response, OkPacket};
use crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword;
use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{packet_reader::PacketReader, writers};
use crate::server::{default_capabilities, DEFAULT_SERVER_VERSION};

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::scramble::scramble_native;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Error};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// Generate a random scramble from printable-ish ASCII, avoiding the two
/// bytes the protocol treats specially.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(0..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

/// Check one `mysql_native_password` response against the static profile
/// password and the salt this server handed out.
fn native_response_matches(password: &str, salt: &[u8], auth_response: &[u8]) -> bool {
    match scramble_native(salt, password.as_bytes()) {
        Some(expected) => auth_response == expected.as_slice(),
        // empty password scrambles to nothing
        None => auth_response.is_empty(),
    }
}

async fn deny<W: AsyncWrite + Send + Unpin>(
    writer: &mut PacketWriter<W>,
    seq: u8,
    user: &str,
) -> Error {
    let message = format!("Access denied for user {user:?}");
    writer.set_seq(seq.wrapping_add(1));
    if let Err(e) =
        writers::write_err_packet(ErrorKind::ER_ACCESS_DENIED_ERROR, message.as_bytes(), writer)
            .await
    {
        return e;
    }
    Error::new(io::ErrorKind::PermissionDenied, message)
}

/// Server side of the MySQL connection phase against a local desktop client:
/// greeting, handshake response, static credential check, final OK. Clients
/// arriving with another auth plugin (or withholding the response) get an
/// AuthSwitchRequest to `mysql_native_password` first.
pub async fn authenticate_client<R, W>(
    profile: &Profile,
    conn_id: u64,
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
) -> Result<(), Error>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let salt = gen_user_salt();
    writers::write_initial_handshake(
        writer,
        conn_id,
        salt,
        DEFAULT_SERVER_VERSION,
        default_capabilities(),
    )
    .await?;

    let (mut seq, handshake_pkt) = async_packet_read!(reader);
    let (_, handshake) = client_handshake_response(&handshake_pkt).map_err(|e| {
        Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed handshake response: {e:?}"),
        )
    })?;

    if handshake.wants_tls() {
        // the loopback listener never advertises CLIENT_SSL
        let denied = deny(writer, seq, "<ssl>").await;
        warn!(conn = conn_id, "client requested TLS on the loopback listener");
        return Err(denied);
    }
    if !handshake
        .client_flag
        .contains(CapabilityFlags::CLIENT_PROTOCOL_41)
    {
        writer.set_seq(seq.wrapping_add(1));
        writers::write_err_packet(
            ErrorKind::ER_ACCESS_DENIED_ERROR,
            b"client too old: CLIENT_PROTOCOL_41 is required",
            writer,
        )
        .await?;
        return Err(Error::new(
            io::ErrorKind::ConnectionAborted,
            "client lacks CLIENT_PROTOCOL_41",
        ));
    }

    let username = handshake.username_str();
    if username != profile.proxy_user {
        return Err(deny(writer, seq, &username).await);
    }

    let mut auth_response = handshake.auth_response.clone();
    let desired_plugin = AuthNativePassword.as_ref();
    if auth_response.is_empty() || handshake.auth_plugin != desired_plugin.as_bytes() {
        // switch the client onto our plugin; it re-scrambles over the same salt
        writer.set_seq(seq.wrapping_add(1));
        writers::write_auth_switch_request(writer, desired_plugin, &salt).await?;
        let (switch_seq, switch_pkt) = async_packet_read!(reader);
        seq = switch_seq;
        auth_response = switch_pkt.to_vec();
    }

    if !native_response_matches(&profile.proxy_password, &salt, &auth_response) {
        return Err(deny(writer, seq, &username).await);
    }

    writer.set_seq(seq.wrapping_add(1));
    writers::write_ok_packet_with_client_flags(
        writer,
        handshake.client_flag,
        OkPacket {
            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_avoids_reserved_bytes() {
        for _ in 0..64 {
            let salt = gen_user_salt();
            assert!(salt.iter().all(|&b| b != b'\0' && b != b'$'));
        }
    }

    #[test]
    fn native_scramble_round_trip() {
        let salt = gen_user_salt();
        let scrambled = scramble_native(&salt, b"local_proxy_pass").unwrap();
        assert!(native_response_matches("local_proxy_pass", &salt, &scrambled));
        assert!(!native_response_matches("wrong", &salt, &scrambled));
    }

    #[test]
    fn empty_password_expects_empty_response() {
        let salt = gen_user_salt();
        assert!(native_response_matches("", &salt, &[]));
        assert!(!native_response_matches("", &salt, &[1, 2, 3]));
    }
}
