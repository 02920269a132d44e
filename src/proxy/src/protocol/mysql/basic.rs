use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information
    pub session_state_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub table: String,
    pub column: String,
    pub column_type: mysql_common::constants::ColumnType,
    pub column_flags: mysql_common::constants::ColumnFlags,
}

/// `HandshakeResponse` represents the client's reply to the server greeting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<HashMap<String, String>>,
}

impl HandshakeResponse {
    pub fn username_str(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }

    pub fn wants_tls(&self) -> bool {
        self.client_flag.contains(CapabilityFlags::CLIENT_SSL)
    }
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

/// Parse a HandshakeResponse41 (or the legacy 320 form) out of the packet the
/// client sends after the greeting. A bare SSLRequest (CLIENT_SSL set, body
/// ending after the filler) parses to a response without a username; the auth
/// layer rejects it, since the loopback listener does not speak TLS.
pub fn client_handshake_response(i: &[u8]) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;
        return Ok((
            &b""[..],
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: i.to_vec(),
                auth_plugin: vec![],
                database: None,
                connect_attributes: None,
            },
        ));
    }

    // HandshakeResponse41
    let (i, cap2) = le_u16.parse_peek(i)?;
    let cap = (cap2 as u32) << 16 | capability_flags as u32;
    let capabilities = CapabilityFlags::from_bits_truncate(cap);

    let (i, max_packet_len) = le_u32.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, _) = take(23u8).parse_peek(i)?;

    if i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SSL) {
        // SSLRequest: nothing past the filler
        return Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation),
                username: None,
                auth_response: vec![],
                auth_plugin: vec![],
                database: None,
                connect_attributes: None,
            },
        ));
    }

    let (i, username) = take_until(1.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;

    let (i, auth_response) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            let (i, size) = read_length_encoded_number(i)?;
            take(size).parse_peek(i)?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let (i, size) = le_u8.parse_peek(i)?;
            take(size).parse_peek(i)?
        } else {
            take_until(1.., "\0").parse_peek(i)?
        };

    let (i, database) =
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty() {
            let (i, db) = take_until(1.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, Some(db.to_vec()))
        } else {
            (i, None)
        };

    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, auth_plugin) = take_until(1.., "\0").parse_peek(i)?;
            let (i, _) = literal("\0").parse_peek(i)?;
            (i, auth_plugin)
        } else {
            (i, &b""[..])
        };

    let (i, connect_attributes) =
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
            let (i, data_len) = read_length_encoded_number(i)?;
            let (i, data) = take(data_len).parse_peek(i)?;
            let mut input = data;
            let mut connect_attributes = HashMap::new();
            while !input.is_empty() {
                let (remaining, k) = read_length_encoded_string(input)?;
                let (remaining, v) = read_length_encoded_string(remaining)?;
                connect_attributes.insert(
                    String::from_utf8_lossy(k).to_string(),
                    String::from_utf8_lossy(v).to_string(),
                );
                input = remaining;
            }
            (i, Some(connect_attributes))
        } else {
            (i, None)
        };

    Ok((
        i,
        HandshakeResponse {
            client_flag: capabilities,
            max_packet_len,
            collation: u16::from(collation),
            username: Some(username.to_vec()),
            auth_response: auth_response.to_vec(),
            auth_plugin: auth_plugin.to_vec(),
            database,
            connect_attributes,
        },
    ))
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::basic::client_handshake_response;
    use crate::protocol::mysql::charset::UTF8_GENERAL_CI;
    use mysql_common::constants::CapabilityFlags;

    #[test]
    pub fn test_handshake_parse() {
        // payload of a HandshakeResponse41 from a stock client, user "default"
        let payload = &[
            0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x14, 0xf7,
            0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d, 0x18, 0xc7, 0xa4, 0xe8,
            0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x6d,
            0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76, 0x65, 0x5f, 0x70, 0x61,
            0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let (_, handshake) = client_handshake_response(payload).unwrap();
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(handshake.collation, UTF8_GENERAL_CI as u16);
        assert_eq!(handshake.username.unwrap(), &b"default"[..]);
        assert_eq!(handshake.auth_response.len(), 20);
        assert_eq!(handshake.database.unwrap(), &b"default"[..]);
        assert_eq!(handshake.auth_plugin, &b"mysql_native_password"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[test]
    pub fn test_ssl_request_parses_without_username() {
        // 32-byte SSLRequest body: CLIENT_SSL | CLIENT_PROTOCOL_41 plus filler
        let mut payload = vec![0x85, 0xae, 0x3f, 0x20, 0x00, 0x00, 0x00, 0x01, 0x21];
        payload.extend_from_slice(&[0u8; 23]);
        let (_, handshake) = client_handshake_response(&payload).unwrap();
        assert!(handshake.wants_tls());
        assert!(handshake.username.is_none());
    }

    #[test]
    pub fn test_lenenc_numbers() {
        use super::read_length_encoded_number;
        assert_eq!(read_length_encoded_number(&[0x05]).unwrap().1, 5);
        assert_eq!(
            read_length_encoded_number(&[0xfc, 0x10, 0x01]).unwrap().1,
            0x110
        );
        assert_eq!(
            read_length_encoded_number(&[0xfd, 0x01, 0x00, 0x01])
                .unwrap()
                .1,
            0x010001
        );
    }
}
