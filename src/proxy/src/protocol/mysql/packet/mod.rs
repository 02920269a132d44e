pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mysql::constants;
use crate::protocol::mysql::constants::HeaderInfo;
use std::ops::Deref;

use winnow::binary::{le_u24, le_u8};
use winnow::prelude::*;
use winnow::token::take;
use winnow::Partial;

/// `Packet` Represents one logical payload of the MySql wire protocol, with
/// 16M continuation chunks already reassembled.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        let pkt_len = self.0.len();
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && pkt_len <= 5
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    /// AuthSwitchRequest shares the 0xfe header with EOF but always carries a
    /// plugin name, so the length disambiguates.
    pub fn is_auth_switch_packet(&self) -> bool {
        self.0.len() > 5 && self.0[0] == (HeaderInfo::EOFHeader as u8)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

fn one_frame(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, (u8, &[u8])> {
    let (i, length) = le_u24.parse_peek(i)?;
    let (i, seq) = le_u8.parse_peek(i)?;
    let (i, payload) = take(length as usize).parse_peek(i)?;
    Ok((i, (seq, payload)))
}

/// Assemble one logical packet from the head of `i`, following continuation
/// frames while each chunk is exactly `MAX_PAYLOAD_LEN` long. Returns the
/// unconsumed tail, the seq of the final frame and the reassembled payload.
pub fn packet(i: &[u8]) -> IResult<Partial<&[u8]>, (u8, Packet)> {
    let mut input = Partial::new(i);
    let mut assembled: Option<Vec<u8>> = None;
    loop {
        let (rest, (seq, chunk)) = one_frame(input)?;
        input = rest;
        let last = chunk.len() < constants::MAX_PAYLOAD_LEN;
        match assembled {
            Some(ref mut buf) => buf.extend_from_slice(chunk),
            None if last => return Ok((input, (seq, Packet::from_vec(chunk.to_vec())))),
            None => assembled = Some(chunk.to_vec()),
        }
        if last {
            let payload = assembled.take().unwrap_or_default();
            return Ok((input, (seq, Packet::from_vec(payload))));
        }
    }
}
