//! Parsing that touches the payload of a handshake or command packet, as opposed to the framing
//! itself (see `packet`). Everything here is read-only with respect to the bytes it parses: the
//! proxy relays the original bytes verbatim and only extracts fields it needs for policy
//! decisions.

use crate::error::ProtocolError;
use crate::protocol::mysql::constants::CommandCode as ComInfo;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use mysql_common::constants::{CapabilityFlags, StatusFlags};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::combinator::{alt, preceded, rest};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::{Parser, Partial};

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Query(&'a [u8]),
    ListFields(&'a [u8]),
    Close(u32),
    Prepare(&'a [u8]),
    Init(&'a [u8]),
    Execute {
        stmt: u32,
        params: &'a [u8],
    },
    SendLongData {
        stmt: u32,
        param: u16,
        data: &'a [u8],
    },
    Ping,
    Quit,
}

#[pin_project]
pub struct PacketIO<R, W> {
    pub reader: PacketReader<R>,
    pub writer: PacketWriter<W>,
}

impl<R: AsyncRead + Send + Unpin, W: AsyncWrite + Send + Unpin> PacketIO<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: PacketReader::new(reader),
            writer: PacketWriter::new(writer),
        }
    }
}

/// The two fields the handshake relay extracts from the client's Handshake Response v41. Every
/// other byte of the handshake is relayed opaquely and never reconstructed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u8,
    pub username: Vec<u8>,
    pub database: Option<Vec<u8>>,
}

impl HandshakeResponse {
    pub fn db_user_string(&self) -> String {
        String::from_utf8_lossy(&self.username).to_string()
    }
}

pub(crate) fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
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

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> winnow::IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;
    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;
            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    std::str::from_utf8(session_state_info).unwrap_or("")
                } else {
                    ""
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_string(),
            )
        } else {
            ("".to_string(), "".to_string())
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: StatusFlags,
    pub warnings: u16,
    pub info: String,
    pub session_state_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub table: String,
    pub column: String,
    pub column_type: mysql_common::constants::ColumnType,
    pub column_flags: mysql_common::constants::ColumnFlags,
}

fn malformed(ctx: &str) -> ProtocolError {
    ProtocolError::MalformedPacket(ctx.to_string())
}

/// Extracts `username` and `database` from a client Handshake Response v41/320 payload.
///
/// Fail-close: any length-encoded or length-prefixed field declared to extend past the payload,
/// a missing null terminator where one is required, or a database field claimed by
/// `CLIENT_CONNECT_WITH_DB` but absent from the payload, is a `MalformedPacket` error — never a
/// silently-defaulted field.
pub fn client_handshake_response(payload: &[u8]) -> Result<HandshakeResponse, ProtocolError> {
    let i = payload;
    let (i, cap1) = le_u16::<_, winnow::error::ContextError>
        .parse_peek(i)
        .map_err(|_| malformed("capability flags"))?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(cap1 as u32);

    if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        let (i, cap2) = le_u16::<_, winnow::error::ContextError>
            .parse_peek(i)
            .map_err(|_| malformed("capability flags (high word)"))?;
        capabilities = CapabilityFlags::from_bits_truncate((cap2 as u32) << 16 | cap1 as u32);

        let (i, max_packet_len) = le_u32::<_, winnow::error::ContextError>
            .parse_peek(i)
            .map_err(|_| malformed("max_packet_len"))?;
        let (i, collation) = take::<_, _, winnow::error::ContextError>(1u8)
            .parse_peek(i)
            .map_err(|_| malformed("collation"))?;
        let (i, _filler) = take::<_, _, winnow::error::ContextError>(23u8)
            .parse_peek(i)
            .map_err(|_| malformed("reserved filler"))?;

        if capabilities.contains(CapabilityFlags::CLIENT_SSL) {
            // The remainder of the payload is encrypted under TLS; the proxy cannot and does
            // not attempt to extract fields from it. It still relays the bytes opaquely.
            return Ok(HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: collation[0],
                username: Vec::new(),
                database: None,
            });
        }

        let (i, username) = take_until::<_, _, winnow::error::ContextError>(1.., "\0")
            .parse_peek(i)
            .map_err(|_| malformed("username: missing null terminator"))?;
        let (i, _) = literal::<_, _, winnow::error::ContextError>(b"\0")
            .parse_peek(i)
            .map_err(|_| malformed("username terminator"))?;

        let (i, _auth_response) = if capabilities
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
        {
            let (i, size) = read_length_encoded_number(i).map_err(|_| malformed("auth_response length"))?;
            take::<_, _, winnow::error::ContextError>(size)
                .parse_peek(i)
                .map_err(|_| malformed("auth_response"))?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let (i, size) = le_u8::<_, winnow::error::ContextError>
                .parse_peek(i)
                .map_err(|_| malformed("auth_response length"))?;
            take::<_, _, winnow::error::ContextError>(size)
                .parse_peek(i)
                .map_err(|_| malformed("auth_response"))?
        } else {
            let (i, resp) = take_until::<_, _, winnow::error::ContextError>(1.., "\0")
                .parse_peek(i)
                .map_err(|_| malformed("auth_response: missing null terminator"))?;
            (i, resp)
        };

        let database = if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            let (_i, db) = take_until::<_, _, winnow::error::ContextError>(1.., "\0")
                .parse_peek(i)
                .map_err(|_| {
                    malformed("database: flag set but field absent or unterminated")
                })?;
            Some(db.to_vec())
        } else {
            None
        };

        Ok(HandshakeResponse {
            client_flag: capabilities,
            max_packet_len,
            collation: collation[0],
            username: username.to_vec(),
            database,
        })
    } else {
        let (i, max_packet_len_v1) = le_u16::<_, winnow::error::ContextError>
            .parse_peek(i)
            .map_err(|_| malformed("max_packet_len (lo)"))?;
        let (i, max_packet_len_v2) = le_u8::<_, winnow::error::ContextError>
            .parse_peek(i)
            .map_err(|_| malformed("max_packet_len (hi)"))?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until::<_, _, winnow::error::ContextError>(1.., "\0")
            .parse_peek(i)
            .map_err(|_| malformed("username: missing null terminator"))?;
        let (_i, _) = literal::<_, _, winnow::error::ContextError>(b"\0")
            .parse_peek(i)
            .map_err(|_| malformed("username terminator"))?;

        Ok(HandshakeResponse {
            client_flag: capabilities,
            max_packet_len,
            collation: 0,
            username: username.to_vec(),
            database: None,
        })
    }
}

fn send_long_data(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, param) = le_u16.parse_peek(remaining)?;
    let data = *remaining;
    Ok((remaining, Command::SendLongData { stmt, param, data }))
}

fn execute(i: Partial<&[u8]>) -> IResult<Partial<&[u8]>, Command<'_>> {
    let (remaining, stmt) = le_u32.parse_peek(i)?;
    let (remaining, _flags) = take(1u8).parse_peek(remaining)?;
    let (remaining, _iterations) = le_u32.parse_peek(remaining)?;
    let params = *remaining;
    Ok((remaining, Command::Execute { stmt, params }))
}

pub fn from_packet(pkt: &[u8]) -> IResult<Partial<&[u8]>, Command<'_>> {
    alt((
        preceded(literal([ComInfo::ComQuery as u8]), rest).map(Command::Query),
        preceded(literal([ComInfo::ComFieldList as u8]), rest).map(Command::ListFields),
        preceded(literal([ComInfo::ComInitDB as u8]), rest).map(Command::Init),
        preceded(literal([ComInfo::ComStmtPrepare as u8]), rest).map(Command::Prepare),
        preceded(
            literal([ComInfo::ComStmtExecute as u8]),
            winnow::unpeek(execute),
        ),
        preceded(
            literal([ComInfo::ComStmtSendLongData as u8]),
            winnow::unpeek(send_long_data),
        ),
        preceded(literal([ComInfo::ComStmtClose as u8]), le_u32).map(Command::Close),
        literal([ComInfo::ComQuit as u8]).map(|_| Command::Quit),
        literal([ComInfo::ComPing as u8]).map(|_| Command::Ping),
    ))
    .parse_peek(Partial::new(pkt))
}
