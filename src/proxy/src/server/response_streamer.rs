//! MySQL result-set state machine (§4.8): relays one response unit from the upstream server to
//! the client, terminating exactly where the wire format says the unit ends regardless of whether
//! the server uses the legacy EOF marker or `CLIENT_DEPRECATE_EOF`.

use crate::protocol::mysql::basic::read_length_encoded_number;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tracing::warn;

/// Commands whose response shape needs special handling. Everything else behaves like `Other`:
/// OK/ERR/degenerate-EOF terminate immediately, anything else is a single-result-set response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ComQuery,
    ComStmtPrepare,
    Other,
}

/// Reads one framed packet from the server and relays it to the client verbatim, preserving the
/// server's sequence id. Returns `Ok(None)` if a sequence-id reversal was observed — relay ends
/// without forwarding the offending packet.
async fn relay_one<W>(
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    client_writer: &mut PacketWriter<W>,
    prev_seq: &mut Option<u8>,
) -> io::Result<Option<Packet>>
where
    W: AsyncWrite + Send + Unpin,
{
    let (seq, packet) = match backend_reader.next_async().await? {
        Some(pair) => pair,
        None => return Ok(None),
    };

    if let Some(prev) = *prev_seq {
        let reversed = seq < prev && !(prev == 255 && seq == 0);
        if reversed {
            warn!(prev_seq = prev, seq, "response sequence id reversal, ending relay");
            return Ok(None);
        }
    }
    *prev_seq = Some(seq);

    client_writer.set_seq(seq);
    std::io::Write::write_all(client_writer, &packet)?;
    client_writer.end_packet().await?;
    client_writer.flush_all().await?;
    Ok(Some(packet))
}

/// A row's value fields are length-encoded strings; walking `column_count` of them and checking
/// the walk consumes the payload exactly is the row half of the deprecate-EOF disambiguation.
fn parses_as_row(payload: &[u8], column_count: u64) -> bool {
    let mut rest = payload;
    for _ in 0..column_count {
        match read_length_encoded_number(rest) {
            Ok((r, len)) => {
                if (r.len() as u64) < len {
                    return false;
                }
                rest = &r[len as usize..];
            }
            Err(_) => return false,
        }
    }
    rest.is_empty()
}

/// The OK half: lenenc affected_rows, lenenc last_insert_id, then at least 4 more bytes (status
/// flags + warning count).
fn parses_as_ok(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let rest = &payload[1..];
    match read_length_encoded_number(rest) {
        Ok((rest, _affected_rows)) => match read_length_encoded_number(rest) {
            Ok((rest, _last_insert_id)) => rest.len() >= 4,
            Err(_) => false,
        },
        Err(_) => false,
    }
}

async fn relay_result_set<W>(
    kind: CommandKind,
    column_count: u64,
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    client_writer: &mut PacketWriter<W>,
    prev_seq: &mut Option<u8>,
) -> io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    // kColumnDefs: the result-set header already declares exactly `column_count` definitions, so
    // relay that many rather than scanning for a terminator that `CLIENT_DEPRECATE_EOF` omits.
    for _ in 0..column_count {
        match relay_one(backend_reader, client_writer, prev_seq).await? {
            Some(p) if p.is_err_packet() => return Ok(()),
            Some(_) => {}
            None => return Ok(()),
        }
    }

    // A legacy server marks the column-defs/rows boundary with one EOF packet;
    // `CLIENT_DEPRECATE_EOF` omits it, so the packet right after the last column def is already
    // the first row (or the terminating OK/ERR of an empty result set).
    let mut next = match relay_one(backend_reader, client_writer, prev_seq).await? {
        Some(p) => p,
        None => return Ok(()),
    };
    if next.is_err_packet() {
        return Ok(());
    }
    if next.is_eof_packet() {
        next = match relay_one(backend_reader, client_writer, prev_seq).await? {
            Some(p) => p,
            None => return Ok(()),
        };
    }

    // kRows
    loop {
        if next.is_eof_packet() || next.is_err_packet() {
            return Ok(());
        }
        if kind == CommandKind::ComQuery && !next.is_empty() && next[0] == 0x00 {
            if !parses_as_row(&next, column_count) {
                if parses_as_ok(&next) {
                    return Ok(());
                }
                warn!("ambiguous deprecate-EOF terminator, ending relay defensively");
                return Ok(());
            }
        }
        next = match relay_one(backend_reader, client_writer, prev_seq).await? {
            Some(p) => p,
            None => return Ok(()),
        };
    }
}

async fn relay_prepare_metadata<W>(
    ok_payload: &Packet,
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    client_writer: &mut PacketWriter<W>,
    prev_seq: &mut Option<u8>,
) -> io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    if ok_payload.len() < 9 {
        warn!("prepare-OK payload too short to contain column/param counts");
        return Ok(());
    }
    let column_count = LittleEndian::read_u16(&ok_payload[5..7]);
    let param_count = LittleEndian::read_u16(&ok_payload[7..9]);

    for _ in 0..param_count {
        if relay_one(backend_reader, client_writer, prev_seq).await?.is_none() {
            return Ok(());
        }
    }
    if param_count > 0 && relay_one(backend_reader, client_writer, prev_seq).await?.is_none() {
        return Ok(());
    }
    for _ in 0..column_count {
        if relay_one(backend_reader, client_writer, prev_seq).await?.is_none() {
            return Ok(());
        }
    }
    if column_count > 0 && relay_one(backend_reader, client_writer, prev_seq).await?.is_none() {
        return Ok(());
    }
    Ok(())
}

/// Relays one complete response unit from `backend_reader` to `client_writer`. Terminates as soon
/// as the response shape says the unit is complete; never consumes the next unrelated server
/// frame.
pub async fn stream_response<W>(
    kind: CommandKind,
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    client_writer: &mut PacketWriter<W>,
) -> io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut prev_seq = None;
    let first = match relay_one(backend_reader, client_writer, &mut prev_seq).await? {
        Some(p) => p,
        None => return Ok(()),
    };

    if first.is_err_packet() {
        return Ok(());
    }
    if first.is_eof_packet() {
        return Ok(());
    }
    if first.is_ok_packet() {
        return match kind {
            CommandKind::ComStmtPrepare => {
                relay_prepare_metadata(&first, backend_reader, client_writer, &mut prev_seq).await
            }
            _ => Ok(()),
        };
    }

    let (_, column_count) = read_length_encoded_number(&first).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "malformed column count packet")
    })?;
    relay_result_set(kind, column_count, backend_reader, client_writer, &mut prev_seq).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet_writer::PacketWriter;
    use tokio::io::duplex;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        out.push(seq);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn ok_response_terminates_immediately_for_com_query() {
        let (mut upstream, downstream) = duplex(4096);
        let ok_payload = {
            let mut p = vec![0x00u8];
            p.extend_from_slice(&[0, 0]); // affected_rows, last_insert_id (lenenc 0)
            p.extend_from_slice(&[0x02, 0x00]); // status flags
            p.extend_from_slice(&[0x00, 0x00]); // warnings
            p
        };
        upstream.try_write(&frame(5, &ok_payload)).unwrap();
        drop(upstream);

        let mut reader = PacketReader::new(downstream);
        let mut writer = PacketWriter::new(Vec::new());
        stream_response(CommandKind::ComQuery, &mut reader, &mut writer)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn err_response_terminates_immediately() {
        let (mut upstream, downstream) = duplex(4096);
        let err_payload = {
            let mut p = vec![0xffu8];
            p.extend_from_slice(&1045u16.to_le_bytes());
            p.push(b'#');
            p.extend_from_slice(b"HY000");
            p.extend_from_slice(b"denied");
            p
        };
        upstream.try_write(&frame(1, &err_payload)).unwrap();
        drop(upstream);

        let mut reader = PacketReader::new(downstream);
        let mut writer = PacketWriter::new(Vec::new());
        stream_response(CommandKind::Other, &mut reader, &mut writer)
            .await
            .unwrap();
    }

    #[test]
    fn row_and_ok_disambiguation() {
        // a single-column row whose value is the 1-byte lenenc string "5"
        let row_payload = [0x01u8, b'5'];
        assert!(parses_as_row(&row_payload, 1));
        assert!(!parses_as_ok(&row_payload));

        // a deprecate-EOF final OK: header, lenenc 0, lenenc 0, status(2), warnings(2)
        let ok_payload = [0x00u8, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert!(parses_as_ok(&ok_payload));
    }
}
