use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};
use tokio::io::AsyncWrite;

/// Builds and writes an ERR packet: `0xFF` marker, 2-byte LE code, `#`, 5-byte SQL state, message.
/// This is the only packet type the proxy ever synthesizes on the client-facing socket.
pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    seq: u8,
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.set_seq(seq);
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await?;
    w.flush_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet_writer::PacketWriter;

    #[tokio::test]
    async fn err_packet_has_nine_byte_minimum_payload() {
        let mut w = PacketWriter::new(Vec::new());
        write_err_packet(ErrorKind::ErAccessDeniedError, b"", 1, &mut w)
            .await
            .unwrap();
        let buf = w.inner_writer;
        // header (4) + payload (marker + code(2) + '#' + sqlstate(5) + empty message = 9)
        assert_eq!(buf.len(), 4 + 9);
        assert_eq!(&buf[0..3], &[9, 0, 0]);
        assert_eq!(buf[3], 1);
        assert_eq!(buf[4], 0xff);
    }
}
