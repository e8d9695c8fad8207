//! Git pkt-line framing: four ASCII-hex length bytes followed by payload,
//! with `0000` as the flush packet. Malformed frames are hard errors; the
//! transport closes the connection on them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{ForgeError, Result};

/// The flush packet marker.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// One decoded pkt-line.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `0000`, a section boundary.
    Flush,
    /// A length-prefixed payload line.
    Data(Bytes),
}

/// Decode one packet from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete packet
/// (nothing is consumed); `Err` on a malformed length prefix.
pub fn read_packet(buf: &mut Bytes) -> Result<Option<Packet>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let len_str = core::str::from_utf8(&len_bytes)
        .map_err(|_| ForgeError::InvalidInput("non-ASCII pkt-line length".into()))?;
    let pkt_len = usize::from_str_radix(len_str, 16)
        .map_err(|_| ForgeError::InvalidInput(format!("invalid pkt-line length: {len_str:?}")))?;

    if pkt_len == 0 {
        buf.advance(4);
        return Ok(Some(Packet::Flush));
    }
    if pkt_len < 4 {
        return Err(ForgeError::InvalidInput(format!(
            "pkt-line length {pkt_len} below header size"
        )));
    }
    if buf.len() < pkt_len {
        return Ok(None);
    }
    buf.advance(4);
    let payload = buf.copy_to_bytes(pkt_len - 4);
    Ok(Some(Packet::Data(payload)))
}

/// Append `payload` to `out` as a pkt-line with its length prefix.
pub fn write_packet(out: &mut BytesMut, payload: &[u8]) {
    let total = payload.len() + 4;
    out.put(format!("{total:04x}").into_bytes().as_slice());
    out.put(payload);
}

/// Append a flush packet.
pub fn write_flush(out: &mut BytesMut) {
    out.put(&FLUSH_PKT[..]);
}

/// Consume bytes up to the next whitespace or NUL, returning the token.
pub fn read_token(line: &mut Bytes) -> String {
    let mut token = Vec::new();
    while line.has_remaining() {
        let b = line.get_u8();
        if b.is_ascii_whitespace() || b == 0 {
            break;
        }
        token.push(b);
    }
    String::from_utf8_lossy(&token).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encoding then decoding restores the payload.
    #[test]
    fn round_trip() {
        let mut out = BytesMut::new();
        write_packet(&mut out, b"want deadbeef\n");
        write_flush(&mut out);
        let mut buf = out.freeze();

        match read_packet(&mut buf).unwrap() {
            Some(Packet::Data(payload)) => assert_eq!(&payload[..], b"want deadbeef\n"),
            other => panic!("expected data packet, got {other:?}"),
        }
        assert_eq!(read_packet(&mut buf).unwrap(), Some(Packet::Flush));
        assert_eq!(read_packet(&mut buf).unwrap(), None);
    }

    /// Short buffers yield None without consuming anything.
    #[test]
    fn partial_input_is_not_an_error() {
        let mut buf = Bytes::from_static(b"00");
        assert_eq!(read_packet(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 2);

        // Complete header, incomplete payload.
        let mut buf = Bytes::from_static(b"0010abc");
        assert_eq!(read_packet(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);
    }

    /// Non-hex and undersized lengths are malformed, not retryable.
    #[test]
    fn malformed_lengths_error() {
        let mut buf = Bytes::from_static(b"zzzzpayload");
        assert!(read_packet(&mut buf).is_err());

        let mut buf = Bytes::from_static(b"0002ab");
        assert!(read_packet(&mut buf).is_err());
    }

    /// Token reading splits on whitespace and NUL.
    #[test]
    fn token_reading() {
        let mut line = Bytes::from_static(b"want abc123\0caps");
        assert_eq!(read_token(&mut line), "want");
        assert_eq!(read_token(&mut line), "abc123");
        assert_eq!(read_token(&mut line), "caps");
    }
}
