//! Git packet-line framing.
//!
//! The smart HTTP protocol delimits messages with packet lines, and the
//! discovery response must reproduce them bit-exactly. This module encodes
//! and decodes that format and builds the service-announcement preamble the
//! `info/refs` endpoint prepends to the ref advertisement.
//!
//! # Packet-line format
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)

use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A single Git packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`) -- marks end of a message / section.
    Flush,
    /// Delimiter packet (`0001`) -- separates sections within a single
    /// message.
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a Git packet-line (4-hex-digit length prefix + data).
///
/// The length includes the 4 prefix bytes themselves.  Callers are responsible
/// for including any trailing newline in `data` if the protocol requires it.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    assert!(
        total_len <= 0xFFFF,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Encode a [`PktLine`] back into its wire representation.
pub fn encode_pkt(pkt: &PktLine) -> Vec<u8> {
    match pkt {
        PktLine::Data(data) => encode_pkt_line(data),
        PktLine::Flush => b"0000".to_vec(),
        PktLine::Delimiter => b"0001".to_vec(),
        PktLine::ResponseEnd => b"0002".to_vec(),
    }
}

/// Build the discovery preamble for a named service:
/// `PKT "# service=<name>\n"` followed by a flush packet.
///
/// The ref advertisement produced by the external executable is appended
/// verbatim after this preamble.
pub fn service_announcement(service_name: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service={service_name}\n").as_bytes());
    buf.extend_from_slice(b"0000");
    buf
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a sequence of Git packet lines from raw bytes.
///
/// Returns all successfully parsed packets.  If the input is malformed the
/// parser stops at the first unparseable position and returns whatever was
/// decoded up to that point.
pub fn decode_pkt_lines(data: &[u8]) -> Vec<PktLine> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let len_hex = match std::str::from_utf8(&data[pos..pos + 4]) {
            Ok(s) => s,
            Err(_) => {
                warn!(offset = pos, "non-UTF-8 packet-line length prefix");
                break;
            }
        };

        let pkt_len = match u16::from_str_radix(len_hex, 16) {
            Ok(n) => n as usize,
            Err(_) => {
                warn!(offset = pos, len_hex, "invalid packet-line length");
                break;
            }
        };

        match pkt_len {
            0 => {
                trace!(offset = pos, "flush packet");
                packets.push(PktLine::Flush);
                pos += 4;
            }
            1 => {
                trace!(offset = pos, "delimiter packet");
                packets.push(PktLine::Delimiter);
                pos += 4;
            }
            2 => {
                trace!(offset = pos, "response-end packet");
                packets.push(PktLine::ResponseEnd);
                pos += 4;
            }
            3 => {
                // Length 3 is invalid (would mean 3 total bytes but the prefix
                // itself is 4).
                warn!(offset = pos, "invalid packet-line length 0003");
                break;
            }
            n => {
                if pos + n > data.len() {
                    warn!(
                        offset = pos,
                        declared = n,
                        available = data.len() - pos,
                        "truncated packet-line"
                    );
                    break;
                }
                let payload = data[pos + 4..pos + n].to_vec();
                trace!(offset = pos, payload_len = payload.len(), "data packet");
                packets.push(PktLine::Data(payload));
                pos += n;
            }
        }
    }

    packets
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pkt_line() {
        let encoded = encode_pkt_line(b"hello\n");
        assert_eq!(&encoded, b"000ahello\n");
    }

    #[test]
    fn test_encode_pkt_line_empty() {
        let encoded = encode_pkt_line(b"");
        assert_eq!(&encoded, b"0004");
    }

    #[test]
    fn test_service_announcement_exact_bytes() {
        // "# service=git-upload-pack\n" is 26 bytes + 4 prefix = 0x1e.
        let preamble = service_announcement("git-upload-pack");
        assert_eq!(&preamble, b"001e# service=git-upload-pack\n0000");
    }

    #[test]
    fn test_service_announcement_receive_pack() {
        let preamble = service_announcement("git-receive-pack");
        assert_eq!(&preamble, b"001f# service=git-receive-pack\n0000");
    }

    #[test]
    fn test_decode_flush() {
        let packets = decode_pkt_lines(b"0000");
        assert_eq!(packets, vec![PktLine::Flush]);
    }

    #[test]
    fn test_decode_delimiter() {
        let packets = decode_pkt_lines(b"0001");
        assert_eq!(packets, vec![PktLine::Delimiter]);
    }

    #[test]
    fn test_decode_response_end() {
        let packets = decode_pkt_lines(b"0002");
        assert_eq!(packets, vec![PktLine::ResponseEnd]);
    }

    #[test]
    fn test_roundtrip_data_packet() {
        let original = b"want 0123456789abcdef\n";
        let encoded = encode_pkt_line(original);
        let decoded = decode_pkt_lines(&encoded);
        assert_eq!(decoded.len(), 1);
        match &decoded[0] {
            PktLine::Data(d) => assert_eq!(d.as_slice(), original),
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_announcement_roundtrip() {
        let wire = service_announcement("git-upload-pack");
        let packets = decode_pkt_lines(&wire);
        assert_eq!(packets.len(), 2);
        match &packets[0] {
            PktLine::Data(d) => {
                assert_eq!(d.as_slice(), b"# service=git-upload-pack\n");
            }
            other => panic!("expected Data, got {other:?}"),
        }
        assert_eq!(packets[1], PktLine::Flush);
    }

    #[test]
    fn test_decode_truncated_packet_stops() {
        // Declared length 0x0010 but only 8 bytes available.
        let packets = decode_pkt_lines(b"0010abcd");
        assert!(packets.is_empty());
    }
}
