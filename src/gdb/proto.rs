//! GDB Remote Serial Protocol packet framing (§4.K "Packet framing").
//!
//! `$<payload>#<2-hex-checksum>`, ACKed with a bare `+`/`-` byte; `^C`
//! (0x03) may arrive mid-session outside any packet and must be honored
//! immediately.

use crate::config::GDB_PACKET_BUF_SIZE;

pub const CTRL_C: u8 = 0x03;
pub const ACK: u8 = b'+';
pub const NACK: u8 = b'-';

/// Compute the RSP checksum: sum of payload bytes mod 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame `payload` as `$...#cc`.
pub fn frame_packet(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload);
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());
    out
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete, checksum-valid packet was extracted; remaining bytes
    /// from `input` that form it are reported so the caller can drain them.
    Packet(Vec<u8>, usize),
    /// A complete but checksum-invalid packet was extracted.
    BadChecksum(usize),
    /// `^C` was seen before a `$`.
    Interrupt(usize),
    /// Not enough bytes yet for a full packet.
    Incomplete,
}

/// Scan `input` (the unconsumed tail of the socket read buffer) for one
/// packet or an interrupt byte. Never looks past [`GDB_PACKET_BUF_SIZE`]
/// bytes, matching the fixed 16 KiB packet buffer (§4.K).
pub fn parse_one(input: &[u8]) -> ParseOutcome {
    let input = &input[..input.len().min(GDB_PACKET_BUF_SIZE)];

    if let Some(pos) = input.iter().position(|&b| b == CTRL_C) {
        if input[..pos].iter().all(|&b| b != b'$') {
            return ParseOutcome::Interrupt(pos + 1);
        }
    }

    let start = match input.iter().position(|&b| b == b'$') {
        Some(p) => p,
        None => return ParseOutcome::Incomplete,
    };
    let hash = match input[start..].iter().position(|&b| b == b'#') {
        Some(p) => start + p,
        None => return ParseOutcome::Incomplete,
    };
    if input.len() < hash + 3 {
        return ParseOutcome::Incomplete;
    }
    let payload = &input[start + 1..hash];
    let csum_str = std::str::from_utf8(&input[hash + 1..hash + 3]).unwrap_or("");
    let expected = u8::from_str_radix(csum_str, 16).unwrap_or(0xff);
    let consumed = hash + 3;
    if expected == checksum(payload) {
        ParseOutcome::Packet(payload.to_vec(), consumed)
    } else {
        ParseOutcome::BadChecksum(consumed)
    }
}

/// RSP binary-data escaping (`vFile` replies, memory dumps): `}`, `$`, `#`,
/// `*` are escaped as `}` followed by the byte XORed with `0x20` (§4.K
/// "vFile").
pub fn escape_binary(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if matches!(b, b'}' | b'$' | b'#' | b'*') {
            out.push(b'}');
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_and_reparses_a_packet() {
        let framed = frame_packet(b"qSupported");
        match parse_one(&framed) {
            ParseOutcome::Packet(payload, consumed) => {
                assert_eq!(payload, b"qSupported");
                assert_eq!(consumed, framed.len());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn detects_bad_checksum() {
        let mut framed = frame_packet(b"g");
        *framed.last_mut().unwrap() = b'0'; // corrupt the checksum
        assert!(matches!(parse_one(&framed), ParseOutcome::BadChecksum(_)));
    }

    #[test]
    fn ctrl_c_before_dollar_is_an_interrupt() {
        let input = [CTRL_C, b'$', b'g', b'#', b'6', b'7'];
        assert!(matches!(parse_one(&input), ParseOutcome::Interrupt(1)));
    }

    #[test]
    fn incomplete_packet_waits_for_more_bytes() {
        let input = b"$qSup";
        assert_eq!(parse_one(input), ParseOutcome::Incomplete);
    }

    #[test]
    fn escapes_rsp_special_bytes() {
        let escaped = escape_binary(b"a}b$c");
        assert_eq!(escaped, vec![b'a', b'}', b'}' ^ 0x20, b'b', b'}', b'$' ^ 0x20, b'c']);
    }
}
