//! PN53x normal-information frame codec (L1).
//!
//! `00 00 FF LEN LCS TFI PD0..PDn DCS 00`, bit-exact. Adapted from the
//! checksum/frame arithmetic in `pn532.rs`'s `send`/`parse_response`
//! (`wrapping_add`/`!sum + 1` checksum idiom), generalized to decode
//! arbitrary TFI and to distinguish ACK/NACK from a normal frame instead of
//! assuming a response is always waiting.

use crate::error::{ErrorKind, Result};
use crate::types::MAX_FRAME_PAYLOAD;

pub const HOST_TO_CHIP: u8 = 0xd4;
pub const CHIP_TO_HOST: u8 = 0xd5;

const PREAMBLE: [u8; 3] = [0x00, 0x00, 0xff];
const POSTAMBLE: u8 = 0x00;
pub const ACK_FRAME: [u8; 6] = [0x00, 0x00, 0xff, 0x00, 0xff, 0x00];
pub const NACK_FRAME: [u8; 6] = [0x00, 0x00, 0xff, 0xff, 0xff, 0x00];

const fn checksum(sum: u8) -> u8 {
    (!sum).wrapping_add(1)
}

/// Outcome of decoding one raw buffer as returned by the transport.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// The chip acknowledged a command; no payload.
    Ack,
    /// The chip rejected the preceding frame.
    Nack,
    /// A normal response frame: response code + status stripped, payload left.
    Response { response_code: u8, payload: &'a [u8] },
}

/// Encode a host-to-chip (or chip-to-host, for test purposes) command frame.
///
/// `payload` is TFI-less; `tfi` is supplied separately so the codec can be
/// exercised with either direction byte. Rejects payloads beyond the PN53x's
/// maximum frame size.
pub fn encode(tfi: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD - 1 {
        return Err(ErrorKind::InvalidArgument);
    }
    let len = (payload.len() + 1) as u8; // +1 for TFI
    out.clear();
    out.extend_from_slice(&PREAMBLE);
    if payload.len() + 1 <= 255 {
        out.push(len);
        out.push(checksum(len));
    } else {
        out.push(0xff);
        out.push(0xff);
        let full_len = (payload.len() + 1) as u16;
        out.push((full_len >> 8) as u8);
        out.push((full_len & 0xff) as u8);
        out.push(checksum(((full_len >> 8) as u8).wrapping_add((full_len & 0xff) as u8)));
    }
    out.push(tfi);
    out.extend_from_slice(payload);
    let mut dcs_sum = tfi;
    for &b in payload {
        dcs_sum = dcs_sum.wrapping_add(b);
    }
    out.push(checksum(dcs_sum));
    out.push(POSTAMBLE);
    Ok(())
}

/// Decode one raw buffer as returned by the transport.
///
/// Skips leading `00` pad bytes, tolerates a missing trailing postamble (some
/// transports strip it), and distinguishes ACK/NACK from a normal frame. The
/// returned payload has the response-code and status bytes stripped off by
/// the caller (see `command.rs`); this layer only strips TFI.
pub fn decode(buf: &[u8]) -> Result<Decoded<'_>> {
    let mut i = 0;
    while i + 1 < buf.len() && buf[i] == 0x00 && buf[i + 1] == 0x00 {
        i += 1;
    }
    if buf.len() < i + 2 || buf[i] != 0x00 || buf[i + 1] != 0xff {
        return Err(ErrorKind::ProtocolError);
    }
    i += 2;

    if buf.len() >= i + 2 && buf[i] == 0x00 && buf[i + 1] == 0xff {
        return Ok(Decoded::Ack);
    }
    if buf.len() >= i + 2 && buf[i] == 0xff && buf[i + 1] == 0xff && buf.len() < i + 3 {
        return Ok(Decoded::Nack);
    }

    let (frame_len, header_len): (usize, usize) = if buf.get(i) == Some(&0xff) && buf.get(i + 1) == Some(&0xff) {
        if buf.len() < i + 5 {
            return Err(ErrorKind::ProtocolError);
        }
        let len = ((buf[i + 2] as usize) << 8) | buf[i + 3] as usize;
        let lcs = buf[i + 4];
        if (((len >> 8) as u8).wrapping_add((len & 0xff) as u8)).wrapping_add(lcs) != 0 {
            return Err(ErrorKind::ChecksumError);
        }
        (len, i + 5)
    } else {
        if buf.len() < i + 2 {
            return Err(ErrorKind::ProtocolError);
        }
        let len = buf[i] as usize;
        let lcs = buf[i + 1];
        // NACK: LEN=FF LCS=FF handled above only for the 2-byte tail case;
        // a NACK can also appear with trailing bytes absent entirely.
        if len == 0xff && lcs == 0xff {
            return Ok(Decoded::Nack);
        }
        if len.wrapping_add(lcs as usize) & 0xff != 0 {
            return Err(ErrorKind::ChecksumError);
        }
        (len, i + 2)
    };

    if frame_len == 0 {
        return Err(ErrorKind::ProtocolError);
    }
    if buf.len() < header_len + frame_len + 1 {
        return Err(ErrorKind::ProtocolError);
    }

    let tfi = buf[header_len];
    if tfi != CHIP_TO_HOST {
        return Err(ErrorKind::ProtocolError);
    }

    let body = &buf[header_len..header_len + frame_len]; // TFI + payload
    let dcs = buf[header_len + frame_len];
    let sum = body.iter().fold(0u8, |s, &b| s.wrapping_add(b));
    if sum.wrapping_add(dcs) != 0 {
        return Err(ErrorKind::ChecksumError);
    }

    // Tolerate a stripped postamble: only check it if a byte is present.
    if let Some(&post) = buf.get(header_len + frame_len + 1) {
        if post != POSTAMBLE {
            return Err(ErrorKind::ProtocolError);
        }
    }

    let payload = &body[1..]; // drop TFI
    if payload.is_empty() {
        return Err(ErrorKind::ProtocolError);
    }
    let response_code = payload[0];
    Ok(Decoded::Response {
        response_code,
        payload: &payload[1..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(tfi: u8, payload: &[u8]) {
        let mut buf = Vec::new();
        encode(tfi, payload, &mut buf).unwrap();
        if tfi == CHIP_TO_HOST && !payload.is_empty() {
            match decode(&buf).unwrap() {
                Decoded::Response { response_code, payload: p } => {
                    assert_eq!(response_code, payload[0]);
                    assert_eq!(p, &payload[1..]);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        roundtrip(CHIP_TO_HOST, &[0x03, 0x00, 0xaa, 0xbb]);
        roundtrip(CHIP_TO_HOST, &[0x4b, 0x00]);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut buf = Vec::new();
        encode(CHIP_TO_HOST, &[0x03, 0x00], &mut buf).unwrap();
        let last_data_idx = buf.len() - 2; // DCS byte, before postamble
        buf[last_data_idx] ^= 1;
        assert!(matches!(decode(&buf), Err(ErrorKind::ChecksumError)));
    }

    #[test]
    fn leading_pad_and_trailing_postamble_are_transparent() {
        let mut buf = vec![0x00, 0x00];
        let mut frame = Vec::new();
        encode(CHIP_TO_HOST, &[0x03, 0x00], &mut frame).unwrap();
        buf.extend_from_slice(&frame);
        match decode(&buf).unwrap() {
            Decoded::Response { response_code, payload } => {
                assert_eq!(response_code, 0x03);
                assert_eq!(payload, &[]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack_frame_decodes_as_ack() {
        assert_eq!(decode(&ACK_FRAME).unwrap(), Decoded::Ack);
    }

    #[test]
    fn ack_then_response_skips_ack() {
        // The codec only decodes one frame at a time; the ACK-skip behavior
        // lives in the command layer, which re-reads on Ack. Here we just
        // confirm the ACK itself is recognized distinctly from a response.
        let ack = decode(&ACK_FRAME).unwrap();
        assert_eq!(ack, Decoded::Ack);
        let mut resp = Vec::new();
        encode(CHIP_TO_HOST, &[0x03, 0x00], &mut resp).unwrap();
        match decode(&resp).unwrap() {
            Decoded::Response { response_code, .. } => assert_eq!(response_code, 0x03),
            other => panic!("unexpected {other:?}"),
        }
    }
}
