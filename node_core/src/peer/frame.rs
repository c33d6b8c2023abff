//! Data-phase framing for peer channels: plain topic frames are a 4-byte little-endian length
//! followed by the payload; service responses additionally carry a 1-byte success flag ahead of
//! that same length-prefixed payload.

use crate::error::{ErrorKind, NodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

fn malformed(detail: impl Into<String>) -> NodeError {
    NodeError::with_detail(ErrorKind::ProtocolMalformed, detail.into())
}

pub fn encode_data_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.write_u32::<LittleEndian>(payload.len() as u32).expect("write to Vec never fails");
    out.extend_from_slice(payload);
    out
}

/// Given everything buffered so far, returns `Some(payload)` and the number of bytes it
/// occupied once a complete frame is available, or `None` if more bytes are needed.
pub fn try_decode_data_frame(buffered: &[u8]) -> crate::error::Result<Option<(Vec<u8>, usize)>> {
    if buffered.len() < 4 {
        return Ok(None);
    }
    let len = (&buffered[..4]).read_u32::<LittleEndian>().map_err(|_| malformed("truncated frame length"))? as usize;
    let total = 4 + len;
    if buffered.len() < total {
        return Ok(None);
    }
    Ok(Some((buffered[4..total].to_vec(), total)))
}

pub fn encode_service_response(ok: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + payload.len());
    out.push(if ok { 1 } else { 0 });
    out.extend_from_slice(&encode_data_frame(payload));
    out
}

/// Returns `Some((ok, payload, consumed))` once a full service response has arrived.
pub fn try_decode_service_response(buffered: &[u8]) -> crate::error::Result<Option<(bool, Vec<u8>, usize)>> {
    if buffered.is_empty() {
        return Ok(None);
    }
    let ok = buffered[0] != 0;
    match try_decode_data_frame(&buffered[1..])? {
        Some((payload, consumed)) => Ok(Some((ok, payload, 1 + consumed))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trips() {
        let encoded = encode_data_frame(b"hello");
        let (payload, consumed) = try_decode_data_frame(&encoded).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn partial_frame_yields_none() {
        let encoded = encode_data_frame(b"hello world");
        assert!(try_decode_data_frame(&encoded[..5]).unwrap().is_none());
    }

    #[test]
    fn zero_length_frame_round_trips() {
        let encoded = encode_data_frame(b"");
        let (payload, consumed) = try_decode_data_frame(&encoded).unwrap().unwrap();
        assert!(payload.is_empty());
        assert_eq!(consumed, 4);
    }

    #[test]
    fn service_response_round_trips_with_ok_flag() {
        let encoded = encode_service_response(true, b"result");
        let (ok, payload, consumed) = try_decode_service_response(&encoded).unwrap().unwrap();
        assert!(ok);
        assert_eq!(payload, b"result");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn service_failure_flag_round_trips() {
        let encoded = encode_service_response(false, b"why it failed");
        let (ok, payload, _) = try_decode_service_response(&encoded).unwrap().unwrap();
        assert!(!ok);
        assert_eq!(payload, b"why it failed");
    }
}
