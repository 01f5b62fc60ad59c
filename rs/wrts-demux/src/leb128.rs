//! 7-bit (LEB128-style) unsigned integer coding used by every non-payload
//! field in the RTS wire format: MSB of each byte signals continuation, the
//! remaining 7 bits are little-endian ordered payload.

use bytes::{Buf, BufMut};

use crate::Error;

/// Decode a single LEB128 unsigned integer from `buf`, advancing it past the
/// bytes consumed. Returns `None` if `buf` doesn't yet contain a complete
/// value (the caller should buffer more bytes and retry).
pub fn decode_u64(buf: &[u8]) -> Option<(u64, usize)> {
	let mut value: u64 = 0;
	let mut shift: u32 = 0;

	for (i, &byte) in buf.iter().enumerate() {
		value |= u64::from(byte & 0x7f) << shift;
		if byte & 0x80 == 0 {
			return Some((value, i + 1));
		}
		shift += 7;
		if shift >= 64 {
			// A well-formed stream never needs more than 10 bytes for a u64.
			return None;
		}
	}

	None
}

/// Decode a LEB128 value directly off a `Buf`, consuming it on success and
/// leaving the cursor untouched on failure (tolerated truncation).
pub fn try_get_u64<B: Buf>(buf: &mut B) -> Option<u64> {
	let chunk = buf.chunk();
	let (value, len) = decode_u64(chunk)?;
	buf.advance(len);
	Some(value)
}

pub fn try_get_u32<B: Buf>(buf: &mut B) -> Option<u32> {
	try_get_u64(buf).map(|v| v as u32)
}

pub fn try_get_i64<B: Buf>(buf: &mut B) -> Option<i64> {
	// Signed fields on the wire are zig-zag-free: RTS only uses signed values
	// for composition offsets and extendable durations, carried as a raw u64
	// cast back to i64 by the caller via `as i64`. We still decode as u64 here.
	try_get_u64(buf).map(|v| v as i64)
}

pub fn encode_u64<B: BufMut>(buf: &mut B, mut value: u64) {
	loop {
		let byte = (value & 0x7f) as u8;
		value >>= 7;
		if value == 0 {
			buf.put_u8(byte);
			break;
		} else {
			buf.put_u8(byte | 0x80);
		}
	}
}

pub fn encode_i64<B: BufMut>(buf: &mut B, value: i64) {
	encode_u64(buf, value as u64);
}

/// Reads a LEB128 integer, returning a decode error if the buffer is
/// exhausted rather than merely incomplete (used where truncation is fatal,
/// e.g. inside a framed packet whose total length is already known).
pub fn get_u64_fatal<B: Buf>(buf: &mut B) -> Result<u64, Error> {
	try_get_u64(buf).ok_or(Error::Truncated)
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BytesMut;

	#[test]
	fn round_trips_small_and_large_values() {
		for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
			let mut buf = BytesMut::new();
			encode_u64(&mut buf, value);
			let mut slice = &buf[..];
			let decoded = try_get_u64(&mut slice).expect("decode");
			assert_eq!(decoded, value);
			assert!(slice.is_empty());
		}
	}

	#[test]
	fn incomplete_buffer_returns_none() {
		let mut buf = BytesMut::new();
		encode_u64(&mut buf, 300);
		let truncated = &buf[..1];
		assert!(decode_u64(truncated).is_none());
	}
}
