//! Minimal ISO-BMFF box writer: every box is `[size:u32][fourcc:4][body]`,
//! with `size` back-patched once the body is known. This mirrors the
//! contractual box ordering and flag bits fixed by the CMAF spec; nothing
//! here is generic enough to round-trip arbitrary boxes, only to emit the
//! ones `CmafMux` needs, byte-for-byte, given identical inputs.

use bytes::{BufMut, BytesMut};

/// Write a full box: reserve a 4-byte size placeholder, run `body` to fill
/// in the fourcc-specific content, then back-patch the size.
pub fn write_box(buf: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
	let start = buf.len();
	buf.put_u32(0); // placeholder
	buf.put_slice(fourcc);
	body(buf);
	let size = (buf.len() - start) as u32;
	buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Write a full box version + 24-bit flags header, as used by every
/// "full box" (`mvhd`, `tkhd`, `mdhd`, `hdlr`, `tfhd`, `tfdt`, `trun`, ...).
pub fn put_full_header(buf: &mut BytesMut, version: u8, flags: u32) {
	buf.put_u8(version);
	buf.put_uint(flags as u64, 3);
}
