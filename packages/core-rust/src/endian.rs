//! Big-endian codec primitives for the envelope wire format.
//!
//! Every multi-byte integer on the wire is big-endian; variable-length
//! fields are a `u32` length prefix followed by that many raw bytes.
//! Decoders validate remaining-buffer length before every read so a
//! truncated envelope surfaces as `WireError::Truncated` instead of a
//! panic.

use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Upper bound on any single length-prefixed field. A decoder that trusts
/// an attacker-controlled length prefix would otherwise allocate up to 4 GiB.
pub const MAX_FIELD_LEN: usize = 16 << 20;

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

/// Reads a `u32` length prefix followed by that many bytes.
pub fn get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>, WireError> {
    let len = get_u32(buf)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(WireError::LengthOverflow {
            got: len,
            limit: MAX_FIELD_LEN,
        });
    }
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Reads a length-prefixed UTF-8 string.
pub fn get_string(buf: &mut impl Buf) -> Result<String, WireError> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| WireError::InvalidUtf8)
}

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}
