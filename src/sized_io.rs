//! Exact-count transfers and the container's integer field codec.
//!
//! Reads and writes run in slices of at most one gigabyte so a single huge
//! chunk never trips platform `read`/`write` size limits; a short slice is
//! retried with the remainder until the full count is transferred or the
//! source runs dry.
//!
//! Integer fields on disk use the byte order of the writing host. That is a
//! legacy property of the container format and the reason cross-endian
//! archives are unsupported; it is confined to this module. Building with the
//! `portable-le` cargo feature switches the field codec to little-endian for
//! future-format experiments.

use std::io::{Read, Write};

use crate::error::StreamError;

/// Largest single slice handed to the OS in one call.
const SLICE_MAX: usize = 1000 * 1024 * 1024;

/// Write all of `buf`, slicing the transfer at [`SLICE_MAX`].
pub fn write_exact<W: Write>(w: &mut W, buf: &[u8]) -> Result<(), StreamError> {
    let mut done = 0;
    while done < buf.len() {
        let end = buf.len().min(done + SLICE_MAX);
        let n = w
            .write(&buf[done..end])
            .map_err(|e| StreamError::io(e, "write_exact"))?;
        if n == 0 {
            return Err(StreamError::ShortTransfer {
                wanted: buf.len() as u64,
                got: done as u64,
            });
        }
        done += n;
    }
    Ok(())
}

/// Fill all of `buf`, slicing the transfer at [`SLICE_MAX`].
pub fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), StreamError> {
    let wanted = buf.len() as u64;
    let mut done = 0;
    while done < buf.len() {
        let end = buf.len().min(done + SLICE_MAX);
        let n = r
            .read(&mut buf[done..end])
            .map_err(|e| StreamError::io(e, "read_exact"))?;
        if n == 0 {
            return Err(StreamError::ShortTransfer {
                wanted,
                got: done as u64,
            });
        }
        done += n;
    }
    Ok(())
}

#[cfg(not(feature = "portable-le"))]
fn u64_to_field(v: u64) -> [u8; 8] {
    v.to_ne_bytes()
}

#[cfg(feature = "portable-le")]
fn u64_to_field(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

#[cfg(not(feature = "portable-le"))]
fn u64_from_field(b: [u8; 8]) -> u64 {
    u64::from_ne_bytes(b)
}

#[cfg(feature = "portable-le")]
fn u64_from_field(b: [u8; 8]) -> u64 {
    u64::from_le_bytes(b)
}

#[cfg(not(feature = "portable-le"))]
fn u32_from_field(b: [u8; 4]) -> u32 {
    u32::from_ne_bytes(b)
}

#[cfg(feature = "portable-le")]
fn u32_from_field(b: [u8; 4]) -> u32 {
    u32::from_le_bytes(b)
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<(), StreamError> {
    write_exact(w, &[v])
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<(), StreamError> {
    write_exact(w, &u64_to_field(v))
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8, StreamError> {
    let mut b = [0u8; 1];
    read_exact(r, &mut b)?;
    Ok(b[0])
}

/// 32-bit fields only occur in pre-0.4 chunk headers.
pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, StreamError> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(u32_from_field(b))
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, StreamError> {
    let mut b = [0u8; 8];
    read_exact(r, &mut b)?;
    Ok(u64_from_field(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn integer_fields_round_trip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 0xAB).unwrap();
        write_u64(&mut buf, 0x1122_3344_5566_7788).unwrap();
        write_u64(&mut buf, 0).unwrap();
        let mut c = Cursor::new(buf);
        assert_eq!(read_u8(&mut c).unwrap(), 0xAB);
        assert_eq!(read_u64(&mut c).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(read_u64(&mut c).unwrap(), 0);
    }

    #[test]
    fn read_past_end_is_short_transfer() {
        let mut c = Cursor::new(vec![1u8, 2, 3]);
        let mut out = [0u8; 8];
        match read_exact(&mut c, &mut out) {
            Err(StreamError::ShortTransfer { wanted: 8, got: 3 }) => {}
            other => panic!("expected short transfer, got {:?}", other),
        }
    }

    #[test]
    fn exact_write_then_read() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut sink = Vec::new();
        write_exact(&mut sink, &data).unwrap();
        let mut c = Cursor::new(sink);
        let mut back = vec![0u8; data.len()];
        read_exact(&mut c, &mut back).unwrap();
        assert_eq!(back, data);
    }
}
