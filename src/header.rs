//! Chunk headers: the links of the per-stream chains.
//!
//! A header is 25 bytes on disk:
//!
//! | offset | size | field      |
//! |-------:|-----:|------------|
//! | 0      | 1    | codec tag  |
//! | 1      | 8    | `c_len`    |
//! | 9      | 8    | `u_len`    |
//! | 17     | 8    | `next_off` |
//!
//! `next_off` is the absolute file offset of the stream's next chunk header,
//! written as 0 first and back-patched by whichever worker appends the
//! successor; the final header of a stream keeps the 0 as the end marker.
//! Containers from versions before 0.4 store the three lengths as 32-bit
//! fields, giving a 13-byte header; that layout is read-only.

use std::io::{Read, Write};

use crate::codec::Codec;
use crate::error::StreamError;
use crate::sized_io::{read_u32, read_u64, read_u8, write_u64, write_u8};

/// On-disk size of a modern chunk header.
pub const CHUNK_HEADER_SIZE: u64 = 25;
/// On-disk size of a pre-0.4 chunk header.
pub const LEGACY_HEADER_SIZE: u64 = 13;
/// Byte offset of the `next_off` field inside a header (1 + 8 + 8).
pub(crate) const NEXT_OFF_FIELD: u64 = 17;

#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub c_type: u8,
    pub c_len: u64,
    pub u_len: u64,
    pub next_off: u64,
}

impl ChunkHeader {
    /// The blank header `open_out` writes once per stream, waiting for the
    /// stream's first chunk to patch `next_off`.
    pub fn initial() -> ChunkHeader {
        ChunkHeader {
            c_type: Codec::None.tag(),
            c_len: 0,
            u_len: 0,
            next_off: 0,
        }
    }

    /// True when every field is zero. Seen both on untouched initial headers
    /// of empty streams and on the spurious leading header some historical
    /// archives carry.
    pub fn is_blank(&self) -> bool {
        self.c_type == Codec::None.tag() && self.c_len == 0 && self.u_len == 0 && self.next_off == 0
    }

    pub fn size(legacy: bool) -> u64 {
        if legacy {
            LEGACY_HEADER_SIZE
        } else {
            CHUNK_HEADER_SIZE
        }
    }

    /// Modern 25-byte form. The write side never emits the legacy layout.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), StreamError> {
        write_u8(w, self.c_type)?;
        write_u64(w, self.c_len)?;
        write_u64(w, self.u_len)?;
        write_u64(w, self.next_off)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, legacy: bool) -> Result<ChunkHeader, StreamError> {
        let c_type = read_u8(r)?;
        if legacy {
            Ok(ChunkHeader {
                c_type,
                c_len: read_u32(r)? as u64,
                u_len: read_u32(r)? as u64,
                next_off: read_u32(r)? as u64,
            })
        } else {
            Ok(ChunkHeader {
                c_type,
                c_len: read_u64(r)?,
                u_len: read_u64(r)?,
                next_off: read_u64(r)?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn modern_header_round_trips_at_25_bytes() {
        let hdr = ChunkHeader {
            c_type: 3,
            c_len: 12_345,
            u_len: 99_999,
            next_off: 0xDEAD_BEEF,
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, CHUNK_HEADER_SIZE);

        let back = ChunkHeader::read_from(&mut Cursor::new(buf), false).unwrap();
        assert_eq!(back.c_type, 3);
        assert_eq!(back.c_len, 12_345);
        assert_eq!(back.u_len, 99_999);
        assert_eq!(back.next_off, 0xDEAD_BEEF);
    }

    #[test]
    fn blank_detection() {
        assert!(ChunkHeader::initial().is_blank());
        let mut hdr = ChunkHeader::initial();
        hdr.next_off = 25;
        assert!(!hdr.is_blank());
    }
}
