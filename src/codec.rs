//! Uniform compress/decompress front over the back-end codecs.
//!
//! All back-ends work buffer to buffer; none of them see the container file.
//! The write path owns three policy decisions:
//!
//! - **Incompressibility pre-test**: before handing a chunk to a slow
//!   back-end, a quick LZO pass over growing prefixes estimates whether the
//!   data compresses at all. If LZO cannot shave a byte off, the slow codecs
//!   will not either, so the chunk is stored as [`Codec::None`]. Gzip is fast
//!   enough that it skips the pre-test.
//! - **Keep-if-smaller**: a compressed payload replaces the original only
//!   when it is strictly smaller; otherwise the chunk is stored raw and
//!   tagged [`Codec::None`].
//! - **LZMA memory fallback**: when the LZMA encoder cannot allocate its
//!   window the chunk is retried with bzip2 instead of being stored raw.

use std::io::Read;

use log::debug;
use minilzo_rs::LZO;

use crate::config::{StreamConfig, STREAM_BUFSIZE};
use crate::error::StreamError;

/// Back-end selection and on-disk chunk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Plain storage without any compression. Also the tag every chunk falls
    /// back to when the back-end output is not smaller than its input.
    None,
    /// bzip2, via the `bzip2` crate.
    Bzip2,
    /// LZO1X. Very fast, modest ratio; doubles as the pre-test codec.
    Lzo,
    /// LZMA via liblzma. Best general ratio of the mid-weight back-ends.
    Lzma,
    /// zlib deflate, via `flate2`.
    Gzip,
    /// Zstandard at a scaled-up level, filling the heavyweight slot.
    Zstd,
}

impl Codec {
    /// The tag byte stored in chunk headers.
    pub fn tag(self) -> u8 {
        match self {
            Codec::None => 0,
            Codec::Bzip2 => 1,
            Codec::Lzo => 2,
            Codec::Lzma => 3,
            Codec::Gzip => 4,
            Codec::Zstd => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Codec> {
        match tag {
            0 => Some(Codec::None),
            1 => Some(Codec::Bzip2),
            2 => Some(Codec::Lzo),
            3 => Some(Codec::Lzma),
            4 => Some(Codec::Gzip),
            5 => Some(Codec::Zstd),
            _ => None,
        }
    }
}

/// Compress one chunk according to the configured codec.
///
/// Takes ownership of the buffer and returns it either replaced by the
/// compressed payload with the matching tag, or untouched and tagged
/// [`Codec::None`] when compression is off, the chunk is empty, or the data
/// did not shrink.
pub(crate) fn compress_chunk(
    cfg: &StreamConfig,
    buf: Vec<u8>,
) -> Result<(Vec<u8>, Codec), StreamError> {
    if cfg.codec == Codec::None || buf.is_empty() {
        return Ok((buf, Codec::None));
    }

    let compressed = match cfg.codec {
        Codec::Bzip2 => {
            if lzo_compresses(&buf, cfg.threshold)? {
                bzip2_compress(&buf, cfg.level)?
            } else {
                None
            }
        }
        Codec::Gzip => gzip_compress(&buf, cfg.level)?,
        Codec::Lzma => {
            if lzo_compresses(&buf, cfg.threshold)? {
                lzma_compress(&buf, cfg.level)?
            } else {
                None
            }
        }
        Codec::Lzo => lzo_compress(&buf)?,
        Codec::Zstd => {
            if lzo_compresses(&buf, cfg.threshold)? {
                zstd_compress(&buf, cfg.level)?
            } else {
                None
            }
        }
        Codec::None => unreachable!(),
    };

    match compressed {
        Some(payload) => Ok((payload, cfg.codec)),
        None => {
            debug!("incompressible block, storing {} bytes raw", buf.len());
            Ok((buf, Codec::None))
        }
    }
}

/// Decompress one chunk according to its tag. `u_len` is the advertised
/// plaintext length from the chunk header; any mismatch is a format error
/// because the chain beyond this chunk can no longer be trusted.
pub(crate) fn decompress_chunk(
    c_type: Codec,
    buf: Vec<u8>,
    u_len: usize,
) -> Result<Vec<u8>, StreamError> {
    let out = match c_type {
        Codec::None => {
            if buf.len() != u_len {
                return Err(StreamError::Format(format!(
                    "raw chunk length {} does not match advertised {}",
                    buf.len(),
                    u_len
                )));
            }
            return Ok(buf);
        }
        Codec::Bzip2 => {
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(&buf[..])
                .read_to_end(&mut out)
                .map_err(|e| StreamError::Codec(format!("bzip2 decompress: {}", e)))?;
            out
        }
        Codec::Gzip => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(&buf[..])
                .read_to_end(&mut out)
                .map_err(|e| StreamError::Codec(format!("gzip decompress: {}", e)))?;
            out
        }
        Codec::Lzma => {
            let mut out = Vec::new();
            xz2::read::XzDecoder::new(&buf[..])
                .read_to_end(&mut out)
                .map_err(|e| StreamError::Codec(format!("lzma decompress: {}", e)))?;
            out
        }
        Codec::Lzo => {
            let mut lzo = lzo_instance()?;
            lzo.decompress_safe(&buf[..], u_len)
                .map_err(|e| StreamError::Codec(format!("lzo decompress: {:?}", e)))?
        }
        Codec::Zstd => zstd::bulk::decompress(&buf, u_len)
            .map_err(|e| StreamError::Codec(format!("zstd decompress: {}", e)))?,
    };

    if out.len() != u_len {
        return Err(StreamError::Format(format!(
            "inconsistent length after decompression: got {} bytes, expected {}",
            out.len(),
            u_len
        )));
    }
    Ok(out)
}

fn lzo_instance() -> Result<LZO, StreamError> {
    LZO::init().map_err(|e| StreamError::Codec(format!("lzo init: {:?}", e)))
}

fn bzip2_compress(buf: &[u8], level: u32) -> Result<Option<Vec<u8>>, StreamError> {
    let mut out = Vec::new();
    bzip2::read::BzEncoder::new(buf, bzip2::Compression::new(level))
        .read_to_end(&mut out)
        .map_err(|e| StreamError::Codec(format!("bzip2 compress: {}", e)))?;
    Ok(if out.len() < buf.len() { Some(out) } else { None })
}

fn gzip_compress(buf: &[u8], level: u32) -> Result<Option<Vec<u8>>, StreamError> {
    let mut out = Vec::new();
    flate2::read::ZlibEncoder::new(buf, flate2::Compression::new(level))
        .read_to_end(&mut out)
        .map_err(|e| StreamError::Codec(format!("gzip compress: {}", e)))?;
    Ok(if out.len() < buf.len() { Some(out) } else { None })
}

fn lzma_compress(buf: &[u8], level: u32) -> Result<Option<Vec<u8>>, StreamError> {
    // liblzma exposes seven useful presets, not nine; rescale.
    let preset = (level * 7 / 9).max(1);
    let mut out = Vec::new();
    match xz2::read::XzEncoder::new(buf, preset).read_to_end(&mut out) {
        Ok(_) => Ok(if out.len() < buf.len() { Some(out) } else { None }),
        Err(e) => {
            if is_lzma_mem_error(&e) {
                debug!("lzma could not allocate its window, falling back to bzip2");
                return bzip2_compress(buf, level);
            }
            Err(StreamError::Codec(format!("lzma compress: {}", e)))
        }
    }
}

fn is_lzma_mem_error(e: &std::io::Error) -> bool {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<xz2::stream::Error>())
        .map_or(false, |le| {
            matches!(le, xz2::stream::Error::Mem | xz2::stream::Error::MemLimit)
        })
}

fn lzo_compress(buf: &[u8]) -> Result<Option<Vec<u8>>, StreamError> {
    let mut lzo = lzo_instance()?;
    let out = lzo
        .compress(buf)
        .map_err(|e| StreamError::Codec(format!("lzo compress: {:?}", e)))?;
    Ok(if out.len() < buf.len() { Some(out) } else { None })
}

fn zstd_compress(buf: &[u8], level: u32) -> Result<Option<Vec<u8>>, StreamError> {
    // Map the 1..=9 axis onto zstd's 1..=19 range.
    let scaled = ((level * 19 / 9).max(1)) as i32;
    let out = zstd::bulk::compress(buf, scaled)
        .map_err(|e| StreamError::Codec(format!("zstd compress: {}", e)))?;
    Ok(if out.len() < buf.len() { Some(out) } else { None })
}

/// Quick incompressibility estimate.
///
/// LZO is so much faster than the other back-ends that it is worth a test
/// pass first: if LZO cannot drop a single byte, nothing else here will.
/// Progressively larger prefixes are compressed until one of them beats
/// `threshold`, or the whole input has been tested without success. The
/// prefix starts small and doubles per pass, capped at [`STREAM_BUFSIZE`].
pub(crate) fn lzo_compresses(buf: &[u8], threshold: f64) -> Result<bool, StreamError> {
    if threshold > 1.0 {
        return Ok(true);
    }
    let mut lzo = lzo_instance()?;

    let mut buftest_size = if buf.len() > 5 * STREAM_BUFSIZE {
        STREAM_BUFSIZE
    } else {
        STREAM_BUFSIZE / 4096
    };
    let mut offset = 0;
    let mut test_len = buf.len();
    let mut in_len = test_len.min(buftest_size);
    let mut passes = 0u32;

    while test_len > 0 {
        passes += 1;
        let out = lzo
            .compress(&buf[offset..offset + in_len])
            .map_err(|e| StreamError::Codec(format!("lzo pre-test: {:?}", e)))?;
        if (out.len() as f64) < in_len as f64 * threshold {
            debug!("lzo pre-test passed after {} passes", passes);
            return Ok(true);
        }
        test_len -= in_len;
        if test_len > 0 {
            offset += in_len;
            if buftest_size < STREAM_BUFSIZE {
                buftest_size <<= 1;
            }
            in_len = test_len.min(buftest_size);
        }
    }
    debug!("lzo pre-test failed after {} passes, below threshold", passes);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn cfg_with(codec: Codec) -> StreamConfig {
        StreamConfig {
            codec,
            level: 6,
            ..StreamConfig::default()
        }
    }

    fn repeated_text(size: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(size)
            .collect()
    }

    #[test]
    fn every_backend_round_trips() {
        let data = repeated_text(200 * 1024);
        for codec in [
            Codec::None,
            Codec::Bzip2,
            Codec::Lzo,
            Codec::Lzma,
            Codec::Gzip,
            Codec::Zstd,
        ] {
            let (payload, tag) = compress_chunk(&cfg_with(codec), data.clone()).unwrap();
            if codec != Codec::None {
                assert_eq!(tag, codec, "text should compress under {:?}", codec);
                assert!(payload.len() < data.len());
            }
            let back = decompress_chunk(tag, payload, data.len()).unwrap();
            assert_eq!(back, data);
        }
    }

    #[test]
    fn random_data_falls_back_to_raw() {
        let mut data = vec![0u8; 1024 * 1024];
        rand::rngs::OsRng.fill_bytes(&mut data);
        for codec in [Codec::Bzip2, Codec::Lzo, Codec::Lzma, Codec::Gzip, Codec::Zstd] {
            let (payload, tag) = compress_chunk(&cfg_with(codec), data.clone()).unwrap();
            assert_eq!(tag, Codec::None, "random bytes must stay raw for {:?}", codec);
            assert_eq!(payload.len(), data.len());
        }
    }

    #[test]
    fn pre_test_judges_both_ways() {
        let text = repeated_text(256 * 1024);
        assert!(lzo_compresses(&text, 1.0).unwrap());

        let mut noise = vec![0u8; 256 * 1024];
        rand::rngs::OsRng.fill_bytes(&mut noise);
        assert!(!lzo_compresses(&noise, 1.0).unwrap());

        // A threshold above 1.0 short-circuits without looking at the data.
        assert!(lzo_compresses(&noise, 2.0).unwrap());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(Codec::from_tag(9).is_none());
        for t in 0..=5u8 {
            assert_eq!(Codec::from_tag(t).unwrap().tag(), t);
        }
    }
}
