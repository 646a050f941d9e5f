//! Container-wide configuration.
//!
//! Every knob is fixed before the first worker is spawned; workers hold the
//! config behind an `Arc` and only ever read it.

use crate::codec::Codec;
use crate::crypto::KeySchedule;

/// Baseline chunk size. The sizing probe in `open_out` never divides below
/// it, and the incompressibility pre-test uses it to cap its test windows.
pub const STREAM_BUFSIZE: usize = 10 * 1024 * 1024;

/// Holds all settings for one container, write side or read side.
#[derive(Debug)]
pub struct StreamConfig {
    /// The back-end used for new chunks. Chunks that do not shrink are
    /// stored as [`Codec::None`] regardless.
    pub codec: Codec,
    /// Compression level, 1 to 9. Back-ends with a different level axis
    /// rescale it.
    pub level: u32,
    /// Ring width: how many compression (or per-stream decompression)
    /// workers may be in flight at once.
    pub threads: usize,
    /// Compressed-fraction threshold for the incompressibility pre-test.
    /// Values above 1.0 disable the test entirely.
    pub threshold: f64,
    /// Container format version `(major, minor)` of the archive being read.
    /// Versions before 0.4 use 13-byte chunk headers with 32-bit fields.
    pub version: (u32, u32),
    /// Passphrase-derived key material; `None` leaves chunks in the clear.
    pub crypto: Option<KeySchedule>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            codec: Codec::Lzma,
            level: 7,
            threads: num_cpus::get().max(1),
            threshold: 1.0,
            version: (0, 6),
            crypto: None,
        }
    }
}

impl StreamConfig {
    /// True when the archive predates the 64-bit header fields.
    pub(crate) fn legacy_headers(&self) -> bool {
        self.version.0 == 0 && self.version.1 < 4
    }
}
