//! # Tributary
//!
//! A multi-stream compression container: N independent logical byte streams
//! multiplexed into one seekable file. Each stream is an on-disk linked list
//! of chunks, compressed by a pluggable back-end codec and optionally
//! encrypted with AES-128-CBC plus ciphertext stealing. Writing and reading
//! both run through bounded rings of worker threads, so back-end work
//! parallelizes while the file itself is only ever touched in order.
//!
//! ## Key Modules
//!
//! - [`writer`]: the compression worker ring and [`StreamWriter`] facade.
//! - [`reader`]: per-stream decompression rings and the [`StreamReader`] facade.
//! - [`codec`]: the uniform front over the back-end codecs, including the
//!   incompressibility pre-test.
//! - [`crypto`]: passphrase key schedule and per-chunk CBC/CTS encryption.
//! - [`header`]: the 25-byte chunk header and its pre-0.4 compatibility form.
//! - [`sized_io`]: exact-count transfers and the on-disk integer codec.
//!
//! ## Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::sync::Arc;
//! use tributary::{Codec, StreamConfig, StreamReader, StreamWriter};
//!
//! # fn main() -> Result<(), tributary::StreamError> {
//! let cfg = Arc::new(StreamConfig { codec: Codec::Lzo, ..StreamConfig::default() });
//!
//! let out = File::create("data.trb")?;
//! let mut writer = StreamWriter::open_out(out, Arc::clone(&cfg), 2, 1 << 20)?;
//! writer.write(0, b"stream zero bytes")?;
//! writer.write(1, b"stream one bytes")?;
//! writer.close()?;
//!
//! let input = File::open("data.trb")?;
//! let mut reader = StreamReader::open_in(input, cfg, 2)?;
//! let mut buf = [0u8; 17];
//! reader.read(0, &mut buf)?;
//! reader.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod header;
pub mod reader;
pub mod sized_io;
mod sync;
pub mod writer;

pub use codec::Codec;
pub use config::{StreamConfig, STREAM_BUFSIZE};
pub use crypto::KeySchedule;
pub use error::StreamError;
pub use reader::StreamReader;
pub use writer::StreamWriter;
