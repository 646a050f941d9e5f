//! Structural checks on the bytes the writer leaves behind: chain
//! integrity, the blank-leading-header recovery quirk, and the pre-0.4
//! header layout.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tempfile::tempdir;
use tributary::{Codec, StreamConfig, StreamError, StreamReader, StreamWriter};

// ---------- helpers ----------

fn cfg(codec: Codec, threads: usize) -> Arc<StreamConfig> {
    Arc::new(StreamConfig {
        codec,
        level: 6,
        threads,
        ..StreamConfig::default()
    })
}

fn read_header(f: &mut File, at: u64) -> (u8, u64, u64, u64) {
    f.seek(SeekFrom::Start(at)).unwrap();
    let mut b = [0u8; 25];
    f.read_exact(&mut b).unwrap();
    (
        b[0],
        u64::from_ne_bytes(b[1..9].try_into().unwrap()),
        u64::from_ne_bytes(b[9..17].try_into().unwrap()),
        u64::from_ne_bytes(b[17..25].try_into().unwrap()),
    )
}

fn traverse_chain(f: &mut File, initial_at: u64) -> Vec<(u64, u8, u64, u64)> {
    let (c_type, c_len, u_len, mut next) = read_header(f, initial_at);
    assert_eq!((c_type, c_len, u_len), (0, 0, 0), "initial header must be blank");
    let mut chunks = Vec::new();
    while next != 0 {
        let (t, c, u, n) = read_header(f, next);
        chunks.push((next, t, c, u));
        next = n;
    }
    chunks
}

fn read_all(reader: &mut StreamReader, stream: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(stream, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

// ---------- chain integrity ----------

#[test]
fn chains_cover_the_file_exactly_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chains.trb");
    let s0: Vec<u8> = b"alpha ".iter().copied().cycle().take(200_000).collect();
    let s1: Vec<u8> = b"beta beta ".iter().copied().cycle().take(150_000).collect();

    let file = File::create(&path).unwrap();
    let c = cfg(Codec::Gzip, 3);
    let mut writer = StreamWriter::open_out(file, Arc::clone(&c), 2, 48 * 1024).unwrap();
    writer.write(0, &s0).unwrap();
    writer.write(1, &s1).unwrap();
    writer.close().unwrap();

    let mut f = File::open(&path).unwrap();
    let file_len = f.metadata().unwrap().len();
    let chain0 = traverse_chain(&mut f, 0);
    let chain1 = traverse_chain(&mut f, 25);

    // Each chain terminates (traverse_chain only returns on next_off == 0)
    // and restores its own byte count.
    let sum0: u64 = chain0.iter().map(|(_, _, _, u)| u).sum();
    let sum1: u64 = chain1.iter().map(|(_, _, _, u)| u).sum();
    assert_eq!(sum0, s0.len() as u64);
    assert_eq!(sum1, s1.len() as u64);

    // Together the chunks tile the file after the two initial headers, with
    // no gaps, no overlaps, and nothing visited twice.
    let mut spans: Vec<(u64, u64)> = chain0
        .iter()
        .chain(chain1.iter())
        .map(|(off, _, c_len, _)| (*off, off + 25 + c_len))
        .collect();
    spans.sort();
    let mut cursor = 50u64;
    for (start, end) in spans {
        assert_eq!(start, cursor, "chunk must start where the previous ended");
        cursor = end;
    }
    assert_eq!(cursor, file_len);
}

// ---------- recovery quirk ----------

#[test]
fn blank_leading_header_is_skipped_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("quirky.trb");

    // Some emitters left one spurious all-zero header in front of the real
    // container; reproduce that shape by hand.
    let mut file = File::create(&path).unwrap();
    file.write_all(&[0u8; 25]).unwrap();
    let c = cfg(Codec::Lzo, 2);
    let mut writer = StreamWriter::open_out(file, Arc::clone(&c), 1, 64 * 1024).unwrap();
    writer.write(0, b"recovered payload").unwrap();
    writer.close().unwrap();

    let mut reader = StreamReader::open_in(File::open(&path).unwrap(), c, 1).unwrap();
    assert_eq!(read_all(&mut reader, 0), b"recovered payload");
    let mut file = reader.close().unwrap();
    // close_in leaves the cursor right behind the container bytes.
    let end = file.stream_position().unwrap();
    assert_eq!(end, file.metadata().unwrap().len());
}

// ---------- pre-0.4 layout ----------

fn legacy_cfg() -> Arc<StreamConfig> {
    Arc::new(StreamConfig {
        codec: Codec::None,
        threads: 2,
        version: (0, 3),
        ..StreamConfig::default()
    })
}

/// A one-stream container in the 13-byte-header layout: blank initial
/// header, then a single raw chunk holding "hello".
fn legacy_fixture() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.push(0u8);
    bytes.extend_from_slice(&0u32.to_ne_bytes());
    bytes.extend_from_slice(&0u32.to_ne_bytes());
    bytes.extend_from_slice(&13u32.to_ne_bytes()); // next_off: right behind us
    bytes.push(0u8);
    bytes.extend_from_slice(&5u32.to_ne_bytes()); // c_len
    bytes.extend_from_slice(&5u32.to_ne_bytes()); // u_len
    bytes.extend_from_slice(&0u32.to_ne_bytes()); // end of stream
    bytes.extend_from_slice(b"hello");
    bytes
}

#[test]
fn legacy_headers_read_with_the_right_version() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.trb");
    std::fs::write(&path, legacy_fixture()).unwrap();

    let mut reader = StreamReader::open_in(File::open(&path).unwrap(), legacy_cfg(), 1).unwrap();
    assert_eq!(read_all(&mut reader, 0), b"hello");
    let mut file = reader.close().unwrap();
    assert_eq!(file.stream_position().unwrap(), 31); // 13 + 13 + 5
}

#[test]
fn legacy_bytes_fail_under_the_modern_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy_modern.trb");
    std::fs::write(&path, legacy_fixture()).unwrap();

    let modern = cfg(Codec::None, 2);
    match StreamReader::open_in(File::open(&path).unwrap(), modern, 1) {
        Err(StreamError::Format(_)) | Err(StreamError::ShortTransfer { .. }) => {}
        other => panic!("expected a format rejection, got {:?}", other.map(|_| ())),
    }
}
