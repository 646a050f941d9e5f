//! Write side: a ring of compression workers feeding one container file.
//!
//! `write` accumulates caller bytes into a per-stream buffer. A full buffer
//! moves into the next ring slot and a worker thread takes over: compress,
//! optionally encrypt, then commit the chunk to the file. Compression runs
//! freely in parallel, but a worker may only touch the file after its
//! predecessor slot posts `complete`, so chunks land on disk in submission
//! order no matter which back-end finishes first. Committing means patching
//! the stream's previous header to point here, appending a fresh header with
//! `next_off = 0`, then the payload.
//!
//! Memory stays bounded at roughly `bufsize * (streams + threads)`: one
//! accumulation buffer per stream plus at most one in-flight buffer per ring
//! slot, with `free` semaphores providing the back-pressure.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;

use crate::codec::{compress_chunk, Codec};
use crate::config::{StreamConfig, STREAM_BUFSIZE};
use crate::crypto::{self, SALT_LEN};
use crate::error::StreamError;
use crate::header::{ChunkHeader, CHUNK_HEADER_SIZE, NEXT_OFF_FIELD};
use crate::sized_io::{write_exact, write_u64};
use crate::sync::{PoisonFlag, Semaphore};

/// One reusable position in the write ring.
struct WriteSlot {
    /// Posted once the slot's worker has committed its chunk; consumed by
    /// the successor slot. This chain is the only write-ordering point.
    complete: Semaphore,
    /// Posted when the slot's worker is done and the slot may be reused.
    free: Semaphore,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Write cursor and per-stream back-patch targets. Only the worker holding
/// the write turn touches this, so the mutex is never contended.
struct WritePos {
    /// Container bytes committed since `initial_pos`.
    cur_pos: u64,
    /// Absolute file offset of each stream's most recent `next_off` field.
    last_head: Vec<u64>,
}

/// Container state shared with the workers.
struct WriterShared {
    cfg: Arc<StreamConfig>,
    file: File,
    initial_pos: u64,
    pos: Mutex<WritePos>,
    slots: Vec<WriteSlot>,
    poison: PoisonFlag,
}

struct OutStream {
    buf: Vec<u8>,
}

/// Write half of the container. Created by [`open_out`](Self::open_out),
/// must be [`close`](Self::close)d to flush tail buffers and drain workers.
pub struct StreamWriter {
    shared: Arc<WriterShared>,
    streams: Vec<OutStream>,
    bufsize: usize,
    thread_no: usize,
}

const TWO_GIG: usize = 2 * 1024 * 1024 * 1024;

fn alloc_buf(bufsize: usize) -> Result<Vec<u8>, StreamError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bufsize).map_err(|_| {
        StreamError::Resource(format!("cannot allocate {} byte stream buffer", bufsize))
    })?;
    Ok(buf)
}

/// Shrink `limit` toward what the allocator will actually grant, then fit
/// the result to the ring. The probe asks for `limit * (streams + 1)` (the
/// stream buffers plus back-end headroom) and backs off to 90% until the
/// allocation succeeds.
fn probe_bufsize(
    mut limit: usize,
    num_streams: usize,
    threads: usize,
) -> Result<usize, StreamError> {
    loop {
        if limit == 0 {
            return Err(StreamError::Resource(
                "allocation probe exhausted, cannot size stream buffers".into(),
            ));
        }
        let testsize = if cfg!(target_pointer_width = "32") {
            limit.saturating_mul(num_streams).saturating_mul(3)
        } else {
            limit.saturating_mul(num_streams + 1)
        };
        let mut probe: Vec<u8> = Vec::new();
        if probe.try_reserve_exact(testsize).is_ok() {
            debug!("allocation probe succeeded at {} bytes", testsize);
            break;
        }
        limit = limit / 10 * 9;
    }
    Ok(limit.min(((limit + threads - 1) / threads).max(STREAM_BUFSIZE)))
}

impl StreamWriter {
    /// Open a container for writing at the file's current position, with
    /// `num_streams` logical streams and per-chunk buffers of at most
    /// `limit` bytes. Writes one blank header per stream.
    pub fn open_out(
        mut file: File,
        cfg: Arc<StreamConfig>,
        num_streams: usize,
        limit: usize,
    ) -> Result<StreamWriter, StreamError> {
        if num_streams == 0 {
            return Err(StreamError::Format("container needs at least one stream".into()));
        }
        let threads = cfg.threads.max(1);

        let mut limit = limit;
        if cfg!(target_pointer_width = "32") {
            limit = limit.min(TWO_GIG / 6);
        }

        let initial_pos = file
            .stream_position()
            .map_err(|e| StreamError::io(e, "open_out position"))?;

        let mut bufsize = probe_bufsize(limit, num_streams, threads)?;
        if cfg!(target_pointer_width = "32") && cfg.codec == Codec::Lzma {
            // Largest window lzma handles comfortably on a 32-bit host.
            bufsize = bufsize.min(3 * STREAM_BUFSIZE * 10);
        }
        debug!(
            "using {} threads to compress up to {} bytes each",
            threads, bufsize
        );

        // Ring slots; the seed post on the last slot lets slot 0 take the
        // first write turn.
        let slots: Vec<WriteSlot> = (0..threads)
            .map(|_| WriteSlot {
                complete: Semaphore::new(0),
                free: Semaphore::new(1),
                handle: Mutex::new(None),
            })
            .collect();
        if threads > 1 {
            slots[threads - 1].complete.post();
        }

        // Blank initial headers; each stream's first chunk back-patches its
        // own one.
        let mut cur_pos = 0u64;
        let mut last_head = Vec::with_capacity(num_streams);
        for _ in 0..num_streams {
            last_head.push(initial_pos + cur_pos + NEXT_OFF_FIELD);
            ChunkHeader::initial().write_to(&mut file)?;
            cur_pos += CHUNK_HEADER_SIZE;
        }

        let mut streams = Vec::with_capacity(num_streams);
        for _ in 0..num_streams {
            streams.push(OutStream {
                buf: alloc_buf(bufsize)?,
            });
        }

        Ok(StreamWriter {
            shared: Arc::new(WriterShared {
                cfg,
                file,
                initial_pos,
                pos: Mutex::new(WritePos { cur_pos, last_head }),
                slots,
                poison: PoisonFlag::new(),
            }),
            streams,
            bufsize,
            thread_no: 0,
        })
    }

    /// The chunk size this container settled on.
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Append bytes to one logical stream, handing every filled buffer to
    /// the ring.
    pub fn write(&mut self, stream: usize, mut data: &[u8]) -> Result<(), StreamError> {
        if stream >= self.streams.len() {
            return Err(StreamError::Format(format!("no such stream {}", stream)));
        }
        while !data.is_empty() {
            self.shared.poison.check()?;
            let s = &mut self.streams[stream];
            let n = (self.bufsize - s.buf.len()).min(data.len());
            s.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if s.buf.len() == self.bufsize {
                self.flush_buffer(stream)?;
            }
        }
        Ok(())
    }

    /// Move the stream's accumulated buffer into the next ring slot and
    /// spawn a worker for it.
    fn flush_buffer(&mut self, stream: usize) -> Result<(), StreamError> {
        let threads = self.shared.slots.len();
        let i = self.thread_no;

        // Make sure this slot's previous worker is gone before reusing it.
        self.shared.slots[i].free.wait();
        if let Some(h) = self.shared.slots[i].handle.lock().unwrap().take() {
            if h.join().is_err() {
                self.shared
                    .poison
                    .set(StreamError::Resource("compression worker panicked".into()));
            }
        }

        let replacement = match alloc_buf(self.bufsize) {
            Ok(b) => b,
            Err(e) => {
                self.shared.slots[i].free.post();
                return Err(e);
            }
        };
        let buf = std::mem::replace(&mut self.streams[stream].buf, replacement);
        let wait_on = (i + threads - 1) % threads;

        debug!(
            "starting thread {} to compress {} bytes from stream {}",
            i,
            buf.len(),
            stream
        );
        let worker_shared = Arc::clone(&self.shared);
        let handle = match thread::Builder::new()
            .name(format!("compress-{}", i))
            .spawn(move || compress_worker(worker_shared, i, wait_on, stream, buf))
        {
            Ok(h) => h,
            Err(e) => {
                self.shared.slots[i].free.post();
                return Err(StreamError::Resource(format!(
                    "failed to spawn compression worker: {}",
                    e
                )));
            }
        };
        *self.shared.slots[i].handle.lock().unwrap() = Some(handle);

        self.thread_no = (i + 1) % threads;
        Ok(())
    }

    /// Flush every stream's tail buffer, then drain the ring. Reports the
    /// first worker failure if any chunk did not make it to disk.
    pub fn close(mut self) -> Result<(), StreamError> {
        let mut flush_err = None;
        for stream in 0..self.streams.len() {
            if !self.streams[stream].buf.is_empty() {
                if let Err(e) = self.flush_buffer(stream) {
                    flush_err = Some(e);
                    break;
                }
            }
        }

        // Every slot's final worker posts `free` last, so waiting on all of
        // them proves the ring is idle.
        for slot in &self.shared.slots {
            slot.free.wait();
            if let Some(h) = slot.handle.lock().unwrap().take() {
                if h.join().is_err() {
                    self.shared
                        .poison
                        .set(StreamError::Resource("compression worker panicked".into()));
                }
            }
        }

        if let Some(e) = flush_err {
            return Err(e);
        }
        self.shared.poison.check()
    }
}

struct PreparedChunk {
    payload: Vec<u8>,
    s_len: u64,
    c_type: Codec,
    salt: Option<[u8; SALT_LEN]>,
}

/// Compress (and encrypt) off-turn, then take the write turn and commit.
fn compress_worker(
    shared: Arc<WriterShared>,
    slot: usize,
    wait_on: usize,
    stream: usize,
    buf: Vec<u8>,
) {
    let prepared = prepare_chunk(&shared.cfg, buf);

    // The predecessor's `complete` is the only write-ordering point.
    if shared.slots.len() > 1 {
        shared.slots[wait_on].complete.wait();
    }

    let committed = match prepared {
        Ok(chunk) => {
            if shared.poison.is_clean() {
                commit_chunk(&shared, stream, chunk)
            } else {
                // An earlier worker already broke the chain; appending after
                // it would only bury the damage deeper.
                Ok(())
            }
        }
        Err(e) => Err(e),
    };
    if let Err(e) = committed {
        shared.poison.set(e);
    }

    shared.slots[slot].complete.post();
    shared.slots[slot].free.post();
}

fn prepare_chunk(cfg: &StreamConfig, buf: Vec<u8>) -> Result<PreparedChunk, StreamError> {
    let s_len = buf.len() as u64;
    let (mut payload, c_type) = compress_chunk(cfg, buf)?;
    let salt = match &cfg.crypto {
        Some(ks) => {
            let salt = crypto::generate_salt();
            crypto::encrypt_chunk(ks, &salt, &mut payload);
            Some(salt)
        }
        None => None,
    };
    Ok(PreparedChunk {
        payload,
        s_len,
        c_type,
        salt,
    })
}

/// Runs with the write turn held: back-patch the predecessor header, append
/// ours, append the payload, sync.
fn commit_chunk(
    shared: &WriterShared,
    stream: usize,
    chunk: PreparedChunk,
) -> Result<(), StreamError> {
    let mut pos = shared.pos.lock().unwrap();
    let mut f = &shared.file;
    let c_len = chunk.payload.len() as u64;
    let header_at = shared.initial_pos + pos.cur_pos;

    f.seek(SeekFrom::Start(pos.last_head[stream]))
        .map_err(|e| StreamError::io(e, "seek to back-patch"))?;
    write_u64(&mut f, header_at)?;
    pos.last_head[stream] = header_at + NEXT_OFF_FIELD;

    f.seek(SeekFrom::Start(header_at))
        .map_err(|e| StreamError::io(e, "seek to append"))?;
    debug!("writing {} compressed bytes at offset {}", c_len, header_at);
    ChunkHeader {
        c_type: chunk.c_type.tag(),
        c_len,
        u_len: chunk.s_len,
        next_off: 0,
    }
    .write_to(&mut f)?;
    pos.cur_pos += CHUNK_HEADER_SIZE;

    if let Some(salt) = chunk.salt {
        write_exact(&mut f, &salt)?;
        pos.cur_pos += SALT_LEN as u64;
    }
    write_exact(&mut f, &chunk.payload)?;
    pos.cur_pos += c_len;

    shared
        .file
        .sync_all()
        .map_err(|e| StreamError::io(e, "chunk sync"))?;
    Ok(())
}
