//! Read side: per-stream rings of decompression workers.
//!
//! All file traffic stays on the caller's thread. `fill_buffer` walks a
//! stream's chunk chain, reads compressed payloads, and hands each one to a
//! free slot in that stream's sub-ring of the worker pool; the workers only
//! ever decompress memory. Chunks are handed back to the caller strictly in
//! chain order by waiting on the oldest outstanding slot, while up to one
//! chunk per slot decompresses ahead.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::codec::{decompress_chunk, Codec};
use crate::config::StreamConfig;
use crate::crypto::{self, SALT_LEN};
use crate::error::StreamError;
use crate::header::ChunkHeader;
use crate::sized_io::read_exact;
use crate::sync::{PoisonFlag, Semaphore};

/// One reusable position in a stream's decompression sub-ring.
struct ReadSlot {
    /// Slot may be (re)used.
    free: Semaphore,
    /// Decompression finished; `result` holds the plaintext.
    complete: Semaphore,
    /// The consumer took the data; the worker may exit.
    ready: Semaphore,
    result: Mutex<Option<Vec<u8>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ReaderShared {
    cfg: Arc<StreamConfig>,
    slots: Vec<ReadSlot>,
    poison: PoisonFlag,
}

struct InStream {
    /// Current decompressed chunk.
    buf: Vec<u8>,
    /// Read cursor into `buf`.
    bufp: usize,
    /// Absolute file offset of the next chunk header, 0 at end of stream.
    last_head: u64,
    eos: bool,
    /// This stream's slice of the worker pool is
    /// `[base_thread, base_thread + threads)`.
    base_thread: usize,
    /// Next slot to dispatch into.
    uthread_no: usize,
    /// Oldest outstanding slot, the next one owed to the caller.
    unext_thread: usize,
    /// Dispatched but not yet consumed chunks.
    outstanding: usize,
}

/// Read half of the container. Created by [`open_in`](Self::open_in);
/// [`close`](Self::close) drains the workers and leaves the file positioned
/// just past the bytes the container consumed.
pub struct StreamReader {
    shared: Arc<ReaderShared>,
    file: File,
    initial_pos: u64,
    total_read: u64,
    streams: Vec<InStream>,
}

impl StreamReader {
    /// Open a container for reading at the file's current position and
    /// validate the blank initial header of each stream.
    pub fn open_in(
        mut file: File,
        cfg: Arc<StreamConfig>,
        num_streams: usize,
    ) -> Result<StreamReader, StreamError> {
        if num_streams == 0 {
            return Err(StreamError::Format("container needs at least one stream".into()));
        }
        let threads = cfg.threads.max(1);
        let legacy = cfg.legacy_headers();

        let mut initial_pos = file
            .stream_position()
            .map_err(|e| StreamError::io(e, "open_in position"))?;

        let slots: Vec<ReadSlot> = (0..threads * num_streams)
            .map(|_| ReadSlot {
                free: Semaphore::new(1),
                complete: Semaphore::new(0),
                ready: Semaphore::new(0),
                result: Mutex::new(None),
                handle: Mutex::new(None),
            })
            .collect();

        let mut total_read = 0u64;
        let mut streams = Vec::with_capacity(num_streams);
        for i in 0..num_streams {
            let mut retried = false;
            let header = loop {
                let h = ChunkHeader::read_from(&mut file, legacy)?;
                // Some historical archives carry one spurious all-zero
                // header before the real initial headers. Skip it once.
                if i == 0 && !retried && h.is_blank() {
                    warn!("blank leading header, enabling stream close workaround");
                    initial_pos += ChunkHeader::size(legacy);
                    retried = true;
                    continue;
                }
                break h;
            };
            total_read += ChunkHeader::size(legacy);

            if header.c_type != Codec::None.tag() {
                return Err(StreamError::Format(format!(
                    "unexpected initial tag {} in stream {}",
                    header.c_type, i
                )));
            }
            if header.c_len != 0 {
                return Err(StreamError::Format(format!(
                    "unexpected initial c_len {} in stream {}",
                    header.c_len, i
                )));
            }
            if header.u_len != 0 {
                return Err(StreamError::Format(format!(
                    "unexpected initial u_len {} in stream {}",
                    header.u_len, i
                )));
            }

            let base = threads * i;
            streams.push(InStream {
                buf: Vec::new(),
                bufp: 0,
                last_head: header.next_off,
                // A never-patched initial header means the stream has no
                // chunks at all.
                eos: header.next_off == 0,
                base_thread: base,
                uthread_no: base,
                unext_thread: base,
                outstanding: 0,
            });
        }

        Ok(StreamReader {
            shared: Arc::new(ReaderShared {
                cfg,
                slots,
                poison: PoisonFlag::new(),
            }),
            file,
            initial_pos,
            total_read,
            streams,
        })
    }

    /// Read up to `out.len()` bytes from one logical stream. Returns the
    /// count actually read; short (possibly 0) only at end of stream.
    pub fn read(&mut self, stream: usize, out: &mut [u8]) -> Result<usize, StreamError> {
        if stream >= self.streams.len() {
            return Err(StreamError::Format(format!("no such stream {}", stream)));
        }
        let mut done = 0;
        while done < out.len() {
            let s = &mut self.streams[stream];
            let n = (s.buf.len() - s.bufp).min(out.len() - done);
            if n > 0 {
                out[done..done + n].copy_from_slice(&s.buf[s.bufp..s.bufp + n]);
                s.bufp += n;
                done += n;
            }
            if done < out.len() && self.streams[stream].bufp == self.streams[stream].buf.len() {
                self.fill_buffer(stream)?;
                let s = &self.streams[stream];
                if s.bufp == s.buf.len() {
                    break; // stream fully drained
                }
            }
        }
        Ok(done)
    }

    /// Replace the stream's spent buffer with the next chunk, prefetching as
    /// far ahead as the sub-ring allows.
    fn fill_buffer(&mut self, stream: usize) -> Result<(), StreamError> {
        let shared = Arc::clone(&self.shared);
        self.streams[stream].buf = Vec::new();
        self.streams[stream].bufp = 0;

        // Dispatch chunk reads until the chain ends or the next slot is
        // still busy with an unconsumed chunk.
        loop {
            if self.streams[stream].eos {
                break;
            }
            self.dispatch_chunk(stream)?;
            let s = &self.streams[stream];
            if s.eos {
                break;
            }
            let next = &shared.slots[s.uthread_no];
            if next.free.try_wait() {
                next.free.post();
            } else {
                break;
            }
        }

        let s = &mut self.streams[stream];
        if s.outstanding == 0 {
            return Ok(()); // chain fully consumed; leave the buffer empty
        }

        // Hand the oldest outstanding chunk to the caller, in chain order.
        let slot = &shared.slots[s.unext_thread];
        slot.complete.wait();
        let result = slot.result.lock().unwrap().take();
        slot.ready.post();
        s.outstanding -= 1;
        s.unext_thread += 1;
        if s.unext_thread == s.base_thread + self.shared.cfg.threads.max(1) {
            s.unext_thread = s.base_thread;
        }

        match result {
            Some(plain) => {
                let s = &mut self.streams[stream];
                s.buf = plain;
                s.bufp = 0;
                Ok(())
            }
            None => match self.shared.poison.check() {
                Err(e) => Err(e),
                Ok(()) => Err(StreamError::Poisoned),
            },
        }
    }

    /// Read the next chunk header and payload for `stream` and start a
    /// decompression worker on the next slot of its sub-ring.
    fn dispatch_chunk(&mut self, stream: usize) -> Result<(), StreamError> {
        let shared = Arc::clone(&self.shared);
        let legacy = shared.cfg.legacy_headers();
        let threads = shared.cfg.threads.max(1);

        self.file
            .seek(SeekFrom::Start(self.streams[stream].last_head))
            .map_err(|e| StreamError::io(e, "seek to chunk header"))?;
        let header = ChunkHeader::read_from(&mut self.file, legacy)?;
        self.total_read += ChunkHeader::size(legacy);

        let c_type = Codec::from_tag(header.c_type).ok_or_else(|| {
            StreamError::Format(format!("unknown codec tag {} in chunk header", header.c_type))
        })?;
        if c_type == Codec::None && header.c_len != header.u_len {
            return Err(StreamError::Format(format!(
                "raw chunk advertises c_len {} but u_len {}",
                header.c_len, header.u_len
            )));
        }

        let slot_idx = self.streams[stream].uthread_no;
        let slot = &shared.slots[slot_idx];
        // Wait till this slot is idle, then reap its previous worker.
        slot.free.wait();
        if let Some(h) = slot.handle.lock().unwrap().take() {
            if h.join().is_err() {
                shared
                    .poison
                    .set(StreamError::Resource("decompression worker panicked".into()));
            }
        }

        let salt = if shared.cfg.crypto.is_some() {
            let mut salt = [0u8; SALT_LEN];
            if let Err(e) = read_exact(&mut self.file, &mut salt) {
                shared.slots[slot_idx].free.post();
                return Err(e);
            }
            self.total_read += SALT_LEN as u64;
            Some(salt)
        } else {
            None
        };

        let mut payload = Vec::new();
        if payload.try_reserve_exact(header.c_len as usize).is_err() {
            shared.slots[slot_idx].free.post();
            return Err(StreamError::Resource(format!(
                "cannot allocate {} byte chunk buffer",
                header.c_len
            )));
        }
        payload.resize(header.c_len as usize, 0);
        if let Err(e) = read_exact(&mut self.file, &mut payload) {
            shared.slots[slot_idx].free.post();
            return Err(e);
        }
        self.total_read += header.c_len;

        debug!(
            "starting thread {} to decompress {} bytes from stream {}",
            slot_idx, header.c_len, stream
        );
        let u_len = header.u_len as usize;
        let worker_shared = Arc::clone(&shared);
        let handle = match thread::Builder::new()
            .name(format!("decompress-{}", slot_idx))
            .spawn(move || decompress_worker(worker_shared, slot_idx, c_type, payload, u_len, salt))
        {
            Ok(h) => h,
            Err(e) => {
                shared.slots[slot_idx].free.post();
                return Err(StreamError::Resource(format!(
                    "failed to spawn decompression worker: {}",
                    e
                )));
            }
        };
        *shared.slots[slot_idx].handle.lock().unwrap() = Some(handle);

        let s = &mut self.streams[stream];
        s.last_head = header.next_off;
        if header.next_off == 0 {
            s.eos = true;
        }
        s.outstanding += 1;
        s.uthread_no += 1;
        if s.uthread_no == s.base_thread + threads {
            s.uthread_no = s.base_thread;
        }
        Ok(())
    }

    /// Drain the rings and reposition the file just past the container, so
    /// the caller may keep reading whatever follows it.
    pub fn close(mut self) -> Result<File, StreamError> {
        let threads = self.shared.cfg.threads.max(1);
        for s in &mut self.streams {
            while s.outstanding > 0 {
                let slot = &self.shared.slots[s.unext_thread];
                slot.complete.wait();
                slot.result.lock().unwrap().take();
                slot.ready.post();
                s.outstanding -= 1;
                s.unext_thread += 1;
                if s.unext_thread == s.base_thread + threads {
                    s.unext_thread = s.base_thread;
                }
            }
        }
        for slot in &self.shared.slots {
            if let Some(h) = slot.handle.lock().unwrap().take() {
                if h.join().is_err() {
                    self.shared
                        .poison
                        .set(StreamError::Resource("decompression worker panicked".into()));
                }
            }
        }

        self.shared.poison.check()?;

        self.file
            .seek(SeekFrom::Start(self.initial_pos + self.total_read))
            .map_err(|e| StreamError::io(e, "close_in reposition"))?;
        Ok(self.file)
    }
}

/// Decompress one chunk, park the plaintext in the slot, and wait to be
/// released. A failed chunk poisons the container and parks nothing.
fn decompress_worker(
    shared: Arc<ReaderShared>,
    slot_idx: usize,
    c_type: Codec,
    mut payload: Vec<u8>,
    u_len: usize,
    salt: Option<[u8; SALT_LEN]>,
) {
    let result = {
        if let (Some(ks), Some(salt)) = (shared.cfg.crypto.as_ref(), salt.as_ref()) {
            crypto::decrypt_chunk(ks, salt, &mut payload);
        }
        decompress_chunk(c_type, payload, u_len)
    };

    let slot = &shared.slots[slot_idx];
    match result {
        Ok(plain) => {
            *slot.result.lock().unwrap() = Some(plain);
        }
        Err(e) => shared.poison.set(e),
    }
    slot.complete.post();
    slot.ready.wait();
    slot.free.post();
}
