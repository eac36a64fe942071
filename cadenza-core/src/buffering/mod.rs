//! Playback ring between the receive loop and the output callback.
//!
//! Backed by `ringbuf::HeapRb<u8>`: the producer half ([`ChunkWriter`]) lives in
//! the background session context, the consumer half ([`FrameReader`]) is moved
//! into the real-time output callback. `FrameReader::pull_into` is wait-free
//! and allocation-free.
//!
//! Two additions on top of the plain SPSC ring:
//!
//! - **Spill.** `push` never drops. Bytes that do not fit in the ring are
//!   queued on the writer side and moved in, in order, as the reader frees
//!   space (`pump`). The spill queue is unbounded.
//! - **Discard watermark.** `clear` cannot touch the consumer half, so it
//!   publishes the total number of bytes written so far. The reader skips
//!   everything below that mark before serving its next pull.

pub mod chunk;
pub mod recording;

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

/// Counters shared between the two halves.
#[derive(Debug, Default)]
struct RingShared {
    /// Bytes that have entered the ring (excludes spill).
    written: AtomicU64,
    /// Bytes the reader has consumed or skipped.
    read: AtomicU64,
    /// Bytes below this offset are stale and must never be played.
    discard_to: AtomicU64,
    pulls: AtomicU64,
    underruns: AtomicU64,
    spilled: AtomicU64,
}

/// Point-in-time ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub pulls: u64,
    pub underruns: u64,
    /// Total bytes that ever had to wait in the spill queue.
    pub spilled_bytes: u64,
}

/// Create a matched writer/reader pair holding up to `capacity` bytes in the ring.
///
/// # Panics
/// Panics if `capacity` is zero.
pub fn audio_ring(capacity: usize) -> (ChunkWriter, FrameReader) {
    let (prod, cons) = HeapRb::<u8>::new(capacity).split();
    let shared = Arc::new(RingShared::default());
    (
        ChunkWriter {
            prod,
            spill: VecDeque::new(),
            spill_offset: 0,
            spill_bytes: 0,
            written: 0,
            shared: Arc::clone(&shared),
        },
        FrameReader {
            cons,
            read: 0,
            shared,
        },
    )
}

/// Producer half. Owned by the background session context.
pub struct ChunkWriter {
    prod: HeapProd<u8>,
    spill: VecDeque<Vec<u8>>,
    /// Bytes of `spill.front()` already moved into the ring.
    spill_offset: usize,
    spill_bytes: usize,
    written: u64,
    shared: Arc<RingShared>,
}

impl ChunkWriter {
    /// Append `data` after everything already queued. Never blocks, never drops.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.pump();

        if !self.spill.is_empty() {
            self.spill_back(data.to_vec());
            return;
        }

        let n = self.prod.push_slice(data);
        self.advance(n);
        if n < data.len() {
            self.spill_back(data[n..].to_vec());
        }
    }

    /// Move as much spilled data into the ring as currently fits.
    ///
    /// Returns the number of bytes moved.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;
        while let Some(front) = self.spill.front() {
            let rest = &front[self.spill_offset..];
            let n = self.prod.push_slice(rest);
            let drained = n == rest.len();
            self.advance(n);
            moved += n;
            self.spill_bytes -= n;
            if drained {
                self.spill.pop_front();
                self.spill_offset = 0;
            } else {
                self.spill_offset += n;
                break;
            }
        }
        moved
    }

    /// Discard everything queued so far, in the ring and in the spill.
    ///
    /// Takes effect at the start of the reader's next pull.
    pub fn clear(&mut self) {
        self.spill.clear();
        self.spill_offset = 0;
        self.spill_bytes = 0;
        self.shared.discard_to.store(self.written, Ordering::Release);
    }

    /// Bytes pushed but not yet pulled (stale bytes excluded).
    pub fn buffered_bytes(&self) -> usize {
        let read = self.shared.read.load(Ordering::Acquire);
        let live_from = read.max(self.shared.discard_to.load(Ordering::Acquire));
        self.written.saturating_sub(live_from) as usize + self.spill_bytes
    }

    /// Bytes waiting outside the ring.
    pub fn spilled_bytes(&self) -> usize {
        self.spill_bytes
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            pulls: self.shared.pulls.load(Ordering::Relaxed),
            underruns: self.shared.underruns.load(Ordering::Relaxed),
            spilled_bytes: self.shared.spilled.load(Ordering::Relaxed),
        }
    }

    fn spill_back(&mut self, bytes: Vec<u8>) {
        self.spill_bytes += bytes.len();
        self.shared
            .spilled
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.spill.push_back(bytes);
    }

    fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.written += n as u64;
        self.shared.written.store(self.written, Ordering::Release);
    }
}

/// Consumer half. Moved into the real-time output callback.
pub struct FrameReader {
    cons: HeapCons<u8>,
    read: u64,
    shared: Arc<RingShared>,
}

impl FrameReader {
    /// Fill `out` completely: queued bytes first, zeros for whatever is missing.
    ///
    /// Wait-free and allocation-free; safe to call from the output callback.
    /// Returns the number of real (non-padding) bytes written.
    pub fn pull_into(&mut self, out: &mut [u8]) -> usize {
        let discard_to = self.shared.discard_to.load(Ordering::Acquire);
        if self.read < discard_to {
            let stale = (discard_to - self.read) as usize;
            self.read += self.cons.skip(stale) as u64;
        }

        let n = self.cons.pop_slice(out);
        self.read += n as u64;
        if n < out.len() {
            out[n..].fill(0);
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.read.store(self.read, Ordering::Release);
        self.shared.pulls.fetch_add(1, Ordering::Relaxed);
        n
    }

    /// Allocating variant of [`pull_into`](Self::pull_into). Not for the callback.
    pub fn pull(&mut self, frame_byte_count: usize) -> Vec<u8> {
        let mut out = vec![0u8; frame_byte_count];
        self.pull_into(&mut out);
        out
    }
}
