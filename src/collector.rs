//! Jitter-buffered frame reassembly.
//!
//! Arriving chunks are grouped by frame id into `FrameBuffer`s. A frame
//!  becomes reconstructible as soon as K of its K+R chunks are present -
//!  directly if all data chunks survived, through the erasure coder
//!  otherwise. Reconstruction runs *outside* the collector lock: the ripe
//!  buffer is moved out of the map, decoded, and the result re-inserted
//!  under the lock, so a K^2-sized matrix inversion never stalls chunk
//!  ingestion.
//!
//! Completed frames are not handed to the consumer immediately. They wait
//!  in a pending map that the flusher thread drains in ascending (modular)
//!  frame-id order: a missing frame stalls emission for at most the jitter
//!  window, then its id range is skipped and recorded. Frames that complete
//!  after the cursor has passed them are dropped, which also makes
//!  double-emission impossible.
//!
//! The flusher thread doubles as the eviction sweep: any frame buffer older
//!  than the jitter window gets one final reconstruction attempt (if it has
//!  enough chunks) and is discarded either way.

use crate::chunk::Chunk;
use crate::error::TransportError;
use crate::fec::ErasureCoder;
use crate::frame_id::FrameId;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consumer capability: receives reassembled frames from the flusher
///  thread. Implementations must not block.
pub trait FrameSink: Send + Sync + 'static {
    fn on_frame_ready(&self, frame_id: FrameId, payload: Bytes);
}

/// How many recently dropped / skipped frame ids are retained for
///  diagnostics.
const ID_HISTORY: usize = 64;

/// Upper bound for the shutdown-check granularity of the flusher thread.
const MAX_TICK: Duration = Duration::from_millis(10);

/// Accumulates the chunks of one frame until reconstruction or eviction.
struct FrameBuffer {
    /// One slot per chunk id; duplicates never overwrite (first wins).
    slots: Vec<Option<Chunk>>,
    k: u16,
    r: u16,
    arrived: usize,
    data_arrived: usize,
    first_arrival: Instant,
}

impl FrameBuffer {
    fn new(k: u16, r: u16, now: Instant) -> FrameBuffer {
        FrameBuffer {
            slots: vec![None; k as usize + r as usize],
            k,
            r,
            arrived: 0,
            data_arrived: 0,
            first_arrival: now,
        }
    }

    /// Returns false for a duplicate (the slot keeps its first occupant).
    fn insert(&mut self, chunk: Chunk) -> bool {
        let slot = &mut self.slots[chunk.chunk_id as usize];
        if slot.is_some() {
            return false;
        }
        if chunk.chunk_id < self.k {
            self.data_arrived += 1;
        }
        self.arrived += 1;
        *slot = Some(chunk);
        true
    }

    fn is_ready(&self) -> bool {
        self.arrived >= self.k as usize
    }
}

struct PendingFrame {
    payload: Bytes,
    completed_at: Instant,
}

#[derive(Default)]
struct CollectorInner {
    frames: FxHashMap<u32, FrameBuffer>,
    pending: FxHashMap<u32, PendingFrame>,
    /// The next frame id the consumer should see; `None` until the first
    ///  emission.
    next_expected: Option<FrameId>,

    duplicate_chunks: u64,
    stale_chunks: u64,
    rejected_chunks: u64,
    frames_emitted: u64,
    frames_dropped: u64,
    frames_skipped: u64,
    late_frames: u64,
    decode_failures: u64,

    dropped_ids: VecDeque<u32>,
    skipped_ids: VecDeque<u32>,
}

impl CollectorInner {
    fn record_dropped(&mut self, frame_id: FrameId) {
        self.frames_dropped += 1;
        if self.dropped_ids.len() == ID_HISTORY {
            self.dropped_ids.pop_front();
        }
        self.dropped_ids.push_back(frame_id.to_raw());
    }

    fn record_skipped(&mut self, frame_id: FrameId) {
        if self.skipped_ids.len() == ID_HISTORY {
            self.skipped_ids.pop_front();
        }
        self.skipped_ids.push_back(frame_id.to_raw());
    }

    /// Smallest pending frame id in modular order.
    fn pending_head(&self) -> Option<FrameId> {
        self.pending
            .keys()
            .copied()
            .map(FrameId::from_raw)
            .reduce(|a, b| {
                if b.seq_cmp(a) == CmpOrdering::Less {
                    b
                }
                else {
                    a
                }
            })
    }

    fn drain_ready(&mut self, jitter_window: Duration, now: Instant) -> Vec<(FrameId, Bytes)> {
        let mut emissions = Vec::new();
        loop {
            // completions that arrived after the cursor passed them
            if let Some(next_expected) = self.next_expected {
                let late: Vec<u32> = self
                    .pending
                    .keys()
                    .copied()
                    .filter(|&raw| FrameId::from_raw(raw).seq_cmp(next_expected) == CmpOrdering::Less)
                    .collect();
                for raw in late {
                    debug!("dropping late completed frame {}", raw);
                    self.pending.remove(&raw);
                    self.late_frames += 1;
                }
            }

            let head = match self.pending_head() {
                Some(head) => head,
                None => break,
            };

            match self.next_expected {
                Some(next_expected) if head != next_expected => {
                    // gap: wait up to the jitter window for it to fill, then
                    //  skip past it
                    let waited = now.duration_since(self.pending[&head.to_raw()].completed_at);
                    if waited < jitter_window {
                        break;
                    }

                    let gap = head.distance_from(next_expected) as u64;
                    warn!(
                        "gap of {} frame(s) before {} did not fill within the jitter window, skipping",
                        gap, head
                    );
                    self.frames_skipped += gap;
                    let mut skipped = next_expected;
                    for _ in 0..u64::min(gap, ID_HISTORY as u64) {
                        self.record_skipped(skipped);
                        skipped = skipped.next();
                    }
                }
                None => {
                    // no frame emitted yet, so there is no cursor to order
                    //  against: treat the unknown predecessors as a gap and
                    //  age the head one jitter window, which lets a
                    //  reordered startup burst settle into ascending order
                    let waited = now.duration_since(self.pending[&head.to_raw()].completed_at);
                    if waited < jitter_window {
                        break;
                    }
                }
                _ => {}
            }

            let pending = self.pending.remove(&head.to_raw()).unwrap();
            self.frames_emitted += 1;
            self.next_expected = Some(head.next());
            emissions.push((head, pending.payload));
        }
        emissions
    }
}

/// Running totals of the collector, for metrics exporters and tests.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CollectorStats {
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub late_frames: u64,
    pub duplicate_chunks: u64,
    pub stale_chunks: u64,
    pub rejected_chunks: u64,
    pub decode_failures: u64,
}

pub struct SmartCollector {
    inner: Mutex<CollectorInner>,
    coders: Mutex<FxHashMap<(u16, u16), Arc<ErasureCoder>>>,
    sink: Arc<dyn FrameSink>,
    payload_size: usize,
    jitter_window: Duration,
    flush_interval: Duration,
    running: Arc<AtomicBool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl SmartCollector {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        payload_size: usize,
        jitter_window: Duration,
        flush_interval: Duration,
    ) -> SmartCollector {
        SmartCollector {
            inner: Mutex::new(CollectorInner::default()),
            coders: Mutex::new(FxHashMap::default()),
            sink,
            payload_size,
            jitter_window,
            flush_interval,
            running: Arc::new(AtomicBool::new(false)),
            flusher: Mutex::new(None),
        }
    }

    /// Ingests one chunk. Duplicates, stale chunks and malformed chunks are
    ///  counted and otherwise ignored; a chunk completing its frame triggers
    ///  reconstruction synchronously (outside the collector lock).
    pub fn push_chunk(&self, chunk: Chunk) {
        let frame_id = chunk.frame_id;
        let ready = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(next_expected) = inner.next_expected {
                if frame_id.seq_cmp(next_expected) == CmpOrdering::Less {
                    inner.stale_chunks += 1;
                    return;
                }
            }
            if inner.pending.contains_key(&frame_id.to_raw()) {
                inner.duplicate_chunks += 1;
                return;
            }
            // a frame gets exactly one reconstruction attempt: chunks
            //  arriving after its buffer was given up on must not recreate it
            if inner.dropped_ids.contains(&frame_id.to_raw()) {
                inner.stale_chunks += 1;
                return;
            }
            if chunk.payload.len() != self.payload_size
                || (chunk.chunk_id as u32) >= chunk.k as u32 + chunk.r as u32
                || chunk.k as u32 + chunk.r as u32 > crate::fec::MAX_TOTAL_CHUNKS
            {
                inner.rejected_chunks += 1;
                return;
            }

            let now = Instant::now();
            let buffer = inner
                .frames
                .entry(frame_id.to_raw())
                .or_insert_with(|| FrameBuffer::new(chunk.k, chunk.r, now));
            if buffer.k != chunk.k || buffer.r != chunk.r {
                warn!(
                    "chunk for frame {} carries k/r {}/{}, buffer has {}/{}",
                    frame_id, chunk.k, chunk.r, buffer.k, buffer.r
                );
                inner.rejected_chunks += 1;
                return;
            }
            if !buffer.insert(chunk) {
                inner.duplicate_chunks += 1;
                return;
            }

            if buffer.is_ready() {
                inner.frames.remove(&frame_id.to_raw())
            }
            else {
                None
            }
        };

        if let Some(buffer) = ready {
            self.complete_frame(frame_id, buffer);
        }
    }

    /// Reconstructs outside the lock, then parks the result for in-order
    ///  emission.
    fn complete_frame(&self, frame_id: FrameId, buffer: FrameBuffer) {
        match self.reconstruct(&buffer) {
            Ok(payload) => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(next_expected) = inner.next_expected {
                    if frame_id.seq_cmp(next_expected) == CmpOrdering::Less {
                        inner.late_frames += 1;
                        return;
                    }
                }
                inner.pending.insert(
                    frame_id.to_raw(),
                    PendingFrame {
                        payload,
                        completed_at: Instant::now(),
                    },
                );
            }
            Err(e) => {
                warn!("reconstruction of frame {} failed: {}", frame_id, e);
                let mut inner = self.inner.lock().unwrap();
                inner.decode_failures += 1;
                inner.record_dropped(frame_id);
            }
        }
    }

    fn reconstruct(&self, buffer: &FrameBuffer) -> Result<Bytes, TransportError> {
        let k = buffer.k as usize;

        if buffer.data_arrived == k {
            // every data chunk survived, no coding needed
            let total: usize = buffer.slots[..k]
                .iter()
                .flatten()
                .map(|c| c.chunk_size as usize)
                .sum();
            let mut frame = BytesMut::with_capacity(total);
            for chunk in buffer.slots[..k].iter().flatten() {
                frame.extend_from_slice(&chunk.payload[..chunk.chunk_size as usize]);
            }
            return Ok(frame.freeze());
        }

        // parity chunks carry the frame total; at least one is present
        //  whenever the buffer is ready with a data chunk missing
        let total = buffer.slots[k..]
            .iter()
            .flatten()
            .next()
            .map(|c| c.chunk_size as usize)
            .ok_or(TransportError::InsufficientChunks {
                present: buffer.arrived,
                needed: k,
            })?;

        let coder = self.coder(buffer.k, buffer.r)?;
        let present: Vec<(u16, &[u8])> = buffer
            .slots
            .iter()
            .flatten()
            .map(|c| (c.chunk_id, c.payload.as_ref()))
            .collect();
        let data = coder.decode(&present)?;

        let mut frame = BytesMut::with_capacity(k * self.payload_size);
        for chunk in &data {
            frame.extend_from_slice(chunk);
        }
        frame.truncate(total);
        Ok(frame.freeze())
    }

    fn coder(&self, k: u16, r: u16) -> Result<Arc<ErasureCoder>, TransportError> {
        let mut coders = self.coders.lock().unwrap();
        if let Some(coder) = coders.get(&(k, r)) {
            return Ok(coder.clone());
        }
        let coder = Arc::new(ErasureCoder::new(k, r)?);
        coders.insert((k, r), coder.clone());
        Ok(coder)
    }

    /// One sweep of the flusher: evict expired frame buffers, then emit
    ///  whatever the in-order cursor allows.
    fn flush(&self) {
        let now = Instant::now();

        let expired: Vec<(u32, FrameBuffer)> = {
            let mut inner = self.inner.lock().unwrap();
            let expired_ids: Vec<u32> = inner
                .frames
                .iter()
                .filter(|(_, b)| now.duration_since(b.first_arrival) >= self.jitter_window)
                .map(|(&raw, _)| raw)
                .collect();
            expired_ids
                .into_iter()
                .map(|raw| {
                    let buffer = inner.frames.remove(&raw).unwrap();
                    (raw, buffer)
                })
                .collect()
        };

        for (raw, buffer) in expired {
            let frame_id = FrameId::from_raw(raw);
            if buffer.is_ready() {
                // ready but never completed - can happen when the final
                //  chunk raced the sweep
                self.complete_frame(frame_id, buffer);
            }
            else {
                debug!(
                    "dropping unrecoverable frame {} after jitter window ({}/{} chunks)",
                    frame_id,
                    buffer.arrived,
                    buffer.k + buffer.r
                );
                self.inner.lock().unwrap().record_dropped(frame_id);
            }
        }

        let emissions = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain_ready(self.jitter_window, now)
        };
        for (frame_id, payload) in emissions {
            self.sink.on_frame_ready(frame_id, payload);
        }
    }

    /// Starts the flusher thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("collector is already running");
            return;
        }
        info!(
            "collector starting (jitter window {:?}, flush interval {:?})",
            self.jitter_window, self.flush_interval
        );

        let collector = self.clone();
        let running = self.running.clone();
        let tick = Duration::min(self.flush_interval, MAX_TICK);
        let handle = std::thread::spawn(move || {
            let mut last_flush = Instant::now();
            while running.load(Ordering::Relaxed) {
                if last_flush.elapsed() >= collector.flush_interval {
                    collector.flush();
                    last_flush = Instant::now();
                }
                std::thread::sleep(tick);
            }
            debug!("flusher thread exiting");
        });
        *self.flusher.lock().unwrap() = Some(handle);
    }

    /// Signals the flusher thread and joins it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("collector stopped");
    }

    pub fn stats(&self) -> CollectorStats {
        let inner = self.inner.lock().unwrap();
        CollectorStats {
            frames_emitted: inner.frames_emitted,
            frames_dropped: inner.frames_dropped,
            frames_skipped: inner.frames_skipped,
            late_frames: inner.late_frames,
            duplicate_chunks: inner.duplicate_chunks,
            stale_chunks: inner.stale_chunks,
            rejected_chunks: inner.rejected_chunks,
            decode_failures: inner.decode_failures,
        }
    }

    /// The most recently dropped frame ids (bounded history).
    pub fn recent_dropped_frames(&self) -> Vec<FrameId> {
        self.inner
            .lock()
            .unwrap()
            .dropped_ids
            .iter()
            .copied()
            .map(FrameId::from_raw)
            .collect()
    }

    /// The most recently skipped frame ids (bounded history).
    pub fn recent_skipped_frames(&self) -> Vec<FrameId> {
        self.inner
            .lock()
            .unwrap()
            .skipped_ids
            .iter()
            .copied()
            .map(FrameId::from_raw)
            .collect()
    }
}

impl Drop for SmartCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
