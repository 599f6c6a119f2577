//! Epoch extraction from the acquired sample stream.
//!
//! The extractor is driven by the acquisition thread, one chunk at a time.
//! Requests and cancellations arrive from the stimulus side over lock-free
//! ring buffers, carrying `(t0, key)` identities. A bounded lookback buffer
//! of recent chunks lets a request whose start is already past still be
//! captured; once the start scrolls out of the lookback window the epoch is
//! reported missed instead.

mod capture;

use std::collections::VecDeque;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use serde::Serialize;
use serde_json::Value;

use crate::error::EpochError;
use crate::queue::{EventKind, Key, QueueEvent, StimulusQueue, TrialRecord};

pub use capture::{CaptureOutcome, EpochCapture};

/// A request to capture one epoch. `(t0, key)` is the identity used for
/// matching, cancellation and deduplication.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRequest {
    /// Epoch start in seconds, absolute to acquisition start.
    pub t0: f64,
    pub key: Key,
    pub duration: Option<f64>,
    pub metadata: Option<Value>,
}

impl EpochRequest {
    pub fn from_record(record: &TrialRecord) -> Self {
        EpochRequest {
            t0: record.t0,
            key: record.key,
            duration: Some(record.duration),
            metadata: record.metadata.clone(),
        }
    }
}

/// Request fields plus the capture window the extractor resolved for it.
#[derive(Debug, Clone, Serialize)]
pub struct EpochInfo {
    pub t0: f64,
    pub key: Key,
    pub duration: Option<f64>,
    pub epoch_size: f64,
    pub poststim_time: f64,
    pub metadata: Option<Value>,
}

/// One captured (or missed) epoch.
#[derive(Debug, Clone, Serialize)]
pub struct Epoch {
    /// `None` when the epoch was missed.
    pub signal: Option<Vec<f32>>,
    pub info: EpochInfo,
}

/// Identity of an in-flight epoch. `t0` is compared by bit pattern, so the
/// request and its removal must quote the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EpochId {
    t0_bits: u64,
    key: Key,
}

impl EpochId {
    fn new(t0: f64, key: Key) -> Self {
        EpochId {
            t0_bits: t0.to_bits(),
            key,
        }
    }
}

pub struct ExtractorConfig {
    pub fs: f64,
    /// Epoch length in seconds; 0.0 means each request's own duration.
    pub epoch_size: f64,
    /// Extra capture time appended after the epoch proper.
    pub poststim_time: f64,
    /// Seconds of history kept for capturing epochs requested after the fact.
    pub buffer_size: f64,
}

pub type EpochTarget = Box<dyn FnMut(Vec<Epoch>) + Send>;

struct BufferedChunk {
    tlb: i64,
    data: Vec<f32>,
}

pub struct EpochExtractor {
    fs: f64,
    epoch_size: f64,
    poststim_time: f64,
    buffer_samples: i64,
    /// Absolute index of the next incoming sample.
    tlb: i64,
    lookback: VecDeque<BufferedChunk>,
    /// In-flight captures in insertion order.
    active: Vec<(EpochId, EpochCapture)>,
    pending: Vec<Epoch>,
    requests: HeapCons<EpochRequest>,
    removals: HeapCons<EpochRequest>,
    target: EpochTarget,
    empty_queue_callback: Option<Box<dyn FnOnce() + Send>>,
}

impl EpochExtractor {
    pub fn new(
        config: ExtractorConfig,
        requests: HeapCons<EpochRequest>,
        removals: HeapCons<EpochRequest>,
        target: impl FnMut(Vec<Epoch>) + Send + 'static,
    ) -> Self {
        EpochExtractor {
            fs: config.fs,
            epoch_size: config.epoch_size,
            poststim_time: config.poststim_time,
            buffer_samples: (config.buffer_size * config.fs).round() as i64,
            tlb: 0,
            lookback: VecDeque::new(),
            active: Vec::new(),
            pending: Vec::new(),
            requests,
            removals,
            target: Box::new(target),
            empty_queue_callback: None,
        }
    }

    /// Invoked once, after a `process` call finds both the request queue and
    /// the in-flight set empty.
    pub fn set_empty_queue_callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.empty_queue_callback = Some(Box::new(callback));
    }

    /// Absolute index of the next incoming sample.
    pub fn tlb(&self) -> i64 {
        self.tlb
    }

    pub fn n_active(&self) -> usize {
        self.active.len()
    }

    /// End (one past the last sample) of the oldest buffered chunk.
    pub fn oldest_buffered_end(&self) -> Option<i64> {
        self.lookback
            .front()
            .map(|chunk| chunk.tlb + chunk.data.len() as i64)
    }

    /// Consume the next acquired chunk.
    ///
    /// Removals are handled before new requests, so a removal arriving in
    /// the same tick as its request cancels it. New requests replay the
    /// lookback buffer; completed epochs are flushed to the target as one
    /// batch at the end of the call.
    ///
    /// A duplicate `(t0, key)` request is dropped and reported as
    /// `DuplicateEpoch` after the chunk has been fully accounted for; the
    /// extractor stays consistent and can keep being driven.
    pub fn process(&mut self, data: &[f32]) -> Result<(), EpochError> {
        self.lookback.push_back(BufferedChunk {
            tlb: self.tlb,
            data: data.to_vec(),
        });

        let mut skip: Vec<EpochId> = Vec::new();
        let mut n_marked = 0;
        let mut n_dropped = 0;
        while let Some(removal) = self.removals.try_pop() {
            let id = EpochId::new(removal.t0, removal.key);
            if let Some(position) = self.active.iter().position(|(active_id, _)| *active_id == id)
            {
                self.active.remove(position);
                n_dropped += 1;
            } else {
                skip.push(id);
                n_marked += 1;
            }
        }
        log::debug!("marked {n_marked} epochs for removal, removed {n_dropped} epochs");

        // Feed the new chunk to in-flight captures; settled ones leave the
        // active set in completion order.
        let tlb = self.tlb;
        let mut index = 0;
        while index < self.active.len() {
            match self.active[index].1.on_chunk(tlb, data) {
                CaptureOutcome::Continue => index += 1,
                CaptureOutcome::Complete(signal) => {
                    let (_, capture) = self.active.remove(index);
                    self.pending.push(Epoch {
                        signal: Some(signal),
                        info: capture.info,
                    });
                }
                CaptureOutcome::Missed => {
                    let (_, capture) = self.active.remove(index);
                    self.pending.push(Epoch {
                        signal: None,
                        info: capture.info,
                    });
                }
            }
        }

        let mut n_queued = 0;
        let mut n_invalid = 0;
        let mut duplicate: Option<EpochError> = None;
        while let Some(request) = self.requests.try_pop() {
            let id = EpochId::new(request.t0, request.key);
            if let Some(position) = skip.iter().position(|skipped| *skipped == id) {
                skip.remove(position);
                n_invalid += 1;
                continue;
            }
            n_queued += 1;

            let epoch_size = if self.epoch_size > 0.0 {
                self.epoch_size
            } else {
                match request.duration {
                    Some(duration) => duration,
                    None => {
                        log::warn!(
                            "epoch request for key {} has no duration, capturing zero samples",
                            request.key
                        );
                        0.0
                    }
                }
            };
            let t0_samples = (request.t0 * self.fs).round() as i64;
            let epoch_samples = ((epoch_size + self.poststim_time) * self.fs).round().max(0.0) as usize;
            let info = EpochInfo {
                t0: request.t0,
                key: request.key,
                duration: request.duration,
                epoch_size,
                poststim_time: self.poststim_time,
                metadata: request.metadata,
            };
            let mut capture = EpochCapture::new(t0_samples, epoch_samples, info);

            // Replay buffered history. The current chunk is already in the
            // buffer, so a request landing in it settles right here.
            let mut settled: Option<Option<Vec<f32>>> = None;
            for chunk in &self.lookback {
                match capture.on_chunk(chunk.tlb, &chunk.data) {
                    CaptureOutcome::Continue => continue,
                    CaptureOutcome::Complete(signal) => {
                        settled = Some(Some(signal));
                        break;
                    }
                    CaptureOutcome::Missed => {
                        settled = Some(None);
                        break;
                    }
                }
            }
            match settled {
                Some(signal) => self.pending.push(Epoch {
                    signal,
                    info: capture.info,
                }),
                None => {
                    if self.active.iter().any(|(active_id, _)| *active_id == id) {
                        // Drop this request only; tlb advance, flush and
                        // prune below must still run so the next chunk is
                        // indexed correctly.
                        duplicate = Some(EpochError::DuplicateEpoch);
                        continue;
                    }
                    self.active.push((id, capture));
                }
            }
        }
        log::debug!("queued {n_queued} epochs, {n_invalid} were invalid");

        self.tlb += data.len() as i64;

        if !self.pending.is_empty() {
            (self.target)(std::mem::take(&mut self.pending));
        }

        // Drop chunks whose last sample has left the lookback window.
        while let Some(oldest) = self.lookback.front() {
            let tub = oldest.tlb + oldest.data.len() as i64;
            if tub <= self.tlb - self.buffer_samples {
                self.lookback.pop_front();
            } else {
                break;
            }
        }

        if self.requests.is_empty() && self.active.is_empty() {
            if let Some(callback) = self.empty_queue_callback.take() {
                callback();
            }
        }

        match duplicate {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Wire a queue's `added`/`removed` events into a pair of ring buffers an
/// extractor can drain from the acquisition thread. Overflow drops the
/// request with a warning rather than blocking the output thread.
pub fn connect_epoch_requests(
    queue: &mut StimulusQueue,
    capacity: usize,
) -> (HeapCons<EpochRequest>, HeapCons<EpochRequest>) {
    let (mut added_producer, added_consumer) = HeapRb::<EpochRequest>::new(capacity).split();
    let (mut removed_producer, removed_consumer) = HeapRb::<EpochRequest>::new(capacity).split();

    queue.connect(EventKind::Added, move |event| {
        if let QueueEvent::Added(record) = event {
            if added_producer
                .try_push(EpochRequest::from_record(record))
                .is_err()
            {
                log::warn!("epoch request queue full, dropping request for key {}", record.key);
            }
        }
    });
    queue.connect(EventKind::Removed, move |event| {
        if let QueueEvent::Removed(record) = event {
            if removed_producer
                .try_push(EpochRequest::from_record(record))
                .is_err()
            {
                log::warn!("epoch removal queue full, dropping removal for key {}", record.key);
            }
        }
    });

    (added_consumer, removed_consumer)
}
