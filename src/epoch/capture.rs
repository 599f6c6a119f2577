//! Per-epoch capture state machine.
//!
//! Each in-flight epoch is an explicit state object fed successive sample
//! chunks. `Complete` and `Missed` are terminal; the caller drops the state
//! after either.

use super::EpochInfo;

pub enum CaptureOutcome {
    /// The epoch is not finished; feed the next chunk.
    Continue,
    /// All samples acquired; the concatenated signal.
    Complete(Vec<f32>),
    /// The epoch start has already scrolled past; nothing can be captured.
    Missed,
}

pub struct EpochCapture {
    /// Next sample index to capture, absolute to acquisition start.
    t0_samples: i64,
    samples_remaining: usize,
    accumulated: Vec<Vec<f32>>,
    pub(crate) info: EpochInfo,
}

impl EpochCapture {
    pub fn new(t0_samples: i64, epoch_samples: usize, info: EpochInfo) -> Self {
        EpochCapture {
            t0_samples,
            samples_remaining: epoch_samples,
            accumulated: Vec::new(),
            info,
        }
    }

    pub fn info(&self) -> &EpochInfo {
        &self.info
    }

    /// Advance with a chunk whose first sample has absolute index `tlb`.
    pub fn on_chunk(&mut self, tlb: i64, data: &[f32]) -> CaptureOutcome {
        let samples = data.len() as i64;

        if self.t0_samples < tlb {
            log::warn!(
                "missed samples for epoch of {} samples starting at {}",
                self.samples_remaining,
                self.t0_samples
            );
            return CaptureOutcome::Missed;
        }

        if self.t0_samples <= tlb + samples {
            // The capture point is inside (or at the end of) this chunk.
            // Take what the chunk holds; the rest comes from later chunks.
            let i = (self.t0_samples - tlb) as usize;
            let d = self.samples_remaining.min(samples as usize - i);
            self.accumulated.push(data[i..i + d].to_vec());
            self.t0_samples += d as i64;
            self.samples_remaining -= d;

            if self.samples_remaining == 0 {
                let total = self.accumulated.iter().map(Vec::len).sum();
                let mut signal = Vec::with_capacity(total);
                for piece in self.accumulated.drain(..) {
                    signal.extend(piece);
                }
                return CaptureOutcome::Complete(signal);
            }
        }

        CaptureOutcome::Continue
    }
}
