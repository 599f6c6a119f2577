//! Sample dispatch: filling output buffers from the queue.
//!
//! `pop_buffer` always delivers exactly the number of samples asked for,
//! interleaving trial waveforms with intertrial silence and padding with
//! silence once the queue runs dry. Pause, cancel, requeue and rewind give
//! the experiment loop sample-accurate control over an interrupted run.

use std::collections::HashMap;

use super::{Key, QueueEvent, StimulusQueue, TrialRecord};
use crate::error::QueueError;
use crate::source::Source;

/// Where dispatch currently is. `Paused` overlays the rest; `Empty` means
/// the policy has reported the queue spent and output is padding silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DispatchState {
    Idle,
    Delaying,
    Playing,
    Paused,
    Empty,
}

/// Read head for the token currently being played out.
pub(crate) struct ActiveSource {
    pub(crate) key: Key,
    pub(crate) mode: ReadMode,
}

pub(crate) enum ReadMode {
    Generator,
    Array { position: usize },
}

impl StimulusQueue {
    /// Fill exactly `samples` output samples.
    ///
    /// Trials are set up on demand through the ordering policy; an empty
    /// queue latches the empty flag and pads with silence. A negative
    /// intertrial delay surfaces as `InvalidDelay`.
    pub fn pop_buffer(&mut self, samples: usize, decrement: bool) -> Result<Vec<f32>, QueueError> {
        let mut output = Vec::with_capacity(samples);
        let mut remaining = samples;
        while remaining > 0 {
            let block = match self.pop_block(remaining, decrement) {
                Ok(block) => block,
                Err(QueueError::QueueEmpty) => {
                    log::info!("queue is empty");
                    self.empty = true;
                    vec![0.0; remaining]
                }
                Err(err) => return Err(err),
            };
            remaining -= block.len();
            self.samples += block.len() as u64;
            output.extend(block);
        }
        log::trace!("generated {} samples", output.len());
        Ok(output)
    }

    /// One step of buffer filling: returns up to `samples` samples, possibly
    /// none when the step only set up the next trial.
    fn pop_block(&mut self, samples: usize, decrement: bool) -> Result<Vec<f32>, QueueError> {
        if self.paused {
            return Ok(vec![0.0; samples]);
        }

        if self.active.is_some() {
            return Ok(self.read_active(samples));
        }

        if self.delay_samples > 0 {
            let n = self.delay_samples.min(samples as u64) as usize;
            self.delay_samples -= n as u64;
            return Ok(vec![0.0; n]);
        }

        self.next_trial(decrement)?;
        Ok(Vec::new())
    }

    fn read_active(&mut self, samples: usize) -> Vec<f32> {
        let Some(ActiveSource { key, mode }) = self.active.take() else {
            return Vec::new();
        };
        let Some(token) = self.data.get_mut(&key) else {
            return Vec::new();
        };
        match (mode, &mut token.source) {
            (ReadMode::Generator, Source::Generator(generator)) => {
                let n = samples.min(generator.n_samples_remaining());
                let block = generator.next(n);
                if !generator.is_complete() {
                    self.active = Some(ActiveSource {
                        key,
                        mode: ReadMode::Generator,
                    });
                }
                block
            }
            (ReadMode::Array { position }, Source::Array(data)) => {
                let end = (position + samples).min(data.len());
                let block = data[position..end].to_vec();
                if end < data.len() {
                    self.active = Some(ActiveSource {
                        key,
                        mode: ReadMode::Array { position: end },
                    });
                }
                block
            }
            _ => Vec::new(),
        }
    }

    /// Set up the next trial immediately. Calling this mid-trial abandons
    /// the current one.
    pub fn next_trial(&mut self, decrement: bool) -> Result<(), QueueError> {
        let key = self.policy.next_key(&self.ordering)?;
        if decrement {
            self.decrement_key(key, 1)?;
        }

        let fs = self.fs;
        let token = self.data.get_mut(&key).ok_or(QueueError::UnknownKey(key))?;
        let mode = match &mut token.source {
            Source::Generator(generator) => {
                generator.reset();
                ReadMode::Generator
            }
            Source::Array(_) => ReadMode::Array { position: 0 },
        };

        let delay = token.delays.next_delay();
        if delay < 0.0 {
            return Err(QueueError::InvalidDelay(delay));
        }
        let duration = token.duration;
        let metadata = token.metadata.clone();

        self.delay_samples = (delay * fs).round() as u64;
        self.active = Some(ActiveSource { key, mode });

        let record = TrialRecord {
            t0: self.t0 + self.samples as f64 / fs,
            duration,
            key,
            metadata,
            decrement,
        };
        self.generated.push(record.clone());
        self.notify(QueueEvent::Added(record));
        Ok(())
    }

    // --- Playback control ---

    /// Stop producing samples. With `t`, also cancel and requeue everything
    /// scheduled past `t` and rewind to it.
    pub fn pause(&mut self, t: Option<f64>) -> Result<(), QueueError> {
        log::debug!("pausing queue");
        self.paused = true;
        if let Some(t) = t {
            self.cancel(t, 0.0);
            self.requeue(t);
            self.rewind_samples(t)?;
        }
        Ok(())
    }

    /// Emit `removed` for every trial still underway at `t`. An in-flight
    /// source has its decrement undone and is dropped; the next output then
    /// starts after `delay` seconds of silence.
    pub fn cancel(&mut self, t: f64, delay: f64) {
        let cancelled: Vec<TrialRecord> = self
            .generated
            .iter()
            .rev()
            .filter(|record| record.t0 + record.duration > t)
            .cloned()
            .collect();
        for record in cancelled {
            self.notify(QueueEvent::Removed(record));
        }

        if self.active.take().is_some() {
            if let Some(record) = self.generated.last_mut() {
                // Clearing the flag keeps requeue from crediting the same
                // trial a second time.
                if record.decrement {
                    record.decrement = false;
                    let key = record.key;
                    if let Some(token) = self.data.get_mut(&key) {
                        token.trials += 1;
                    }
                }
            }
        }

        self.delay_samples = (delay * self.fs).round() as u64;
    }

    /// Add trials scheduled after `t` back onto their tokens. Only trials
    /// whose dispatch decremented the counter are credited; keys that fell
    /// out of the ordering are put back at the front.
    pub fn requeue(&mut self, t: f64) {
        let mut to_requeue: Vec<Key> = Vec::new();
        for record in self.generated.iter().rev() {
            if record.t0 + record.duration <= t {
                continue;
            }
            if record.decrement {
                to_requeue.push(record.key);
            }
        }

        // to_requeue runs from last to first in time, so inserting each
        // missing key at the front restores the forward order.
        for &key in &to_requeue {
            if !self.ordering.contains(&key) {
                self.ordering.insert(0, key);
            }
        }

        let mut counts: HashMap<Key, i64> = HashMap::new();
        for &key in &to_requeue {
            *counts.entry(key).or_insert(0) += 1;
        }
        for (key, count) in counts {
            log::debug!("adding {count} trials for key {key} back to queue");
            if let Some(token) = self.data.get_mut(&key) {
                token.trials += count;
            }
        }
    }

    /// Move the output position back to `t`. Moving forward past the last
    /// generated sample is refused; rewinding before the queue start clamps
    /// to zero.
    pub fn rewind_samples(&mut self, t: f64) -> Result<(), QueueError> {
        log::debug!(
            "current queue time is {:.3}, attempting rewind to {:.3}",
            self.get_ts(),
            t
        );
        let t_samples = (t * self.fs).round() as i64;
        let t0_samples = (self.t0 * self.fs).round() as i64;
        let new_sample = t_samples - t0_samples;
        if new_sample > self.samples as i64 {
            return Err(QueueError::RewindPastEnd {
                requested: t,
                last: self.get_ts(),
            });
        }
        self.samples = new_sample.max(0) as u64;
        log::debug!("rewound queue to sample {}", self.samples);
        Ok(())
    }

    /// Resume producing samples, optionally rewinding to `t` first.
    pub fn resume(&mut self, t: Option<f64>) -> Result<(), QueueError> {
        log::debug!("resuming queue, current timestamp is {:.3}", self.get_ts());
        if let Some(t) = t {
            self.rewind_samples(t)?;
        }
        self.paused = false;
        Ok(())
    }

    pub fn state(&self) -> DispatchState {
        if self.paused {
            DispatchState::Paused
        } else if self.active.is_some() {
            DispatchState::Playing
        } else if self.delay_samples > 0 {
            DispatchState::Delaying
        } else if self.empty {
            DispatchState::Empty
        } else {
            DispatchState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::EventKind;
    use super::*;
    use crate::source::Delays;
    use crate::tones::{ToneGenerator, Waveform};
    use std::sync::{Arc, Mutex};

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    fn record_added_keys(queue: &mut StimulusQueue) -> Arc<Mutex<Vec<Key>>> {
        let keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&keys);
        queue.connect(EventKind::Added, move |event| {
            if let QueueEvent::Added(record) = event {
                sink.lock().unwrap().push(record.key);
            }
        });
        keys
    }

    #[test]
    fn fifo_single_token_single_trial() {
        let mut queue = StimulusQueue::fifo(100.0);
        let samples = ramp(50);
        queue.append(samples.clone(), 1, vec![0.0], None, None);

        assert_eq!(queue.pop_buffer(50, true).unwrap(), samples);
        assert!(!queue.is_empty());

        let padding = queue.pop_buffer(10, true).unwrap();
        assert_eq!(padding, vec![0.0; 10]);
        assert!(queue.is_empty());
        assert_eq!(queue.state(), DispatchState::Empty);
    }

    #[test]
    fn interleaved_two_tokens_alternate() {
        let mut queue = StimulusQueue::interleaved_fifo(100.0);
        let order = record_added_keys(&mut queue);
        let a = queue.append(vec![1.0; 10], 2, 0.0, None, None);
        let b = queue.append(vec![2.0; 10], 2, 0.0, None, None);

        let output = queue.pop_buffer(40, true).unwrap();
        assert_eq!(&output[..10], &[1.0; 10]);
        assert_eq!(&output[10..20], &[2.0; 10]);
        assert_eq!(&output[20..30], &[1.0; 10]);
        assert_eq!(&output[30..], &[2.0; 10]);
        assert_eq!(*order.lock().unwrap(), vec![a, b, a, b]);

        assert_eq!(queue.pop_buffer(10, true).unwrap(), vec![0.0; 10]);
        assert!(queue.is_empty());
    }

    #[test]
    fn intertrial_delay_inserts_silence() {
        let mut queue = StimulusQueue::fifo(1000.0);
        queue.append(vec![1.0; 10], 2, 0.005, None, None);

        let output = queue.pop_buffer(30, true).unwrap();
        assert_eq!(&output[..10], &[1.0; 10]);
        assert_eq!(&output[10..15], &[0.0; 5]);
        assert_eq!(&output[15..25], &[1.0; 10]);
        assert_eq!(&output[25..], &[0.0; 5]);
    }

    #[test]
    fn negative_delay_surfaces() {
        let mut queue = StimulusQueue::fifo(1000.0);
        queue.append(vec![1.0; 10], 1, Delays::constant(-0.5), None, None);
        assert!(matches!(
            queue.pop_buffer(10, true),
            Err(QueueError::InvalidDelay(_))
        ));
    }

    #[test]
    fn generator_token_resets_per_trial() {
        let mut queue = StimulusQueue::fifo(1000.0);
        let tone = ToneGenerator::new(1000.0, 100.0, 1.0, Waveform::Sine, 0.02);
        queue.append(Source::generator(tone), 2, 0.0, None, None);

        let output = queue.pop_buffer(40, true).unwrap();
        // Both trials replay the same waveform from the top.
        assert_eq!(&output[..20], &output[20..]);
    }

    #[test]
    fn exact_delivery_across_odd_requests() {
        let mut queue = StimulusQueue::fifo(1000.0);
        queue.append(ramp(17), 3, 0.003, None, None);

        let mut total = 0;
        for n in [1, 7, 13, 29, 64, 5] {
            let block = queue.pop_buffer(n, true).unwrap();
            assert_eq!(block.len(), n);
            total += n;
        }
        assert_eq!(queue.get_ts(), total as f64 / 1000.0);
    }

    #[test]
    fn trial_records_increase_in_t0() {
        let mut queue = StimulusQueue::fifo(1000.0);
        let t0s = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&t0s);
        queue.connect(EventKind::Added, move |event| {
            if let QueueEvent::Added(record) = event {
                sink.lock().unwrap().push(record.t0);
            }
        });

        queue.append(ramp(20), 3, 0.004, None, None);
        queue.pop_buffer(100, true).unwrap();

        // 20 samples of waveform plus 4 of silence per trial.
        assert_eq!(*t0s.lock().unwrap(), vec![0.0, 0.024, 0.048]);
    }

    #[test]
    fn cancel_mid_trial_restores_counter_and_rewinds() {
        let mut queue = StimulusQueue::fifo(1000.0);
        let key = queue.append(vec![1.0; 1000], 2, 0.0, None, None);

        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        queue.connect(EventKind::Removed, move |event| {
            if let QueueEvent::Removed(record) = event {
                sink.lock().unwrap().push(record.key);
            }
        });

        queue.pop_buffer(500, true).unwrap();
        assert_eq!(queue.remaining_trials(key).unwrap(), 1);

        queue.pause(Some(0.25)).unwrap();
        assert_eq!(*removed.lock().unwrap(), vec![key]);
        assert_eq!(queue.remaining_trials(key).unwrap(), 2);
        assert_eq!(queue.get_ts(), 0.25);
        assert_eq!(queue.state(), DispatchState::Paused);

        // Dispatch resumes from the rewound position.
        queue.resume(None).unwrap();
        queue.pop_buffer(100, true).unwrap();
        assert!(queue.get_closest_key(0.25).is_some());
        assert_eq!(queue.remaining_trials(key).unwrap(), 1);
    }

    #[test]
    fn pause_resume_round_trip_restores_position() {
        let mut queue = StimulusQueue::fifo(1000.0);
        queue.append(vec![1.0; 300], 5, 0.0, None, None);

        queue.pop_buffer(450, true).unwrap();
        queue.pause(Some(0.2)).unwrap();
        queue.resume(Some(0.2)).unwrap();
        assert_eq!(queue.get_ts(), 0.2);

        // Paused output is silence and does not advance trials.
        queue.pause(None).unwrap();
        let silent = queue.pop_buffer(40, true).unwrap();
        assert_eq!(silent, vec![0.0; 40]);
    }

    #[test]
    fn requeue_restores_removed_key_to_front() {
        let mut queue = StimulusQueue::fifo(1000.0);
        let key = queue.append(vec![1.0; 100], 1, 0.0, None, None);

        queue.pop_buffer(100, true).unwrap();
        assert_eq!(queue.count_factories(), 0);

        queue.requeue(0.05);
        assert_eq!(queue.count_factories(), 1);
        assert_eq!(queue.remaining_trials(key).unwrap(), 1);

        let output = queue.pop_buffer(100, true).unwrap();
        assert_eq!(output, vec![1.0; 100]);
    }

    #[test]
    fn rewind_past_end_is_refused() {
        let mut queue = StimulusQueue::fifo(1000.0);
        queue.append(vec![1.0; 100], 1, 0.0, None, None);
        queue.pop_buffer(50, true).unwrap();

        assert!(matches!(
            queue.rewind_samples(0.2),
            Err(QueueError::RewindPastEnd { .. })
        ));
        // Rewinding before the queue start clamps at zero.
        queue.rewind_samples(0.0).unwrap();
        assert_eq!(queue.get_ts(), 0.0);
    }

    #[test]
    fn base_t0_offsets_trial_records() {
        let mut queue = StimulusQueue::fifo(1000.0);
        queue.set_t0(2.0);
        queue.append(vec![1.0; 10], 1, 0.0, None, None);

        let t0s = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&t0s);
        queue.connect(EventKind::Added, move |event| {
            if let QueueEvent::Added(record) = event {
                sink.lock().unwrap().push(record.t0);
            }
        });

        queue.pop_buffer(10, true).unwrap();
        assert_eq!(*t0s.lock().unwrap(), vec![2.0]);
    }

    #[test]
    fn grouped_fifo_advances_by_group() {
        let mut queue = StimulusQueue::grouped_fifo(1000.0, 2);
        let order = record_added_keys(&mut queue);
        let a = queue.append(vec![1.0; 5], 1, 0.0, None, None);
        let b = queue.append(vec![2.0; 5], 1, 0.0, None, None);
        let c = queue.append(vec![3.0; 5], 1, 0.0, None, None);
        let d = queue.append(vec![4.0; 5], 1, 0.0, None, None);

        queue.pop_buffer(20, true).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![a, b, c, d]);
    }

    #[test]
    fn blocked_fifo_group_is_whole_queue() {
        let mut queue = StimulusQueue::blocked_fifo(1000.0);
        let order = record_added_keys(&mut queue);
        let a = queue.append(vec![1.0; 5], 2, 0.0, None, None);
        let b = queue.append(vec![2.0; 5], 2, 0.0, None, None);
        let c = queue.append(vec![3.0; 5], 2, 0.0, None, None);

        queue.pop_buffer(30, true).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![a, b, c, a, b, c]);
    }

    #[test]
    fn dispatch_states() {
        let mut queue = StimulusQueue::fifo(1000.0);
        assert_eq!(queue.state(), DispatchState::Idle);

        queue.append(vec![1.0; 20], 1, 0.5, None, None);
        queue.pop_buffer(10, true).unwrap();
        assert_eq!(queue.state(), DispatchState::Playing);

        queue.pop_buffer(10, true).unwrap();
        assert_eq!(queue.state(), DispatchState::Delaying);

        queue.pause(None).unwrap();
        assert_eq!(queue.state(), DispatchState::Paused);
    }
}
