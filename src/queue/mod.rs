//! Stimulus token queue.
//!
//! A [`StimulusQueue`] stores stimulus tokens keyed by opaque UUIDs, tracks
//! how many trials of each remain, and hands waveform samples to the output
//! stream through the dispatch engine (see `dispatch`). The order tokens are
//! presented in is decided by an [`OrderPolicy`].
//!
//! Listeners register for `added`/`removed`/`decrement` notifications; these
//! fire synchronously on the thread driving the queue.

mod dispatch;
pub mod order;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;
use crate::source::{Delays, Source};

pub use dispatch::DispatchState;
pub use order::OrderPolicy;

/// Opaque token identifier. Equality and hashability are the only contract.
pub type Key = Uuid;

pub(crate) struct Token {
    pub(crate) source: Source,
    pub(crate) trials: i64,
    pub(crate) requested_trials: i64,
    pub(crate) delays: Delays,
    pub(crate) duration: f64,
    pub(crate) metadata: Option<Value>,
}

/// Introspection copy of a token's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub trials_remaining: i64,
    pub requested_trials: i64,
    pub duration: f64,
    pub metadata: Option<Value>,
}

/// Emitted for every dispatched trial.
///
/// `t0` is in seconds, absolute to acquisition start. `decrement` records
/// whether dispatching this trial decremented the token's counter.
#[derive(Debug, Clone, Serialize)]
pub struct TrialRecord {
    pub t0: f64,
    pub duration: f64,
    pub key: Key,
    pub metadata: Option<Value>,
    pub decrement: bool,
}

/// Payload delivered to queue listeners.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added(TrialRecord),
    Removed(TrialRecord),
    Decrement { key: Key },
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Added(_) => EventKind::Added,
            QueueEvent::Removed(_) => EventKind::Removed,
            QueueEvent::Decrement { .. } => EventKind::Decrement,
        }
    }
}

/// Listener registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Added,
    Removed,
    Decrement,
}

pub type EventCallback = Box<dyn FnMut(&QueueEvent) + Send>;

/// Scalar-or-sequence argument for [`StimulusQueue::extend`]. A `Shared`
/// value is repeated for every source; a `PerToken` sequence must match the
/// number of sources exactly.
#[derive(Debug, Clone)]
pub enum Param<T> {
    Shared(T),
    PerToken(Vec<T>),
}

impl<T: Clone> Param<T> {
    fn resolve(self, n: usize, param: &'static str) -> Result<Vec<T>, QueueError> {
        match self {
            Param::Shared(value) => Ok(vec![value; n]),
            Param::PerToken(values) if values.len() == n => Ok(values),
            Param::PerToken(_) => Err(QueueError::SizeMismatch { param, n }),
        }
    }
}

pub struct StimulusQueue {
    fs: f64,
    t0: f64,
    data: HashMap<Key, Token>,
    ordering: Vec<Key>,
    policy: OrderPolicy,
    active: Option<dispatch::ActiveSource>,
    samples: u64,
    delay_samples: u64,
    paused: bool,
    empty: bool,
    generated: Vec<TrialRecord>,
    added_listeners: Vec<EventCallback>,
    removed_listeners: Vec<EventCallback>,
    decrement_listeners: Vec<EventCallback>,
}

impl StimulusQueue {
    pub fn new(fs: f64, policy: OrderPolicy) -> Self {
        StimulusQueue {
            fs,
            t0: 0.0,
            data: HashMap::new(),
            ordering: Vec::new(),
            policy,
            active: None,
            samples: 0,
            delay_samples: 0,
            paused: false,
            empty: false,
            generated: Vec::new(),
            added_listeners: Vec::new(),
            removed_listeners: Vec::new(),
            decrement_listeners: Vec::new(),
        }
    }

    pub fn fifo(fs: f64) -> Self {
        Self::new(fs, OrderPolicy::fifo())
    }

    pub fn interleaved_fifo(fs: f64) -> Self {
        Self::new(fs, OrderPolicy::interleaved_fifo())
    }

    pub fn random(fs: f64) -> Self {
        Self::new(fs, OrderPolicy::random())
    }

    pub fn blocked_random(fs: f64, seed: u64) -> Self {
        Self::new(fs, OrderPolicy::blocked_random(seed))
    }

    pub fn grouped_fifo(fs: f64, group_size: usize) -> Self {
        Self::new(fs, OrderPolicy::grouped_fifo(group_size))
    }

    pub fn blocked_fifo(fs: f64) -> Self {
        Self::new(fs, OrderPolicy::blocked_fifo())
    }

    // --- Timebase ---

    pub fn fs(&self) -> f64 {
        self.fs
    }

    /// Sampling rate waveforms are generated at; used in all timing math.
    pub fn set_fs(&mut self, fs: f64) {
        self.fs = fs;
    }

    pub fn t0(&self) -> f64 {
        self.t0
    }

    /// Queue start time relative to acquisition start, in seconds.
    pub fn set_t0(&mut self, t0: f64) {
        self.t0 = t0;
    }

    /// Seconds of output generated so far.
    pub fn get_ts(&self) -> f64 {
        self.samples as f64 / self.fs
    }

    /// True once dispatch has hit an empty queue and padded with silence.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    // --- Token management ---

    /// Add a token at the front of the ordering.
    pub fn insert(
        &mut self,
        source: impl Into<Source>,
        trials: i64,
        delays: impl Into<Delays>,
        duration: Option<f64>,
        metadata: Option<Value>,
    ) -> Key {
        let key = self.add_source(source.into(), trials, delays.into(), duration, metadata);
        self.ordering.insert(0, key);
        key
    }

    /// Add a token at the back of the ordering.
    pub fn append(
        &mut self,
        source: impl Into<Source>,
        trials: i64,
        delays: impl Into<Delays>,
        duration: Option<f64>,
        metadata: Option<Value>,
    ) -> Key {
        let key = self.add_source(source.into(), trials, delays.into(), duration, metadata);
        self.ordering.push(key);
        if let OrderPolicy::BlockedFifo { group_size, .. } = &mut self.policy {
            *group_size += 1;
        }
        key
    }

    /// Append several tokens at once. Each parameter is either shared across
    /// all sources or a sequence of matching length.
    pub fn extend(
        &mut self,
        sources: Vec<Source>,
        trials: Param<i64>,
        delays: Param<Delays>,
        duration: Param<Option<f64>>,
        metadata: Param<Option<Value>>,
    ) -> Result<Vec<Key>, QueueError> {
        let n = sources.len();
        let trials = trials.resolve(n, "trials")?;
        let delays = delays.resolve(n, "delays")?;
        let duration = duration.resolve(n, "duration")?;
        let metadata = metadata.resolve(n, "metadata")?;

        let mut keys = Vec::with_capacity(n);
        for (((source, trials), delays), (duration, metadata)) in sources
            .into_iter()
            .zip(trials)
            .zip(delays)
            .zip(duration.into_iter().zip(metadata))
        {
            keys.push(self.append(source, trials, delays, duration, metadata));
        }
        Ok(keys)
    }

    fn add_source(
        &mut self,
        source: Source,
        trials: i64,
        delays: Delays,
        duration: Option<f64>,
        metadata: Option<Value>,
    ) -> Key {
        let key = Uuid::new_v4();
        let duration = match duration {
            Some(duration) => duration,
            None => source.duration(self.fs),
        };
        self.data.insert(
            key,
            Token {
                source,
                trials,
                requested_trials: trials,
                delays,
                duration,
                metadata,
            },
        );
        key
    }

    /// Remove a key from the ordering. Token data is kept for introspection.
    pub fn remove_key(&mut self, key: Key) -> Result<(), QueueError> {
        let position = self
            .ordering
            .iter()
            .position(|k| *k == key)
            .ok_or(QueueError::KeyNotQueued(key))?;
        self.ordering.remove(position);
        Ok(())
    }

    /// Decrement the trial counter for `key` by `n`. Returns true when the
    /// token (or, for interleaved policies, the whole queue) completes.
    pub fn decrement_key(&mut self, key: Key, n: i64) -> Result<bool, QueueError> {
        if !self.ordering.contains(&key) {
            return Err(QueueError::KeyNotQueued(key));
        }
        let token = self.data.get_mut(&key).ok_or(QueueError::UnknownKey(key))?;
        token.trials -= n;
        let remaining = token.trials;

        if self.policy.tracks_queue_completion() {
            // Interleaved policies keep every key in rotation and complete
            // only once all tokens are spent.
            if self.data.values().all(|token| token.trials <= 0) {
                self.policy.mark_complete();
                return Ok(true);
            }
            return Ok(false);
        }

        if let Some(group_size) = self.policy.group_size() {
            let group: Vec<Key> = self.ordering.iter().take(group_size).copied().collect();
            let group_done = group
                .iter()
                .all(|k| self.data.get(k).map_or(true, |token| token.trials <= 0));
            if !group_done {
                return Ok(false);
            }
            self.ordering.retain(|k| !group.contains(k));
            return Ok(true);
        }

        if remaining <= 0 {
            self.ordering.retain(|k| *k != key);
            return Ok(true);
        }
        self.notify(QueueEvent::Decrement { key });
        Ok(false)
    }

    // --- Counters and introspection ---

    pub fn count_factories(&self) -> usize {
        self.ordering.len()
    }

    /// Remaining trials across all tokens. Interleaved policies keep
    /// exhausted keys in rotation, so their counters clamp at zero.
    pub fn count_trials(&self) -> i64 {
        if self.policy.tracks_queue_completion() {
            self.data.values().map(|token| token.trials.max(0)).sum()
        } else {
            self.data.values().map(|token| token.trials).sum()
        }
    }

    pub fn count_requested_trials(&self) -> i64 {
        self.data.values().map(|token| token.requested_trials).sum()
    }

    pub fn remaining_trials(&self, key: Key) -> Result<i64, QueueError> {
        self.data
            .get(&key)
            .map(|token| token.trials)
            .ok_or(QueueError::UnknownKey(key))
    }

    pub fn get_max_duration(&self) -> f64 {
        self.data
            .values()
            .map(|token| token.duration)
            .fold(0.0, f64::max)
    }

    pub fn get_info(&self, key: Key) -> Result<TokenInfo, QueueError> {
        let token = self.data.get(&key).ok_or(QueueError::UnknownKey(key))?;
        Ok(TokenInfo {
            trials_remaining: token.trials,
            requested_trials: token.requested_trials,
            duration: token.duration,
            metadata: token.metadata.clone(),
        })
    }

    /// Key of the most recently dispatched trial with `t0 <= t`.
    pub fn get_closest_key(&self, t: f64) -> Option<Key> {
        self.generated
            .iter()
            .rev()
            .find(|record| record.t0 <= t)
            .map(|record| record.key)
    }

    // --- Event bus ---

    pub fn connect(&mut self, kind: EventKind, callback: impl FnMut(&QueueEvent) + Send + 'static) {
        let listeners = match kind {
            EventKind::Added => &mut self.added_listeners,
            EventKind::Removed => &mut self.removed_listeners,
            EventKind::Decrement => &mut self.decrement_listeners,
        };
        listeners.push(Box::new(callback));
    }

    /// Register by event name ("added", "removed", "decrement").
    pub fn connect_named(
        &mut self,
        event: &str,
        callback: impl FnMut(&QueueEvent) + Send + 'static,
    ) -> Result<(), QueueError> {
        let kind = event
            .parse::<EventKind>()
            .map_err(|_| QueueError::UnknownEvent(event.to_string()))?;
        self.connect(kind, callback);
        Ok(())
    }

    /// A panicking listener must not silence the others.
    pub(crate) fn notify(&mut self, event: QueueEvent) {
        let listeners = match event.kind() {
            EventKind::Added => &mut self.added_listeners,
            EventKind::Removed => &mut self.removed_listeners,
            EventKind::Decrement => &mut self.decrement_listeners,
        };
        for listener in listeners.iter_mut() {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::error!("queue listener panicked during {} notification", event.kind());
            }
        }
    }
}
