//! Sample-accurate stimulus dispatch and epoch capture for auditory
//! experiments.
//!
//! The output side pulls samples from a [`StimulusQueue`]: a store of
//! stimulus tokens played out in a policy-defined order, separated by
//! intertrial silence, with pause/cancel/requeue control down to the sample.
//! Every dispatched trial is announced as a [`TrialRecord`] carrying its
//! absolute start time.
//!
//! The acquisition side feeds chunks of the recorded stream to an
//! [`EpochExtractor`], which matches them against requested `(t0, key)`
//! windows and emits captured epochs in batches. A bounded lookback buffer
//! lets a request arrive after its start time has already been acquired.
//!
//! The two sides run on their own threads and coordinate only through
//! lock-free ring buffers; see [`connect_epoch_requests`].

pub mod epoch;
pub mod error;
pub mod queue;
pub mod source;
pub mod tones;

pub use epoch::{
    connect_epoch_requests, CaptureOutcome, Epoch, EpochCapture, EpochExtractor, EpochInfo,
    EpochRequest, ExtractorConfig,
};
pub use error::{EpochError, QueueError};
pub use queue::{
    DispatchState, EventKind, Key, OrderPolicy, Param, QueueEvent, StimulusQueue, TokenInfo,
    TrialRecord,
};
pub use source::{Delays, Generator, Source};
