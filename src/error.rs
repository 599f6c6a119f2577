use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the stimulus queue and dispatch engine.
///
/// `QueueEmpty` is the only variant handled internally: `pop_buffer`
/// converts it to padding silence. Everything else is terminal to the
/// current operation and leaves the queue state coherent.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    QueueEmpty,

    #[error("{param} must be a scalar or a sequence of length {n}")]
    SizeMismatch { param: &'static str, n: usize },

    #[error("invalid intertrial delay {0}")]
    InvalidDelay(f64),

    #[error("{0} not in queue")]
    KeyNotQueued(Uuid),

    #[error("unknown key {0}")]
    UnknownKey(Uuid),

    #[error("event \"{0}\" not valid")]
    UnknownEvent(String),

    #[error("cannot rewind past last sample generated: requested {requested:.3}s, last sample was {last:.3}s")]
    RewindPastEnd { requested: f64, last: f64 },
}

/// Errors surfaced by the epoch extractor.
///
/// A missed epoch is not an error; it is delivered downstream as an
/// `Epoch` with `signal: None`.
#[derive(Debug, Error)]
pub enum EpochError {
    #[error("duplicate epochs not supported")]
    DuplicateEpoch,
}
