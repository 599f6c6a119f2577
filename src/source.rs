//! Waveform sources for queued stimulus tokens.
//!
//! A token's samples come either from a stateful [`Generator`] that is reset
//! and re-run for every trial, or from a prebuilt sample array read from
//! offset zero. The variant is fixed when the token enters the queue.

/// A restartable waveform generator.
///
/// `next` may return fewer than `n` samples when the waveform is nearing
/// completion; calling it again after `is_complete` returns true is
/// undefined. `reset` must restore the generator to its initial state so the
/// same trial waveform can be produced again.
pub trait Generator: Send {
    fn reset(&mut self);

    /// Produce up to `n` further samples.
    fn next(&mut self, n: usize) -> Vec<f32>;

    /// Samples left before completion; `usize::MAX` for unbounded generators.
    fn n_samples_remaining(&self) -> usize;

    fn is_complete(&self) -> bool;

    /// Total waveform duration in seconds.
    fn duration(&self) -> f64;
}

/// Sample source for one token.
pub enum Source {
    Generator(Box<dyn Generator>),
    Array(Vec<f32>),
}

impl Source {
    pub fn generator(generator: impl Generator + 'static) -> Self {
        Source::Generator(Box::new(generator))
    }

    pub fn array(samples: Vec<f32>) -> Self {
        Source::Array(samples)
    }

    /// Duration in seconds, given the output sampling rate.
    pub fn duration(&self, fs: f64) -> f64 {
        match self {
            Source::Generator(generator) => generator.duration(),
            Source::Array(samples) => samples.len() as f64 / fs,
        }
    }
}

impl From<Vec<f32>> for Source {
    fn from(samples: Vec<f32>) -> Self {
        Source::Array(samples)
    }
}

/// Lazy sequence of intertrial delays, in seconds.
///
/// `Constant` repeats one value forever. `Sequence` yields each value once
/// and then falls back to 0.0 (with a warning). `Cycle` repeats the list.
#[derive(Debug, Clone)]
pub enum Delays {
    Constant(f64),
    Sequence { values: Vec<f64>, index: usize },
    Cycle { values: Vec<f64>, index: usize },
}

impl Delays {
    pub fn constant(delay: f64) -> Self {
        Delays::Constant(delay)
    }

    pub fn sequence(values: Vec<f64>) -> Self {
        Delays::Sequence { values, index: 0 }
    }

    pub fn cycle(values: Vec<f64>) -> Self {
        Delays::Cycle { values, index: 0 }
    }

    /// Pull the next delay.
    pub fn next_delay(&mut self) -> f64 {
        match self {
            Delays::Constant(delay) => *delay,
            Delays::Sequence { values, index } => match values.get(*index) {
                Some(delay) => {
                    *index += 1;
                    *delay
                }
                None => {
                    log::warn!("delay sequence exhausted, using 0.0");
                    0.0
                }
            },
            Delays::Cycle { values, index } => {
                if values.is_empty() {
                    return 0.0;
                }
                let delay = values[*index % values.len()];
                *index += 1;
                delay
            }
        }
    }
}

impl Default for Delays {
    fn default() -> Self {
        Delays::Constant(0.0)
    }
}

impl From<f64> for Delays {
    fn from(delay: f64) -> Self {
        Delays::Constant(delay)
    }
}

impl From<Vec<f64>> for Delays {
    fn from(values: Vec<f64>) -> Self {
        Delays::sequence(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_delay_repeats() {
        let mut delays = Delays::from(0.5);
        for _ in 0..10 {
            assert_eq!(delays.next_delay(), 0.5);
        }
    }

    #[test]
    fn sequence_exhausts_to_zero() {
        let mut delays = Delays::from(vec![0.1, 0.2]);
        assert_eq!(delays.next_delay(), 0.1);
        assert_eq!(delays.next_delay(), 0.2);
        assert_eq!(delays.next_delay(), 0.0);
    }

    #[test]
    fn cycle_wraps() {
        let mut delays = Delays::cycle(vec![0.1, 0.2]);
        assert_eq!(delays.next_delay(), 0.1);
        assert_eq!(delays.next_delay(), 0.2);
        assert_eq!(delays.next_delay(), 0.1);
    }

    #[test]
    fn array_source_duration() {
        let source = Source::from(vec![0.0; 500]);
        assert_eq!(source.duration(1000.0), 0.5);
    }
}
