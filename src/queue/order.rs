//! Ordering policies: which token is presented next.
//!
//! Every variant picks the next key from the queue's ordering list. The
//! interleaved variants never drop keys from the ordering; they report the
//! whole queue complete once every token's counter reaches zero. Cursor
//! variants advance before reading, starting at -1 so the first pick is the
//! head of the ordering.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::Key;
use crate::error::QueueError;

pub enum OrderPolicy {
    /// Strict first-in first-out: play out the head token, then the next.
    Fifo,
    /// Rotate through all tokens, one trial each.
    InterleavedFifo { cursor: isize, complete: bool },
    /// Uniform draw over the ordering.
    Random,
    /// Rotate in blocks; each block is a fresh seeded permutation of the
    /// ordering, so every token appears exactly once per block.
    BlockedRandom {
        indices: Vec<usize>,
        rng: StdRng,
        complete: bool,
    },
    /// FIFO over a sliding group: cycle the first `group_size` keys until all
    /// are spent, then advance to the next group.
    GroupedFifo { group_size: usize, cursor: isize },
    /// Grouped FIFO whose group grows with every append, so the group is
    /// always the whole queue.
    BlockedFifo { group_size: usize, cursor: isize },
}

impl OrderPolicy {
    pub fn fifo() -> Self {
        OrderPolicy::Fifo
    }

    pub fn interleaved_fifo() -> Self {
        OrderPolicy::InterleavedFifo {
            cursor: -1,
            complete: false,
        }
    }

    pub fn random() -> Self {
        OrderPolicy::Random
    }

    pub fn blocked_random(seed: u64) -> Self {
        OrderPolicy::BlockedRandom {
            indices: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            complete: false,
        }
    }

    pub fn grouped_fifo(group_size: usize) -> Self {
        OrderPolicy::GroupedFifo {
            group_size,
            cursor: -1,
        }
    }

    pub fn blocked_fifo() -> Self {
        OrderPolicy::BlockedFifo {
            group_size: 0,
            cursor: -1,
        }
    }

    /// Pick the key for the next trial.
    pub(crate) fn next_key(&mut self, ordering: &[Key]) -> Result<Key, QueueError> {
        match self {
            OrderPolicy::Fifo => ordering.first().copied().ok_or(QueueError::QueueEmpty),
            OrderPolicy::InterleavedFifo { cursor, complete } => {
                if *complete || ordering.is_empty() {
                    return Err(QueueError::QueueEmpty);
                }
                *cursor = (*cursor + 1).rem_euclid(ordering.len() as isize);
                Ok(ordering[*cursor as usize])
            }
            OrderPolicy::Random => {
                if ordering.is_empty() {
                    return Err(QueueError::QueueEmpty);
                }
                let i = rand::thread_rng().gen_range(0..ordering.len());
                Ok(ordering[i])
            }
            OrderPolicy::BlockedRandom {
                indices,
                rng,
                complete,
            } => {
                if *complete || ordering.is_empty() {
                    return Err(QueueError::QueueEmpty);
                }
                if indices.is_empty() {
                    // Block is spent; shuffle a fresh permutation.
                    *indices = (0..ordering.len()).collect();
                    indices.shuffle(rng);
                }
                let i = indices.pop().ok_or(QueueError::QueueEmpty)?;
                ordering.get(i).copied().ok_or(QueueError::QueueEmpty)
            }
            OrderPolicy::GroupedFifo { group_size, cursor }
            | OrderPolicy::BlockedFifo { group_size, cursor } => {
                if ordering.is_empty() || *group_size == 0 {
                    return Err(QueueError::QueueEmpty);
                }
                *cursor = (*cursor + 1).rem_euclid(*group_size as isize);
                ordering
                    .get(*cursor as usize)
                    .copied()
                    .ok_or(QueueError::QueueEmpty)
            }
        }
    }

    /// True for policies where completion is tracked queue-wide rather than
    /// per token.
    pub(crate) fn tracks_queue_completion(&self) -> bool {
        matches!(
            self,
            OrderPolicy::InterleavedFifo { .. } | OrderPolicy::BlockedRandom { .. }
        )
    }

    pub(crate) fn group_size(&self) -> Option<usize> {
        match self {
            OrderPolicy::GroupedFifo { group_size, .. }
            | OrderPolicy::BlockedFifo { group_size, .. } => Some(*group_size),
            _ => None,
        }
    }

    pub(crate) fn mark_complete(&mut self) {
        if let OrderPolicy::InterleavedFifo { complete, .. }
        | OrderPolicy::BlockedRandom { complete, .. } = self
        {
            *complete = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use uuid::Uuid;

    fn keys(n: usize) -> Vec<Key> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn fifo_always_picks_head() {
        let ordering = keys(3);
        let mut policy = OrderPolicy::fifo();
        assert_eq!(policy.next_key(&ordering).unwrap(), ordering[0]);
        assert_eq!(policy.next_key(&ordering).unwrap(), ordering[0]);
    }

    #[test]
    fn fifo_empty_ordering() {
        let mut policy = OrderPolicy::fifo();
        assert!(matches!(
            policy.next_key(&[]),
            Err(QueueError::QueueEmpty)
        ));
    }

    #[test_case(1 ; "single key")]
    #[test_case(3 ; "three keys")]
    #[test_case(7 ; "seven keys")]
    fn interleaved_cycles_from_head(n: usize) {
        let ordering = keys(n);
        let mut policy = OrderPolicy::interleaved_fifo();
        let picks: Vec<Key> = (0..2 * n)
            .map(|_| policy.next_key(&ordering).unwrap())
            .collect();
        assert_eq!(&picks[..n], &ordering[..]);
        assert_eq!(&picks[n..], &ordering[..]);
    }

    #[test]
    fn interleaved_complete_is_terminal() {
        let ordering = keys(2);
        let mut policy = OrderPolicy::interleaved_fifo();
        policy.mark_complete();
        assert!(matches!(
            policy.next_key(&ordering),
            Err(QueueError::QueueEmpty)
        ));
    }

    #[test]
    fn random_draws_from_ordering() {
        let ordering = keys(4);
        let mut policy = OrderPolicy::random();
        for _ in 0..50 {
            let pick = policy.next_key(&ordering).unwrap();
            assert!(ordering.contains(&pick));
        }
    }

    #[test]
    fn blocked_random_is_a_permutation_per_block() {
        let ordering = keys(5);
        let mut policy = OrderPolicy::blocked_random(0);
        for _ in 0..3 {
            let mut block: Vec<Key> =
                (0..5).map(|_| policy.next_key(&ordering).unwrap()).collect();
            block.sort();
            let mut expected = ordering.clone();
            expected.sort();
            assert_eq!(block, expected);
        }
    }

    #[test]
    fn blocked_random_same_seed_same_order() {
        let ordering = keys(6);
        let mut first = OrderPolicy::blocked_random(42);
        let mut second = OrderPolicy::blocked_random(42);
        for _ in 0..12 {
            assert_eq!(
                first.next_key(&ordering).unwrap(),
                second.next_key(&ordering).unwrap()
            );
        }
    }

    #[test]
    fn grouped_cycles_within_group() {
        let ordering = keys(4);
        let mut policy = OrderPolicy::grouped_fifo(2);
        let picks: Vec<Key> = (0..4).map(|_| policy.next_key(&ordering).unwrap()).collect();
        assert_eq!(picks, vec![ordering[0], ordering[1], ordering[0], ordering[1]]);
    }

    #[test]
    fn grouped_short_ordering_reports_empty() {
        let ordering = keys(1);
        let mut policy = OrderPolicy::grouped_fifo(3);
        assert_eq!(policy.next_key(&ordering).unwrap(), ordering[0]);
        assert!(matches!(
            policy.next_key(&ordering),
            Err(QueueError::QueueEmpty)
        ));
    }

    #[test]
    fn blocked_fifo_starts_empty() {
        let mut policy = OrderPolicy::blocked_fifo();
        assert!(matches!(
            policy.next_key(&keys(0)),
            Err(QueueError::QueueEmpty)
        ));
    }
}
