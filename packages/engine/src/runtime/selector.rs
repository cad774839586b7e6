// packages/engine/src/runtime/selector.rs
//! Member selection for the kernel pool
//!
//! Least-loaded first: the member with the fewest requests in flight wins.
//! Ties go to the first candidate at or after a rotating cursor, so idle
//! members are used round-robin instead of always the first one.
//!
//! Selection and the winner's load increment happen under one lock, so two
//! concurrent callers never both see the same member as idle.

use parking_lot::Mutex;

/// Index of the least-loaded candidate, scanning from `start`
///
/// `None` entries are excluded (crashed or terminated members).
pub fn pick(loads: &[Option<usize>], start: usize) -> Option<usize> {
    let n = loads.len();
    if n == 0 {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for offset in 0..n {
        let index = (start + offset) % n;
        if let Some(load) = loads[index] {
            match best {
                Some((_, best_load)) if best_load <= load => {}
                _ => best = Some((index, load)),
            }
            if load == 0 {
                break;
            }
        }
    }
    best.map(|(index, _)| index)
}

/// Least-loaded selector with a round-robin tie-break
#[derive(Debug, Default)]
pub struct LeastLoaded {
    cursor: Mutex<usize>,
}

impl LeastLoaded {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a member and claim it while the selection lock is held
    ///
    /// `loads` yields one entry per member, `None` for excluded members.
    /// `claim` runs with the chosen index before the lock is released.
    pub fn select<I, F>(&self, loads: I, claim: F) -> Option<usize>
    where
        I: IntoIterator<Item = Option<usize>>,
        F: FnOnce(usize),
    {
        let mut cursor = self.cursor.lock();
        let loads: Vec<_> = loads.into_iter().collect();
        let index = pick(&loads, *cursor)?;
        claim(index);
        *cursor = (index + 1) % loads.len();
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_prefers_least_loaded() {
        assert_eq!(pick(&[Some(3), Some(1), Some(2)], 0), Some(1));
        assert_eq!(pick(&[Some(3), None, Some(2)], 0), Some(2));
        assert_eq!(pick(&[None, None], 0), None);
        assert_eq!(pick(&[], 0), None);
    }

    #[test]
    fn test_ties_rotate() {
        let selector = LeastLoaded::new();
        let idle = || [Some(0), Some(0), Some(0)];

        let order: Vec<_> = (0..6)
            .map(|_| selector.select(idle(), |_| {}).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_claim_runs_before_next_selection() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let selector = LeastLoaded::new();
        let loads: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();

        for _ in 0..9 {
            selector
                .select(
                    loads.iter().map(|l| Some(l.load(Ordering::SeqCst))),
                    |i| {
                        loads[i].fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }
        for load in &loads {
            assert_eq!(load.load(Ordering::SeqCst), 3);
        }
    }

    #[test]
    fn test_skips_excluded_members() {
        let selector = LeastLoaded::new();
        for _ in 0..4 {
            let index = selector.select([None, Some(5), None], |_| {}).unwrap();
            assert_eq!(index, 1);
        }
    }

    proptest! {
        #[test]
        fn prop_pick_is_minimal(
            loads in prop::collection::vec(prop::option::of(0usize..8), 1..12),
            start in 0usize..12,
        ) {
            match pick(&loads, start) {
                Some(index) => {
                    let chosen = loads[index].unwrap();
                    prop_assert!(loads.iter().flatten().all(|&l| l >= chosen));
                }
                None => prop_assert!(loads.iter().all(Option::is_none)),
            }
        }
    }
}
