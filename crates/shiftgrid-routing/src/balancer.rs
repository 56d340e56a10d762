//! Round-robin selection.
//!
//! Distributes picks across a member list using an atomic counter.
//! Lock-free and safe for concurrent access.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Selects indices into a member list in rotation.
///
/// The counter keeps running when the list changes size, so a shrinking
/// routing table does not reset the rotation.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }

    /// Pick the next element of `members`.
    pub fn pick<'a, T>(&self, members: &'a [T]) -> Option<&'a T> {
        self.next(members.len()).map(|idx| &members[idx])
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_indices() {
        let lb = RoundRobinBalancer::new();

        assert_eq!(lb.next(3), Some(0));
        assert_eq!(lb.next(3), Some(1));
        assert_eq!(lb.next(3), Some(2));
        assert_eq!(lb.next(3), Some(0)); // wraps
    }

    #[test]
    fn empty_list_yields_nothing() {
        let lb = RoundRobinBalancer::new();
        assert_eq!(lb.next(0), None);
        assert!(lb.pick::<u8>(&[]).is_none());
    }

    #[test]
    fn pick_follows_shrinking_list() {
        let lb = RoundRobinBalancer::new();
        let four = ["a", "b", "c", "d"];
        assert_eq!(lb.pick(&four), Some(&"a"));
        assert_eq!(lb.pick(&four), Some(&"b"));

        let two = ["a", "b"];
        assert_eq!(lb.pick(&two), Some(&"a"));
        assert_eq!(lb.pick(&two), Some(&"b"));
    }

    #[test]
    fn concurrent_picks_are_evenly_spread() {
        use std::sync::Arc;
        use std::thread;

        let lb = Arc::new(RoundRobinBalancer::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = Arc::clone(&lb);
                thread::spawn(move || (0..100).filter_map(|_| lb.next(4)).collect::<Vec<_>>())
            })
            .collect();

        let mut counts = [0usize; 4];
        for handle in handles {
            for idx in handle.join().unwrap() {
                counts[idx] += 1;
            }
        }
        assert_eq!(counts, [100, 100, 100, 100]);
    }
}
