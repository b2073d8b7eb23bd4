//! A queue of deadlines for pending queries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Stand-in for waits too long to represent as an `Instant`.
const FOREVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + wait`, saturating to a deadline that will not fire in practice
/// when the sum does not fit in an `Instant`.
pub fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(FOREVER))
        .unwrap_or(now)
}

struct Timeout<T>(Instant, T);

impl<T> PartialOrd for Timeout<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Timeout<T> {
    // Reversed so the heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl<T> PartialEq for Timeout<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}

impl<T> Eq for Timeout<T> {}

/// Values ordered by the instant they expire.
///
/// Entries are never removed early. Owners re-arm by pushing a new deadline
/// and discard stale entries when they pop them.
pub struct TimeoutQueue<T>(BinaryHeap<Timeout<T>>);

impl<T> TimeoutQueue<T> {
    pub fn new() -> Self {
        Self(BinaryHeap::new())
    }

    pub fn push(&mut self, deadline: Instant, value: T) {
        self.0.push(Timeout(deadline, value));
    }

    /// Pops the earliest entry whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(Instant, T)> {
        if self.0.peek()?.0 > now {
            return None;
        }
        self.0.pop().map(|Timeout(deadline, value)| (deadline, value))
    }

    /// Drops entries from the head while `stale` says so.
    pub fn clean_head(&mut self, mut stale: impl FnMut(Instant, &T) -> bool) {
        while let Some(top) = self.0.peek() {
            if !stale(top.0, &top.1) {
                break;
            }
            self.0.pop();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.0.peek().map(|top| top.0)
    }
}

impl<T> Default for TimeoutQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let mut q = TimeoutQueue::new();
        q.push(base + Duration::from_secs(3), 'c');
        q.push(base + Duration::from_secs(1), 'a');
        q.push(base + Duration::from_secs(2), 'b');

        assert_eq!(q.next_deadline(), Some(base + Duration::from_secs(1)));
        assert!(q.pop_expired(base).is_none());

        let now = base + Duration::from_secs(2);
        assert_eq!(q.pop_expired(now).map(|e| e.1), Some('a'));
        assert_eq!(q.pop_expired(now).map(|e| e.1), Some('b'));
        assert!(q.pop_expired(now).is_none());
    }

    #[test]
    fn clean_head_stops_at_live_entry() {
        let base = Instant::now();
        let mut q = TimeoutQueue::new();
        q.push(base, 1);
        q.push(base + Duration::from_secs(1), 2);
        q.push(base + Duration::from_secs(2), 3);

        q.clean_head(|_, v| *v != 2);
        assert_eq!(q.next_deadline(), Some(base + Duration::from_secs(1)));
    }

    #[test]
    fn huge_wait_saturates() {
        let now = Instant::now();
        let deadline = deadline_after(now, Duration::MAX);
        assert!(deadline >= now + Duration::from_secs(60 * 60));
        assert_eq!(
            deadline_after(now, Duration::from_secs(4)),
            now + Duration::from_secs(4)
        );
    }
}
