use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// A retry arriving this long after the first attempt counts as a new attempt.
pub const PASS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// A combination of client IP, envelope sender, and envelope recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Triplet {
    pub ip: String,
    pub from: String,
    pub to: String,
}

impl Triplet {
    pub fn new(ip: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Triplet {
            ip: ip.into(),
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.ip, self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreylistOutcome {
    /// First sighting, or a retry that came after the pass window.
    New,
    /// Retried before the configured minimum delay.
    TooSoon(Duration),
    /// Retried inside the window; the IP is now in the passed set.
    Passed(Duration),
}

#[derive(Default)]
struct Tables {
    first_seen: HashMap<Triplet, Instant>,
    // Min-heap over first-seen times. Resets leave stale heap entries behind,
    // they are dropped when popped.
    by_age: BinaryHeap<Reverse<(Instant, Triplet)>>,
    passed: HashSet<String>,
}

impl Tables {
    fn record(&mut self, triplet: Triplet, now: Instant) {
        self.by_age.push(Reverse((now, triplet.clone())));
        self.first_seen.insert(triplet, now);
    }
}

/// In-memory greylist shared by every transaction of the process.
pub struct GreylistStore {
    min_delay: Duration,
    tables: RwLock<Tables>,
}

impl GreylistStore {
    /// `min_delay` of zero disables the too-soon check.
    pub fn new(min_delay: Duration) -> Self {
        GreylistStore {
            min_delay,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Check and update the greylist for a triplet observed now.
    pub fn check(&self, ip: &str, from: &str, to: &str) -> GreylistOutcome {
        self.check_at(Triplet::new(ip, from, to), Instant::now())
    }

    pub fn check_at(&self, triplet: Triplet, now: Instant) -> GreylistOutcome {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(&first_seen) = tables.first_seen.get(&triplet) {
            let delay = now.saturating_duration_since(first_seen);
            if delay < self.min_delay {
                return GreylistOutcome::TooSoon(delay);
            }
            if delay < PASS_WINDOW {
                tables.passed.insert(triplet.ip);
                return GreylistOutcome::Passed(delay);
            }
        }

        tables.record(triplet, now);
        GreylistOutcome::New
    }

    /// Whether `ip` has ever passed greylisting.
    pub fn already_passed(&self, ip: &str) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .passed
            .contains(ip)
    }

    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first_seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every triplet first seen at least one pass window before `now`.
    /// Returns the number of triplets removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;

        while let Some(Reverse((seen, _))) = tables.by_age.peek() {
            if now.saturating_duration_since(*seen) < PASS_WINDOW {
                break;
            }
            let Some(Reverse((seen, triplet))) = tables.by_age.pop() else {
                break;
            };
            if tables.first_seen.get(&triplet) == Some(&seen) {
                tables.first_seen.remove(&triplet);
                removed += 1;
            }
        }

        removed
    }

    /// Periodically sweep expired triplets until the task is dropped.
    pub async fn run_sweeper(&self, every: Duration) {
        let mut timer = tokio::time::interval(every);
        loop {
            timer.tick().await;
            let removed = self.sweep(Instant::now());
            if removed > 0 {
                log::debug!(
                    "Swept {removed} expired greylist entries, {} remaining",
                    self.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn triplet() -> Triplet {
        Triplet::new("203.0.113.9", "a@spammer.example", "b@victim.example")
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_expired_triplets() {
        let store = std::sync::Arc::new(GreylistStore::new(Duration::ZERO));
        let sweeper = tokio::spawn({
            let store = store.clone();
            async move { store.run_sweeper(10 * MINUTE).await }
        });

        store.check("203.0.113.9", "a@spammer.example", "b@victim.example");
        tokio::time::sleep(PASS_WINDOW / 2).await;
        store.check("203.0.113.10", "a@spammer.example", "b@victim.example");
        assert_eq!(store.len(), 2);

        tokio::time::sleep(PASS_WINDOW / 2 + 15 * MINUTE).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(PASS_WINDOW / 2).await;
        assert!(store.is_empty());

        sweeper.abort();
    }

    #[test]
    fn test_new_then_passed() {
        let store = GreylistStore::new(Duration::ZERO);
        let start = Instant::now();

        assert_eq!(store.check_at(triplet(), start), GreylistOutcome::New);
        assert!(!store.already_passed("203.0.113.9"));

        assert_eq!(
            store.check_at(triplet(), start + 20 * MINUTE),
            GreylistOutcome::Passed(20 * MINUTE)
        );
        assert!(store.already_passed("203.0.113.9"));
    }

    #[test]
    fn test_too_soon_does_not_pass_or_reset() {
        let store = GreylistStore::new(5 * MINUTE);
        let start = Instant::now();

        store.check_at(triplet(), start);
        assert_eq!(
            store.check_at(triplet(), start + 2 * MINUTE),
            GreylistOutcome::TooSoon(2 * MINUTE)
        );
        assert!(!store.already_passed("203.0.113.9"));

        // First-seen is still the original attempt.
        assert_eq!(
            store.check_at(triplet(), start + 6 * MINUTE),
            GreylistOutcome::Passed(6 * MINUTE)
        );
    }

    #[test]
    fn test_late_retry_resets_first_seen() {
        let store = GreylistStore::new(Duration::ZERO);
        let start = Instant::now();
        let late = start + PASS_WINDOW + MINUTE;

        store.check_at(triplet(), start);
        assert_eq!(store.check_at(triplet(), late), GreylistOutcome::New);
        assert!(!store.already_passed("203.0.113.9"));

        assert_eq!(
            store.check_at(triplet(), late + 30 * MINUTE),
            GreylistOutcome::Passed(30 * MINUTE)
        );
    }

    #[test]
    fn test_passed_ip_covers_other_pairs() {
        let store = GreylistStore::new(Duration::ZERO);
        let start = Instant::now();

        store.check_at(triplet(), start);
        store.check_at(triplet(), start + MINUTE);

        assert!(store.already_passed("203.0.113.9"));
        assert!(!store.already_passed("203.0.113.10"));
        // The triplet map itself stays keyed on the full combination.
        let other = Triplet::new("203.0.113.9", "c@other.example", "b@victim.example");
        assert_eq!(store.check_at(other, start + MINUTE), GreylistOutcome::New);
    }

    #[test]
    fn test_sweep_removes_only_expired_entries() {
        let store = GreylistStore::new(Duration::ZERO);
        let start = Instant::now();

        store.check_at(triplet(), start);
        let fresh = Triplet::new("198.51.100.1", "x@a.example", "y@b.example");
        store.check_at(fresh.clone(), start + 12 * 60 * MINUTE);
        assert_eq!(store.len(), 2);

        assert_eq!(store.sweep(start + PASS_WINDOW + MINUTE), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.check_at(fresh, start + 13 * 60 * MINUTE),
            GreylistOutcome::Passed(60 * MINUTE)
        );
    }

    #[test]
    fn test_sweep_skips_stale_heap_entries_after_reset() {
        let store = GreylistStore::new(Duration::ZERO);
        let start = Instant::now();
        let reset_at = start + PASS_WINDOW + MINUTE;

        store.check_at(triplet(), start);
        store.check_at(triplet(), reset_at);

        // The original heap entry is expired but the triplet was re-recorded.
        assert_eq!(store.sweep(reset_at + MINUTE), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep(reset_at + PASS_WINDOW), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_keeps_passed_set() {
        let store = GreylistStore::new(Duration::ZERO);
        let start = Instant::now();

        store.check_at(triplet(), start);
        store.check_at(triplet(), start + MINUTE);
        store.sweep(start + 2 * PASS_WINDOW);

        assert!(store.is_empty());
        assert!(store.already_passed("203.0.113.9"));
    }
}
