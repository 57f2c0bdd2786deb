//! Locally unique `(timestamp, sequence)` pairs
//!
//! Two calls within the same wall-clock second get the same timestamp and
//! increasing sequence numbers; the sequence restarts at 0 with each new
//! second.

use std::sync::Mutex;

/// Source of the current time in whole seconds
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

pub struct TimeSequence {
    clock: Box<dyn Clock>,
    last: Mutex<(i64, u64)>,
}

impl TimeSequence {
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new((i64::MIN, 0)),
        }
    }

    pub fn next(&self) -> (i64, u64) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now_secs();
        if now == last.0 {
            last.1 += 1;
        } else {
            *last = (now, 0);
        }
        *last
    }
}

impl Default for TimeSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    struct ManualClock(Arc<AtomicI64>);

    impl Clock for ManualClock {
        fn now_secs(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_sequence_resets_each_second() {
        let time = Arc::new(AtomicI64::new(1_000));
        let seq = TimeSequence::with_clock(Box::new(ManualClock(time.clone())));

        assert_eq!(seq.next(), (1_000, 0));
        assert_eq!(seq.next(), (1_000, 1));
        assert_eq!(seq.next(), (1_000, 2));

        time.store(1_001, Ordering::SeqCst);
        assert_eq!(seq.next(), (1_001, 0));
    }

    #[test]
    fn test_unique_across_threads() {
        let time = Arc::new(AtomicI64::new(5));
        let seq = Arc::new(TimeSequence::with_clock(Box::new(ManualClock(time))));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = seq.clone();
                std::thread::spawn(move || (0..100).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for stamp in handle.join().unwrap() {
                assert!(seen.insert(stamp), "duplicate {:?}", stamp);
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
