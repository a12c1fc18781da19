//! Single-shot delay timer driven by elapsed time.

use std::time::Duration;

/// A cancellable one-shot timer.
///
/// The timer does not read a clock; the owner advances it with the time that
/// passed since the previous call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OneShot {
    remaining: Option<Duration>,
}

impl OneShot {
    /// Create an idle timer.
    pub fn new() -> Self {
        Self { remaining: None }
    }

    /// Arm the timer. A pending expiry is cancelled first.
    pub fn start(&mut self, delay: Duration) {
        self.remaining = Some(delay);
    }

    /// Disarm the timer.
    pub fn cancel(&mut self) {
        self.remaining = None;
    }

    /// Whether the timer is armed.
    pub fn is_pending(&self) -> bool {
        self.remaining.is_some()
    }

    /// Time left until expiry, if armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    /// Let `elapsed` pass. Returns `true` exactly once, when the timer expires.
    pub fn advance(&mut self, elapsed: Duration) -> bool {
        match self.remaining {
            Some(left) if elapsed >= left => {
                self.remaining = None;
                true
            }
            Some(left) => {
                self.remaining = Some(left - elapsed);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_fires_once() {
        let mut timer = OneShot::new();
        timer.start(MS * 100);
        assert!(!timer.advance(MS * 60));
        assert_eq!(timer.remaining(), Some(MS * 40));
        assert!(timer.advance(MS * 40));
        assert!(!timer.is_pending());
        assert!(!timer.advance(MS * 1000));
    }

    #[test]
    fn test_restart_replaces_pending() {
        let mut timer = OneShot::new();
        timer.start(MS * 100);
        timer.advance(MS * 90);
        timer.start(MS * 100);
        assert!(!timer.advance(MS * 50));
        assert!(timer.advance(MS * 50));
    }

    #[test]
    fn test_cancel() {
        let mut timer = OneShot::new();
        timer.start(MS);
        timer.cancel();
        assert!(!timer.advance(MS * 10));
    }

    #[test]
    fn test_zero_delay() {
        let mut timer = OneShot::new();
        timer.start(Duration::ZERO);
        assert!(timer.advance(Duration::ZERO));
    }
}
