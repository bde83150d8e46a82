//! Settle delays and the clock used to wait on the device.

use std::time::Duration;

use parking_lot::Mutex;

/// Wait after a rewind or re-arm trigger before the processor has applied it.
pub const TRIGGER_SETTLE: Duration = Duration::from_millis(10);
/// Wait after zeroing the stop register before re-reading position.
pub const PAUSE_SETTLE: Duration = Duration::from_millis(20);
/// Wait between writing the event register and firing the event trigger.
pub const EVENT_SETTLE: Duration = Duration::from_millis(10);

/// Source of delays. Injected so tests can run the poll loop without sleeping.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct ManualClock {
    slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_accumulates_without_blocking() {
        let clock = ManualClock::new();
        clock.sleep(TRIGGER_SETTLE);
        clock.sleep(PAUSE_SETTLE);
        assert_eq!(clock.sleeps(), vec![TRIGGER_SETTLE, PAUSE_SETTLE]);
        assert_eq!(clock.sleeps().iter().sum::<Duration>(), Duration::from_millis(30));
    }
}
