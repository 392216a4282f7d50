use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source for the scheduler loop.
pub trait Clock: Send {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

/// Clock that only moves when told to. Sleeping jumps straight to the
/// deadline, so a whole session can run in a test without waiting.
#[derive(Clone)]
pub struct VirtualClock {
    base: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.base + *self.elapsed.lock()
    }

    fn sleep_until(&self, deadline: Instant) {
        let target = deadline.saturating_duration_since(self.base);
        let mut elapsed = self.elapsed.lock();
        if target > *elapsed {
            *elapsed = target;
        }
        drop(elapsed);
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_jumps_to_deadlines() {
        let clock = VirtualClock::new();
        let start = clock.now();
        clock.sleep_until(start + Duration::from_millis(5));
        assert_eq!(clock.now() - start, Duration::from_millis(5));

        clock.sleep_until(start);
        assert_eq!(clock.elapsed(), Duration::from_millis(5));

        clock.advance(Duration::from_millis(1));
        assert_eq!(clock.now() - start, Duration::from_millis(6));
    }
}
