//! Local-timezone clock abstraction.
//!
//! Build timestamps are persisted with timezone information and produced by
//! a local-TZ clock rather than calling `Utc::now()` directly throughout the
//! state machine, so tests can inject a fixed instant.

use chrono::{DateTime, Local};

/// Produces the current local time. Injected into the state machine and
/// handlers so tests can substitute a fixed clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A clock that always returns the same instant until advanced.
    pub struct FixedClock(Mutex<DateTime<Local>>);

    impl FixedClock {
        pub fn new(at: DateTime<Local>) -> Self {
            Self(Mutex::new(at))
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut guard = self.0.lock().expect("fixed clock lock poisoned");
            *guard = *guard + delta;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Local> {
            *self.0.lock().expect("fixed clock lock poisoned")
        }
    }
}
