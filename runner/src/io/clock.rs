//! Wall-clock access behind a trait so timing rules stay testable.

use chrono::{Local, NaiveDateTime, Timelike};

pub trait Clock {
    /// Local time truncated to whole seconds (the log's resolution).
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_has_second_resolution() {
        assert_eq!(SystemClock.now().nanosecond(), 0);
    }
}
