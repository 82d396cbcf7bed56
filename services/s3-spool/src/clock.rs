use chrono::{DateTime, Local};

/// Source of wall-clock time for key naming and midnight scheduling
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The process-local system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}
