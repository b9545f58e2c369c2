#[cfg(test)] use mockall::automock;
use std::time::Instant;

/// Monotonic time source, abstracted so tests can control send and receive
///  instants.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
