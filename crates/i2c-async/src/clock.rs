use embassy_time::Instant;

/// Monotonic time source for the dispatch loop.
pub trait Clock {
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Clock backed by the embassy time driver of the running firmware.
#[cfg(feature = "time-driver")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[cfg(feature = "time-driver")]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
