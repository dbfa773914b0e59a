use i2c_async::{Clock, Duration, Instant};

/// Wall clock measured from the moment the loop started.
pub struct StdClock {
    origin: std::time::Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self { origin: std::time::Instant::now() }
    }
}

impl Clock for StdClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.origin.elapsed().as_micros() as u64)
    }
}

pub fn to_std(duration: Duration) -> std::time::Duration {
    std::time::Duration::from_micros(duration.as_micros())
}
