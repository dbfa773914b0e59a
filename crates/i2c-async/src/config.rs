use embassy_time::Duration;

/// Engine-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// How long a physical transaction may stay outstanding before it is
    /// aborted and reported as [`StatusCode::Error`](crate::StatusCode::Error).
    /// `None` waits forever.
    pub transfer_timeout: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { transfer_timeout: Some(Duration::from_millis(100)) }
    }
}

impl BusConfig {
    pub const fn without_timeout() -> Self {
        Self { transfer_timeout: None }
    }
}
