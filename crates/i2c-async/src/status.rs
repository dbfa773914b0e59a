use bitflags::bitflags;

bitflags! {
    /// Raw completion event reported by a [`Transport`](crate::Transport)
    /// when a physical transaction finishes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Event: u32 {
        /// Generic transfer failure.
        const ERROR               = 1 << 1;
        /// The addressed slave did not acknowledge its address.
        const NO_SLAVE            = 1 << 2;
        /// Every segment was transferred as requested.
        const TRANSFER_COMPLETE   = 1 << 3;
        /// A data byte was not acknowledged before the last one.
        const TRANSFER_EARLY_NACK = 1 << 4;
        /// Another master won arbitration.
        const ARBITRATION_LOST    = 1 << 5;
        /// The transfer did not finish in time.
        const TIMEOUT             = 1 << 6;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Event {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Event({=u32:#x})", self.bits())
    }
}

/// Outcome of one physical transaction, as seen by completion callbacks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusCode {
    /// The transfer completed as requested.
    Ok = 0,
    /// Any transport failure other than a missing slave.
    Error = 1,
    /// The addressed device did not acknowledge.
    NoSlave = 2,
}

impl StatusCode {
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<Event> for StatusCode {
    /// Only the exact events are recognised; combined bits count as errors.
    fn from(event: Event) -> Self {
        if event == Event::NO_SLAVE {
            Self::NoSlave
        } else if event == Event::TRANSFER_COMPLETE {
            Self::Ok
        } else {
            Self::Error
        }
    }
}

impl core::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "bus error"),
            Self::NoSlave => write!(f, "no slave acknowledged"),
        }
    }
}
