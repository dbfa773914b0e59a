use crate::slots::OperationId;
use crate::transport::MAX_TRANSFER_LEN;

/// Errors reported synchronously when a request cannot be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A receive length of zero or above [`MAX_TRANSFER_LEN`] was requested.
    InvalidLength(usize),
    /// The operation is no longer pending (already completed or cancelled).
    UnknownOperation(OperationId),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidLength(len) => write!(
                f,
                "invalid transfer length {} (expected 1..={})",
                len, MAX_TRANSFER_LEN
            ),
            Error::UnknownOperation(id) => {
                write!(f, "operation {:?} is not pending", id)
            }
        }
    }
}

impl core::error::Error for Error {}
