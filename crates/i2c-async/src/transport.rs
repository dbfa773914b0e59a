use alloc::vec::Vec;

use crate::slots::OperationId;
use crate::status::Event;

/// Largest number of bytes a single segment may carry.
pub const MAX_TRANSFER_LEN: usize = 32;
/// Largest number of segments in one physical transaction.
pub const MAX_SEGMENTS: usize = 2;

/// One contiguous part of a physical transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Segment {
    /// Bytes sent to the slave.
    Transmit(heapless::Vec<u8, MAX_TRANSFER_LEN>),
    /// Number of bytes to receive from the slave.
    Receive(usize),
}

impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Transmit(bytes) => bytes.len(),
            Segment::Receive(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A physical transaction: an ordered list of segments against one slave.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transfer {
    pub address: u8,
    pub segments: heapless::Vec<Segment, MAX_SEGMENTS>,
}

impl Transfer {
    /// `[register, value]` in a single transmit segment.
    pub fn write_register(address: u8, register: u8, value: u8) -> Self {
        let mut bytes = heapless::Vec::new();
        let _ = bytes.extend_from_slice(&[register, value]);
        Self::from_segments(address, [Segment::Transmit(bytes)])
    }

    /// Register select followed by a receive segment of `len` bytes.
    pub fn write_read(address: u8, register: u8, len: usize) -> Self {
        let mut bytes = heapless::Vec::new();
        let _ = bytes.push(register);
        Self::from_segments(
            address,
            [Segment::Transmit(bytes), Segment::Receive(len)],
        )
    }

    /// A lone receive segment, for devices that stream or auto-increment.
    pub fn read(address: u8, len: usize) -> Self {
        Self::from_segments(address, [Segment::Receive(len)])
    }

    fn from_segments<const N: usize>(address: u8, segments: [Segment; N]) -> Self {
        let mut list = heapless::Vec::new();
        for segment in segments {
            // N never exceeds MAX_SEGMENTS at the call sites above.
            let _ = list.push(segment);
        }
        Self { address, segments: list }
    }
}

/// Result view handed back by the transport once a transaction finishes.
///
/// `segments` holds one buffer per issued segment, in order: the bytes sent
/// for transmit segments, the bytes received for receive segments. Ownership
/// of the buffers moves to whoever consumes the completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: OperationId,
    pub event: Event,
    pub segments: heapless::Vec<Vec<u8>, MAX_SEGMENTS>,
}

/// Issues physical transactions on a two-wire bus.
///
/// A transport reports exactly one [`Completion`] per accepted transfer,
/// through [`Transport::poll_completion`], from the same dispatch loop that
/// issued it.
pub trait Transport {
    /// Start a transaction. `Err(event)` means it never started; the event is
    /// reported to the operation as if the transaction had completed with it.
    fn issue(&mut self, id: OperationId, transfer: Transfer) -> Result<(), Event>;

    /// Next finished transaction, if any.
    fn poll_completion(&mut self) -> Option<Completion>;

    /// Abandon an outstanding transaction. Its completion, if it still
    /// arrives, is ignored by the engine.
    fn abort(&mut self, _id: OperationId) {}
}
