#![no_std]
//! Callback-driven transaction engine for a two-wire (I2C) sensor bus.
//!
//! Requests return as soon as their transfer is issued. Completions are
//! mapped to a [`StatusCode`], have their response bytes moved out of the
//! transport's result view and are delivered to the caller's callback from
//! the engine's cooperative task queue, optionally after a delay. Callbacks
//! receive the [`Bus`] itself, so a chain of requests is written as a series
//! of continuations; [`Bus::write_sequence`] packages the common case of
//! several register writes issued strictly one after the other.
//!
//! Nothing runs on its own: the application drives the engine by calling
//! [`Bus::poll`] from its dispatch loop.

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
mod fmt;

mod bus;
mod clock;
mod config;
mod error;
mod operation;
mod scheduler;
mod sequence;
mod slots;
mod status;
mod transport;

pub mod sim;

pub use bus::Bus;
#[cfg(feature = "time-driver")]
pub use clock::SystemClock;
pub use clock::Clock;
pub use config::BusConfig;
pub use embassy_time::{Duration, Instant};
pub use error::Error;
pub use scheduler::{Scheduler, Task};
pub use sequence::{Phase, RegisterWrite, SequenceReport, Transition, WriteSequence};
pub use slots::OperationId;
pub use status::{Event, StatusCode};
pub use transport::{Completion, Segment, Transfer, Transport, MAX_SEGMENTS, MAX_TRANSFER_LEN};
