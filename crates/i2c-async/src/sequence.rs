use alloc::boxed::Box;

use embassy_time::Duration;

use crate::bus::Bus;
use crate::clock::Clock;
use crate::status::StatusCode;
use crate::transport::Transport;

/// One step of a write chain: `value` into `register`, then wait `delay`
/// before the step's completion is handed on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterWrite {
    pub register: u8,
    pub value: u8,
    pub delay: Duration,
}

impl RegisterWrite {
    pub const fn new(register: u8, value: u8) -> Self {
        Self { register, value, delay: Duration::from_ticks(0) }
    }

    pub const fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

/// Final result of a write chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceReport {
    /// Status of the last step that ran, `Ok` for a completed chain.
    pub status: StatusCode,
    /// Steps that completed successfully. On failure this is also the index
    /// of the failing step.
    pub completed: usize,
    /// The step that failed, if any.
    pub failed: Option<RegisterWrite>,
}

impl SequenceReport {
    pub const fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Phase state machine for a write chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// Nothing issued yet.
    Idle,
    /// Step `n` is on the bus; its completion has not been handled.
    AwaitingStep(usize),
    /// Every step completed.
    Done,
    /// A step failed; later steps were never issued.
    Failed(SequenceReport),
}

/// What the driver has to do after [`WriteSequence::advance`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transition {
    /// Issue this write; feed its status back into `advance`.
    Issue(RegisterWrite),
    /// The chain is over.
    Finish(SequenceReport),
}

/// Cursor over a fixed list of register writes.
///
/// Pure state: it never touches a bus, so it can be driven by hand.
#[derive(Debug, Clone)]
pub struct WriteSequence<const N: usize> {
    steps: [RegisterWrite; N],
    pos: usize,
    phase: Phase,
}

impl<const N: usize> WriteSequence<N> {
    pub const fn new(steps: [RegisterWrite; N]) -> Self {
        Self { steps, pos: 0, phase: Phase::Idle }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of steps issued so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn steps(&self) -> &[RegisterWrite] {
        &self.steps
    }

    /// Feed the status of the step in flight (`Ok` to start).
    ///
    /// The cursor moves before the step is handed out, so a step can never be
    /// issued twice. Once finished, the same report is returned again.
    pub fn advance(&mut self, status: StatusCode) -> Transition {
        match self.phase {
            Phase::Done => return Transition::Finish(self.done_report()),
            Phase::Failed(report) => return Transition::Finish(report),
            Phase::Idle | Phase::AwaitingStep(_) => {}
        }

        if !status.is_ok() {
            // Before the first issue there is no step to blame.
            let report = match self.pos.checked_sub(1) {
                Some(failed_at) => SequenceReport {
                    status,
                    completed: failed_at,
                    failed: self.steps.get(failed_at).copied(),
                },
                None => SequenceReport { status, completed: 0, failed: None },
            };
            self.phase = Phase::Failed(report);
            return Transition::Finish(report);
        }

        if self.pos < N {
            let step = self.steps[self.pos];
            self.phase = Phase::AwaitingStep(self.pos);
            self.pos += 1;
            Transition::Issue(step)
        } else {
            self.phase = Phase::Done;
            Transition::Finish(self.done_report())
        }
    }

    fn done_report(&self) -> SequenceReport {
        SequenceReport { status: StatusCode::Ok, completed: N, failed: None }
    }
}

/// Chain state moved from each step's callback into the next one. Dropped
/// exactly once, right before the final callback runs.
struct Chain<F, const N: usize> {
    address: u8,
    sequence: WriteSequence<N>,
    callback: F,
}

impl<T: Transport + 'static, C: Clock + 'static> Bus<T, C> {
    /// Write each step in order, issuing step `k + 1` only after step `k`
    /// reported `Ok`, and report once at the end.
    ///
    /// The first failure stops the chain; the report names the failing step.
    /// An empty list reports `Ok` without touching the bus.
    pub fn write_sequence<F, const N: usize>(
        &mut self,
        address: u8,
        steps: [RegisterWrite; N],
        callback: F,
    ) where
        F: FnOnce(&mut Self, SequenceReport) + 'static,
    {
        let chain = Box::new(Chain {
            address,
            sequence: WriteSequence::new(steps),
            callback,
        });
        debug!("i2c {:#x}: write sequence of {} steps", address, N);
        // Through the queue, so even an empty chain reports from the loop.
        self.post(move |bus| advance_chain(bus, chain, StatusCode::Ok));
    }
}

fn advance_chain<T, C, F, const N: usize>(
    bus: &mut Bus<T, C>,
    mut chain: Box<Chain<F, N>>,
    status: StatusCode,
) where
    T: Transport + 'static,
    C: Clock + 'static,
    F: FnOnce(&mut Bus<T, C>, SequenceReport) + 'static,
{
    match chain.sequence.advance(status) {
        Transition::Issue(step) => {
            let address = chain.address;
            bus.write_single(address, step.register, step.value, step.delay, move |bus, status| {
                advance_chain(bus, chain, status)
            });
        }
        Transition::Finish(report) => {
            if !report.is_ok() {
                debug!(
                    "i2c {:#x}: write sequence stopped at step {} ({:?})",
                    chain.address, report.completed, report.status
                );
            }
            let Chain { callback, .. } = *chain;
            callback(bus, report);
        }
    }
}
