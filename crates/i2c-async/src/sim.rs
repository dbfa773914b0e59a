//! In-memory bus for host builds and tests.
//!
//! [`SimTransport`] executes transfers against [`SimDevice`]s keyed by slave
//! address and reports completions on the next poll, so every request goes
//! through the same issue/complete/dispatch path as on hardware.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use embassy_time::Instant;

use crate::bus::Bus;
use crate::clock::Clock;
use crate::slots::OperationId;
use crate::status::Event;
use crate::transport::{Completion, Segment, Transfer, Transport, MAX_SEGMENTS};

/// Byte pattern a failed receive segment is filled with.
pub const GARBAGE: u8 = 0xFF;

/// A slave on the simulated bus.
pub trait SimDevice {
    /// Bytes of one transmit segment.
    fn write(&mut self, bytes: &[u8]);
    /// Fill one receive segment.
    fn read(&mut self, buf: &mut [u8]);
}

impl<D: SimDevice + ?Sized> SimDevice for Box<D> {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) {
        (**self).read(buf)
    }
}

/// Shared handle, so a test can keep looking at a device it handed over.
impl<D: SimDevice> SimDevice for Rc<RefCell<D>> {
    fn write(&mut self, bytes: &[u8]) {
        self.borrow_mut().write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) {
        self.borrow_mut().read(buf)
    }
}

/// 256 byte-wide registers behind an auto-incrementing pointer.
///
/// The first byte of a transmit segment selects the register; further bytes
/// are written from there on. Receive segments read from the pointer on.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    registers: [u8; 256],
    pointer: u8,
    writes: Vec<(u8, u8)>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub const fn new() -> Self {
        Self { registers: [0; 256], pointer: 0, writes: Vec::new() }
    }

    /// Preload `values` starting at `register`.
    pub fn preload(mut self, register: u8, values: &[u8]) -> Self {
        self.load(register, values);
        self
    }

    pub fn load(&mut self, register: u8, values: &[u8]) {
        for (offset, value) in values.iter().enumerate() {
            self.registers[register.wrapping_add(offset as u8) as usize] = *value;
        }
    }

    pub fn get(&self, register: u8) -> u8 {
        self.registers[register as usize]
    }

    pub fn set(&mut self, register: u8, value: u8) {
        self.registers[register as usize] = value;
    }

    /// Every register write seen over the bus, in order.
    pub fn writes(&self) -> &[(u8, u8)] {
        &self.writes
    }
}

impl SimDevice for RegisterFile {
    fn write(&mut self, bytes: &[u8]) {
        let Some((&register, values)) = bytes.split_first() else {
            return;
        };
        self.pointer = register;
        for &value in values {
            self.registers[self.pointer as usize] = value;
            self.writes.push((self.pointer, value));
            self.pointer = self.pointer.wrapping_add(1);
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        for byte in buf {
            *byte = self.registers[self.pointer as usize];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

/// What the simulated bus does with the next issued transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimOutcome {
    /// Execute against the addressed device (`NO_SLAVE` if there is none).
    Complete,
    /// Skip the device and complete with this event.
    Fail(Event),
    /// Accept the transfer but report nothing until it is released.
    Hold,
    /// Refuse to start the transfer.
    Refuse(Event),
}

/// Simulated two-wire bus.
pub struct SimTransport {
    devices: BTreeMap<u8, Box<dyn SimDevice>>,
    script: VecDeque<SimOutcome>,
    ready: VecDeque<Completion>,
    held: Vec<(OperationId, Transfer)>,
    issued: Vec<Transfer>,
    aborted: Vec<OperationId>,
    max_outstanding: usize,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            script: VecDeque::new(),
            ready: VecDeque::new(),
            held: Vec::new(),
            issued: Vec::new(),
            aborted: Vec::new(),
            max_outstanding: 0,
        }
    }

    pub fn with_device(mut self, address: u8, device: impl SimDevice + 'static) -> Self {
        self.attach(address, device);
        self
    }

    pub fn attach(&mut self, address: u8, device: impl SimDevice + 'static) {
        self.devices.insert(address, Box::new(device));
    }

    pub fn detach(&mut self, address: u8) -> Option<Box<dyn SimDevice>> {
        self.devices.remove(&address)
    }

    /// Queue an outcome for the next issued transfer without one.
    pub fn script(&mut self, outcome: SimOutcome) {
        self.script.push_back(outcome);
    }

    /// Fail the next `count` transfers with `event`.
    pub fn fail_next(&mut self, count: usize, event: Event) {
        for _ in 0..count {
            self.script(SimOutcome::Fail(event));
        }
    }

    /// Push a completion as if the hardware had produced it.
    pub fn inject(&mut self, completion: Completion) {
        self.ready.push_back(completion);
    }

    /// Complete every held transfer, in issue order.
    pub fn release_held(&mut self) -> usize {
        let held = core::mem::take(&mut self.held);
        let count = held.len();
        for (id, transfer) in held {
            let completion = self.execute(id, &transfer);
            self.ready.push_back(completion);
        }
        count
    }

    pub fn held(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.held.iter().map(|(id, _)| *id)
    }

    /// Every transfer accepted so far, in issue order.
    pub fn issued(&self) -> &[Transfer] {
        &self.issued
    }

    pub fn aborted(&self) -> &[OperationId] {
        &self.aborted
    }

    /// Transfers accepted but not yet reported.
    pub fn outstanding(&self) -> usize {
        self.ready.len() + self.held.len()
    }

    /// Highest [`SimTransport::outstanding`] seen.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    fn execute(&mut self, id: OperationId, transfer: &Transfer) -> Completion {
        match self.devices.get_mut(&transfer.address) {
            Some(device) => {
                let segments = run_segments(transfer, |segment| match segment {
                    Segment::Transmit(bytes) => {
                        device.write(bytes);
                        bytes.to_vec()
                    }
                    Segment::Receive(len) => {
                        let mut buf = vec![0; *len];
                        device.read(&mut buf);
                        buf
                    }
                });
                Completion { id, event: Event::TRANSFER_COMPLETE, segments }
            }
            None => fail(id, transfer, Event::NO_SLAVE),
        }
    }
}

impl Transport for SimTransport {
    fn issue(&mut self, id: OperationId, transfer: Transfer) -> Result<(), Event> {
        let outcome = self.script.pop_front().unwrap_or(SimOutcome::Complete);
        if let SimOutcome::Refuse(event) = outcome {
            return Err(event);
        }

        self.issued.push(transfer.clone());
        match outcome {
            SimOutcome::Complete => {
                let completion = self.execute(id, &transfer);
                self.ready.push_back(completion);
            }
            SimOutcome::Fail(event) => self.ready.push_back(fail(id, &transfer, event)),
            SimOutcome::Hold => self.held.push((id, transfer)),
            SimOutcome::Refuse(_) => {}
        }
        self.max_outstanding = self.max_outstanding.max(self.outstanding());
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<Completion> {
        self.ready.pop_front()
    }

    fn abort(&mut self, id: OperationId) {
        self.held.retain(|(held, _)| *held != id);
        self.ready.retain(|completion| completion.id != id);
        self.aborted.push(id);
    }
}

fn run_segments(
    transfer: &Transfer,
    mut f: impl FnMut(&Segment) -> Vec<u8>,
) -> heapless::Vec<Vec<u8>, MAX_SEGMENTS> {
    let mut segments = heapless::Vec::new();
    for segment in &transfer.segments {
        let _ = segments.push(f(segment));
    }
    segments
}

fn fail(id: OperationId, transfer: &Transfer, event: Event) -> Completion {
    let segments = run_segments(transfer, |segment| match segment {
        Segment::Transmit(bytes) => bytes.to_vec(),
        Segment::Receive(len) => vec![GARBAGE; *len],
    });
    Completion { id, event, segments }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub const fn new() -> Self {
        Self { now: Cell::new(Instant::from_ticks(0)) }
    }

    pub fn advance(&self, by: embassy_time::Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, at: Instant) {
        self.now.set(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Run the loop until nothing is left to do, jumping the clock to each
/// wakeup. Stops early if only held transfers without a deadline remain.
/// Returns the number of callbacks run.
pub fn settle<T: Transport + 'static>(bus: &mut Bus<T, ManualClock>) -> usize {
    run_until(bus, None)
}

/// Like [`settle`], but never moves the clock past `until`.
pub fn run_until<T: Transport + 'static>(
    bus: &mut Bus<T, ManualClock>,
    until: Option<Instant>,
) -> usize {
    let mut ran = 0;
    loop {
        let count = bus.poll();
        ran += count;
        if count > 0 {
            continue;
        }

        let Some(at) = bus.next_wakeup() else {
            break;
        };
        if let Some(until) = until.filter(|until| at > *until) {
            if until > bus.now() {
                bus.clock().set(until);
            }
            break;
        }
        if at > bus.now() {
            bus.clock().set(at);
        }
    }
    ran
}

#[cfg(test)]
mod tests {
    use super::*;

    type Slots = crate::slots::Slots<()>;

    fn id(slots: &mut Slots) -> OperationId {
        slots.insert(())
    }

    #[test]
    fn register_file_auto_increments() {
        let mut regs = RegisterFile::new().preload(0x3B, &[1, 2, 3]);
        regs.write(&[0x3B]);
        let mut buf = [0; 3];
        regs.read(&mut buf);
        assert_eq!(buf, [1, 2, 3]);

        regs.write(&[0x10, 0xAA, 0xBB]);
        assert_eq!(regs.get(0x10), 0xAA);
        assert_eq!(regs.get(0x11), 0xBB);
        assert_eq!(regs.writes(), &[(0x10, 0xAA), (0x11, 0xBB)]);
    }

    #[test]
    fn absent_device_reports_no_slave_with_garbage() {
        let mut slots = Slots::new();
        let mut sim = SimTransport::new();
        let op = id(&mut slots);
        assert_eq!(sim.issue(op, Transfer::write_read(0x50, 0x00, 2)), Ok(()));

        let completion = sim.poll_completion().unwrap();
        assert_eq!(completion.event, Event::NO_SLAVE);
        assert_eq!(completion.segments[1], [GARBAGE, GARBAGE]);
        assert!(sim.poll_completion().is_none());
    }

    #[test]
    fn held_transfers_count_as_outstanding() {
        let mut slots = Slots::new();
        let mut sim = SimTransport::new().with_device(0x68, RegisterFile::new());
        sim.script(SimOutcome::Hold);
        sim.issue(id(&mut slots), Transfer::write_register(0x68, 0x6B, 0)).unwrap();
        sim.issue(id(&mut slots), Transfer::write_register(0x68, 0x6C, 0)).unwrap();

        assert_eq!(sim.outstanding(), 2);
        assert_eq!(sim.max_outstanding(), 2);
        assert_eq!(sim.release_held(), 1);
        assert_eq!(sim.issued().len(), 2);
    }

    #[test]
    fn refused_transfer_is_not_recorded() {
        let mut slots = Slots::new();
        let mut sim = SimTransport::new();
        sim.script(SimOutcome::Refuse(Event::ARBITRATION_LOST));
        let result = sim.issue(id(&mut slots), Transfer::read(0x68, 1));
        assert_eq!(result, Err(Event::ARBITRATION_LOST));
        assert!(sim.issued().is_empty());
        assert_eq!(sim.outstanding(), 0);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Instant::from_ticks(0));
        let step = embassy_time::Duration::from_millis(5);
        clock.advance(step);
        assert_eq!(clock.now(), Instant::from_ticks(0) + step);
        clock.advance(step);
        assert_eq!(clock.now(), Instant::from_ticks(0) + step * 2);
    }
}
