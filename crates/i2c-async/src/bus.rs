use alloc::boxed::Box;
use alloc::vec::Vec;

use embassy_time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::BusConfig;
use crate::error::Error;
use crate::operation::{Delivery, Operation, Reply, Response};
use crate::scheduler::{Scheduler, Task};
use crate::slots::{OperationId, Slots};
use crate::status::{Event, StatusCode};
use crate::transport::{Completion, Transfer, Transport, MAX_TRANSFER_LEN};

/// Transaction engine for one bus.
///
/// Owns the transport, the clock, the task queue and every pending
/// operation. Callbacks receive `&mut Bus` so they can issue follow-up
/// requests; nothing is ever invoked from inside a request call or a
/// transport notification, only from [`Bus::poll`].
pub struct Bus<T, C> {
    transport: T,
    clock: C,
    config: BusConfig,
    scheduler: Scheduler<Self>,
    operations: Slots<Operation<T, C>>,
}

impl<T: Transport, C: Clock> Bus<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self::with_config(transport, clock, BusConfig::default())
    }

    pub fn with_config(transport: T, clock: C, config: BusConfig) -> Self {
        Self {
            transport,
            clock,
            config,
            scheduler: Scheduler::new(),
            operations: Slots::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Operations whose physical transaction is still outstanding.
    pub fn pending(&self) -> usize {
        self.operations.len()
    }

    pub fn is_pending(&self, id: OperationId) -> bool {
        self.operations.get(id).is_some()
    }

    /// Callbacks waiting in the task queue.
    pub fn scheduled(&self) -> usize {
        self.scheduler.len()
    }

    /// Nothing outstanding on the bus and nothing left to run.
    pub fn is_idle(&self) -> bool {
        self.operations.len() == 0 && self.scheduler.is_empty()
    }

    /// Earliest instant at which [`Bus::poll`] has timed work to do: a
    /// delayed callback falling due or a transfer deadline passing.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let deadline = self.operations.values().filter_map(Operation::deadline).min();
        match (self.scheduler.next_due(), deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl<T: Transport + 'static, C: Clock + 'static> Bus<T, C> {
    /// Run `task` on the next dispatch cycle.
    pub fn post<F>(&mut self, task: F)
    where
        F: FnOnce(&mut Self) + 'static,
    {
        let now = self.clock.now();
        self.scheduler.post(now, Box::new(task));
    }

    /// Run `task` once `delay` has elapsed.
    pub fn post_after<F>(&mut self, delay: Duration, task: F)
    where
        F: FnOnce(&mut Self) + 'static,
    {
        let now = self.clock.now();
        self.scheduler.post_after(now, delay, Box::new(task));
    }

    /// Write `value` to `register`: one transmit segment `[register, value]`.
    pub fn write_single<F>(
        &mut self,
        address: u8,
        register: u8,
        value: u8,
        delay: Duration,
        callback: F,
    ) -> OperationId
    where
        F: FnOnce(&mut Self, StatusCode) + 'static,
    {
        let operation =
            Operation::new(Reply::Status(Box::new(callback)), delay, Response::None);
        self.start(Transfer::write_register(address, register, value), operation)
    }

    /// Select `register`, then receive `len` bytes.
    ///
    /// The callback gets the buffer only on [`StatusCode::Ok`].
    pub fn read_multiple<F>(
        &mut self,
        address: u8,
        register: u8,
        len: usize,
        delay: Duration,
        callback: F,
    ) -> Result<OperationId, Error>
    where
        F: FnOnce(&mut Self, StatusCode, usize, Option<Vec<u8>>) + 'static,
    {
        check_len(len)?;
        let operation = Operation::new(
            Reply::Bytes(Box::new(callback)),
            delay,
            Response::FollowsWrite,
        );
        Ok(self.start(Transfer::write_read(address, register, len), operation))
    }

    /// Read one register. The byte is `None` unless the status is ok.
    pub fn read_single<F>(
        &mut self,
        address: u8,
        register: u8,
        delay: Duration,
        callback: F,
    ) -> Result<OperationId, Error>
    where
        F: FnOnce(&mut Self, StatusCode, Option<u8>) + 'static,
    {
        self.read_multiple(address, register, 1, delay, move |bus, status, _, data| {
            let byte = data.and_then(|bytes| bytes.first().copied());
            callback(bus, status, byte)
        })
    }

    /// Receive `len` bytes without selecting a register first.
    pub fn bulk_read<F>(
        &mut self,
        address: u8,
        len: usize,
        delay: Duration,
        callback: F,
    ) -> Result<OperationId, Error>
    where
        F: FnOnce(&mut Self, StatusCode, usize, Option<Vec<u8>>) + 'static,
    {
        check_len(len)?;
        let operation =
            Operation::new(Reply::Bytes(Box::new(callback)), delay, Response::Only);
        Ok(self.start(Transfer::read(address, len), operation))
    }

    /// Abandon a pending operation. Its callback still runs once, with
    /// [`StatusCode::Error`], so chained state is released.
    pub fn cancel(&mut self, id: OperationId) -> Result<(), Error> {
        let operation = self.operations.remove(id).ok_or(Error::UnknownOperation(id))?;
        debug!("i2c: cancel {:?}", id);
        self.transport.abort(id);
        self.finish_early(id, operation, Event::ERROR);
        Ok(())
    }

    /// One dispatch cycle: hand finished transfers to the dispatcher, expire
    /// whatever is still outstanding past its deadline, then run every due
    /// callback posted before the cycle started running callbacks. Returns
    /// the number of callbacks run.
    pub fn poll(&mut self) -> usize {
        let now = self.clock.now();
        while let Some(completion) = self.transport.poll_completion() {
            self.dispatch(completion);
        }

        // A completion already reported wins over its deadline.
        if self.operations.len() > 0 {
            self.expire(now);
        }

        let horizon = self.scheduler.horizon();
        let mut ran = 0;
        while let Some(task) = self.scheduler.pop_due(now, horizon) {
            task(self);
            ran += 1;
        }
        ran
    }

    fn start(&mut self, transfer: Transfer, operation: Operation<T, C>) -> OperationId {
        let deadline = self.config.transfer_timeout.map(|timeout| self.clock.now() + timeout);
        let address = transfer.address;
        let id = self.operations.insert(operation.with_deadline(deadline));
        trace!("i2c {:#x}: issue {:?}", address, id);

        if let Err(event) = self.transport.issue(id, transfer) {
            warn!("i2c {:#x}: transfer refused ({:?})", address, event);
            if let Some(operation) = self.operations.remove(id) {
                self.finish_early(id, operation, event);
            }
        }
        id
    }

    /// Completion dispatcher: status mapping, response extraction, delivery.
    fn dispatch(&mut self, completion: Completion) {
        let id = completion.id;
        let Some(operation) = self.operations.remove(id) else {
            warn!("i2c: dropping completion for stale operation {:?}", id);
            return;
        };

        let delivery = operation.interpret(completion);
        trace!("i2c: {:?} finished with {:?}", id, delivery.status);
        self.schedule(operation, delivery);
    }

    fn expire(&mut self, now: Instant) {
        for id in self.operations.find(|operation| operation.expired(now)) {
            if let Some(operation) = self.operations.remove(id) {
                warn!("i2c: {:?} timed out", id);
                self.transport.abort(id);
                self.finish_early(id, operation, Event::TIMEOUT);
            }
        }
    }

    fn finish_early(&mut self, id: OperationId, operation: Operation<T, C>, event: Event) {
        let completion = Completion { id, event, segments: heapless::Vec::new() };
        let delivery = operation.interpret(completion);
        self.schedule(operation, delivery);
    }

    fn schedule(&mut self, operation: Operation<T, C>, delivery: Delivery) {
        let now = self.clock.now();
        let delay = operation.delay();
        let task: Task<Self> =
            Box::new(move |bus: &mut Self| operation.deliver(bus, delivery));

        if delay.as_ticks() == 0 {
            self.scheduler.post(now, task);
        } else {
            self.scheduler.post_after(now, delay, task);
        }
    }
}

fn check_len(len: usize) -> Result<(), Error> {
    if len == 0 || len > MAX_TRANSFER_LEN {
        return Err(Error::InvalidLength(len));
    }
    Ok(())
}
