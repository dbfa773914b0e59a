use alloc::boxed::Box;
use alloc::vec::Vec;

use embassy_time::{Duration, Instant};

use crate::bus::Bus;
use crate::status::StatusCode;
use crate::transport::Completion;

/// Callback for requests that only report a status.
pub type StatusCallback<T, C> = Box<dyn FnOnce(&mut Bus<T, C>, StatusCode)>;

/// Callback for requests that receive bytes: status, received length and the
/// received buffer (`None` unless the status is [`StatusCode::Ok`]).
pub type BytesCallback<T, C> =
    Box<dyn FnOnce(&mut Bus<T, C>, StatusCode, usize, Option<Vec<u8>>)>;

/// The closed set of result shapes an operation can deliver.
pub(crate) enum Reply<T, C> {
    Status(StatusCallback<T, C>),
    Bytes(BytesCallback<T, C>),
}

/// Where the response lives in the transport's result view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Response {
    /// Nothing to extract.
    None,
    /// Second segment, after the register-select write.
    FollowsWrite,
    /// First and only segment.
    Only,
}

impl Response {
    fn segment(self) -> Option<usize> {
        match self {
            Response::None => None,
            Response::FollowsWrite => Some(1),
            Response::Only => Some(0),
        }
    }
}

/// One logical request/response cycle against a slave.
///
/// Lives in the engine's slot table while its transaction is outstanding,
/// is moved into a delivery task on completion, and is dropped as soon as
/// its callback returns.
pub(crate) struct Operation<T, C> {
    reply: Reply<T, C>,
    delay: Duration,
    response: Response,
    deadline: Option<Instant>,
}

impl<T, C> Operation<T, C> {
    pub fn new(reply: Reply<T, C>, delay: Duration, response: Response) -> Self {
        Self { reply, delay, response, deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Turn a completion into the delivery payload. The response buffer is
    /// moved out of the result view; it is only kept on success.
    pub fn interpret(&self, completion: Completion) -> Delivery {
        let status = StatusCode::from(completion.event);
        match (status, self.response.segment()) {
            (StatusCode::Ok, Some(index)) => match completion.segments.into_iter().nth(index) {
                Some(data) => Delivery { status, data: Some(data) },
                // Reported complete, but the expected response is not there.
                None => Delivery { status: StatusCode::Error, data: None },
            },
            _ => Delivery { status, data: None },
        }
    }

    /// Run the callback, consuming the operation.
    pub fn deliver(self, bus: &mut Bus<T, C>, delivery: Delivery) {
        let Delivery { status, data } = delivery;
        match self.reply {
            Reply::Status(callback) => callback(bus, status),
            Reply::Bytes(callback) => {
                let len = data.as_ref().map_or(0, Vec::len);
                callback(bus, status, len, data)
            }
        }
    }
}

/// Status and extracted response of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub status: StatusCode,
    pub data: Option<Vec<u8>>,
}
