//! Purpose: Client facade over named and session message queues.
//! Exports: `Queues` operations and the `PulledEntry` result type.
//! Role: Validates names locally, then speaks the queue wire ops.
//! Invariants: The reserved alias SESSION always targets the caller's
//! Invariants: session queue; named-queue grammar is checked before any
//! Invariants: round trip.
use time::OffsetDateTime;

use crate::api::context::{ClientContext, failure};
use crate::core::error::{Error, ErrorKind};
use crate::core::model::InsertOrder;
use crate::core::name::{SESSION_ALIAS, generated_queue_name, validate_queue_name};
use crate::core::wire::{Request, ResultCode, Subsystem, op};

/// One delivered queue entry: the opaque data plus the daemon-assigned
/// insertion timestamp.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PulledEntry {
    pub data: Vec<u8>,
    pub timestamp: OffsetDateTime,
}

pub struct Queues<'a> {
    context: &'a ClientContext,
}

impl<'a> Queues<'a> {
    pub(crate) fn new(context: &'a ClientContext) -> Self {
        Self { context }
    }

    /// Create a named queue. With no name, or when the requested name is
    /// taken, the caller gets a generated unique name; the second element
    /// reports whether the request collided.
    pub fn create(&self, name: Option<&str>) -> Result<(String, bool), Error> {
        let requested = match name {
            Some(name) => {
                validate_queue_name(name)?;
                name.to_string()
            }
            None => generated_queue_name()?,
        };
        let response = self.context.call_expect_ok(
            &Request::new(Subsystem::Queue, op::queue::CREATE).with_name(requested),
        )?;
        let actual = String::from_utf8(response.payload).map_err(|_| {
            Error::new(ErrorKind::Protocol).with_message("queue name in response not UTF-8")
        })?;
        // A collision on a caller-chosen name is reported; a collision on a
        // generated candidate is an internal retry, not the caller's concern.
        Ok((actual, name.is_some() && response.params[0] != 0))
    }

    /// Attach to a named queue, creating it on first use; reports whether it
    /// already existed. The session queue always exists once the process has
    /// a session.
    pub fn open(&self, name: &str) -> Result<bool, Error> {
        if is_session(name) {
            self.context.ensure_session()?;
            return Ok(true);
        }
        validate_queue_name(name)?;
        let response = self
            .context
            .call_expect_ok(&Request::new(Subsystem::Queue, op::queue::OPEN).with_name(name))?;
        Ok(response.params[0] != 0)
    }

    /// Delete a queue and fail any waiters parked on it. Deleting the session
    /// queue is refused while other processes still reference it.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        if is_session(name) {
            let handle = self.context.ensure_session()?;
            self.context.call_expect_ok(
                &Request::new(Subsystem::Queue, op::queue::DELETE).with_params([handle, 0, 0]),
            )?;
            self.context.forget_session();
            return Ok(());
        }
        validate_queue_name(name)?;
        self.context
            .call_expect_ok(&Request::new(Subsystem::Queue, op::queue::DELETE).with_name(name))?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> Result<bool, Error> {
        if is_session(name) {
            return Ok(true);
        }
        validate_queue_name(name)?;
        let response = self
            .context
            .call_expect_ok(&Request::new(Subsystem::Queue, op::queue::QUERY).with_name(name))?;
        Ok(response.params[0] != 0)
    }

    pub fn len(&self, name: &str) -> Result<u64, Error> {
        let response = self
            .context
            .call_expect_ok(&self.target_request(op::queue::COUNT, name)?)?;
        Ok(response.params[0])
    }

    pub fn clear(&self, name: &str) -> Result<(), Error> {
        self.context
            .call_expect_ok(&self.target_request(op::queue::CLEAR, name)?)?;
        Ok(())
    }

    pub fn add(&self, name: &str, data: Vec<u8>, order: InsertOrder) -> Result<(), Error> {
        let mut request = self.target_request(op::queue::ADD, name)?.with_payload(data);
        request.params[1] = order.as_u64();
        self.context.call_expect_ok(&request)?;
        Ok(())
    }

    /// Pull the head entry. `wait = false` on an empty queue is a normal
    /// `None`; `wait = true` parks in the daemon until an entry arrives or
    /// the queue is deleted (which surfaces as `NotFound`).
    pub fn pull(&self, name: &str, wait: bool) -> Result<Option<PulledEntry>, Error> {
        let mut request = self.target_request(op::queue::PULL, name)?;
        request.params[1] = u64::from(wait);
        let response = self.context.call(&request)?;
        match response.result {
            ResultCode::Ok => {
                let timestamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(
                    response.params[0],
                ))
                .map_err(|_| {
                    Error::new(ErrorKind::Protocol).with_message("bad entry timestamp")
                })?;
                Ok(Some(PulledEntry {
                    data: response.payload,
                    timestamp,
                }))
            }
            ResultCode::Empty => Ok(None),
            code => Err(failure(code)),
        }
    }

    /// Queue ops carry either the queue name or, for the session queue, the
    /// handle in the first parameter word.
    fn target_request(&self, opcode: u8, name: &str) -> Result<Request, Error> {
        if is_session(name) {
            let handle = self.context.ensure_session()?;
            return Ok(Request::new(Subsystem::Queue, opcode).with_params([handle, 0, 0]));
        }
        validate_queue_name(name)?;
        Ok(Request::new(Subsystem::Queue, opcode).with_name(name))
    }
}

fn is_session(name: &str) -> bool {
    name.eq_ignore_ascii_case(SESSION_ALIAS)
}

#[cfg(test)]
mod tests {
    use super::is_session;

    #[test]
    fn session_alias_matches_any_case() {
        assert!(is_session("SESSION"));
        assert!(is_session("session"));
        assert!(is_session("SeSsIoN"));
        assert!(!is_session("SESSIONS"));
    }
}
