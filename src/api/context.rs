// Per-process client context: the connection pool plus the session-queue
// reference this process holds.
//
// The context is an explicit object with a defined lifecycle, injected into
// the subsystem facades; nothing here is process-global except the
// `CROSSBAR_SESSION` handoff to descendants.
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use crate::api::macros::MacroSpace;
use crate::api::pool::{Connection, ConnectionPool};
use crate::api::queues::Queues;
use crate::api::registry::Registry;
use crate::core::error::{Error, ErrorKind};
use crate::core::wire::{Request, Response, ResultCode, Subsystem, op};
use crate::daemon::endpoint::default_endpoint;

pub const SESSION_ENV: &str = "CROSSBAR_SESSION";

pub struct ClientContext {
    pool: ConnectionPool,
    session: Mutex<Option<u64>>,
}

impl ClientContext {
    /// Context without an eager session; the session queue is materialized on
    /// first use.
    pub fn connect(endpoint: Option<PathBuf>) -> Self {
        let endpoint = endpoint.unwrap_or_else(default_endpoint);
        Self {
            pool: ConnectionPool::new(endpoint),
            session: Mutex::new(None),
        }
    }

    /// Process startup: nest onto the inherited session queue if the
    /// environment carries one, otherwise create a fresh session and publish
    /// its handle for descendants.
    pub fn init_process() -> Result<Self, Error> {
        let context = Self::connect(None);
        context.ensure_session()?;
        Ok(context)
    }

    /// Process teardown: release this process's session reference. The daemon
    /// deletes the queue only when the last reference goes.
    pub fn terminate_process(&self) -> Result<(), Error> {
        let handle = self.session.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            self.call_expect_ok(
                &Request::new(Subsystem::Control, op::control::SESSION_DETACH)
                    .with_params([handle, 0, 0]),
            )?;
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &std::path::Path {
        self.pool.endpoint()
    }

    pub fn queues(&self) -> Queues<'_> {
        Queues::new(self)
    }

    pub fn macro_space(&self) -> MacroSpace<'_> {
        MacroSpace::new(self)
    }

    pub fn registry(&self) -> Registry<'_> {
        Registry::new(self)
    }

    /// Liveness probe; answers the daemon's pid.
    pub fn ping(&self) -> Result<u32, Error> {
        let response = self.call_expect_ok(&Request::new(Subsystem::Control, op::control::PING))?;
        Ok(response.params[0] as u32)
    }

    pub fn shutdown_daemon(&self) -> Result<(), Error> {
        self.call_expect_ok(&Request::new(Subsystem::Control, op::control::SHUTDOWN))?;
        Ok(())
    }

    /// The session-queue handle this process references, attaching or
    /// creating it on first call. The guard stays held across the round
    /// trip; racing first users mint exactly one session.
    pub(crate) fn ensure_session(&self) -> Result<u64, Error> {
        let mut slot = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = *slot {
            return Ok(handle);
        }
        let handle = match session_from_env() {
            Some(inherited) => match self.attach_session(inherited) {
                Ok(()) => inherited,
                // Stale inheritance (daemon restarted since the parent's
                // handle was minted): fall back to a fresh session.
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(handle = inherited, "inherited session is gone, creating a new one");
                    self.create_session()?
                }
                Err(err) => return Err(err),
            },
            None => self.create_session()?,
        };
        *slot = Some(handle);
        Ok(handle)
    }

    /// Drop the cached handle after an explicit session-queue deletion.
    pub(crate) fn forget_session(&self) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = None;
        }
    }

    fn attach_session(&self, handle: u64) -> Result<(), Error> {
        self.call_expect_ok(
            &Request::new(Subsystem::Control, op::control::SESSION_ATTACH)
                .with_params([handle, 0, 0]),
        )?;
        Ok(())
    }

    fn create_session(&self) -> Result<u64, Error> {
        let response =
            self.call_expect_ok(&Request::new(Subsystem::Control, op::control::SESSION_CREATE))?;
        let handle = response.params[0];
        // Publish for child processes; they nest onto this queue via attach.
        unsafe {
            std::env::set_var(SESSION_ENV, session_token(handle));
        }
        Ok(handle)
    }

    /// One round trip on a pooled connection. A connection that failed
    /// mid-call is dropped rather than returned to the pool.
    pub(crate) fn call(&self, request: &Request) -> Result<Response, Error> {
        let mut connection = self.pool.acquire()?;
        let response = connection.call(request)?;
        self.pool.release(connection);
        Ok(response)
    }

    /// Round trip that treats anything but `Ok` as a failure.
    pub(crate) fn call_expect_ok(&self, request: &Request) -> Result<Response, Error> {
        let response = self.call(request)?;
        expect_ok(response)
    }

    /// Run a multi-request exchange on one dedicated connection (needed by
    /// cursor-based protocols, which keep state per connection).
    pub(crate) fn with_connection<T>(
        &self,
        exchange: impl FnOnce(&mut Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut connection = self.pool.acquire()?;
        let value = exchange(&mut connection)?;
        self.pool.release(connection);
        Ok(value)
    }
}

pub(crate) fn expect_ok(response: Response) -> Result<Response, Error> {
    match response.result {
        ResultCode::Ok => Ok(response),
        code => Err(failure(code)),
    }
}

pub(crate) fn failure(code: ResultCode) -> Error {
    match code.to_error_kind() {
        Some(kind) => Error::new(kind).with_message("daemon reported a failure"),
        None => Error::new(ErrorKind::Protocol).with_message("unexpected result code"),
    }
}

pub(crate) fn session_token(handle: u64) -> String {
    format!("{handle:016x}")
}

fn session_from_env() -> Option<u64> {
    let raw = std::env::var(SESSION_ENV).ok()?;
    if raw.len() != 16 {
        return None;
    }
    u64::from_str_radix(&raw, 16).ok()
}
