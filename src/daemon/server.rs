// Blocking Unix-socket server: one worker thread per client connection.
//
// The daemon never trusts a client-side lock to decide liveness; whoever
// binds the well-known socket is the daemon. Each worker handles exactly one
// request at a time (the protocol forbids pipelining), so per-connection
// state like the macro iteration cursor lives on the worker's stack.
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::model::{CallbackType, InsertOrder, RegistrationEntry};
use crate::core::wire::{Request, Response, ResultCode, Subsystem, op};
use crate::daemon::state::{MacroRecord, Pulled, Queue, State};

const ACCEPT_TICK: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub endpoint: PathBuf,
}

/// Run the daemon until a shutdown request or signal arrives. Returns
/// `Duplicate` if another daemon already owns the endpoint.
pub fn run(config: ServeConfig) -> Result<(), Error> {
    let listener = bind(&config.endpoint)?;
    listener.set_nonblocking(true).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to configure listener")
            .with_source(err)
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to register signal handler")
                .with_source(err)
        })?;
    }

    let state = Arc::new(State::new());
    info!(endpoint = %config.endpoint.display(), "crossbar daemon listening");

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                let shutdown = Arc::clone(&shutdown);
                std::thread::spawn(move || serve_connection(stream, &state, &shutdown));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_TICK);
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                std::thread::sleep(ACCEPT_TICK);
            }
        }
    }

    let _ = std::fs::remove_file(&config.endpoint);
    info!("crossbar daemon shut down");
    Ok(())
}

/// Bind the well-known socket. A live daemon on the other end means we lost
/// the race and must not serve; a dead socket file is cleaned up and rebound.
fn bind(endpoint: &Path) -> Result<UnixListener, Error> {
    match UnixListener::bind(endpoint) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(endpoint).is_ok() {
                return Err(Error::new(ErrorKind::Duplicate)
                    .with_message("daemon already running")
                    .with_path(endpoint));
            }
            std::fs::remove_file(endpoint).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to remove stale socket")
                    .with_path(endpoint)
                    .with_source(err)
            })?;
            UnixListener::bind(endpoint).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to bind endpoint")
                    .with_path(endpoint)
                    .with_source(err)
            })
        }
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("failed to bind endpoint")
            .with_path(endpoint)
            .with_source(err)),
    }
}

struct MacroCursor {
    records: Vec<MacroRecord>,
    next_descriptor: usize,
    next_image: usize,
}

enum Outcome {
    Reply(Response),
    Hangup,
    Shutdown,
}

fn serve_connection(stream: UnixStream, state: &State, shutdown: &AtomicBool) {
    debug!("client connected");
    let mut cursor: Option<MacroCursor> = None;
    loop {
        let request = match Request::read_from(&mut &stream) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "connection closed");
                break;
            }
        };
        let outcome = dispatch(state, &stream, &mut cursor, shutdown, &request);
        match outcome {
            Outcome::Reply(response) => {
                if let Err(err) = response.write_to(&mut &stream) {
                    debug!(error = %err, "client went away mid-response");
                    break;
                }
            }
            Outcome::Hangup => {
                debug!("client hung up while blocked");
                break;
            }
            Outcome::Shutdown => {
                let _ = Response::ok().write_to(&mut &stream);
                info!("shutdown requested by client");
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

/// A parked puller must never outlive its client: peek the socket for EOF on
/// every wait tick, and bail out on daemon shutdown as well. MSG_PEEK leaves
/// any buffered request bytes in place; MSG_DONTWAIT keeps the probe from
/// blocking without touching the stream's own mode.
fn peer_alive(stream: &UnixStream) -> bool {
    let mut byte = [0u8; 1];
    let received = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            byte.as_mut_ptr().cast::<libc::c_void>(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    match received {
        0 => false,
        n if n > 0 => true,
        _ => std::io::Error::last_os_error().raw_os_error() == Some(libc::EWOULDBLOCK),
    }
}

fn dispatch(
    state: &State,
    stream: &UnixStream,
    cursor: &mut Option<MacroCursor>,
    shutdown: &AtomicBool,
    request: &Request,
) -> Outcome {
    let result = match request.subsystem {
        Subsystem::Control => {
            if request.opcode == op::control::SHUTDOWN {
                return Outcome::Shutdown;
            }
            handle_control(state, request)
        }
        Subsystem::Queue => {
            if request.opcode == op::queue::PULL {
                return handle_pull(state, stream, shutdown, request);
            }
            handle_queue(state, request)
        }
        Subsystem::Macro => handle_macro(state, cursor, request),
        Subsystem::Registry => handle_registry(state, request),
    };
    Outcome::Reply(result.unwrap_or_else(|err| {
        debug!(subsystem = ?request.subsystem, opcode = request.opcode, error = %err, "request failed");
        Response::failure(ResultCode::from_error_kind(err.kind()))
    }))
}

fn handle_control(state: &State, request: &Request) -> Result<Response, Error> {
    match request.opcode {
        op::control::PING => Ok(Response::ok().with_params([
            u64::from(std::process::id()),
            state.session_count(),
            0,
        ])),
        op::control::SESSION_CREATE => {
            let handle = state.session_create();
            Ok(Response::ok().with_params([handle, 0, 0]))
        }
        op::control::SESSION_ATTACH => {
            state.session_attach(request.params[0])?;
            Ok(Response::ok())
        }
        op::control::SESSION_DETACH => {
            state.session_detach(request.params[0])?;
            Ok(Response::ok())
        }
        _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown control opcode")),
    }
}

/// Queue requests address either a named queue (name set) or the session
/// queue whose handle rides in params[0].
fn target_queue(state: &State, request: &Request) -> Result<Arc<Queue>, Error> {
    if request.name.is_empty() {
        state.session_queue(request.params[0])
    } else {
        state.named_queue(&request.name)
    }
}

fn handle_queue(state: &State, request: &Request) -> Result<Response, Error> {
    match request.opcode {
        op::queue::CREATE => {
            let (actual, duplicate) = state.create_named(&request.name)?;
            Ok(Response::ok()
                .with_params([u64::from(duplicate), 0, 0])
                .with_payload(actual.into_bytes()))
        }
        op::queue::OPEN => {
            let existed = state.open_named(&request.name)?;
            Ok(Response::ok().with_params([u64::from(existed), 0, 0]))
        }
        op::queue::DELETE => {
            if request.name.is_empty() {
                state.session_delete(request.params[0])?;
            } else {
                state.delete_named(&request.name)?;
            }
            Ok(Response::ok())
        }
        op::queue::QUERY => {
            let exists = state.query_named(&request.name)?;
            Ok(Response::ok().with_params([u64::from(exists), 0, 0]))
        }
        op::queue::COUNT => {
            let queue = target_queue(state, request)?;
            Ok(Response::ok().with_params([queue.len(), 0, 0]))
        }
        op::queue::CLEAR => {
            let queue = target_queue(state, request)?;
            queue.clear();
            Ok(Response::ok())
        }
        op::queue::ADD => {
            let queue = target_queue(state, request)?;
            let order = InsertOrder::from_u64(request.params[1])?;
            queue.add(request.payload.clone(), order)?;
            Ok(Response::ok())
        }
        _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown queue opcode")),
    }
}

fn handle_pull(
    state: &State,
    stream: &UnixStream,
    shutdown: &AtomicBool,
    request: &Request,
) -> Outcome {
    let queue = match target_queue(state, request) {
        Ok(queue) => queue,
        Err(err) => {
            return Outcome::Reply(Response::failure(ResultCode::from_error_kind(err.kind())));
        }
    };
    let wait = request.params[1] == 1;
    let mut probe = || peer_alive(stream) && !shutdown.load(Ordering::SeqCst);
    match queue.pull(wait, &mut probe) {
        Pulled::Entry(entry) => Outcome::Reply(
            Response::ok()
                .with_params([entry.timestamp_ns, 0, 0])
                .with_payload(entry.data),
        ),
        Pulled::Empty => Outcome::Reply(Response::failure(ResultCode::Empty)),
        Pulled::Deleted => Outcome::Reply(Response::failure(ResultCode::NotFound)),
        Pulled::Hangup => Outcome::Hangup,
    }
}

fn handle_macro(
    state: &State,
    cursor: &mut Option<MacroCursor>,
    request: &Request,
) -> Result<Response, Error> {
    match request.opcode {
        op::macrospace::ADD => {
            let order = u32::try_from(request.params[0])
                .map_err(|_| Error::new(ErrorKind::Protocol).with_message("order out of range"))?;
            state.macro_add(&request.name, request.payload.clone(), order)?;
            Ok(Response::ok())
        }
        op::macrospace::REMOVE => {
            state.macro_remove(&request.name)?;
            Ok(Response::ok())
        }
        op::macrospace::CLEAR => {
            state.macro_clear();
            Ok(Response::ok())
        }
        op::macrospace::GET => {
            let record = state.macro_get(&request.name)?;
            Ok(Response::ok()
                .with_params([u64::from(record.order), 0, 0])
                .with_payload(record.image))
        }
        op::macrospace::QUERY => {
            let order = state.macro_query(&request.name)?;
            Ok(Response::ok().with_params([u64::from(order), 0, 0]))
        }
        op::macrospace::REORDER => {
            let order = u32::try_from(request.params[0])
                .map_err(|_| Error::new(ErrorKind::Protocol).with_message("order out of range"))?;
            state.macro_reorder(&request.name, order)?;
            Ok(Response::ok())
        }
        op::macrospace::COUNT => Ok(Response::ok().with_params([state.macro_count(), 0, 0])),
        op::macrospace::ITER_BEGIN => {
            let records = state.macro_snapshot();
            let count = records.len() as u64;
            *cursor = Some(MacroCursor {
                records,
                next_descriptor: 0,
                next_image: 0,
            });
            Ok(Response::ok().with_params([count, 0, 0]))
        }
        op::macrospace::ITER_DESCRIPTOR => {
            let cursor = cursor
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::Protocol).with_message("no open iteration"))?;
            if cursor.next_descriptor >= cursor.records.len() {
                return Ok(Response::failure(ResultCode::Empty));
            }
            let record = &cursor.records[cursor.next_descriptor];
            cursor.next_descriptor += 1;
            Ok(Response::ok()
                .with_params([record.image.len() as u64, u64::from(record.order), 0])
                .with_payload(record.name.clone().into_bytes()))
        }
        op::macrospace::ITER_IMAGE => {
            let cursor = cursor
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::Protocol).with_message("no open iteration"))?;
            if cursor.next_image >= cursor.records.len() {
                return Ok(Response::failure(ResultCode::Empty));
            }
            let record = &cursor.records[cursor.next_image];
            cursor.next_image += 1;
            Ok(Response::ok().with_payload(record.image.clone()))
        }
        _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown macro opcode")),
    }
}

fn handle_registry(state: &State, request: &Request) -> Result<Response, Error> {
    let kind = CallbackType::from_u64(request.params[0])?;
    match request.opcode {
        op::registry::REGISTER => {
            let entry = RegistrationEntry::decode(&request.payload)?;
            let duplicate = state.register(kind, &request.name, entry)?;
            Ok(Response::ok().with_params([u64::from(duplicate), 0, 0]))
        }
        op::registry::DROP => {
            let library = qualifying_library(request)?;
            state.deregister(kind, &request.name, library.as_deref())?;
            Ok(Response::ok())
        }
        op::registry::QUERY => {
            let library = qualifying_library(request)?;
            match state.lookup(kind, &request.name, library.as_deref()) {
                Some(entry) => Ok(Response::ok()
                    .with_params([1, 0, 0])
                    .with_payload(entry.user_data)),
                None => Ok(Response::ok()),
            }
        }
        op::registry::FETCH => {
            let library = qualifying_library(request)?;
            let entry = state
                .lookup(kind, &request.name, library.as_deref())
                .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("not registered"))?;
            Ok(Response::ok().with_payload(entry.encode()?))
        }
        _ => Err(Error::new(ErrorKind::Protocol).with_message("unknown registry opcode")),
    }
}

/// Drop/query/fetch may qualify by library: params[1] flags it, the payload
/// carries the library name.
fn qualifying_library(request: &Request) -> Result<Option<String>, Error> {
    if request.params[1] != 1 {
        return Ok(None);
    }
    String::from_utf8(request.payload.clone())
        .map(Some)
        .map_err(|_| Error::new(ErrorKind::Protocol).with_message("library name not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::{ServeConfig, run};
    use crate::core::wire::{Request, Response, ResultCode, Subsystem, op};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn start_server(dir: &std::path::Path) -> (std::path::PathBuf, std::thread::JoinHandle<()>) {
        let endpoint = dir.join("crossbar-test.sock");
        let config = ServeConfig {
            endpoint: endpoint.clone(),
        };
        let handle = std::thread::spawn(move || {
            run(config).expect("server run");
        });
        for _ in 0..100 {
            if UnixStream::connect(&endpoint).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        (endpoint, handle)
    }

    fn call(stream: &UnixStream, request: &Request) -> Response {
        request.write_to(&mut &*stream).expect("write");
        Response::read_from(&mut &*stream).expect("read")
    }

    #[test]
    fn ping_shutdown_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (endpoint, handle) = start_server(dir.path());
        let stream = UnixStream::connect(&endpoint).expect("connect");

        let pong = call(&stream, &Request::new(Subsystem::Control, op::control::PING));
        assert_eq!(pong.result, ResultCode::Ok);
        assert_ne!(pong.params[0], 0);

        let bye = call(
            &stream,
            &Request::new(Subsystem::Control, op::control::SHUTDOWN),
        );
        assert_eq!(bye.result, ResultCode::Ok);
        handle.join().expect("join");
        assert!(!endpoint.exists(), "socket file must be unlinked");
    }

    #[test]
    fn second_bind_loses_to_running_daemon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (endpoint, handle) = start_server(dir.path());

        let err = run(ServeConfig {
            endpoint: endpoint.clone(),
        })
        .expect_err("bind must lose");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Duplicate);

        let stream = UnixStream::connect(&endpoint).expect("connect");
        call(
            &stream,
            &Request::new(Subsystem::Control, op::control::SHUTDOWN),
        );
        handle.join().expect("join");
    }

    #[test]
    fn liveness_probe_tracks_the_peer_end() {
        use std::io::{Read, Write};

        let (ours, theirs) = UnixStream::pair().expect("pair");
        assert!(super::peer_alive(&ours), "open idle peer is alive");

        (&theirs).write_all(b"x").expect("write");
        assert!(super::peer_alive(&ours), "buffered bytes mean alive");
        let mut byte = [0u8; 1];
        (&ours).read_exact(&mut byte).expect("drain");

        drop(theirs);
        assert!(!super::peer_alive(&ours), "closed peer is dead");
    }

    #[test]
    fn unknown_opcode_is_a_protocol_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (endpoint, handle) = start_server(dir.path());
        let stream = UnixStream::connect(&endpoint).expect("connect");

        let response = call(&stream, &Request::new(Subsystem::Queue, 200));
        assert_eq!(response.result, ResultCode::Protocol);

        call(
            &stream,
            &Request::new(Subsystem::Control, op::control::SHUTDOWN),
        );
        handle.join().expect("join");
    }
}
