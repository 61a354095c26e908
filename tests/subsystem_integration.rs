// End-to-end facade tests against an in-process daemon on a scratch endpoint.
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbar::api::{
    CallbackType, ClientContext, Error, ErrorKind, InsertOrder, ModuleBackend,
};
use crossbar::daemon::server::{ServeConfig, run};

struct TestDaemon {
    _dir: tempfile::TempDir,
    endpoint: PathBuf,
    server: Option<JoinHandle<()>>,
}

impl TestDaemon {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = dir.path().join("crossbar.sock");
        let config = ServeConfig {
            endpoint: endpoint.clone(),
        };
        let server = std::thread::spawn(move || {
            run(config).expect("daemon run");
        });
        for _ in 0..200 {
            if endpoint.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Self {
            _dir: dir,
            endpoint,
            server: Some(server),
        }
    }

    fn context(&self) -> ClientContext {
        ClientContext::connect(Some(self.endpoint.clone()))
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.context().shutdown_daemon();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

#[test]
fn fifo_and_lifo_interleave_into_one_sequence() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let queues = context.queues();

    queues.create(Some("Work")).expect("create");
    queues
        .add("Work", b"a".to_vec(), InsertOrder::Fifo)
        .expect("add a");
    queues
        .add("Work", b"b".to_vec(), InsertOrder::Fifo)
        .expect("add b");
    queues
        .add("Work", b"c".to_vec(), InsertOrder::Lifo)
        .expect("add c");
    assert_eq!(queues.len("Work").expect("len"), 3);

    let mut seen = Vec::new();
    while let Some(entry) = queues.pull("Work", false).expect("pull") {
        seen.push(entry.data);
    }
    assert_eq!(seen, vec![b"c".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(queues.len("Work").expect("len"), 0);
}

#[test]
fn duplicate_create_reports_generated_name() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let queues = context.queues();

    let (first, duplicate) = queues.create(Some("Jobs")).expect("create");
    assert_eq!(first, "Jobs");
    assert!(!duplicate);

    let (second, duplicate) = queues.create(Some("Jobs")).expect("create again");
    assert!(duplicate);
    assert!(!second.eq_ignore_ascii_case("Jobs"));
    assert!(queues.exists(&second).expect("generated queue exists"));
}

#[test]
fn bad_queue_names_fail_before_the_wire() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let queues = context.queues();

    for name in ["", "has space", "SESSION", &"x".repeat(64)] {
        let err = queues.create(Some(name)).expect_err("invalid name");
        assert_eq!(err.kind(), ErrorKind::BadArgument, "name: {name:?}");
    }
}

#[test]
fn blocking_pull_waits_for_an_entry() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    context.queues().create(Some("Slow")).expect("create");

    let endpoint = daemon.endpoint.clone();
    let waiter = std::thread::spawn(move || {
        let context = ClientContext::connect(Some(endpoint));
        context.queues().pull("Slow", true)
    });
    std::thread::sleep(Duration::from_millis(100));
    context
        .queues()
        .add("Slow", b"late".to_vec(), InsertOrder::Fifo)
        .expect("add");

    let entry = waiter
        .join()
        .expect("join")
        .expect("pull")
        .expect("entry delivered");
    assert_eq!(entry.data, b"late");
}

#[test]
fn deleting_a_queue_fails_parked_pullers() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    context.queues().create(Some("Doomed")).expect("create");

    let endpoint = daemon.endpoint.clone();
    let waiter = std::thread::spawn(move || {
        let context = ClientContext::connect(Some(endpoint));
        context.queues().pull("Doomed", true)
    });
    std::thread::sleep(Duration::from_millis(100));
    context.queues().delete("Doomed").expect("delete");

    let outcome = waiter.join().expect("join");
    let err = outcome.expect_err("waiter must fail, not hang");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!context.queues().exists("Doomed").expect("query"));
}

#[test]
fn session_queue_is_reachable_through_the_alias() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let queues = context.queues();

    queues
        .add("SESSION", b"mine".to_vec(), InsertOrder::Fifo)
        .expect("add");
    assert_eq!(queues.len("session").expect("len"), 1);
    let entry = queues
        .pull("Session", false)
        .expect("pull")
        .expect("entry");
    assert_eq!(entry.data, b"mine");
    context.terminate_process().expect("detach");
}

#[test]
fn concurrent_first_session_use_shares_one_queue() {
    let daemon = TestDaemon::start();
    let context = Arc::new(daemon.context());

    // All threads race the very first session use; every entry must land in
    // the one session queue this process references.
    let barrier = Arc::new(Barrier::new(8));
    let mut writers = Vec::new();
    for value in 0u8..8 {
        let context = Arc::clone(&context);
        let barrier = Arc::clone(&barrier);
        writers.push(std::thread::spawn(move || {
            barrier.wait();
            context
                .queues()
                .add("SESSION", vec![value], InsertOrder::Fifo)
        }));
    }
    for writer in writers {
        writer.join().expect("join").expect("add");
    }

    assert_eq!(context.queues().len("SESSION").expect("len"), 8);
    context.terminate_process().expect("detach");
}

#[test]
fn macro_save_clear_load_round_trip() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let space = context.macro_space();
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("macros.cbm");

    space.add("Alpha", b"image-a".to_vec(), 2).expect("add");
    space.add("beta", b"image-b".to_vec(), 0).expect("add");
    space.add("Gamma", b"image-c".to_vec(), 1).expect("add");
    space.save(&file, None).expect("save");

    space.clear().expect("clear");
    assert_eq!(space.count().expect("count"), 0);

    space.load(&file, None).expect("load");
    assert_eq!(space.count().expect("count"), 3);
    let alpha = space.get("ALPHA").expect("get");
    assert_eq!(alpha.image, b"image-a");
    assert_eq!(alpha.position, 2);
    let beta = space.get("beta").expect("get");
    assert_eq!(beta.image, b"image-b");
    assert_eq!(beta.position, 0);
}

#[test]
fn selective_load_reads_past_skipped_images() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let space = context.macro_space();
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("macros.cbm");

    space.add("first", b"AAAAAAAA".to_vec(), 0).expect("add");
    space.add("second", b"BBBB".to_vec(), 1).expect("add");
    space.add("third", b"CC".to_vec(), 2).expect("add");
    space.save(&file, None).expect("save");
    space.clear().expect("clear");

    // Only the record behind a skipped image; a seek bug would misread it.
    space
        .load(&file, Some(&["SECOND".to_string()]))
        .expect("load");
    assert_eq!(space.count().expect("count"), 1);
    let second = space.get("second").expect("get");
    assert_eq!(second.image, b"BBBB");
    assert_eq!(
        space.get("first").expect_err("not loaded").kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn named_subset_save_writes_only_those_records() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let space = context.macro_space();
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("subset.cbm");

    space.add("keep", b"K".to_vec(), 0).expect("add");
    space.add("drop", b"D".to_vec(), 1).expect("add");
    space
        .save(&file, Some(&["keep".to_string()]))
        .expect("save");

    space.clear().expect("clear");
    space.load(&file, None).expect("load");
    assert_eq!(space.count().expect("count"), 1);
    assert!(space.get("keep").is_ok());
}

#[test]
fn corrupted_version_string_rejects_the_whole_file() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let space = context.macro_space();
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("macros.cbm");

    space.add("Only", b"image".to_vec(), 0).expect("add");
    space.save(&file, None).expect("save");
    space.clear().expect("clear");

    let mut bytes = std::fs::read(&file).expect("read");
    bytes[3] ^= 0x01;
    std::fs::write(&file, bytes).expect("write");

    let err = space.load(&file, None).expect_err("corrupt header");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(space.count().expect("count"), 0, "no record transmitted");
}

struct TableBackend;

impl ModuleBackend for TableBackend {
    fn load(&self, library: &str) -> Result<u64, Error> {
        if library == "mylib" {
            Ok(1)
        } else {
            Err(Error::new(ErrorKind::NotFound))
        }
    }

    fn lookup(&self, module: u64, symbol: &str) -> Result<u64, Error> {
        if module == 1 && symbol == "MYPROC" {
            Ok(0xBEEF)
        } else {
            Err(Error::new(ErrorKind::NotFound))
        }
    }
}

#[test]
fn registered_function_resolves_with_uppercase_fallback() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let registry = context.registry();

    let duplicate = registry
        .register_library(
            CallbackType::Function,
            "MYFUNC",
            "mylib",
            "MyProc",
            b"ud".to_vec(),
            true,
        )
        .expect("register");
    assert!(!duplicate);

    let user_data = registry
        .query(CallbackType::Function, "MYFUNC", None)
        .expect("query")
        .expect("registered");
    assert_eq!(user_data, b"ud");

    // The library exports only the upper-cased spelling.
    let address = registry
        .resolve(CallbackType::Function, "MYFUNC", None, &TableBackend)
        .expect("resolve");
    assert_eq!(address, 0xBEEF);

    // Resolve failure and absence are the same fault.
    let err = registry
        .resolve(CallbackType::Function, "UNKNOWN", None, &TableBackend)
        .expect_err("absent");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn unreachable_daemon_surfaces_as_unavailable_not_absent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let context = ClientContext::connect(Some(dir.path().join("nobody.sock")));

    // A transport fault is not "no such registration"; it must keep its own
    // kind so callers can tell the daemon is down.
    let err = context
        .registry()
        .resolve(CallbackType::Function, "ANY", None, &TableBackend)
        .expect_err("no daemon");
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[test]
fn reregistration_keeps_the_first_binding() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let registry = context.registry();

    registry
        .register_entry_point(CallbackType::Exit, "GUARD", 0x1000, Vec::new())
        .expect("register");
    let duplicate = registry
        .register_entry_point(CallbackType::Exit, "GUARD", 0x2000, Vec::new())
        .expect("re-register");
    assert!(duplicate);

    let entry = registry
        .fetch(CallbackType::Exit, "GUARD", None)
        .expect("fetch");
    assert_eq!(entry.binding, crossbar::api::Binding::EntryPoint(0x1000));
}

#[test]
fn protected_registration_refuses_drop() {
    let daemon = TestDaemon::start();
    let context = daemon.context();
    let registry = context.registry();

    registry
        .register_library(
            CallbackType::Subcommand,
            "EDIT",
            "mylib",
            "Edit",
            Vec::new(),
            false,
        )
        .expect("register");
    let err = registry
        .drop(CallbackType::Subcommand, "EDIT", None)
        .expect_err("protected");
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}
