//! Purpose: `crossbar` CLI entry point and daemon launcher.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Query-style commands emit stable JSON envelopes.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: `daemon stop`/`status` never bootstrap a daemon as a side
//! Invariants: effect; only data-plane commands do.
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::aot::Shell;
use serde::Serialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

use crossbar::api::{
    CallbackType, ClientContext, Error, ErrorKind, HostCompiler, InsertOrder, to_exit_code,
};
use crossbar::core::wire::{Request, Response, ResultCode, Subsystem, op};
use crossbar::daemon::endpoint::default_endpoint;
use crossbar::daemon::server::{self, ServeConfig};

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn emit_error(err: &Error) {
    let payload = json!({
        "error": format!("{err}"),
        "hint": err.hint(),
    });
    eprintln!("{payload}");
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let endpoint = cli.endpoint.unwrap_or_else(default_endpoint);
    match cli.command {
        Command::Daemon { command } => run_daemon_command(command, endpoint),
        Command::Queue { command } => run_queue_command(command, endpoint),
        Command::Macro { command } => run_macro_command(command, endpoint),
        Command::Registry { command } => run_registry_command(command, endpoint),
        Command::Completion { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "crossbar",
    version,
    about = "Shared queues, macro space, and callback registries for local IPC",
    after_help = r#"EXAMPLES
  $ crossbar queue create jobs
  $ crossbar queue add jobs '{"task": "build"}'
  $ crossbar queue pull jobs --wait
  $ crossbar macro save /tmp/macros.cbm
  $ crossbar daemon status

NOTES
  - The daemon starts on demand; `daemon run` is only needed for supervision.
  - Set CROSSBAR_ENDPOINT or pass --endpoint to use a private daemon."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Daemon socket path (default: derived per host/user/session)",
        value_hint = ValueHint::FilePath
    )]
    endpoint: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run or control the crossbar daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    #[command(arg_required_else_help = true, about = "Named and session queues")]
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    #[command(arg_required_else_help = true, about = "The shared macro space")]
    Macro {
        #[command(subcommand)]
        command: MacroCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Subcommand, exit, and function callback registries"
    )]
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DaemonCommand {
    #[command(about = "Run the daemon in the foreground until signalled")]
    Run,
    #[command(about = "Ask a running daemon to shut down")]
    Stop,
    #[command(about = "Report whether a daemon is serving the endpoint")]
    Status,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OrderCli {
    Fifo,
    Lifo,
}

impl From<OrderCli> for InsertOrder {
    fn from(value: OrderCli) -> Self {
        match value {
            OrderCli::Fifo => InsertOrder::Fifo,
            OrderCli::Lifo => InsertOrder::Lifo,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CallbackTypeCli {
    Subcommand,
    Exit,
    Function,
}

impl From<CallbackTypeCli> for CallbackType {
    fn from(value: CallbackTypeCli) -> Self {
        match value {
            CallbackTypeCli::Subcommand => CallbackType::Subcommand,
            CallbackTypeCli::Exit => CallbackType::Exit,
            CallbackTypeCli::Function => CallbackType::Function,
        }
    }
}

#[derive(Subcommand)]
enum QueueCommand {
    #[command(about = "Create a named queue (generated name when omitted or taken)")]
    Create {
        #[arg(help = "Queue name; omit for a generated unique name")]
        name: Option<String>,
    },
    #[command(about = "Attach to a named queue, creating it if missing")]
    Open {
        name: String,
    },
    #[command(about = "Delete a queue and fail its parked pullers")]
    Delete {
        name: String,
    },
    #[command(about = "Report whether a named queue exists")]
    Query {
        name: String,
    },
    #[command(about = "Count the entries in a queue")]
    Count {
        name: String,
    },
    #[command(about = "Discard all entries of a queue")]
    Clear {
        name: String,
    },
    #[command(about = "Add one entry")]
    Add {
        name: String,
        #[arg(help = "Entry data (opaque bytes)")]
        data: String,
        #[arg(long, value_enum, default_value = "fifo", help = "Insertion order")]
        order: OrderCli,
    },
    #[command(about = "Pull the head entry")]
    Pull {
        name: String,
        #[arg(long, help = "Block until an entry arrives or the queue is deleted")]
        wait: bool,
    },
}

#[derive(Subcommand)]
enum MacroCommand {
    #[command(about = "Store a macro image from a file")]
    Add {
        name: String,
        #[arg(help = "Image file (or source file with --compile)", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, default_value_t = 0, help = "Search-order position")]
        position: u32,
        #[arg(long, help = "Compile source through the host compile entry point")]
        compile: bool,
    },
    #[command(about = "Remove one macro")]
    Remove {
        name: String,
    },
    #[command(about = "Remove every macro")]
    Clear,
    #[command(about = "Report a macro's search-order position")]
    Query {
        name: String,
    },
    #[command(about = "Move a macro to a new search-order position")]
    Reorder {
        name: String,
        position: u32,
    },
    #[command(about = "Count stored macros")]
    Count,
    #[command(about = "Save macros to a macro-space file")]
    Save {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long = "name", help = "Save only this macro (repeatable)")]
        names: Vec<String>,
    },
    #[command(about = "Load macros from a macro-space file")]
    Load {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long = "name", help = "Load only this macro (repeatable)")]
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RegistryCommand {
    #[command(about = "Register a library-resident callback")]
    Add {
        #[arg(value_enum)]
        kind: CallbackTypeCli,
        name: String,
        library: String,
        procedure: String,
        #[arg(long, help = "Opaque user data stored with the registration")]
        user_data: Option<String>,
        #[arg(long, help = "Refuse later drops of this registration")]
        protect: bool,
    },
    #[command(about = "Remove a registration")]
    Drop {
        #[arg(value_enum)]
        kind: CallbackTypeCli,
        name: String,
        #[arg(long, help = "Only drop a binding against this library")]
        library: Option<String>,
    },
    #[command(about = "Report whether a callback is registered")]
    Query {
        #[arg(value_enum)]
        kind: CallbackTypeCli,
        name: String,
        #[arg(long, help = "Only match a binding against this library")]
        library: Option<String>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("CROSSBAR_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

fn run_daemon_command(command: DaemonCommand, endpoint: PathBuf) -> Result<(), Error> {
    match command {
        DaemonCommand::Run => {
            init_tracing();
            server::run(ServeConfig { endpoint })
        }
        DaemonCommand::Stop => {
            match control_call(&endpoint, op::control::SHUTDOWN)? {
                Some(_) => println!("{}", json!({"stopped": true})),
                None => println!("{}", json!({"stopped": false, "running": false})),
            }
            Ok(())
        }
        DaemonCommand::Status => {
            let status = match control_call(&endpoint, op::control::PING)? {
                Some(response) => DaemonStatus {
                    running: true,
                    pid: Some(response.params[0] as u32),
                    sessions: Some(response.params[1]),
                    endpoint: endpoint.display().to_string(),
                },
                None => DaemonStatus {
                    running: false,
                    pid: None,
                    sessions: None,
                    endpoint: endpoint.display().to_string(),
                },
            };
            let rendered = serde_json::to_string(&status).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to render status")
                    .with_source(err)
            })?;
            println!("{rendered}");
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct DaemonStatus {
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sessions: Option<u64>,
    endpoint: String,
}

/// One control round trip straight over the socket, with no bootstrap:
/// `None` means nobody is serving the endpoint.
fn control_call(endpoint: &std::path::Path, opcode: u8) -> Result<Option<Response>, Error> {
    let mut stream = match UnixStream::connect(endpoint) {
        Ok(stream) => stream,
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) =>
        {
            return Ok(None);
        }
        Err(err) => {
            return Err(Error::new(ErrorKind::Io)
                .with_message("failed to reach daemon endpoint")
                .with_path(endpoint)
                .with_source(err));
        }
    };
    let request = Request::new(Subsystem::Control, opcode);
    request.write_to(&mut stream)?;
    let response = Response::read_from(&mut stream)?;
    if response.result != ResultCode::Ok {
        return Err(Error::new(ErrorKind::Protocol).with_message("daemon refused control request"));
    }
    Ok(Some(response))
}

/// Run one subcommand on a short-lived context and release any session
/// reference it took; the session queue must die with this invocation, not
/// with the daemon.
fn with_context(
    endpoint: PathBuf,
    run: impl FnOnce(&ClientContext) -> Result<(), Error>,
) -> Result<(), Error> {
    let context = ClientContext::connect(Some(endpoint));
    let result = run(&context);
    let _ = context.terminate_process();
    result
}

fn run_queue_command(command: QueueCommand, endpoint: PathBuf) -> Result<(), Error> {
    with_context(endpoint, |context| queue_command(context, command))
}

fn queue_command(context: &ClientContext, command: QueueCommand) -> Result<(), Error> {
    let queues = context.queues();
    match command {
        QueueCommand::Create { name } => {
            let (actual, duplicate) = queues.create(name.as_deref())?;
            println!("{}", json!({"name": actual, "duplicate": duplicate}));
        }
        QueueCommand::Open { name } => {
            let existed = queues.open(&name)?;
            println!("{}", json!({"name": name, "existed": existed}));
        }
        QueueCommand::Delete { name } => {
            queues.delete(&name)?;
            println!("{}", json!({"deleted": name}));
        }
        QueueCommand::Query { name } => {
            let exists = queues.exists(&name)?;
            println!("{}", json!({"name": name, "exists": exists}));
        }
        QueueCommand::Count { name } => {
            let count = queues.len(&name)?;
            println!("{}", json!({"name": name, "count": count}));
        }
        QueueCommand::Clear { name } => {
            queues.clear(&name)?;
            println!("{}", json!({"cleared": name}));
        }
        QueueCommand::Add { name, data, order } => {
            queues.add(&name, data.into_bytes(), order.into())?;
            println!("{}", json!({"added": name}));
        }
        QueueCommand::Pull { name, wait } => match queues.pull(&name, wait)? {
            Some(entry) => {
                let time = entry
                    .timestamp
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| entry.timestamp.to_string());
                println!(
                    "{}",
                    json!({
                        "data": String::from_utf8_lossy(&entry.data),
                        "time": time,
                    })
                );
            }
            None => println!("{}", json!({"empty": true})),
        },
    }
    Ok(())
}

fn run_macro_command(command: MacroCommand, endpoint: PathBuf) -> Result<(), Error> {
    with_context(endpoint, |context| macro_command(context, command))
}

fn macro_command(context: &ClientContext, command: MacroCommand) -> Result<(), Error> {
    let space = context.macro_space();
    match command {
        MacroCommand::Add {
            name,
            file,
            position,
            compile,
        } => {
            if compile {
                space.add_from_file(&name, &file, position, &HostCompiler)?;
            } else {
                let image = std::fs::read(&file).map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("cannot read image file")
                        .with_path(&file)
                        .with_source(err)
                })?;
                space.add(&name, image, position)?;
            }
            println!("{}", json!({"added": name, "position": position}));
        }
        MacroCommand::Remove { name } => {
            space.remove(&name)?;
            println!("{}", json!({"removed": name}));
        }
        MacroCommand::Clear => {
            space.clear()?;
            println!("{}", json!({"cleared": true}));
        }
        MacroCommand::Query { name } => {
            let position = space.query(&name)?;
            println!("{}", json!({"name": name, "position": position}));
        }
        MacroCommand::Reorder { name, position } => {
            space.reorder(&name, position)?;
            println!("{}", json!({"name": name, "position": position}));
        }
        MacroCommand::Count => {
            let count = space.count()?;
            println!("{}", json!({"count": count}));
        }
        MacroCommand::Save { file, names } => {
            let subset = (!names.is_empty()).then_some(names.as_slice());
            space.save(&file, subset)?;
            println!("{}", json!({"saved": file.display().to_string()}));
        }
        MacroCommand::Load { file, names } => {
            let subset = (!names.is_empty()).then_some(names.as_slice());
            space.load(&file, subset)?;
            println!("{}", json!({"loaded": file.display().to_string()}));
        }
    }
    Ok(())
}

fn run_registry_command(command: RegistryCommand, endpoint: PathBuf) -> Result<(), Error> {
    with_context(endpoint, |context| registry_command(context, command))
}

fn registry_command(context: &ClientContext, command: RegistryCommand) -> Result<(), Error> {
    let registry = context.registry();
    match command {
        RegistryCommand::Add {
            kind,
            name,
            library,
            procedure,
            user_data,
            protect,
        } => {
            let duplicate = registry.register_library(
                kind.into(),
                &name,
                &library,
                &procedure,
                user_data.map(String::into_bytes).unwrap_or_default(),
                !protect,
            )?;
            println!("{}", json!({"registered": name, "duplicate": duplicate}));
        }
        RegistryCommand::Drop {
            kind,
            name,
            library,
        } => {
            registry.drop(kind.into(), &name, library.as_deref())?;
            println!("{}", json!({"dropped": name}));
        }
        RegistryCommand::Query {
            kind,
            name,
            library,
        } => {
            let user_data = registry.query(kind.into(), &name, library.as_deref())?;
            println!(
                "{}",
                json!({
                    "name": name,
                    "registered": user_data.is_some(),
                    "user_data": user_data.map(|data| String::from_utf8_lossy(&data).into_owned()),
                })
            );
        }
    }
    Ok(())
}
