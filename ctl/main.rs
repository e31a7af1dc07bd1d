#![forbid(unsafe_code)]

//! `session-node-ctl`: local requester for a `session-node` session.
//!
//! Connects to the session's control socket, sends one request (or, with
//! `console`, one request per stdin line) and prints every reply up to the
//! terminal `done`. A session serves a single control connection, so
//! closing it ends the session; `interrupt` uses the separate urgent socket
//! and leaves the control connection alone.

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde::Serialize;

use session_node::protocol::messages::{
    ArchiveRequest, CacheRequest, CleanupSessionRequest, DatasetRef, LogFileRequest, LogLevelRequest, ProcessRequest,
    QueryListRequest, RealTimeLogRequest, ReferenceRequest, StopProcessRequest, WorkerAction,
    WorkerListsRequest,
};
use session_node::protocol::{OpCode, Reply, Request};
use session_node::query::InputParam;
use session_node::urgent::Interrupt;

#[derive(Debug, Parser)]
#[command(name = "session-node-ctl", about = "Local CLI for a session-node session", version, long_about = None)]
struct Cli {
    /// IPC socket name (must match the session's `ipc_name`).
    #[arg(long, default_value = "session-node")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Liveness probe.
    Ping,
    /// Show the session state.
    Status,
    /// Show accumulated statistics.
    Stats,
    /// Show the number of active workers.
    Parallel,
    /// Show the retention quota.
    MaxQueries,
    /// Submit a query.
    Submit {
        /// Executor options.
        #[arg(long, default_value = "")]
        options: String,
        /// Dataset name.
        #[arg(long)]
        dataset: Option<String>,
        /// Inline dataset files; the dataset name labels them.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Input parameters as `name=json`.
        #[arg(long = "input")]
        inputs: Vec<String>,
        /// First entry.
        #[arg(long, default_value_t = 0)]
        first: u64,
        /// Entry count; negative means all.
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        entries: i64,
        /// Return as soon as the query is queued.
        #[arg(long = "async")]
        asynchronous: bool,
        /// Do not persist the query.
        #[arg(long)]
        draw: bool,
    },
    /// List queries.
    List {
        /// Include queries of previous sessions.
        #[arg(long)]
        all: bool,
    },
    /// Remove a query, `cleanupqueue` or `cleanupdir`.
    Remove {
        /// Query reference or keyword.
        reference: String,
    },
    /// Print a full query record.
    Retrieve {
        /// Query reference.
        reference: String,
    },
    /// Archive a query record, or set the default directory with `Default`.
    Archive {
        /// Query reference or `Default`.
        reference: String,
        /// Destination file or directory.
        #[arg(long, default_value = "")]
        path: String,
    },
    /// Remove the results of a dead session.
    CleanupSession {
        /// Session tag.
        tag: String,
    },
    /// Replay part of the session log.
    Log {
        /// Start offset.
        #[arg(long)]
        start: Option<u64>,
        /// End offset.
        #[arg(long)]
        end: Option<u64>,
    },
    /// Cache and package management.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Activate or deactivate subordinates.
    Workers {
        /// What to do.
        #[arg(value_enum)]
        action: WorkerArg,
        /// Ordinal, or `*` for all.
        ordinal: String,
    },
    /// Toggle live log streaming during execution.
    RealTime {
        /// `on` or `off`.
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Stop the running query.
    StopProcess {
        /// Discard the query instead of keeping partial results.
        #[arg(long)]
        abort: bool,
        /// Seconds to wait before giving up on the executor.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Change the log filter, e.g. `debug` or `info,session_node::lock=trace`.
    LogLevel {
        /// Filter directives.
        filter: String,
    },
    /// Terminate the session.
    Stop,
    /// Send an out-of-band interrupt.
    Interrupt {
        /// Interrupt kind.
        #[arg(value_enum)]
        kind: InterruptArg,
    },
    /// Read `<op-code> [json payload]` lines from stdin over one connection.
    Console,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Show cached files.
    Show,
    /// Empty the cache.
    Clear,
    /// Copy a file into the cache.
    Add {
        /// Source file.
        path: PathBuf,
    },
    /// List available packages.
    Packages,
    /// List enabled packages.
    Enabled,
    /// Install a package.
    Install {
        /// Package name.
        name: String,
        /// SHA-256 of the archive.
        checksum: String,
        /// Archive to copy in first.
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Enable a package.
    Enable {
        /// Package name.
        name: String,
    },
    /// Unload one package, or all without a name.
    Unload {
        /// Package name.
        name: Option<String>,
    },
    /// Disable one package, or all without a name.
    Disable {
        /// Package name.
        name: Option<String>,
    },
    /// Delete one package including its archive, or empty the package area.
    Purge {
        /// Package name.
        name: Option<String>,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum WorkerArg {
    Activate,
    Deactivate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum InterruptArg {
    Hard,
    Soft,
    Shutdown,
}

type CtlResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() {
    let args = Cli::parse();
    let outcome = match &args.command {
        Command::Interrupt { kind } => send_interrupt(&args.ipc_name, *kind).map(|()| true),
        Command::Console => run_console(&args.ipc_name),
        command => build_request(command).and_then(|request| run_single(&args.ipc_name, request)),
    };
    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("Is session-node running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(2);
        }
    }
}

fn with_payload(op: OpCode, payload: &impl Serialize) -> CtlResult<Request> {
    Ok(Request::with_payload(op, payload)?)
}

fn build_request(command: &Command) -> CtlResult<Request> {
    let request = match command {
        Command::Ping => Request::new(OpCode::Ping),
        Command::Status => Request::new(OpCode::Status),
        Command::Stats => Request::new(OpCode::GetStats),
        Command::Parallel => Request::new(OpCode::GetParallel),
        Command::MaxQueries => Request::new(OpCode::MaxQueries),
        Command::Submit {
            options,
            dataset,
            files,
            inputs,
            first,
            entries,
            asynchronous,
            draw,
        } => {
            let inputs = inputs.iter().map(|raw| parse_input(raw)).collect::<CtlResult<Vec<_>>>()?;
            let dataset = match (dataset, files.is_empty()) {
                (Some(name), _) => Some(DatasetRef {
                    name: name.clone(),
                    files: files.clone(),
                }),
                (None, false) => Some(DatasetRef {
                    name: String::new(),
                    files: files.clone(),
                }),
                (None, true) => None,
            };
            with_payload(
                OpCode::Process,
                &ProcessRequest {
                    options: options.clone(),
                    inputs,
                    dataset,
                    first: *first,
                    entries: *entries,
                    sync: !asynchronous,
                    draw: *draw,
                },
            )?
        }
        Command::List { all } => with_payload(OpCode::QueryList, &QueryListRequest { all: *all })?,
        Command::Remove { reference } => with_payload(
            OpCode::Remove,
            &ReferenceRequest {
                reference: reference.clone(),
            },
        )?,
        Command::Retrieve { reference } => with_payload(
            OpCode::Retrieve,
            &ReferenceRequest {
                reference: reference.clone(),
            },
        )?,
        Command::Archive { reference, path } => with_payload(
            OpCode::Archive,
            &ArchiveRequest {
                reference: reference.clone(),
                path: path.clone(),
            },
        )?,
        Command::CleanupSession { tag } => {
            with_payload(OpCode::CleanupSession, &CleanupSessionRequest { tag: tag.clone() })?
        }
        Command::Log { start, end } => with_payload(
            OpCode::LogFile,
            &LogFileRequest {
                start: *start,
                end: *end,
            },
        )?,
        Command::Cache(cache) => with_payload(OpCode::Cache, &cache_action(cache))?,
        Command::Workers { action, ordinal } => with_payload(
            OpCode::WorkerLists,
            &WorkerListsRequest {
                action: match action {
                    WorkerArg::Activate => WorkerAction::Activate,
                    WorkerArg::Deactivate => WorkerAction::Deactivate,
                },
                ordinal: ordinal.clone(),
            },
        )?,
        Command::RealTime { state } => with_payload(
            OpCode::RealTimeLog,
            &RealTimeLogRequest {
                on: *state == Toggle::On,
            },
        )?,
        Command::StopProcess { abort, timeout } => with_payload(
            OpCode::StopProcess,
            &StopProcessRequest {
                abort: *abort,
                timeout_secs: *timeout,
            },
        )?,
        Command::LogLevel { filter } => {
            with_payload(OpCode::LogLevel, &LogLevelRequest { filter: filter.clone() })?
        }
        Command::Stop => Request::new(OpCode::Stop),
        Command::Interrupt { .. } | Command::Console => {
            return Err("command does not map to a control request".into());
        }
    };
    Ok(request.with_id(1))
}

fn cache_action(command: &CacheCommand) -> CacheRequest {
    match command {
        CacheCommand::Show => CacheRequest::ShowCache,
        CacheCommand::Clear => CacheRequest::ClearCache,
        CacheCommand::Add { path } => CacheRequest::AddToCache { path: path.clone() },
        CacheCommand::Packages => CacheRequest::ListPackages,
        CacheCommand::Enabled => CacheRequest::ListEnabledPackages,
        CacheCommand::Install {
            name,
            checksum,
            archive,
        } => CacheRequest::InstallPackage {
            name: name.clone(),
            checksum: checksum.clone(),
            archive: archive.clone(),
        },
        CacheCommand::Enable { name } => CacheRequest::EnablePackage { name: name.clone() },
        CacheCommand::Unload { name: Some(name) } => CacheRequest::UnloadPackage { name: name.clone() },
        CacheCommand::Unload { name: None } => CacheRequest::UnloadPackages,
        CacheCommand::Disable { name: Some(name) } => CacheRequest::DisablePackage { name: name.clone() },
        CacheCommand::Disable { name: None } => CacheRequest::DisablePackages,
        CacheCommand::Purge { name: Some(name) } => CacheRequest::ClearPackage { name: name.clone() },
        CacheCommand::Purge { name: None } => CacheRequest::ClearPackages,
    }
}

fn parse_input(raw: &str) -> CtlResult<InputParam> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("input '{raw}' is not of the form name=value"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
    Ok(InputParam {
        name: name.to_owned(),
        value,
    })
}

fn connect(ipc_name: &str) -> CtlResult<Stream> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    Ok(Stream::connect(name)?)
}

fn run_single(ipc_name: &str, request: Request) -> CtlResult<bool> {
    let stream = connect(ipc_name)?;
    let mut reader = BufReader::new(&stream);
    exchange(&stream, &mut reader, &request)
}

fn run_console(ipc_name: &str) -> CtlResult<bool> {
    let stream = connect(ipc_name)?;
    let mut reader = BufReader::new(&stream);
    let mut all_ok = true;
    let mut next_id = 0_u64;
    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (code, payload) = line.split_once(' ').unwrap_or((line, ""));
        next_id += 1;
        let request = Request {
            code: code.parse()?,
            id: Some(next_id),
            payload: if payload.trim().is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(payload)?
            },
        };
        all_ok &= exchange(&stream, &mut reader, &request)?;
    }
    Ok(all_ok)
}

/// Send `request` and print replies until its `done`.
fn exchange(stream: &Stream, reader: &mut BufReader<&Stream>, request: &Request) -> CtlResult<bool> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    let mut writer = stream;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;

    let mut buf = String::new();
    loop {
        buf.clear();
        if reader.read_line(&mut buf)? == 0 {
            return Err("session closed the connection".into());
        }
        let reply: Reply = serde_json::from_str(buf.trim())?;
        match reply {
            Reply::Done { id, ok, error, .. } if id == request.id => {
                if let Some(error) = error {
                    eprintln!("Error: {error}");
                }
                return Ok(ok);
            }
            Reply::SessionTag { tag, .. } => eprintln!("connected to session {tag}"),
            Reply::Log { text } => print!("{text}"),
            Reply::Message { text } => eprintln!("{text}"),
            other => println!("{}", serde_json::to_string_pretty(&other)?),
        }
    }
}

fn send_interrupt(ipc_name: &str, kind: InterruptArg) -> CtlResult<()> {
    let interrupt = match kind {
        InterruptArg::Hard => Interrupt::Hard,
        InterruptArg::Soft => Interrupt::Soft,
        InterruptArg::Shutdown => Interrupt::Shutdown,
    };
    let name = format!("{ipc_name}-urgent");
    let mut stream = Stream::connect(name.to_ns_name::<GenericNamespaced>()?)?;
    stream.write_all(&[interrupt.to_byte()])?;
    stream.flush()?;
    Ok(())
}
