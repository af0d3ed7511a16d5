//! Command line interface and the tasks the binary can run by name
use crate::types::{ExecutionOptions, ResourceLimits, Result, SpawnMode, TaskError};
use crate::units::{parse_memory, parse_time};
use crate::worker::{Arguments, Call, Registry};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "limitbox", author, version)]
#[command(about = "Run a task in a child process under memory, CPU-time and wall-time limits", long_about = None)]
pub struct Cli {
    /// JSON configuration file; LIMITBOX_* variables override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Report which limits this host can enforce
    Supports {
        /// One of memory, cpu_time, wall_time, decorator; all when omitted
        feature: Option<String>,
    },
    /// List the tasks `run` accepts
    Tasks,
    /// Run a task under limits and print the outcome as JSON
    Run {
        /// Memory limit, e.g. 50MB
        #[arg(long)]
        mem: Option<String>,
        /// CPU time limit, e.g. 2s
        #[arg(long)]
        cpu: Option<String>,
        /// Wall time limit, e.g. 1m
        #[arg(long)]
        wall: Option<String>,
        /// Grace period between the soft and hard CPU limits
        #[arg(long)]
        grace: Option<String>,
        /// Maximum number of processes
        #[arg(long)]
        processes: Option<u64>,
        /// fork, spawn or forkserver
        #[arg(long)]
        mode: Option<String>,
        /// Name for the child process
        #[arg(long)]
        name: Option<String>,
        /// Capture the child's stdout and stderr into the report
        #[arg(long)]
        capture: bool,
        /// Leave processes started by the task running
        #[arg(long)]
        keep_children: bool,
        /// Task name, see `limitbox tasks`
        task: String,
        /// Task arguments; JSON literals are decoded, anything else is passed as a string
        #[arg(last = true)]
        args: Vec<String>,
    },
}

/// Build limits from CLI literals
pub fn limits_from_args(
    mem: Option<&str>,
    cpu: Option<&str>,
    wall: Option<&str>,
    grace: Option<&str>,
    processes: Option<u64>,
    default_grace: u64,
) -> Result<ResourceLimits> {
    let limits = ResourceLimits {
        memory: mem.map(parse_memory).transpose()?,
        cpu_time: cpu.map(parse_time).transpose()?,
        wall_time: wall.map(parse_time).transpose()?,
        grace_period: grace.map(parse_time).transpose()?.unwrap_or(default_grace),
        processes,
    };
    limits.validate()?;
    Ok(limits)
}

pub fn options_from_args(
    mode: Option<&str>,
    name: Option<String>,
    capture: bool,
    keep_children: bool,
) -> Result<ExecutionOptions> {
    let spawn_mode = mode.map(str::parse::<SpawnMode>).transpose()?;
    Ok(ExecutionOptions {
        spawn_mode,
        name,
        capture_output: capture,
        terminate_children: !keep_children,
        ..ExecutionOptions::default()
    })
}

/// Turn raw CLI words into a call
pub fn call_from_args(task: &str, args: &[String]) -> Call {
    let mut call = Call::new(task);
    call.args = args
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
        .collect();
    call
}

/// The tasks the `limitbox` binary can run, in and out of worker processes
pub fn demo_registry() -> Registry {
    Registry::new()
        .with("echo", echo)
        .with("print", print)
        .with("sleep", sleep)
        .with("spin", spin)
        .with("allocate", allocate)
        .with("fail", fail)
        .with("exit", exit)
        .with("spawn_sleeper", spawn_sleeper)
        .with("command", command)
}

fn echo(args: Arguments) -> std::result::Result<Value, TaskError> {
    match args.raw_args() {
        [] => Ok(Value::Null),
        [single] => Ok(single.clone()),
        many => Ok(Value::Array(many.to_vec())),
    }
}

/// Print the arguments on one line and return how many there were
fn print(args: Arguments) -> std::result::Result<Value, TaskError> {
    let words: Vec<String> = args.raw_args().iter().map(display_word).collect();
    println!("{}", words.join(" "));
    Ok(json!(words.len()))
}

/// Sleep for the given seconds and return them
fn sleep(args: Arguments) -> std::result::Result<Value, TaskError> {
    let secs: f64 = args.arg(0)?;
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(json!(secs))
}

/// Burn CPU for the given seconds of wall time
fn spin(args: Arguments) -> std::result::Result<Value, TaskError> {
    let secs: f64 = args.arg(0)?;
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    let mut counter: u64 = 0;
    while Instant::now() < deadline {
        counter = std::hint::black_box(counter.wrapping_add(1));
    }
    Ok(json!(counter))
}

/// Allocate and touch the given number of MiB
fn allocate(args: Arguments) -> std::result::Result<Value, TaskError> {
    let mib: u64 = args.arg(0)?;
    let len = usize::try_from(mib.saturating_mul(1 << 20))
        .map_err(|e| TaskError::from(e).with_errno(libc::ENOMEM))?;
    let mut buffer: Vec<u8> = Vec::new();
    buffer.try_reserve_exact(len)?;
    buffer.resize(len, 1);
    Ok(json!(std::hint::black_box(&buffer).len()))
}

/// Return an error of a custom type
fn fail(args: Arguments) -> std::result::Result<Value, TaskError> {
    let message: String = args.arg(0).unwrap_or_else(|_| "failed".to_string());
    Err(TaskError::new("CustomException", message))
}

/// Exit the process with the given code without replying
fn exit(args: Arguments) -> std::result::Result<Value, TaskError> {
    let code: i32 = args.arg(0)?;
    std::process::exit(code)
}

/// Start `sleep <secs>` in the background and return its pid
fn spawn_sleeper(args: Arguments) -> std::result::Result<Value, TaskError> {
    let secs: u64 = args.arg(0).unwrap_or(30);
    let child = std::process::Command::new("sleep").arg(secs.to_string()).spawn()?;
    Ok(json!(child.id()))
}

/// Run an external command and return its exit code and output
fn command(args: Arguments) -> std::result::Result<Value, TaskError> {
    let words: Vec<String> = args.raw_args().iter().map(display_word).collect();
    let (program, rest) = words
        .split_first()
        .ok_or_else(|| TaskError::new("ArgumentError", "command needs a program"))?;
    let output = std::process::Command::new(program).args(rest).output()?;
    Ok(json!({
        "code": output.status.code(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    }))
}

fn display_word(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
