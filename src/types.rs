//! Core types for limitbox: limits, per-call options, outcomes and errors
use crate::units::{IntoBytes, IntoSeconds};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default grace period in seconds between a soft and a hard CPU limit
pub const DEFAULT_GRACE_PERIOD: u64 = 1;

/// Resource caps for one isolated call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address space limit in bytes
    pub memory: Option<u64>,
    /// CPU time limit in seconds
    pub cpu_time: Option<u64>,
    /// Wall clock limit in seconds, enforced by the parent only
    pub wall_time: Option<u64>,
    /// Extra seconds between the soft and hard CPU limit
    pub grace_period: u64,
    /// Maximum number of processes for the child's user
    pub processes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: None,
            cpu_time: None,
            wall_time: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            processes: None,
        }
    }
}

impl ResourceLimits {
    /// Build a validated set of limits
    pub fn new(memory: Option<u64>, cpu_time: Option<u64>, wall_time: Option<u64>) -> Result<Self> {
        let limits = Self {
            memory,
            cpu_time,
            wall_time,
            ..Self::default()
        };
        limits.validate()?;
        Ok(limits)
    }

    /// No limits at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn memory(mut self, amount: impl IntoBytes) -> Result<Self> {
        self.memory = Some(amount.into_bytes()?);
        self.validate()?;
        Ok(self)
    }

    pub fn cpu_time(mut self, amount: impl IntoSeconds) -> Result<Self> {
        self.cpu_time = Some(amount.into_seconds()?);
        self.validate()?;
        Ok(self)
    }

    pub fn wall_time(mut self, amount: impl IntoSeconds) -> Result<Self> {
        self.wall_time = Some(amount.into_seconds()?);
        self.validate()?;
        Ok(self)
    }

    pub fn grace_period(mut self, amount: impl IntoSeconds) -> Result<Self> {
        self.grace_period = amount.into_seconds()?;
        Ok(self)
    }

    pub fn processes(mut self, count: u64) -> Result<Self> {
        self.processes = Some(count);
        self.validate()?;
        Ok(self)
    }

    /// Every configured limit must be at least one unit
    pub fn validate(&self) -> Result<()> {
        if self.memory == Some(0) {
            return Err(SandboxError::Config("`memory` must be >= 1 byte".to_string()));
        }
        if self.cpu_time == Some(0) {
            return Err(SandboxError::Config("`cpu_time` must be >= 1 second".to_string()));
        }
        if self.wall_time == Some(0) {
            return Err(SandboxError::Config("`wall_time` must be >= 1 second".to_string()));
        }
        if self.processes == Some(0) {
            return Err(SandboxError::Config("`processes` must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn wall_time_limit(&self) -> Option<Duration> {
        self.wall_time.map(Duration::from_secs)
    }

    pub fn is_unlimited(&self) -> bool {
        self.memory.is_none() && self.cpu_time.is_none() && self.wall_time.is_none() && self.processes.is_none()
    }
}

/// How the child process gets created
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnMode {
    /// `fork()` the current process; closures can run without re-import
    CopyOnWrite,
    /// Start `worker_program` anew and hand it a named task
    FreshProcess,
    /// Take a worker forked ahead of time from the pool
    #[serde(rename = "pre-forked-pool", alias = "preforked-pool")]
    PreforkedPool,
}

impl Default for SpawnMode {
    fn default() -> Self {
        SpawnMode::CopyOnWrite
    }
}

impl FromStr for SpawnMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fork" | "copy-on-write" | "cow" => Ok(SpawnMode::CopyOnWrite),
            "spawn" | "fresh" | "fresh-process" => Ok(SpawnMode::FreshProcess),
            "forkserver" | "pool" | "pre-forked-pool" => Ok(SpawnMode::PreforkedPool),
            other => Err(SandboxError::Config(format!(
                "Unknown spawn mode '{}', expected copy-on-write, fresh-process or pre-forked-pool",
                other
            ))),
        }
    }
}

impl fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpawnMode::CopyOnWrite => "copy-on-write",
            SpawnMode::FreshProcess => "fresh-process",
            SpawnMode::PreforkedPool => "pre-forked-pool",
        };
        f.write_str(name)
    }
}

/// Identifies a target error without linking its type into the parent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorMatcher {
    /// Full type path or its last segment, e.g. `NotFittedError`
    Name(String),
    /// OS error number, optionally with a platform specific code
    Os { errno: i32, code: Option<i32> },
}

impl ErrorMatcher {
    pub fn name(name: impl Into<String>) -> Self {
        ErrorMatcher::Name(name.into())
    }

    pub fn of<E: ?Sized>() -> Self {
        ErrorMatcher::Name(std::any::type_name::<E>().to_string())
    }

    pub fn os(errno: i32) -> Self {
        ErrorMatcher::Os { errno, code: None }
    }

    pub fn os_with_code(errno: i32, code: i32) -> Self {
        ErrorMatcher::Os { errno, code: Some(code) }
    }

    pub fn matches(&self, error: &TaskError) -> bool {
        match self {
            ErrorMatcher::Name(name) => error.type_name() == name || error.short_name() == name,
            ErrorMatcher::Os { errno, code } => {
                error.errno() == Some(*errno) && code.map_or(true, |c| error.os_code() == Some(c))
            }
        }
    }
}

/// Which failure a mapped error should turn into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapTarget {
    Memory,
    CpuTime,
    WallTime,
    /// Generic sandbox failure
    Sandbox,
}

/// Policy for target errors that are not resource related
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum WrapErrors {
    /// Surface the target's own error
    #[default]
    None,
    /// Wrap every target error into a sandbox failure
    All,
    /// Wrap only matching errors
    Named(Vec<ErrorMatcher>),
    /// Reclassify matching errors as a limit failure, only when that limit is set
    PerLimit(HashMap<WrapTarget, Vec<ErrorMatcher>>),
}

/// Cooperative cancellation of a running call
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    /// Present while this token watches interrupt signals
    #[cfg(unix)]
    signals: Option<Arc<crate::executor::SignalWatch>>,
}

/// Last interrupt signal seen by the handler installed through `CancelToken::watch_signals`
pub(crate) static INTERRUPT_SIGNAL: AtomicI32 = AtomicI32::new(0);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.signal().is_some()
    }

    /// Interrupt signal that cancelled the call, if any
    pub fn signal(&self) -> Option<i32> {
        if !self.watches_signals() {
            return None;
        }
        match INTERRUPT_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// Forget a previously observed interrupt
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if self.watches_signals() {
            INTERRUPT_SIGNAL.store(0, Ordering::SeqCst);
        }
    }

    pub fn watches_signals(&self) -> bool {
        #[cfg(unix)]
        {
            self.signals.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    #[cfg(unix)]
    pub(crate) fn watching(mut self, watch: crate::executor::SignalWatch) -> Self {
        self.signals = Some(Arc::new(watch));
        self
    }
}

/// Per-call options
#[derive(Clone, Debug)]
pub struct ExecutionOptions {
    /// Return failures as `Err` instead of `Outcome::Empty`
    pub raises: bool,
    pub wrap_errors: WrapErrors,
    /// Treat allocation failures of the target as a memory limit failure
    pub wrap_memory_errors: bool,
    /// Reap every descendant of the child, not just the child
    pub terminate_children: bool,
    /// Overrides `SandboxConfig::spawn_mode`
    pub spawn_mode: Option<SpawnMode>,
    /// Process name for the child
    pub name: Option<String>,
    /// Redirect the child's stdout and stderr into the run report
    pub capture_output: bool,
    /// Emit warnings about unsupported limits
    pub warnings: bool,
    /// Kill the child straight away when cancelled
    pub forceful_interrupt: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            raises: true,
            wrap_errors: WrapErrors::None,
            wrap_memory_errors: true,
            terminate_children: true,
            spawn_mode: None,
            name: None,
            capture_output: false,
            warnings: true,
            forceful_interrupt: true,
            cancel: None,
        }
    }
}

/// An error produced by the target, carried across the process boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    type_name: String,
    message: String,
    traceback: Option<String>,
    errno: Option<i32>,
    os_code: Option<i32>,
}

impl<E> From<E> for TaskError
where
    E: std::error::Error + 'static,
{
    fn from(err: E) -> Self {
        let as_dyn: &(dyn std::error::Error + 'static) = &err;
        let raw_os = as_dyn
            .downcast_ref::<std::io::Error>()
            .and_then(|e| e.raw_os_error());

        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        let mut task_error = TaskError::new(std::any::type_name::<E>(), err.to_string());
        task_error.traceback = format_causes(&causes);
        if cfg!(windows) {
            task_error.os_code = raw_os;
        } else {
            task_error.errno = raw_os;
        }
        task_error
    }
}

fn format_causes(causes: &[String]) -> Option<String> {
    if causes.is_empty() {
        return None;
    }
    let mut text = String::from("Caused by:");
    for (idx, cause) in causes.iter().enumerate() {
        text.push_str(&format!("\n    {}: {}", idx, cause));
    }
    Some(text)
}

impl TaskError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: None,
            errno: None,
            os_code: None,
        }
    }

    /// A plain message with no particular error type
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("TaskError", message)
    }

    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let raw_os = err.downcast_ref::<std::io::Error>().and_then(|e| e.raw_os_error());
        let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let mut task_error = TaskError::new("anyhow::Error", err.to_string());
        task_error.traceback = format_causes(&causes);
        task_error.errno = raw_os;
        task_error
    }

    pub(crate) fn from_panic(message: String, backtrace: Option<String>) -> Self {
        let mut task_error = TaskError::new("panic", message);
        task_error.traceback = backtrace;
        task_error
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_os_code(mut self, code: i32) -> Self {
        self.os_code = Some(code);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Last path segment of the type name, generics stripped
    pub fn short_name(&self) -> &str {
        let base = self.type_name.split('<').next().unwrap_or(&self.type_name);
        base.rsplit("::").next().unwrap_or(base)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn os_code(&self) -> Option<i32> {
        self.os_code
    }

    /// Whether this error was built from an `E`
    pub fn is<E: ?Sized>(&self) -> bool {
        self.type_name == std::any::type_name::<E>()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.short_name(), self.message)
    }
}

/// Traceback text of the child, exposed as an error source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Traceback(pub String);

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Traceback {}

/// Why an isolated call produced no value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    MemoryLimitExceeded,
    CpuTimeExceeded,
    WallTimeExceeded,
    SignalReceived(i32),
    SubprocessError(i32),
    InternalError,
    Unclassified,
    /// The target returned or panicked with its own error
    Raised,
}

impl FailureKind {
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            FailureKind::MemoryLimitExceeded | FailureKind::CpuTimeExceeded | FailureKind::WallTimeExceeded
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::MemoryLimitExceeded => write!(f, "memory limit exceeded"),
            FailureKind::CpuTimeExceeded => write!(f, "cpu time exceeded"),
            FailureKind::WallTimeExceeded => write!(f, "wall time exceeded"),
            FailureKind::SignalReceived(sig) => write!(f, "signal {} received", sig),
            FailureKind::SubprocessError(errno) => write!(f, "subprocess error (errno {})", errno),
            FailureKind::InternalError => write!(f, "internal error"),
            FailureKind::Unclassified => write!(f, "unclassified failure"),
            FailureKind::Raised => write!(f, "task error"),
        }
    }
}

/// A classified failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub traceback: Option<Traceback>,
    /// The target's own error, when there was one
    pub error: Option<TaskError>,
    /// Set when the error policy wrapped a target error
    pub wrapped: bool,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
            error: None,
            wrapped: false,
        }
    }

    pub fn raised(error: TaskError) -> Self {
        Self {
            kind: FailureKind::Raised,
            message: error.to_string(),
            traceback: error.traceback().map(|t| Traceback(t.to_string())),
            error: Some(error),
            wrapped: false,
        }
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback.map(Traceback);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.traceback
            .as_ref()
            .map(|t| t as &(dyn std::error::Error + 'static))
    }
}

/// Result of one isolated execution
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(Failure),
    /// No usable result; only returned when `raises` is off
    Empty,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Outcome::Empty)
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        self.failure().map(|f| f.kind)
    }
}

/// CPU and memory consumed by the child
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User CPU time in seconds
    pub user_time: f64,
    /// System CPU time in seconds
    pub system_time: f64,
    /// Peak resident set size in bytes
    pub memory_peak: u64,
}

impl ResourceUsage {
    pub fn cpu_time(&self) -> f64 {
        self.user_time + self.system_time
    }
}

/// Custom error types for limitbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Limiter error: {0}")]
    Limiter(#[from] crate::resource_limits::LimiterError),

    #[error(transparent)]
    Limit(Failure),

    #[error("{0}")]
    Task(TaskError),

    #[error("Execution cancelled (signal {signal:?})")]
    Cancelled { signal: Option<i32> },
}

impl SandboxError {
    /// Kind of the classified failure, if this is one
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SandboxError::Limit(failure) => Some(failure.kind),
            SandboxError::Task(_) => Some(FailureKind::Raised),
            _ => None,
        }
    }

    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            SandboxError::Task(err) => Some(err),
            SandboxError::Limit(failure) => failure.error.as_ref(),
            _ => None,
        }
    }
}

/// Result type alias for limitbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
