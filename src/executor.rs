//! Parent side of an isolated call: spawn, supervise, classify, reap
use crate::cleanup::{self, ProcessGuard};
use crate::config::SandboxConfig;
use crate::ipc::{self, ChannelReader, Poll, Reply};
use crate::shim::{self, CaptureSpec, ShimSettings};
use crate::types::{
    CancelToken, ExecutionOptions, Failure, FailureKind, Outcome, ResourceLimits, ResourceUsage, Result,
    SandboxError, SpawnMode, TaskError, WrapErrors, WrapTarget, INTERRUPT_SIGNAL,
};
use crate::verdict::{self, ExitEvidence, HostOs};
use crate::worker::{self, Call, Job, Registry, WorkerPool};
use chrono::{DateTime, Utc};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, getpid, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Extra time given to a child that already replied to finish on its own
const EXIT_SLACK: Duration = Duration::from_millis(500);

/// The unit of work
pub enum Target<T> {
    /// Runs in a forked copy of the caller; copy-on-write mode only
    Closure(Box<dyn FnOnce() -> std::result::Result<T, TaskError> + Send>),
    /// A registered task, usable in every mode
    Named(Call),
}

impl<T> Target<T> {
    pub fn closure<F>(f: F) -> Self
    where
        F: FnOnce() -> std::result::Result<T, TaskError> + Send + 'static,
    {
        Target::Closure(Box::new(f))
    }

    pub fn named(call: Call) -> Self {
        Target::Named(call)
    }
}

impl<T> std::fmt::Debug for Target<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Closure(_) => f.write_str("Closure"),
            Target::Named(call) => write!(f, "Named({})", call.name),
        }
    }
}

/// A target with its limits and options
pub struct ExecutionRequest<T> {
    pub target: Target<T>,
    pub limits: ResourceLimits,
    pub options: ExecutionOptions,
}

impl<T> ExecutionRequest<T> {
    pub fn new(target: Target<T>) -> Self {
        Self {
            target,
            limits: ResourceLimits::default(),
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}

/// What happened around the call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub name: Option<String>,
    pub spawn_mode: SpawnMode,
    pub pid: Option<i32>,
    pub started_at: DateTime<Utc>,
    /// Seconds from spawn to teardown
    pub wall_time: f64,
    pub exit: Option<ExitEvidence>,
    pub usage: Option<ResourceUsage>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub terminated: Vec<i32>,
    pub still_alive: Vec<i32>,
}

/// Unfiltered result of `Orchestrator::run`
#[derive(Debug)]
pub struct Execution<T> {
    pub outcome: Outcome<T>,
    pub report: RunReport,
}

/// A spawned child and everything needed to tear it down
struct ChildHandle {
    pid: i32,
    started_at: DateTime<Utc>,
    clock: Instant,
    limits: ResourceLimits,
    mode: SpawnMode,
    run_id: uuid::Uuid,
    reader: ChannelReader,
    guard: ProcessGuard,
    capture: Option<tempfile::TempDir>,
    exit: Option<ExitEvidence>,
    usage: Option<ResourceUsage>,
    reaped: bool,
}

enum Supervision {
    Reply(Vec<u8>),
    Exited,
    TimedOut,
    Cancelled(Option<i32>),
}

/// Runs targets in supervised child processes
pub struct Orchestrator {
    config: SandboxConfig,
    registry: Registry,
    pool: Mutex<Option<WorkerPool>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl Orchestrator {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_registry(config, Registry::new())
    }

    pub fn with_registry(config: SandboxConfig, registry: Registry) -> Self {
        Self {
            config,
            registry,
            pool: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute and apply the `raises` policy
    pub fn execute<T>(&self, request: ExecutionRequest<T>) -> Result<Outcome<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let raises = request.options.raises;
        let execution = self.run(request)?;
        surface(execution.outcome, raises)
    }

    /// Execute and return the classified outcome with its report
    pub fn run<T>(&self, request: ExecutionRequest<T>) -> Result<Execution<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let ExecutionRequest {
            target,
            limits,
            options,
        } = request;
        limits.validate()?;
        self.config.validate()?;

        let mode = options.spawn_mode.unwrap_or(self.config.spawn_mode);
        if matches!(target, Target::Closure(_)) && mode != SpawnMode::CopyOnWrite {
            return Err(SandboxError::Config(format!(
                "Closure targets need copy-on-write spawning, not {}; register the task and call it by name",
                mode
            )));
        }
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(SandboxError::Cancelled {
                    signal: token.signal(),
                });
            }
        }

        let run_id = uuid::Uuid::new_v4();
        let capture = if options.capture_output {
            Some(tempfile::Builder::new().prefix("limitbox-").tempdir()?)
        } else {
            None
        };
        let settings = ShimSettings {
            terminate_children: options.terminate_children,
            name: options.name.clone(),
            capture: capture.as_ref().map(|dir| CaptureSpec {
                stdout: dir.path().join("stdout"),
                stderr: dir.path().join("stderr"),
            }),
            warnings: options.warnings && self.config.warnings,
            parent_pid: Some(getpid().as_raw()),
            termination_timeout: self.config.termination_timeout,
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let spawned = match mode {
            SpawnMode::CopyOnWrite => self.spawn_forked(target, &limits, &settings)?,
            SpawnMode::FreshProcess => self.spawn_fresh(target, &limits, &settings)?,
            SpawnMode::PreforkedPool => self.spawn_pooled(target, &limits, settings)?,
        };

        let (pid, reader) = match spawned {
            Ok(spawned) => spawned,
            Err(failure) => {
                log::warn!("Failed to start {} child: {}", mode, failure);
                let report = RunReport {
                    run_id: run_id.to_string(),
                    name: options.name.clone(),
                    spawn_mode: mode,
                    pid: None,
                    started_at,
                    wall_time: clock.elapsed().as_secs_f64(),
                    exit: None,
                    usage: None,
                    stdout: None,
                    stderr: None,
                    terminated: Vec::new(),
                    still_alive: Vec::new(),
                };
                return Ok(Execution {
                    outcome: Outcome::Failure(failure),
                    report,
                });
            }
        };
        log::debug!("Spawned {} child {} for run {}", mode, pid, run_id);

        let mut handle = ChildHandle {
            pid,
            started_at,
            clock,
            limits,
            mode,
            run_id,
            reader,
            guard: ProcessGuard::new(pid, self.config.termination_timeout),
            capture,
            exit: None,
            usage: None,
            reaped: false,
        };

        let supervision = self.supervise(&mut handle, &options)?;
        let outcome = match &supervision {
            Supervision::Reply(payload) => {
                self.await_natural_exit(&mut handle)?;
                Some(reply_outcome::<T>(payload, &handle.limits))
            }
            Supervision::Exited => {
                let evidence = handle.exit.unwrap_or(ExitEvidence::Running);
                Some(Outcome::Failure(verdict::classify_exit(
                    evidence,
                    &handle.limits,
                    HostOs::current(),
                )))
            }
            Supervision::TimedOut => Some(Outcome::Failure(verdict::classify_exit(
                ExitEvidence::Running,
                &handle.limits,
                HostOs::current(),
            ))),
            Supervision::Cancelled(_) => None,
        };

        let forceful = options.forceful_interrupt || !matches!(supervision, Supervision::Cancelled(_));
        let report = self.teardown(&mut handle, &options, forceful)?;

        let outcome = match (outcome, supervision) {
            (Some(outcome), _) => apply_error_policy(outcome, &handle.limits, &options),
            (None, Supervision::Cancelled(signal)) => {
                log::info!("Run {} cancelled (signal {:?})", handle.run_id, signal);
                return Err(SandboxError::Cancelled { signal });
            }
            (None, _) => Outcome::Failure(Failure::new(FailureKind::InternalError, "No outcome")),
        };

        match &outcome {
            Outcome::Success(_) => log::info!("Run {} succeeded in {:.3}s", handle.run_id, report.wall_time),
            Outcome::Failure(failure) => log::info!("Run {} failed: {}", handle.run_id, failure),
            Outcome::Empty => log::info!("Run {} produced nothing", handle.run_id),
        }
        Ok(Execution { outcome, report })
    }

    fn spawn_forked<T>(
        &self,
        target: Target<T>,
        limits: &ResourceLimits,
        settings: &ShimSettings,
    ) -> Result<std::result::Result<(i32, ChannelReader), Failure>>
    where
        T: Serialize,
    {
        let (reader, writer) = ipc::channel()?;
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let _ = nix::unistd::setpgid(child, child);
                drop(writer);
                Ok(Ok((child.as_raw(), reader)))
            }
            Ok(ForkResult::Child) => {
                drop(reader);
                match target {
                    Target::Closure(f) => shim::run_child(writer, limits, settings, f),
                    Target::Named(call) => {
                        shim::run_child(writer, limits, settings, || self.registry.invoke(&call))
                    }
                }
            }
            Err(errno) => Ok(Err(Failure::new(
                FailureKind::SubprocessError(errno as i32),
                format!("fork() failed: {}", errno),
            ))),
        }
    }

    fn spawn_fresh<T>(
        &self,
        target: Target<T>,
        limits: &ResourceLimits,
        settings: &ShimSettings,
    ) -> Result<std::result::Result<(i32, ChannelReader), Failure>> {
        let call = match target {
            Target::Named(call) => call,
            Target::Closure(_) => {
                return Err(SandboxError::Config("Closure targets cannot be re-executed".to_string()))
            }
        };
        let program = self.config.resolve_worker_program()?;
        let job = Job {
            call,
            limits: limits.clone(),
            settings: settings.clone(),
        };
        let frame = worker::encode_job(&job)?;

        let (reader, writer) = ipc::channel()?;
        let write_fd = writer
            .as_raw_fd()
            .ok_or_else(|| SandboxError::Process("Channel has no write end".to_string()))?;
        let parent = getpid().as_raw();

        let mut command = Command::new(&program);
        command.env(worker::WORKER_ENV, "1").stdin(Stdio::piped());
        unsafe {
            command.pre_exec(move || {
                if write_fd == worker::CHANNEL_FD {
                    let flags = libc::fcntl(write_fd, libc::F_GETFD);
                    libc::fcntl(write_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                } else if libc::dup2(write_fd, worker::CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::setpgid(0, 0);
                shim::die_with_parent(parent);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(Err(Failure::new(
                    FailureKind::SubprocessError(e.raw_os_error().unwrap_or(0)),
                    format!("Failed to start worker {}: {}", program.display(), e),
                )))
            }
        };
        drop(writer);
        let pid = child.id() as i32;
        let _ = nix::unistd::setpgid(Pid::from_raw(pid), Pid::from_raw(pid));

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&frame) {
                log::warn!("Failed to hand the job to worker {}: {}", pid, e);
            }
        }
        Ok(Ok((pid, reader)))
    }

    fn spawn_pooled<T>(
        &self,
        target: Target<T>,
        limits: &ResourceLimits,
        mut settings: ShimSettings,
    ) -> Result<std::result::Result<(i32, ChannelReader), Failure>> {
        let call = match target {
            Target::Named(call) => call,
            Target::Closure(_) => {
                return Err(SandboxError::Config("Closure targets cannot run in the pool".to_string()))
            }
        };
        // Workers outlive the thread that forked them; the parent-death signal would misfire
        settings.parent_pid = None;

        let worker = {
            let mut pool = self
                .pool
                .lock()
                .map_err(|_| SandboxError::Process("Worker pool lock poisoned".to_string()))?;
            if pool.is_none() {
                *pool = Some(WorkerPool::new(self.registry.clone(), self.config.pool_size)?);
            }
            match pool.as_mut() {
                Some(pool) => pool.take()?,
                None => return Err(SandboxError::Process("Worker pool unavailable".to_string())),
            }
        };
        let job = Job {
            call,
            limits: limits.clone(),
            settings,
        };
        let (pid, reader) = worker.dispatch(&job)?;
        Ok(Ok((pid, reader)))
    }

    /// Poll the channel, the child and the clocks until something decides the run
    fn supervise(&self, handle: &mut ChildHandle, options: &ExecutionOptions) -> Result<Supervision> {
        let deadline = handle.limits.wall_time_limit().map(|limit| handle.clock + limit);
        let interval = self.config.poll_interval;
        let mut channel_open = true;

        loop {
            if let Some(token) = &options.cancel {
                if token.is_cancelled() {
                    return Ok(Supervision::Cancelled(token.signal()));
                }
            }

            if channel_open {
                match handle.reader.poll() {
                    Ok(Poll::Frame(payload)) => return Ok(Supervision::Reply(payload)),
                    Ok(Poll::Pending) => {}
                    Ok(Poll::Closed { partial }) => {
                        if partial {
                            log::debug!("Child {} closed the channel mid-frame", handle.pid);
                        }
                        channel_open = false;
                    }
                    Err(e) => {
                        log::warn!("Lost the channel to child {}: {}", handle.pid, e);
                        channel_open = false;
                    }
                }
            }

            if let Some((evidence, usage)) = try_wait(handle.pid)? {
                handle.exit = Some(evidence);
                handle.usage = Some(usage);
                handle.reaped = true;
                handle.guard.disarm();
                if channel_open {
                    // Descendants may still hold the write end; give the frame a moment
                    if let Poll::Frame(payload) = handle.reader.drain(EXIT_SLACK, interval)? {
                        return Ok(Supervision::Reply(payload));
                    }
                }
                return Ok(Supervision::Exited);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    log::debug!("Child {} hit the wall time limit", handle.pid);
                    return Ok(Supervision::TimedOut);
                }
            }

            thread::sleep(interval);
        }
    }

    /// A child that replied normally exits by itself shortly after
    fn await_natural_exit(&self, handle: &mut ChildHandle) -> Result<()> {
        if handle.reaped {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.termination_timeout + EXIT_SLACK;
        while Instant::now() < deadline {
            if let Some((evidence, usage)) = try_wait(handle.pid)? {
                handle.exit = Some(evidence);
                handle.usage = Some(usage);
                handle.reaped = true;
                handle.guard.disarm();
                return Ok(());
            }
            thread::sleep(self.config.poll_interval);
        }
        Ok(())
    }

    /// Reap the tree, close the channel, collect captured output
    fn teardown(&self, handle: &mut ChildHandle, options: &ExecutionOptions, forceful: bool) -> Result<RunReport> {
        if !forceful && !handle.reaped {
            // Interrupt the child the way a terminal would, then let it wind down
            cleanup::interrupt(handle.pid, Signal::SIGINT);
            let deadline = Instant::now() + self.config.termination_timeout;
            while Instant::now() < deadline && cleanup::is_process_alive(handle.pid) {
                thread::sleep(self.config.poll_interval);
            }
        }

        let reap = if handle.reaped {
            if options.terminate_children {
                handle.guard.reap_descendants(Signal::SIGTERM)
            } else {
                cleanup::ReapReport::default()
            }
        } else {
            let report = if options.terminate_children {
                handle.guard.reap(Signal::SIGTERM)
            } else {
                // Leave descendants alone; only the root goes
                handle.guard.disarm();
                let _ = nix::sys::signal::kill(Pid::from_raw(handle.pid), Signal::SIGKILL);
                cleanup::ReapReport {
                    terminated: vec![handle.pid],
                    still_alive: Vec::new(),
                }
            };
            if let Some((evidence, usage)) = wait_blocking(handle.pid, self.config.termination_timeout)? {
                handle.exit.get_or_insert(evidence);
                handle.usage = Some(usage);
            }
            handle.reaped = true;
            report
        };
        handle.reader.close();

        let (stdout, stderr) = match handle.capture.take() {
            Some(dir) => {
                let read = |name: &str| {
                    std::fs::read(dir.path().join(name))
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                        .ok()
                };
                (read("stdout"), read("stderr"))
            }
            None => (None, None),
        };

        log::debug!(
            "Run {} torn down: exit {:?}, terminated {:?}, still alive {:?}",
            handle.run_id,
            handle.exit,
            reap.terminated,
            reap.still_alive
        );

        Ok(RunReport {
            run_id: handle.run_id.to_string(),
            name: options.name.clone(),
            spawn_mode: handle.mode,
            pid: Some(handle.pid),
            started_at: handle.started_at,
            wall_time: handle.clock.elapsed().as_secs_f64(),
            exit: handle.exit,
            usage: handle.usage.clone(),
            stdout,
            stderr,
            terminated: reap.terminated,
            still_alive: reap.still_alive,
        })
    }
}

/// Turn the child's reply into an outcome
fn reply_outcome<T: DeserializeOwned>(payload: &[u8], limits: &ResourceLimits) -> Outcome<T> {
    match ipc::decode_reply::<T>(payload) {
        Ok(Reply::Success(value)) => Outcome::Success(value),
        Ok(Reply::Failure(failure)) => Outcome::Failure(failure),
        Ok(Reply::Empty) if limits.memory.is_some() => Outcome::Failure(Failure::new(
            FailureKind::MemoryLimitExceeded,
            "Child could not describe its result under the memory limit",
        )),
        Ok(Reply::Empty) => Outcome::Failure(Failure::new(
            FailureKind::InternalError,
            "Child could not describe its result",
        )),
        Err(e) => Outcome::Failure(Failure::new(FailureKind::InternalError, e.to_string())),
    }
}

/// `raises = true` turns failures into errors; otherwise they become `Empty`
fn surface<T>(outcome: Outcome<T>, raises: bool) -> Result<Outcome<T>> {
    match outcome {
        Outcome::Failure(failure) if !raises => {
            log::info!("Returning an empty outcome instead of: {}", failure);
            Ok(Outcome::Empty)
        }
        Outcome::Failure(failure) if failure.kind == FailureKind::Raised && !failure.wrapped => {
            match failure.error {
                Some(error) => Err(SandboxError::Task(error)),
                None => Err(SandboxError::Limit(failure)),
            }
        }
        Outcome::Failure(failure) => Err(SandboxError::Limit(failure)),
        other => Ok(other),
    }
}

/// Error wrapping for failures the target raised itself
fn apply_error_policy<T>(outcome: Outcome<T>, limits: &ResourceLimits, options: &ExecutionOptions) -> Outcome<T> {
    let failure = match outcome {
        Outcome::Failure(failure) if failure.kind == FailureKind::Raised => failure,
        other => return other,
    };
    let error = match &failure.error {
        Some(error) => error.clone(),
        None => return Outcome::Failure(failure),
    };

    if options.wrap_memory_errors && limits.memory.is_some() && is_memory_error(&error) {
        return Outcome::Failure(rewrap(failure, FailureKind::MemoryLimitExceeded));
    }

    let wrapped = match &options.wrap_errors {
        WrapErrors::None => None,
        WrapErrors::All => Some(FailureKind::Raised),
        WrapErrors::Named(matchers) => matchers
            .iter()
            .any(|m| m.matches(&error))
            .then_some(FailureKind::Raised),
        WrapErrors::PerLimit(map) => {
            // Fixed order keeps the result independent of map iteration
            [WrapTarget::Memory, WrapTarget::CpuTime, WrapTarget::WallTime, WrapTarget::Sandbox]
                .into_iter()
                .find_map(|target| {
                    let matchers = map.get(&target)?;
                    if !matchers.iter().any(|m| m.matches(&error)) {
                        return None;
                    }
                    match target {
                        WrapTarget::Memory if limits.memory.is_some() => Some(FailureKind::MemoryLimitExceeded),
                        WrapTarget::CpuTime if limits.cpu_time.is_some() => Some(FailureKind::CpuTimeExceeded),
                        WrapTarget::WallTime if limits.wall_time.is_some() => Some(FailureKind::WallTimeExceeded),
                        WrapTarget::Sandbox => Some(FailureKind::Raised),
                        _ => None,
                    }
                })
        }
    };

    match wrapped {
        Some(kind) => Outcome::Failure(rewrap(failure, kind)),
        None => Outcome::Failure(failure),
    }
}

fn rewrap(failure: Failure, kind: FailureKind) -> Failure {
    Failure {
        kind,
        wrapped: true,
        ..failure
    }
}

const ENOMEM: i32 = 12;
const WIN_ERROR_NOT_ENOUGH_MEMORY: i32 = 8;
const WIN_ERROR_COMMITMENT_LIMIT: i32 = 1455;

fn is_memory_error(error: &TaskError) -> bool {
    error.short_name() == "TryReserveError"
        || error.short_name() == "AllocError"
        || error.errno() == Some(ENOMEM)
        || matches!(error.os_code(), Some(WIN_ERROR_NOT_ENOUGH_MEMORY) | Some(WIN_ERROR_COMMITMENT_LIMIT))
}

/// Non-blocking `wait4`; `None` while the child runs
fn try_wait(pid: i32) -> Result<Option<(ExitEvidence, ResourceUsage)>> {
    loop {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut rusage) };
        if rc == 0 {
            return Ok(None);
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(SandboxError::Process(format!("wait4({}) failed: {}", pid, err)));
        }
        let evidence = match WaitStatus::from_raw(Pid::from_raw(pid), status) {
            Ok(WaitStatus::Exited(_, code)) => ExitEvidence::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ExitEvidence::Signaled(signal as i32),
            Ok(_) => return Ok(None),
            Err(e) => return Err(SandboxError::Process(format!("Bad wait status for {}: {}", pid, e))),
        };
        return Ok(Some((evidence, usage_from(&rusage))));
    }
}

fn wait_blocking(pid: i32, timeout: Duration) -> Result<Option<(ExitEvidence, ResourceUsage)>> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_wait(pid) {
            Ok(Some(found)) => return Ok(Some(found)),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => {
                log::warn!("Child {} still not collectable after teardown", pid);
                return Ok(None);
            }
            // Already collected elsewhere
            Err(_) => return Ok(None),
        }
    }
}

fn usage_from(rusage: &libc::rusage) -> ResourceUsage {
    let seconds = |tv: &libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    // ru_maxrss is in kilobytes on Linux and bytes on macOS
    let memory_peak = if cfg!(target_os = "macos") {
        rusage.ru_maxrss as u64
    } else {
        rusage.ru_maxrss as u64 * 1024
    };
    ResourceUsage {
        user_time: seconds(&rusage.ru_utime),
        system_time: seconds(&rusage.ru_stime),
        memory_peak,
    }
}

const WATCHED_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Handlers that were in place before the watch, called after recording the signal
static CHAINED: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

struct InstalledWatch {
    watchers: usize,
    previous: Vec<(Signal, SigAction)>,
}

static SIGNAL_WATCH: Mutex<Option<InstalledWatch>> = Mutex::new(None);

fn chained_slot(signal: libc::c_int) -> Option<usize> {
    match signal {
        libc::SIGINT => Some(0),
        libc::SIGTERM => Some(1),
        _ => None,
    }
}

extern "C" fn on_interrupt(signal: libc::c_int) {
    INTERRUPT_SIGNAL.store(signal, Ordering::SeqCst);
    let Some(slot) = chained_slot(signal) else {
        return;
    };
    let previous = CHAINED[slot].load(Ordering::SeqCst);
    if previous != 0 && previous != on_interrupt as usize {
        let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(previous) };
        handler(signal);
    }
}

fn restore_actions(previous: &[(Signal, SigAction)]) {
    for (signal, action) in previous {
        if let Err(e) = unsafe { sigaction(*signal, action) } {
            log::warn!("Failed to restore the {} handler: {}", signal, e);
        }
    }
    for slot in &CHAINED {
        slot.store(0, Ordering::SeqCst);
    }
}

/// SIGINT/SIGTERM handlers shared by every live signal-watching token
///
/// The first watch saves the previous actions and clears any stale interrupt;
/// the last one to drop puts the previous actions back.
pub struct SignalWatch {
    _installed: (),
}

impl SignalWatch {
    fn acquire() -> Result<Self> {
        let mut installed = SIGNAL_WATCH
            .lock()
            .map_err(|_| SandboxError::Process("Signal watch lock poisoned".to_string()))?;
        match installed.as_mut() {
            Some(watch) => watch.watchers += 1,
            None => {
                INTERRUPT_SIGNAL.store(0, Ordering::SeqCst);
                let mut previous = Vec::with_capacity(WATCHED_SIGNALS.len());
                for signal in WATCHED_SIGNALS {
                    let action = SigAction::new(SigHandler::Handler(on_interrupt), SaFlags::SA_RESTART, SigSet::empty());
                    match unsafe { sigaction(signal, &action) } {
                        Ok(old) => {
                            if let (SigHandler::Handler(handler), Some(slot)) =
                                (old.handler(), chained_slot(signal as libc::c_int))
                            {
                                CHAINED[slot].store(handler as usize, Ordering::SeqCst);
                            }
                            previous.push((signal, old));
                        }
                        Err(e) => {
                            restore_actions(&previous);
                            return Err(SandboxError::Process(format!(
                                "Failed to install {} handler: {}",
                                signal, e
                            )));
                        }
                    }
                }
                *installed = Some(InstalledWatch { watchers: 1, previous });
            }
        }
        Ok(Self { _installed: () })
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        let mut installed = match SIGNAL_WATCH.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let last = match installed.as_mut() {
            Some(watch) => {
                watch.watchers = watch.watchers.saturating_sub(1);
                watch.watchers == 0
            }
            None => false,
        };
        if last {
            if let Some(watch) = installed.take() {
                restore_actions(&watch.previous);
            }
            INTERRUPT_SIGNAL.store(0, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for SignalWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignalWatch")
    }
}

impl CancelToken {
    /// A token cancelled by SIGINT or SIGTERM delivered to this process
    ///
    /// While any such token is alive the two signals cancel calls instead of
    /// their usual action; handlers installed earlier still run. Dropping the
    /// last clone of the last watching token restores the previous actions.
    pub fn watch_signals() -> Result<CancelToken> {
        Ok(CancelToken::new().watching(SignalWatch::acquire()?))
    }
}
