/// Named tasks and the processes that run them outside copy-on-write mode
///
/// A closure cannot cross `exec`, so fresh-process and pre-forked pool
/// children look their target up by name in a `Registry`.
use crate::cleanup;
use crate::ipc::{self, ChannelReader, ChannelWriter, Reply};
use crate::shim::{self, ShimSettings};
use crate::types::{Failure, FailureKind, ResourceLimits, Result, SandboxError, TaskError};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;

/// Set on the fresh-process worker's environment
pub const WORKER_ENV: &str = "LIMITBOX_WORKER";
/// Descriptor the fresh-process worker writes its reply to
pub const CHANNEL_FD: RawFd = 3;

/// A registered task
pub type TaskFn = fn(Arguments) -> std::result::Result<Value, TaskError>;

/// Name and arguments of a registered task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.args.push(to_value(value)?);
        Ok(self)
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.kwargs.insert(key.into(), to_value(value)?);
        Ok(self)
    }
}

fn to_value(value: impl Serialize) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| SandboxError::Config(format!("Argument is not serializable: {}", e)))
}

/// Arguments handed to a task
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Positional argument `index`, deserialized
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::new("ArgumentError", format!("missing positional argument {}", index))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<Option<T>, TaskError> {
        match self.kwargs.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn raw_args(&self) -> &[Value] {
        &self.args
    }
}

/// Tasks addressable by name
#[derive(Clone, Default)]
pub struct Registry {
    tasks: HashMap<String, TaskFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, task: TaskFn) -> &mut Self {
        self.tasks.insert(name.into(), task);
        self
    }

    pub fn with(mut self, name: impl Into<String>, task: TaskFn) -> Self {
        self.register(name, task);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn invoke(&self, call: &Call) -> std::result::Result<Value, TaskError> {
        let task = self.tasks.get(&call.name).ok_or_else(|| {
            TaskError::new("UnknownTask", format!("no task registered as '{}'", call.name))
        })?;
        task(Arguments {
            args: call.args.clone(),
            kwargs: call.kwargs.clone(),
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("tasks", &self.names()).finish()
    }
}

/// Everything a worker needs to run one call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub call: Call,
    pub limits: ResourceLimits,
    pub settings: ShimSettings,
}

/// Entry point for fresh-process workers.
///
/// Call this first thing in `main`. In a normal process it returns at once;
/// in a worker started by the orchestrator it runs the job and never returns.
pub fn init(registry: &Registry) {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    std::env::remove_var(WORKER_ENV);
    serve_fresh(registry)
}

fn serve_fresh(registry: &Registry) -> ! {
    let mut writer = ChannelWriter::from_raw_fd(CHANNEL_FD);
    let _ = ipc::set_cloexec(CHANNEL_FD);

    let job = read_job(&mut std::io::stdin().lock());
    match job {
        Ok(job) => shim::run_child(writer, &job.limits, &job.settings, || registry.invoke(&job.call)),
        Err(e) => {
            let failure = Failure::new(FailureKind::InternalError, format!("Worker could not read its job: {}", e));
            let _ = writer.send(&Reply::<()>::Failure(failure));
            writer.close();
            unsafe { libc::_exit(2) }
        }
    }
}

fn read_job<R: std::io::Read>(reader: &mut R) -> Result<Job> {
    let payload = ipc::read_frame(reader)?
        .ok_or_else(|| SandboxError::Process("Job stream closed before a job arrived".to_string()))?;
    serde_json::from_slice(&payload)
        .map_err(|e| SandboxError::Process(format!("Failed to deserialize job: {}", e)))
}

pub fn encode_job(job: &Job) -> Result<Vec<u8>> {
    Ok(ipc::encode_frame(job)?)
}

/// A forked worker waiting for its single job
pub struct ParkedWorker {
    pid: i32,
    job: Option<File>,
    reader: Option<ChannelReader>,
}

impl ParkedWorker {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Hand over the job; the worker starts running it immediately
    pub fn dispatch(mut self, job: &Job) -> Result<(i32, ChannelReader)> {
        let frame = encode_job(job)?;
        let mut pipe = self
            .job
            .take()
            .ok_or_else(|| SandboxError::Process("Worker job pipe already used".to_string()))?;
        pipe.write_all(&frame)?;
        drop(pipe);
        let reader = self
            .reader
            .take()
            .ok_or_else(|| SandboxError::Process("Worker channel already used".to_string()))?;
        Ok((self.pid, reader))
    }

    fn raw_fds(&self) -> Vec<RawFd> {
        use std::os::unix::io::AsRawFd;
        let mut fds = Vec::new();
        if let Some(job) = &self.job {
            fds.push(job.as_raw_fd());
        }
        if let Some(fd) = self.reader.as_ref().and_then(|r| r.as_raw_fd()) {
            fds.push(fd);
        }
        fds
    }
}

impl Drop for ParkedWorker {
    fn drop(&mut self) {
        // An unused worker exits on end-of-file; a dispatched one belongs to the caller
        if self.job.take().is_some() {
            let report = cleanup::terminate(self.pid, true, nix::sys::signal::Signal::SIGKILL, Duration::from_secs(1));
            if !report.is_clean() {
                log::warn!("Parked worker {} did not exit", self.pid);
            }
            let _ = cleanup::collect_zombie(self.pid, Duration::from_secs(1));
        }
    }
}

/// Workers forked ahead of time, one job each
pub struct WorkerPool {
    registry: Registry,
    size: usize,
    idle: VecDeque<ParkedWorker>,
}

impl WorkerPool {
    pub fn new(registry: Registry, size: usize) -> Result<Self> {
        let mut pool = Self {
            registry,
            size: size.max(1),
            idle: VecDeque::new(),
        };
        pool.refill(&[])?;
        log::debug!("Started worker pool with {} worker(s)", pool.idle.len());
        Ok(pool)
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// A live parked worker; the pool refills behind it
    pub fn take(&mut self) -> Result<ParkedWorker> {
        while let Some(worker) = self.idle.pop_front() {
            if cleanup::is_process_alive(worker.pid) {
                self.refill(&worker.raw_fds())?;
                return Ok(worker);
            }
            log::debug!("Discarding dead pool worker {}", worker.pid);
        }
        let worker = self.spawn_worker(&[])?;
        self.refill(&worker.raw_fds())?;
        Ok(worker)
    }

    /// `taken` are the pipes of a worker already handed out; new workers must not inherit them
    fn refill(&mut self, taken: &[RawFd]) -> Result<()> {
        while self.idle.len() < self.size {
            let worker = self.spawn_worker(taken)?;
            self.idle.push_back(worker);
        }
        Ok(())
    }

    fn spawn_worker(&self, taken: &[RawFd]) -> Result<ParkedWorker> {
        let (job_read, job_write) = nix::unistd::pipe()
            .map_err(|e| SandboxError::Process(format!("Failed to create job pipe: {}", e)))?;
        ipc::set_cloexec(job_read)?;
        ipc::set_cloexec(job_write)?;
        let (reader, writer) = ipc::channel()?;

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let _ = nix::unistd::setpgid(child, child);
                let _ = nix::unistd::close(job_read);
                drop(writer);
                Ok(ParkedWorker {
                    pid: child.as_raw(),
                    job: Some(unsafe { File::from_raw_fd(job_write) }),
                    reader: Some(reader),
                })
            }
            Ok(ForkResult::Child) => {
                let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
                let _ = nix::unistd::close(job_write);
                for parked in &self.idle {
                    for fd in parked.raw_fds() {
                        let _ = nix::unistd::close(fd);
                    }
                }
                for &fd in taken {
                    let _ = nix::unistd::close(fd);
                }
                drop(reader);
                self.serve_parked(job_read, writer)
            }
            Err(e) => Err(SandboxError::Process(format!("Failed to fork pool worker: {}", e))),
        }
    }

    fn serve_parked(&self, job_read: RawFd, mut writer: ChannelWriter) -> ! {
        let mut jobs = unsafe { File::from_raw_fd(job_read) };
        match ipc::read_frame(&mut jobs) {
            Ok(Some(payload)) => match serde_json::from_slice::<Job>(&payload) {
                Ok(job) => {
                    drop(jobs);
                    shim::run_child(writer, &job.limits, &job.settings, || self.registry.invoke(&job.call))
                }
                Err(e) => {
                    let failure = Failure::new(FailureKind::InternalError, format!("Bad job: {}", e));
                    let _ = writer.send(&Reply::<()>::Failure(failure));
                    writer.close();
                    unsafe { libc::_exit(2) }
                }
            },
            // Pool closed
            Ok(None) | Err(_) => {
                writer.close();
                unsafe { libc::_exit(0) }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let count = self.idle.len();
        self.idle.clear();
        log::debug!("Worker pool shut down, released {} worker(s)", count);
    }
}
