//! Child side of an isolated call
//!
//! Everything here runs after the fork (or in a fresh worker) and ends with
//! `_exit`; it never returns to the caller's stack.
use crate::cleanup;
use crate::ipc::emergency::{self, Slot};
use crate::ipc::{ChannelWriter, Reply};
use crate::resource_limits::Backend;
use crate::types::{Failure, FailureKind, ResourceLimits, TaskError};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Child-side settings derived from the call options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShimSettings {
    pub terminate_children: bool,
    pub name: Option<String>,
    pub capture: Option<CaptureSpec>,
    pub warnings: bool,
    /// Die together with this parent
    pub parent_pid: Option<i32>,
    pub termination_timeout: Duration,
}

impl Default for ShimSettings {
    fn default() -> Self {
        Self {
            terminate_children: true,
            name: None,
            capture: None,
            warnings: true,
            parent_pid: None,
            termination_timeout: Duration::from_secs(1),
        }
    }
}

/// Files the child's stdout and stderr are redirected into
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureSpec {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

static MEMORY_LIMITED: AtomicBool = AtomicBool::new(false);
static PANIC_TRACE: Mutex<Option<String>> = Mutex::new(None);

/// Ordered ways of getting an answer to the parent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendStep {
    Reply,
    RemoveLimitThenReply,
    DescribeFailure,
    EmptySentinel,
}

const SEND_LADDER: [SendStep; 4] = [
    SendStep::Reply,
    SendStep::RemoveLimitThenReply,
    SendStep::DescribeFailure,
    SendStep::EmptySentinel,
];

/// Apply limits, run `target`, report back and exit
pub fn run_child<T, F>(
    mut writer: ChannelWriter,
    limits: &ResourceLimits,
    settings: &ShimSettings,
    target: F,
) -> !
where
    T: Serialize,
    F: FnOnce() -> Result<T, TaskError>,
{
    prepare_process(settings);

    if let Some(fd) = writer.as_raw_fd() {
        if let Err(e) = emergency::arm(fd) {
            log::debug!("Failed to pre-encode emergency frames: {}", e);
        }
    }
    install_handler(Signal::SIGTERM, SigHandler::Handler(on_terminate));
    install_handler(Signal::SIGINT, SigHandler::SigDfl);
    install_panic_hook();

    let mut backend = Backend::for_host(settings.warnings);
    if let Err(e) = backend.apply(limits) {
        let failure = Failure::new(FailureKind::InternalError, format!("Failed to apply limits: {}", e));
        let _ = writer.send(&Reply::<()>::Failure(failure));
        writer.close();
        exit_now(1);
    }
    if limits.memory.is_some() {
        MEMORY_LIMITED.store(true, Ordering::SeqCst);
        install_handler(Signal::SIGABRT, SigHandler::Handler(on_abort));
    }

    let reply = match panic::catch_unwind(AssertUnwindSafe(target)) {
        Ok(Ok(value)) => Reply::Success(value),
        Ok(Err(err)) => Reply::Failure(Failure::raised(err)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let trace = PANIC_TRACE.lock().ok().and_then(|mut t| t.take());
            Reply::Failure(Failure::raised(TaskError::from_panic(message, trace)))
        }
    };

    match send_with_fallbacks(&mut writer, &mut backend, &reply) {
        Some(SendStep::Reply) => {}
        Some(step) => log::debug!("Reply delivered through {:?}", step),
        None => log::debug!("Every way of reporting back failed"),
    }
    writer.close();
    drop(reply);

    if settings.terminate_children {
        let report = cleanup::terminate_own_children(settings.termination_timeout);
        if !report.is_clean() {
            log::warn!("Child left processes behind: {:?}", report.still_alive);
        }
    }
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    exit_now(0)
}

/// Where the child's answer goes
trait Outbox {
    fn send<T: Serialize>(&mut self, reply: &Reply<T>) -> crate::types::Result<()>;
    fn send_frame(&mut self, frame: &[u8]) -> crate::types::Result<()>;
}

impl Outbox for ChannelWriter {
    fn send<T: Serialize>(&mut self, reply: &Reply<T>) -> crate::types::Result<()> {
        ChannelWriter::send(self, reply)
    }

    fn send_frame(&mut self, frame: &[u8]) -> crate::types::Result<()> {
        ChannelWriter::send_frame(self, frame)
    }
}

/// Walk the ladder until one step gets through; returns that step
fn send_with_fallbacks<T, O>(outbox: &mut O, backend: &mut Backend, reply: &Reply<T>) -> Option<SendStep>
where
    T: Serialize,
    O: Outbox,
{
    let mut last_error = None;
    for step in SEND_LADDER {
        let result = match step {
            SendStep::Reply => outbox.send(reply),
            SendStep::RemoveLimitThenReply => {
                if !backend.remove_memory_limit() {
                    log::debug!("Could not lift the memory limit before resending");
                }
                outbox.send(reply)
            }
            SendStep::DescribeFailure => {
                let reason = last_error
                    .as_ref()
                    .map(|e: &crate::types::SandboxError| e.to_string())
                    .unwrap_or_default();
                let failure = Failure::new(
                    FailureKind::InternalError,
                    format!("Failed to send the result: {}", reason),
                );
                outbox.send(&Reply::<()>::Failure(failure))
            }
            SendStep::EmptySentinel => match emergency::frame(Slot::Empty) {
                Some(frame) => outbox.send_frame(frame),
                None => outbox.send(&Reply::<()>::Empty),
            },
        };
        match result {
            Ok(()) => return Some(step),
            Err(e) => last_error = Some(e),
        }
    }
    None
}

/// Own process group, parent-death signal, no core dumps, name, redirection
fn prepare_process(settings: &ShimSettings) {
    if let Err(e) = nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0)) {
        log::debug!("setpgid failed in child: {}", e);
    }

    if let Some(parent) = settings.parent_pid {
        die_with_parent(parent);
    }

    if let Ok((_, hard)) = getrlimit(Resource::RLIMIT_CORE) {
        let _ = setrlimit(Resource::RLIMIT_CORE, 0, hard);
    }

    if let Some(name) = &settings.name {
        set_process_name(name);
    }

    if let Some(capture) = &settings.capture {
        redirect(&capture.stdout, libc::STDOUT_FILENO);
        redirect(&capture.stderr, libc::STDERR_FILENO);
    }
}

/// SIGKILL when the parent goes away; exit now if it already has
#[cfg(target_os = "linux")]
pub(crate) fn die_with_parent(parent: i32) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
    }
    if nix::unistd::getppid().as_raw() != parent {
        exit_now(1);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn die_with_parent(_parent: i32) {}

#[cfg(target_os = "linux")]
fn set_process_name(name: &str) {
    // The kernel keeps 15 bytes plus the terminator
    let truncated: String = name.chars().take(15).collect();
    if let Ok(name) = std::ffi::CString::new(truncated) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_name(name: &str) {
    log::debug!("Process names are not supported here, ignoring '{}'", name);
}

fn redirect(path: &std::path::Path, target: libc::c_int) {
    match std::fs::File::create(path) {
        Ok(file) => {
            if let Err(e) = nix::unistd::dup2(file.as_raw_fd(), target) {
                log::warn!("Failed to redirect fd {} to {}: {}", target, path.display(), e);
            }
        }
        Err(e) => log::warn!("Failed to open capture file {}: {}", path.display(), e),
    }
}

fn install_handler(signal: Signal, handler: SigHandler) {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    if let Err(e) = unsafe { sigaction(signal, &action) } {
        log::debug!("Failed to install {} handler: {}", signal, e);
    }
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let trace = format!("{}\n{}", info, std::backtrace::Backtrace::force_capture());
        if let Ok(mut slot) = PANIC_TRACE.lock() {
            *slot = Some(trace);
        }
    }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Write the signal frame, then die from SIGTERM for real
extern "C" fn on_terminate(_signal: libc::c_int) {
    emergency::send(Slot::Signal);
    reraise(libc::SIGTERM);
}

/// Rust aborts when an allocation fails; under a memory limit that is the likely cause
extern "C" fn on_abort(_signal: libc::c_int) {
    if MEMORY_LIMITED.load(Ordering::SeqCst) {
        emergency::send(Slot::Memory);
    }
    reraise(libc::SIGABRT);
}

fn reraise(signal: libc::c_int) {
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::sigaddset(&mut unblock, signal);
        libc::sigprocmask(libc::SIG_UNBLOCK, &unblock, std::ptr::null_mut());
        libc::raise(signal);
        libc::_exit(128 + signal);
    }
}

fn exit_now(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}
