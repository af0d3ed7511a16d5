/// Per-platform resource limiting applied inside the child process
use crate::types::ResourceLimits;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "macos")]
pub use darwin::DarwinLimiter;
#[cfg(target_os = "linux")]
pub use linux::LinuxLimiter;
#[cfg(windows)]
pub use windows::WindowsLimiter;

/// Errors raised while applying limits
#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("Failed to set {resource} limit: {source}")]
    Rlimit {
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to arm CPU timer: {0}")]
    Timer(#[source] std::io::Error),

    #[error("Failed to install {signal} handler: {reason}")]
    Handler { signal: &'static str, reason: String },

    #[error("Unknown feature '{0}', expected memory, cpu_time, wall_time or decorator")]
    UnknownFeature(String),
}

/// Capabilities a host may or may not offer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Memory,
    CpuTime,
    WallTime,
    /// Closure targets run without re-import (copy-on-write spawning)
    Decorator,
}

impl FromStr for Feature {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, LimiterError> {
        match s {
            "memory" => Ok(Feature::Memory),
            "cpu_time" => Ok(Feature::CpuTime),
            "wall_time" => Ok(Feature::WallTime),
            "decorator" => Ok(Feature::Decorator),
            other => Err(LimiterError::UnknownFeature(other.to_string())),
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Feature::Memory => "memory",
            Feature::CpuTime => "cpu_time",
            Feature::WallTime => "wall_time",
            Feature::Decorator => "decorator",
        };
        f.write_str(name)
    }
}

/// Set by the CPU limit signal handler once the budget is spent
static CPU_TIME_EXPIRED: AtomicBool = AtomicBool::new(false);

/// Whether this process ran out of CPU time
pub fn cpu_time_expired() -> bool {
    CPU_TIME_EXPIRED.load(Ordering::SeqCst)
}

/// Limiter backend, selected once for the host platform
pub enum Backend {
    #[cfg(target_os = "linux")]
    Linux(LinuxLimiter),
    #[cfg(target_os = "macos")]
    Darwin(DarwinLimiter),
    #[cfg(windows)]
    Windows,
    Unsupported { warnings: bool },
}

impl Backend {
    /// Backend for the platform this binary was built for
    pub fn for_host(warnings: bool) -> Self {
        #[cfg(target_os = "linux")]
        {
            Backend::Linux(LinuxLimiter::new(warnings))
        }
        #[cfg(target_os = "macos")]
        {
            Backend::Darwin(DarwinLimiter::new(warnings))
        }
        #[cfg(windows)]
        {
            let _ = warnings;
            Backend::Windows
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
        {
            Backend::Unsupported { warnings }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Linux(_) => "linux",
            #[cfg(target_os = "macos")]
            Backend::Darwin(_) => "darwin",
            #[cfg(windows)]
            Backend::Windows => "windows",
            Backend::Unsupported { .. } => "unsupported",
        }
    }

    /// Apply CPU time, then process count, then memory
    #[cfg(unix)]
    pub fn apply(&mut self, limits: &ResourceLimits) -> Result<(), LimiterError> {
        log::debug!("Applying {:?} with the {} backend", limits, self.name());
        match self {
            #[cfg(target_os = "linux")]
            Backend::Linux(limiter) => limiter.apply(limits),
            #[cfg(target_os = "macos")]
            Backend::Darwin(limiter) => limiter.apply(limits),
            Backend::Unsupported { warnings } => {
                if limits.memory.is_some() {
                    warn_unsupported(Feature::Memory, *warnings);
                }
                if limits.cpu_time.is_some() {
                    warn_unsupported(Feature::CpuTime, *warnings);
                }
                Ok(())
            }
        }
    }

    /// Restore the memory limit that was in place before `apply`
    #[cfg(unix)]
    pub fn remove_memory_limit(&mut self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Linux(limiter) => limiter.remove_memory_limit(),
            #[cfg(target_os = "macos")]
            Backend::Darwin(_) => true,
            Backend::Unsupported { .. } => true,
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Linux(_) => LinuxLimiter::supports(feature),
            #[cfg(target_os = "macos")]
            Backend::Darwin(_) => DarwinLimiter::supports(feature),
            #[cfg(windows)]
            Backend::Windows => WindowsLimiter::supports(feature),
            Backend::Unsupported { .. } => feature == Feature::WallTime,
        }
    }
}

struct Capabilities {
    memory: bool,
    cpu_time: bool,
    wall_time: bool,
    decorator: bool,
}

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();

/// Whether the host supports `feature`, probed once per process
pub fn supports(feature: Feature) -> bool {
    let caps = CAPABILITIES.get_or_init(|| {
        let backend = Backend::for_host(false);
        let caps = Capabilities {
            memory: backend.supports(Feature::Memory),
            cpu_time: backend.supports(Feature::CpuTime),
            wall_time: backend.supports(Feature::WallTime),
            decorator: backend.supports(Feature::Decorator),
        };
        log::debug!(
            "Capabilities of the {} backend: memory={} cpu_time={} wall_time={} decorator={}",
            backend.name(),
            caps.memory,
            caps.cpu_time,
            caps.wall_time,
            caps.decorator
        );
        caps
    });
    match feature {
        Feature::Memory => caps.memory,
        Feature::CpuTime => caps.cpu_time,
        Feature::WallTime => caps.wall_time,
        Feature::Decorator => caps.decorator,
    }
}

#[cfg(unix)]
pub(crate) fn warn_unsupported(feature: Feature, warnings: bool) {
    if warnings {
        log::warn!("Limiting {} is not supported on this platform, ignoring it", feature);
    } else {
        log::debug!("Limiting {} is not supported on this platform, ignoring it", feature);
    }
}

#[cfg(unix)]
pub(crate) fn rlimit_error(resource: &'static str, errno: nix::errno::Errno) -> LimiterError {
    LimiterError::Rlimit {
        resource,
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}

/// Install `handler` for a CPU limit signal
#[cfg(unix)]
pub(crate) fn install_cpu_handler(signal: nix::sys::signal::Signal) -> Result<(), LimiterError> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

    let action = SigAction::new(
        SigHandler::Handler(on_cpu_time_expired),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(signal, &action) }.map_err(|e| LimiterError::Handler {
        signal: signal.as_str(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Report the CPU failure on the channel, then die by SIGXCPU so the exit evidence agrees
#[cfg(unix)]
extern "C" fn on_cpu_time_expired(_signal: libc::c_int) {
    CPU_TIME_EXPIRED.store(true, Ordering::SeqCst);
    crate::ipc::emergency::send(crate::ipc::emergency::Slot::CpuTime);
    unsafe {
        libc::signal(libc::SIGXCPU, libc::SIG_DFL);
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::sigaddset(&mut unblock, libc::SIGXCPU);
        libc::sigprocmask(libc::SIG_UNBLOCK, &unblock, std::ptr::null_mut());
        libc::raise(libc::SIGXCPU);
        libc::_exit(128 + libc::SIGXCPU);
    }
}
