//! macOS backend: `RLIMIT_CPU` with a SIGXCPU handler; memory cannot be capped
use super::{install_cpu_handler, rlimit_error, warn_unsupported, Feature, LimiterError};
use crate::types::ResourceLimits;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;

pub struct DarwinLimiter {
    warnings: bool,
}

impl DarwinLimiter {
    pub fn new(warnings: bool) -> Self {
        Self { warnings }
    }

    /// `RLIMIT_AS` and `RLIMIT_DATA` are not enforced by the macOS kernel
    pub fn supports(feature: Feature) -> bool {
        match feature {
            Feature::Memory | Feature::Decorator => false,
            Feature::CpuTime | Feature::WallTime => true,
        }
    }

    pub fn apply(&mut self, limits: &ResourceLimits) -> Result<(), LimiterError> {
        if let Some(cpu_time) = limits.cpu_time {
            install_cpu_handler(Signal::SIGXCPU)?;
            let soft = cpu_time;
            let hard = cpu_time.saturating_add(limits.grace_period);
            let (_, current_hard) =
                getrlimit(Resource::RLIMIT_CPU).map_err(|e| rlimit_error("cpu time", e))?;
            let (soft, hard) = if current_hard == libc::RLIM_INFINITY {
                (soft, hard)
            } else {
                (soft.min(current_hard), hard.min(current_hard))
            };
            setrlimit(Resource::RLIMIT_CPU, soft, hard).map_err(|e| rlimit_error("cpu time", e))?;
        }
        if let Some(processes) = limits.processes {
            let (_, hard) =
                getrlimit(Resource::RLIMIT_NPROC).map_err(|e| rlimit_error("process count", e))?;
            let soft = if hard == libc::RLIM_INFINITY {
                processes
            } else {
                processes.min(hard)
            };
            setrlimit(Resource::RLIMIT_NPROC, soft, hard)
                .map_err(|e| rlimit_error("process count", e))?;
        }
        if limits.memory.is_some() {
            warn_unsupported(Feature::Memory, self.warnings);
        }
        Ok(())
    }
}
