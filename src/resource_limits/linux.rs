//! Linux backend: `RLIMIT_AS` for memory, a profiling timer for CPU time
use super::{install_cpu_handler, rlimit_error, Feature, LimiterError};
use crate::types::ResourceLimits;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::Signal;

pub struct LinuxLimiter {
    /// `(soft, hard)` address space limit before `apply`
    old_memory: Option<(libc::rlim_t, libc::rlim_t)>,
    warnings: bool,
}

impl LinuxLimiter {
    pub fn new(warnings: bool) -> Self {
        Self {
            old_memory: None,
            warnings,
        }
    }

    pub fn supports(_feature: Feature) -> bool {
        true
    }

    pub fn apply(&mut self, limits: &ResourceLimits) -> Result<(), LimiterError> {
        if let Some(cpu_time) = limits.cpu_time {
            self.limit_cpu_time(cpu_time, limits.grace_period)?;
        }
        if let Some(processes) = limits.processes {
            self.limit_processes(processes)?;
        }
        if let Some(memory) = limits.memory {
            self.limit_memory(memory)?;
        }
        Ok(())
    }

    /// SIGPROF after `cpu_time` seconds of CPU, repeating every second.
    /// `RLIMIT_CPU` backs it up in case the handler never gets to run.
    fn limit_cpu_time(&mut self, cpu_time: u64, grace_period: u64) -> Result<(), LimiterError> {
        install_cpu_handler(Signal::SIGPROF)?;

        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 1,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: cpu_time as libc::time_t,
                tv_usec: 0,
            },
        };
        let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(LimiterError::Timer(std::io::Error::last_os_error()));
        }

        let soft = cpu_time.saturating_add(grace_period);
        let hard = soft.saturating_add(grace_period);
        let (_, current_hard) =
            getrlimit(Resource::RLIMIT_CPU).map_err(|e| rlimit_error("cpu time", e))?;
        let (soft, hard) = clamp_to_hard(soft, hard, current_hard);
        if let Err(e) = setrlimit(Resource::RLIMIT_CPU, soft, hard) {
            // The timer is armed already; the backstop is optional
            if self.warnings {
                log::warn!("Failed to set RLIMIT_CPU backstop: {}", e);
            }
        }
        Ok(())
    }

    fn limit_processes(&mut self, processes: u64) -> Result<(), LimiterError> {
        let (_, hard) =
            getrlimit(Resource::RLIMIT_NPROC).map_err(|e| rlimit_error("process count", e))?;
        let (soft, hard) = clamp_to_hard(processes, hard, hard);
        setrlimit(Resource::RLIMIT_NPROC, soft, hard).map_err(|e| rlimit_error("process count", e))
    }

    fn limit_memory(&mut self, memory: u64) -> Result<(), LimiterError> {
        let (old_soft, old_hard) =
            getrlimit(Resource::RLIMIT_AS).map_err(|e| rlimit_error("memory", e))?;
        let soft = if old_hard == libc::RLIM_INFINITY {
            memory
        } else {
            memory.min(old_hard)
        };
        setrlimit(Resource::RLIMIT_AS, soft, old_hard).map_err(|e| rlimit_error("memory", e))?;
        self.old_memory = Some((old_soft, old_hard));
        Ok(())
    }

    pub fn remove_memory_limit(&mut self) -> bool {
        match self.old_memory.take() {
            Some((soft, hard)) => match setrlimit(Resource::RLIMIT_AS, soft, hard) {
                Ok(()) => true,
                Err(_) => {
                    self.old_memory = Some((soft, hard));
                    false
                }
            },
            None => true,
        }
    }
}

/// Keep a requested `(soft, hard)` pair within the current hard limit
fn clamp_to_hard(
    soft: libc::rlim_t,
    hard: libc::rlim_t,
    current_hard: libc::rlim_t,
) -> (libc::rlim_t, libc::rlim_t) {
    if current_hard == libc::RLIM_INFINITY {
        return (soft, hard);
    }
    (soft.min(current_hard), hard.min(current_hard))
}
