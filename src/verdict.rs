//! Exit classification
//!
//! A pure function over what the parent could observe about a child that
//! never delivered a reply, the limits it ran under, and the host OS.
use crate::types::{Failure, FailureKind, ResourceLimits};
use serde::{Deserialize, Serialize};

#[cfg(unix)]
pub const SIGSEGV: i32 = libc::SIGSEGV;
#[cfg(unix)]
pub const SIGXCPU: i32 = libc::SIGXCPU;

// Never delivered on hosts without POSIX signals; the Linux numbers keep the match total
#[cfg(not(unix))]
pub const SIGSEGV: i32 = 11;
#[cfg(not(unix))]
pub const SIGXCPU: i32 = 24;

/// Windows process exit statuses and error codes
pub mod windows_codes {
    pub const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub const STATUS_IN_PAGE_ERROR: u32 = 0xC000_0006;
    pub const STATUS_PAGEFILE_QUOTA: u32 = 0xC000_0007;
    pub const STATUS_QUOTA_EXCEEDED: u32 = 0xC000_0044;
    pub const ERROR_COMMITMENT_LIMIT: u32 = 1455;
    /// `ERROR_NOT_ENOUGH_QUOTA`, used as the exit code of a CPU killed job
    pub const ERROR_NOT_ENOUGH_QUOTA: u32 = 1816;

    pub const MEMORY: [u32; 4] = [
        STATUS_ACCESS_VIOLATION,
        STATUS_IN_PAGE_ERROR,
        STATUS_PAGEFILE_QUOTA,
        ERROR_COMMITMENT_LIMIT,
    ];
    pub const CPU: [u32; 2] = [STATUS_QUOTA_EXCEEDED, ERROR_NOT_ENOUGH_QUOTA];
}

/// What the parent saw of the child
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitEvidence {
    /// Still alive when the parent gave up waiting
    Running,
    Exited(i32),
    Signaled(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    Darwin,
    Windows,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            HostOs::Linux
        } else if cfg!(target_os = "macos") {
            HostOs::Darwin
        } else if cfg!(windows) {
            HostOs::Windows
        } else {
            HostOs::Other
        }
    }
}

/// Classify a child that produced no reply
pub fn classify_exit(evidence: ExitEvidence, limits: &ResourceLimits, os: HostOs) -> Failure {
    match evidence {
        ExitEvidence::Running => Failure::new(
            FailureKind::WallTimeExceeded,
            match limits.wall_time {
                Some(secs) => format!("Wall time limit of {}s reached", secs),
                None => "Child did not finish".to_string(),
            },
        ),
        ExitEvidence::Signaled(SIGXCPU) if limits.cpu_time.is_some() => Failure::new(
            FailureKind::CpuTimeExceeded,
            format!("CPU time limit of {}s reached (SIGXCPU)", limits.cpu_time.unwrap_or_default()),
        ),
        // Best effort: a failed allocation can surface as a segfault
        ExitEvidence::Signaled(SIGSEGV) if limits.memory.is_some() => Failure::new(
            FailureKind::MemoryLimitExceeded,
            "Child died with SIGSEGV under a memory limit",
        ),
        ExitEvidence::Exited(code) if os == HostOs::Windows => classify_windows_exit(code, limits),
        ExitEvidence::Exited(0) => Failure::new(
            FailureKind::InternalError,
            "Child exited cleanly without sending a result",
        ),
        ExitEvidence::Exited(code) => Failure::new(
            FailureKind::Unclassified,
            format!("Child exited with code {} and no result", code),
        ),
        ExitEvidence::Signaled(sig) => Failure::new(
            FailureKind::Unclassified,
            format!("Child was killed by signal {} without sending a result", sig),
        ),
    }
}

fn classify_windows_exit(code: i32, limits: &ResourceLimits) -> Failure {
    let status = code as u32;
    if windows_codes::CPU.contains(&status) && limits.cpu_time.is_some() {
        return Failure::new(
            FailureKind::CpuTimeExceeded,
            format!("CPU time limit reached (exit status {:#x})", status),
        );
    }
    if windows_codes::MEMORY.contains(&status) && limits.memory.is_some() {
        return Failure::new(
            FailureKind::MemoryLimitExceeded,
            format!("Memory limit reached (exit status {:#x})", status),
        );
    }
    if code == 0 {
        return Failure::new(
            FailureKind::InternalError,
            "Child exited cleanly without sending a result",
        );
    }
    Failure::new(
        FailureKind::Unclassified,
        format!("Child exited with status {:#x} and no result", status),
    )
}
