//! limitbox: run a unit of work in a child process under memory, CPU-time and wall-time limits
//! The caller gets the value back or a classified reason why it did not arrive, and no descendant outlives the call.

pub mod config;
pub mod isolate;
pub mod resource_limits;
pub mod types;
pub mod units;
pub mod verdict;

#[cfg(unix)]
pub mod cleanup;
#[cfg(unix)]
pub mod cli;
#[cfg(unix)]
pub mod executor;
#[cfg(unix)]
pub mod ipc;
#[cfg(unix)]
pub mod shim;
#[cfg(unix)]
pub mod worker;

pub use config::SandboxConfig;
pub use isolate::supports;
pub use resource_limits::Feature;
pub use types::{
    CancelToken, ErrorMatcher, ExecutionOptions, Failure, FailureKind, Outcome, ResourceLimits, ResourceUsage,
    Result, SandboxError, SpawnMode, TaskError, WrapErrors, WrapTarget,
};
pub use units::{MemoryUnit, TimeUnit};

#[cfg(unix)]
pub use executor::{Execution, ExecutionRequest, Orchestrator, RunReport, Target};
#[cfg(unix)]
pub use isolate::{submit, Sandbox};
#[cfg(unix)]
pub use worker::{Arguments, Call, Registry};
