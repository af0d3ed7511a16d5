//! Public entry points
use crate::resource_limits::{self, Feature};
use crate::types::{Result, SandboxError};

#[cfg(unix)]
pub use self::sandbox::{submit, Sandbox};

/// Whether this host can enforce `feature`
///
/// Accepts `"memory"`, `"cpu_time"`, `"wall_time"` and `"decorator"`.
pub fn supports(feature: &str) -> Result<bool> {
    let feature: Feature = feature
        .parse()
        .map_err(|e: resource_limits::LimiterError| SandboxError::Config(e.to_string()))?;
    Ok(resource_limits::supports(feature))
}

#[cfg(unix)]
mod sandbox {
    use crate::config::SandboxConfig;
    use crate::executor::{Execution, ExecutionRequest, Orchestrator, Target};
    use crate::types::{ExecutionOptions, Outcome, ResourceLimits, Result};
    use crate::worker::{Call, Registry};
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    /// A configured sandbox with default limits and options
    pub struct Sandbox {
        orchestrator: Orchestrator,
        limits: ResourceLimits,
        options: ExecutionOptions,
    }

    impl Sandbox {
        pub fn new(config: SandboxConfig) -> Self {
            Self::with_registry(config, Registry::new())
        }

        /// Sandbox that can run the tasks in `registry` by name
        pub fn with_registry(config: SandboxConfig, registry: Registry) -> Self {
            let limits = ResourceLimits {
                grace_period: config.default_grace_period,
                ..ResourceLimits::default()
            };
            let options = ExecutionOptions {
                warnings: config.warnings,
                ..ExecutionOptions::default()
            };
            Self {
                orchestrator: Orchestrator::with_registry(config, registry),
                limits,
                options,
            }
        }

        /// Sandbox configured from `LIMITBOX_*` environment variables
        pub fn from_env() -> Result<Self> {
            Ok(Self::new(SandboxConfig::from_env()?))
        }

        pub fn with_limits(mut self, limits: ResourceLimits) -> Result<Self> {
            limits.validate()?;
            self.limits = limits;
            Ok(self)
        }

        pub fn with_options(mut self, options: ExecutionOptions) -> Self {
            self.options = options;
            self
        }

        pub fn limits(&self) -> &ResourceLimits {
            &self.limits
        }

        pub fn options(&self) -> &ExecutionOptions {
            &self.options
        }

        pub fn config(&self) -> &SandboxConfig {
            self.orchestrator.config()
        }

        /// Run `target` with the sandbox defaults
        pub fn submit<T>(&self, target: Target<T>) -> Result<Outcome<T>>
        where
            T: Serialize + DeserializeOwned,
        {
            self.submit_with(target, self.limits.clone(), self.options.clone())
        }

        pub fn submit_with<T>(
            &self,
            target: Target<T>,
            limits: ResourceLimits,
            options: ExecutionOptions,
        ) -> Result<Outcome<T>>
        where
            T: Serialize + DeserializeOwned,
        {
            let request = ExecutionRequest::new(target).with_limits(limits).with_options(options);
            self.orchestrator.execute(request)
        }

        /// Run a registered task by name with the sandbox defaults
        pub fn call<T>(&self, call: Call) -> Result<Outcome<T>>
        where
            T: Serialize + DeserializeOwned,
        {
            self.submit(Target::Named(call))
        }

        /// Like `submit`, but returns every outcome along with the run report
        pub fn run<T>(&self, target: Target<T>) -> Result<Execution<T>>
        where
            T: Serialize + DeserializeOwned,
        {
            let request = ExecutionRequest::new(target)
                .with_limits(self.limits.clone())
                .with_options(self.options.clone());
            self.orchestrator.run(request)
        }
    }

    impl Default for Sandbox {
        fn default() -> Self {
            Self::new(SandboxConfig::default())
        }
    }

    /// One-off call with the default configuration
    pub fn submit<T>(target: Target<T>, limits: ResourceLimits, options: ExecutionOptions) -> Result<Outcome<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Sandbox::default().submit_with(target, limits, options)
    }
}
