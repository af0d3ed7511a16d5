//! limitbox: run a task in a child process under resource limits
//!
//! The same binary doubles as the worker program for fresh-process spawning:
//! when started by the orchestrator it serves one job and exits.
//!
//! # Usage
//! ```bash
//! limitbox supports
//! limitbox run --wall 1s sleep -- 5
//! limitbox run --mem 50MB --mode spawn allocate -- 200
//! limitbox run --cpu 1s --capture command -- sh -c 'echo hi'
//! ```
use anyhow::Result;

#[cfg(unix)]
fn main() -> Result<()> {
    use anyhow::Context;
    use clap::Parser;
    use limitbox::cli::{self, Cli, Commands};
    use limitbox::{Feature, Orchestrator, Outcome, SandboxConfig, TaskError};

    let registry = cli::demo_registry();
    // Never returns inside a worker process
    limitbox::worker::init(&registry);

    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SandboxConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .with_env_overrides()?,
        None => SandboxConfig::from_env()?,
    };

    match cli.command {
        Commands::Supports { feature } => {
            let mut report = serde_json::Map::new();
            match feature {
                Some(feature) => {
                    let supported = limitbox::supports(&feature)?;
                    report.insert(feature, supported.into());
                }
                None => {
                    for feature in [Feature::Memory, Feature::CpuTime, Feature::WallTime, Feature::Decorator] {
                        report.insert(feature.to_string(), limitbox::resource_limits::supports(feature).into());
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Tasks => {
            for name in registry.names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Run {
            mem,
            cpu,
            wall,
            grace,
            processes,
            mode,
            name,
            capture,
            keep_children,
            task,
            args,
        } => {
            if !registry.contains(&task) {
                anyhow::bail!("Unknown task '{}'; see `limitbox tasks`", task);
            }
            let limits = cli::limits_from_args(
                mem.as_deref(),
                cpu.as_deref(),
                wall.as_deref(),
                grace.as_deref(),
                processes,
                config.default_grace_period,
            )?;
            let mut options = cli::options_from_args(mode.as_deref(), name, capture, keep_children)?;
            // Ctrl-C tears the child down instead of orphaning it
            options.cancel = Some(limitbox::CancelToken::watch_signals()?);
            let call = cli::call_from_args(&task, &args);
            log::info!("Running '{}' with limits {:?}", task, limits);

            let orchestrator = Orchestrator::with_registry(config, registry);
            let request = limitbox::ExecutionRequest::new(limitbox::Target::<serde_json::Value>::named(call))
                .with_limits(limits)
                .with_options(options);
            let execution = orchestrator.run(request)?;

            let (status, value, failure) = match &execution.outcome {
                Outcome::Success(value) => ("success", Some(value.clone()), None),
                Outcome::Failure(failure) => ("failure", None, Some(failure)),
                Outcome::Empty => ("empty", None, None),
            };
            let json_result = serde_json::json!({
                "status": status,
                "value": value,
                "kind": failure.map(|f| f.kind.to_string()),
                "message": failure.map(|f| f.message.clone()),
                "error": failure.and_then(|f| f.error.as_ref()).map(TaskError::to_string),
                "report": execution.report,
            });
            println!("{}", serde_json::to_string_pretty(&json_result)?);

            if !execution.outcome.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

#[cfg(not(unix))]
fn main() -> Result<()> {
    env_logger::init();
    anyhow::bail!("limitbox needs a Unix host to run tasks")
}
