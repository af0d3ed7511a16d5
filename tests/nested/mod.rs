use limitbox::{submit, ExecutionOptions, FailureKind, ResourceLimits, SandboxError, Target};
use serial_test::serial;
use std::time::Duration;

fn sleepy_inner(limits: ResourceLimits) -> limitbox::Result<limitbox::Outcome<()>> {
    submit(
        Target::closure(|| {
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        }),
        limits,
        ExecutionOptions::default(),
    )
}

#[test]
#[serial]
fn test_inner_failure_kind_reaches_outer_caller() {
    let result = submit(
        Target::closure(|| {
            let inner = sleepy_inner(ResourceLimits::unlimited().wall_time(1u64)?);
            Ok(inner.err().and_then(|e| e.failure_kind()))
        }),
        ResourceLimits::unlimited().wall_time(10u64).unwrap(),
        ExecutionOptions::default(),
    );
    assert_eq!(
        result.expect("Outer call should succeed"),
        limitbox::Outcome::Success(Some(FailureKind::WallTimeExceeded))
    );
}

#[test]
#[serial]
fn test_inner_error_propagates_through_outer() {
    let result = submit(
        Target::closure(|| {
            sleepy_inner(ResourceLimits::unlimited().wall_time(1u64)?)?;
            Ok(())
        }),
        ResourceLimits::unlimited().wall_time(10u64).unwrap(),
        ExecutionOptions::default(),
    );
    match result {
        Err(SandboxError::Task(err)) => {
            assert_eq!(err.short_name(), "SandboxError");
            assert!(err.message().contains("wall time"), "Inner message kept: {}", err.message());
        }
        other => panic!("Expected the inner failure as a task error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_outer_limit_kills_inner_tree() {
    let pid_file = tempfile::NamedTempFile::new().expect("Temp file");
    let path = pid_file.path().to_path_buf();
    let result = submit(
        Target::closure(move || {
            submit(
                Target::closure(move || {
                    std::fs::write(&path, std::process::id().to_string())?;
                    std::thread::sleep(Duration::from_secs(30));
                    Ok(())
                }),
                ResourceLimits::unlimited(),
                ExecutionOptions::default(),
            )?;
            Ok(())
        }),
        ResourceLimits::unlimited().wall_time(1u64).unwrap(),
        ExecutionOptions::default(),
    );
    assert_eq!(result.expect_err("Outer wall limit").failure_kind(), Some(FailureKind::WallTimeExceeded));

    let inner_pid: i32 = std::fs::read_to_string(pid_file.path())
        .expect("Inner child wrote its pid")
        .trim()
        .parse()
        .expect("Pid");
    assert!(
        crate::wait_until_gone(inner_pid, Duration::from_secs(3)),
        "Inner child {} outlived the outer call",
        inner_pid
    );
}
