use limitbox::{
    submit, Call, ExecutionOptions, FailureKind, Outcome, ResourceLimits, SandboxError, SpawnMode, Target, TaskError,
};
use serial_test::serial;
use std::time::{Duration, Instant};

const MIB: usize = 1 << 20;

fn allocate_in_closure(mib: usize) -> Target<usize> {
    Target::closure(move || {
        let mut buffer: Vec<u8> = Vec::new();
        buffer.try_reserve_exact(mib * MIB)?;
        buffer.resize(mib * MIB, 1);
        Ok(std::hint::black_box(buffer).len())
    })
}

fn expect_kind<T: std::fmt::Debug>(result: limitbox::Result<Outcome<T>>, kind: FailureKind) {
    match result {
        Err(err) => assert_eq!(err.failure_kind(), Some(kind), "Unexpected failure: {}", err),
        Ok(outcome) => panic!("Expected {:?}, got {:?}", kind, outcome),
    }
}

#[test]
#[serial]
fn test_memory_limit_in_fork_mode() {
    if !limitbox::supports("memory").unwrap() {
        return;
    }
    let limits = ResourceLimits::unlimited().memory((50u64, "MB")).unwrap();
    let result = submit(allocate_in_closure(200), limits, ExecutionOptions::default());
    expect_kind(result, FailureKind::MemoryLimitExceeded);
}

#[test]
#[serial]
fn test_memory_limit_in_fresh_process() {
    if !limitbox::supports("memory").unwrap() {
        return;
    }
    let sandbox = crate::create_test_sandbox(SpawnMode::FreshProcess)
        .with_limits(ResourceLimits::unlimited().memory((50u64, "MB")).unwrap())
        .unwrap();
    let result = sandbox.call::<usize>(Call::new("allocate").arg(200).unwrap());
    expect_kind(result, FailureKind::MemoryLimitExceeded);
}

#[test]
#[serial]
fn test_small_allocation_fits_under_memory_limit() {
    if !limitbox::supports("memory").unwrap() {
        return;
    }
    let sandbox = crate::create_test_sandbox(SpawnMode::FreshProcess)
        .with_limits(ResourceLimits::unlimited().memory((200u64, "MB")).unwrap())
        .unwrap();
    let result = sandbox.call::<usize>(Call::new("allocate").arg(10).unwrap());
    assert_eq!(result.expect("10 MiB should fit"), Outcome::Success(10 * MIB));
}

#[test]
#[serial]
fn test_memory_errors_left_alone_when_not_wrapped() {
    if !limitbox::supports("memory").unwrap() {
        return;
    }
    let limits = ResourceLimits::unlimited().memory((50u64, "MB")).unwrap();
    let options = ExecutionOptions {
        wrap_memory_errors: false,
        ..ExecutionOptions::default()
    };
    let result = submit(allocate_in_closure(200), limits, options);
    match result {
        Err(SandboxError::Task(err)) => assert_eq!(err.short_name(), "TryReserveError"),
        // The allocator may abort before try_reserve gets a say
        Err(err) => assert_eq!(err.failure_kind(), Some(FailureKind::MemoryLimitExceeded), "Got {}", err),
        Ok(outcome) => panic!("Allocation should not succeed: {:?}", outcome),
    }
}

#[test]
#[serial]
fn test_cpu_time_limit() {
    let limits = ResourceLimits::unlimited().cpu_time(1u64).unwrap();
    let start = Instant::now();
    let result = submit(
        Target::closure(|| {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut counter = 0u64;
            while Instant::now() < deadline {
                counter = std::hint::black_box(counter.wrapping_add(1));
            }
            Ok(counter)
        }),
        limits,
        ExecutionOptions::default(),
    );
    expect_kind(result, FailureKind::CpuTimeExceeded);
    assert!(start.elapsed() < Duration::from_secs(6), "CPU limit took {:?}", start.elapsed());
}

#[test]
#[serial]
fn test_cpu_time_limit_in_fresh_process() {
    let sandbox = crate::create_test_sandbox(SpawnMode::FreshProcess)
        .with_limits(ResourceLimits::unlimited().cpu_time(1u64).unwrap())
        .unwrap();
    let result = sandbox.call::<u64>(Call::new("spin").arg(10).unwrap());
    expect_kind(result, FailureKind::CpuTimeExceeded);
}

#[test]
#[serial]
fn test_wall_time_limit() {
    let limits = ResourceLimits::unlimited().wall_time(1u64).unwrap();
    let start = Instant::now();
    let result = submit(
        Target::closure(|| {
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        }),
        limits,
        ExecutionOptions::default(),
    );
    let elapsed = start.elapsed();
    expect_kind(result, FailureKind::WallTimeExceeded);
    assert!(elapsed >= Duration::from_secs(1), "Returned before the limit: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "Wall limit overshot: {:?}", elapsed);
}

#[test]
#[serial]
fn test_sleep_does_not_count_as_cpu_time() {
    let limits = ResourceLimits::unlimited().cpu_time(1u64).unwrap();
    let result = submit(
        Target::closure(|| {
            std::thread::sleep(Duration::from_millis(1500));
            Ok("rested".to_string())
        }),
        limits,
        ExecutionOptions::default(),
    );
    assert_eq!(result.expect("Sleeping uses no CPU"), Outcome::Success("rested".to_string()));
}

#[test]
#[serial]
fn test_limits_without_raises_return_empty() {
    let limits = ResourceLimits::unlimited().wall_time(1u64).unwrap();
    let options = ExecutionOptions {
        raises: false,
        ..ExecutionOptions::default()
    };
    let result = submit(
        Target::closure(|| {
            std::thread::sleep(Duration::from_secs(5));
            Ok(1u8)
        }),
        limits,
        options,
    );
    assert_eq!(result.expect("raises=false never errors on failure"), Outcome::Empty);
}

#[test]
#[serial]
fn test_run_reports_failure_outcome() {
    let sandbox = crate::create_test_sandbox(SpawnMode::CopyOnWrite)
        .with_limits(ResourceLimits::unlimited().wall_time(1u64).unwrap())
        .unwrap();
    let execution = sandbox
        .run::<f64>(Target::named(Call::new("sleep").arg(5).unwrap()))
        .expect("Run returns failures as outcomes");
    assert_eq!(execution.outcome.kind(), Some(FailureKind::WallTimeExceeded));
    assert!(execution.report.still_alive.is_empty(), "Nothing should survive: {:?}", execution.report);
}

#[test]
fn test_zero_limits_are_rejected() {
    let limits = ResourceLimits {
        wall_time: Some(0),
        ..ResourceLimits::default()
    };
    let result = submit(Target::closure(|| Ok::<_, TaskError>(1u8)), limits, ExecutionOptions::default());
    assert!(matches!(result, Err(SandboxError::Config(_))), "Got {:?}", result);
}
