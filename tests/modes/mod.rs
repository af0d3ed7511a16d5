use limitbox::{
    Call, ExecutionOptions, FailureKind, Orchestrator, Outcome, ResourceLimits, SandboxError, SpawnMode, Target,
};
use serde_json::{json, Value};
use serial_test::serial;

const ALL_MODES: [SpawnMode; 3] = [SpawnMode::CopyOnWrite, SpawnMode::FreshProcess, SpawnMode::PreforkedPool];

#[test]
#[serial]
fn test_echo_in_every_mode() {
    for mode in ALL_MODES {
        let sandbox = crate::create_test_sandbox(mode);
        let call = Call::new("echo").arg(json!({"fruit": "apple", "count": 3})).unwrap();
        let result = sandbox.call::<Value>(call);
        assert_eq!(
            result.expect("Echo should succeed"),
            Outcome::Success(json!({"fruit": "apple", "count": 3})),
            "Mode {}",
            mode
        );
    }
}

#[test]
#[serial]
fn test_closures_need_fork_mode() {
    for mode in [SpawnMode::FreshProcess, SpawnMode::PreforkedPool] {
        let sandbox = crate::create_test_sandbox(mode);
        let result = sandbox.submit(Target::closure(|| Ok(1u8)));
        assert!(matches!(result, Err(SandboxError::Config(_))), "Mode {}: {:?}", mode, result);
    }
}

#[test]
#[serial]
fn test_unknown_task_is_reported() {
    for mode in ALL_MODES {
        let sandbox = crate::create_test_sandbox(mode);
        let err = sandbox.call::<Value>(Call::new("no_such_task")).expect_err("Unknown task");
        let task_error = err.task_error().expect("Should carry the task error");
        assert_eq!(task_error.type_name(), "UnknownTask", "Mode {}", mode);
    }
}

#[test]
#[serial]
fn test_exit_without_reply_is_classified() {
    for mode in [SpawnMode::CopyOnWrite, SpawnMode::FreshProcess] {
        let sandbox = crate::create_test_sandbox(mode);
        let err = sandbox.call::<Value>(Call::new("exit").arg(3).unwrap()).expect_err("Exit 3");
        assert_eq!(err.failure_kind(), Some(FailureKind::Unclassified), "Mode {}: {}", mode, err);

        let err = sandbox.call::<Value>(Call::new("exit").arg(0).unwrap()).expect_err("Exit 0");
        assert_eq!(err.failure_kind(), Some(FailureKind::InternalError), "Mode {}: {}", mode, err);
    }
}

#[test]
#[serial]
fn test_pool_reuses_orchestrator_across_calls() {
    let orchestrator = Orchestrator::with_registry(
        crate::test_config(SpawnMode::PreforkedPool),
        crate::test_registry(),
    );
    let mut pids = Vec::new();
    for round in 0..3 {
        let request = limitbox::ExecutionRequest::new(Target::<Value>::named(Call::new("echo").arg(round).unwrap()));
        let execution = orchestrator.run(request).expect("Pool run");
        assert_eq!(execution.outcome, Outcome::Success(json!(round)));
        pids.push(execution.report.pid.expect("Pool child pid"));
    }
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 3, "Each call gets its own worker");
}

#[test]
#[serial]
fn test_pool_enforces_wall_time() {
    let sandbox = crate::create_test_sandbox(SpawnMode::PreforkedPool);
    let limits = ResourceLimits::unlimited().wall_time(1u64).unwrap();
    let result = sandbox.submit_with::<f64>(
        Target::named(Call::new("sleep").arg(5).unwrap()),
        limits,
        ExecutionOptions::default(),
    );
    assert_eq!(result.expect_err("Sleep outlives the limit").failure_kind(), Some(FailureKind::WallTimeExceeded));
}

#[test]
#[serial]
fn test_missing_worker_program_is_a_subprocess_error() {
    let config = crate::test_config(SpawnMode::FreshProcess).with_worker_program("/nonexistent/limitbox-worker");
    let orchestrator = Orchestrator::with_registry(config, crate::test_registry());
    let request = limitbox::ExecutionRequest::new(Target::<Value>::named(Call::new("echo")));
    let execution = orchestrator.run(request).expect("Spawn failures come back as outcomes");
    assert_eq!(execution.outcome.kind(), Some(FailureKind::SubprocessError(libc::ENOENT)));
}
