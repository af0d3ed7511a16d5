use limitbox::{
    submit, Call, ErrorMatcher, ExecutionOptions, FailureKind, ResourceLimits, SandboxError, SpawnMode, Target,
    TaskError, WrapErrors, WrapTarget,
};
use serial_test::serial;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
struct CustomException(String);

impl fmt::Display for CustomException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CustomException {}

fn raise_custom() -> Target<u8> {
    Target::closure(|| Err(CustomException("apple".to_string()).into()))
}

#[test]
#[serial]
fn test_custom_error_surfaces_as_task_error() {
    let result = submit(raise_custom(), ResourceLimits::unlimited(), ExecutionOptions::default());
    match result {
        Err(SandboxError::Task(err)) => {
            assert_eq!(err.short_name(), "CustomException");
            assert_eq!(err.message(), "apple");
            assert!(err.is::<CustomException>(), "Type name should match: {}", err.type_name());
        }
        other => panic!("Expected the task's own error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_named_task_error_keeps_type_and_message() {
    for mode in [SpawnMode::CopyOnWrite, SpawnMode::FreshProcess] {
        let sandbox = crate::create_test_sandbox(mode);
        let result = sandbox.call::<u8>(Call::new("fail").arg("apple").unwrap());
        let err = result.expect_err("Task should fail");
        let task_error = err.task_error().expect("Should carry the task error");
        assert_eq!(task_error.short_name(), "CustomException", "Mode {}", mode);
        assert_eq!(task_error.message(), "apple", "Mode {}", mode);
    }
}

#[test]
#[serial]
fn test_io_errno_survives_the_boundary() {
    let result = submit(
        Target::closure(|| {
            std::fs::read("/definitely/not/here")?;
            Ok(())
        }),
        ResourceLimits::unlimited(),
        ExecutionOptions::default(),
    );
    let err = result.expect_err("Read should fail");
    let task_error = err.task_error().expect("Should carry the task error");
    assert_eq!(task_error.errno(), Some(libc::ENOENT));
    assert_eq!(task_error.short_name(), "Error");
}

#[test]
#[serial]
fn test_panic_becomes_task_error() {
    let result = submit(
        Target::closure(|| -> Result<u8, TaskError> { panic!("kaboom") }),
        ResourceLimits::unlimited(),
        ExecutionOptions::default(),
    );
    match result {
        Err(SandboxError::Task(err)) => {
            assert_eq!(err.type_name(), "panic");
            assert_eq!(err.message(), "kaboom");
            assert!(err.traceback().is_some(), "Panics carry a backtrace");
        }
        other => panic!("Expected a panic report, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_wrap_all_errors() {
    let options = ExecutionOptions {
        wrap_errors: WrapErrors::All,
        ..ExecutionOptions::default()
    };
    let result = submit(raise_custom(), ResourceLimits::unlimited(), options);
    match result {
        Err(SandboxError::Limit(failure)) => {
            assert!(failure.wrapped);
            assert_eq!(failure.error.map(|e| e.message().to_string()), Some("apple".to_string()));
        }
        other => panic!("Expected a wrapped failure, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_wrap_named_errors_only() {
    let options = ExecutionOptions {
        wrap_errors: WrapErrors::Named(vec![ErrorMatcher::of::<CustomException>()]),
        ..ExecutionOptions::default()
    };
    let result = submit(raise_custom(), ResourceLimits::unlimited(), options.clone());
    assert!(matches!(result, Err(SandboxError::Limit(_))), "Matched error should be wrapped: {:?}", result);

    let result = submit(
        Target::closure(|| Err::<u8, _>(TaskError::new("ValueError", "nope"))),
        ResourceLimits::unlimited(),
        options,
    );
    assert!(matches!(result, Err(SandboxError::Task(_))), "Other errors pass through: {:?}", result);
}

#[test]
#[serial]
fn test_wrap_per_limit_reclassifies() {
    let mut map = HashMap::new();
    map.insert(WrapTarget::WallTime, vec![ErrorMatcher::name("CustomException")]);
    let options = ExecutionOptions {
        wrap_errors: WrapErrors::PerLimit(map),
        ..ExecutionOptions::default()
    };
    let limits = ResourceLimits::unlimited().wall_time(10u64).unwrap();
    let result = submit(raise_custom(), limits, options);
    match result {
        Err(err) => assert_eq!(err.failure_kind(), Some(FailureKind::WallTimeExceeded), "Got {}", err),
        Ok(outcome) => panic!("Expected a reclassified failure, got {:?}", outcome),
    }
}

#[test]
#[serial]
fn test_errors_without_raises_return_empty() {
    let options = ExecutionOptions {
        raises: false,
        ..ExecutionOptions::default()
    };
    let result = submit(raise_custom(), ResourceLimits::unlimited(), options);
    assert_eq!(result.expect("raises=false swallows the error"), limitbox::Outcome::Empty);
}
