use limitbox::cleanup;
use limitbox::{submit, Call, ExecutionOptions, FailureKind, ResourceLimits, SpawnMode, Target};
use serial_test::serial;
use std::process::Command;
use std::time::Duration;

#[test]
#[serial]
fn test_descendants_reaped_after_success() {
    for mode in [SpawnMode::CopyOnWrite, SpawnMode::FreshProcess, SpawnMode::PreforkedPool] {
        let sandbox = crate::create_test_sandbox(mode);
        let result = sandbox.call::<i32>(Call::new("spawn_sleeper").arg(30).unwrap());
        let sleeper = result.expect("Task should succeed").success().expect("Sleeper pid");
        assert!(
            crate::wait_until_gone(sleeper, Duration::from_secs(3)),
            "Mode {}: sleeper {} leaked",
            mode,
            sleeper
        );
    }
}

#[test]
#[serial]
fn test_descendants_reaped_after_wall_timeout() {
    let pid_file = tempfile::NamedTempFile::new().expect("Temp file");
    let path = pid_file.path().to_path_buf();
    let result = submit(
        Target::closure(move || {
            let child = Command::new("sleep").arg("30").spawn()?;
            std::fs::write(&path, child.id().to_string())?;
            std::thread::sleep(Duration::from_secs(10));
            Ok(())
        }),
        ResourceLimits::unlimited().wall_time(1u64).unwrap(),
        ExecutionOptions::default(),
    );
    assert_eq!(result.expect_err("Wall limit").failure_kind(), Some(FailureKind::WallTimeExceeded));

    let sleeper: i32 = std::fs::read_to_string(pid_file.path())
        .expect("Pid file")
        .trim()
        .parse()
        .expect("Pid");
    assert!(crate::wait_until_gone(sleeper, Duration::from_secs(3)), "Sleeper {} leaked", sleeper);
}

#[test]
#[serial]
fn test_keep_children_leaves_descendants_running() {
    let sandbox = crate::create_test_sandbox(SpawnMode::CopyOnWrite).with_options(ExecutionOptions {
        terminate_children: false,
        ..ExecutionOptions::default()
    });
    let sleeper = sandbox
        .call::<i32>(Call::new("spawn_sleeper").arg(30).unwrap())
        .expect("Task should succeed")
        .success()
        .expect("Sleeper pid");

    assert!(cleanup::is_process_alive(sleeper), "Sleeper should survive with terminate_children off");
    let report = cleanup::terminate(sleeper, true, nix::sys::signal::Signal::SIGKILL, Duration::from_secs(1));
    assert!(report.is_clean(), "Manual cleanup failed: {:?}", report);
}

#[test]
#[serial]
fn test_no_children_left_after_many_calls() {
    for _ in 0..5 {
        let result = submit(Target::closure(|| Ok(1u8)), ResourceLimits::unlimited(), ExecutionOptions::default());
        assert!(result.is_ok(), "Call failed: {:?}", result);
    }
    let me = nix::unistd::getpid().as_raw();
    let leftovers = cleanup::descendants(me);
    assert!(leftovers.is_empty(), "Calls left processes behind: {:?}", leftovers);
}
