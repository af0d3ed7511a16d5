use limitbox::{
    submit, CancelToken, Call, ExecutionOptions, Outcome, ResourceLimits, SandboxError, SpawnMode, Target,
};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serial_test::serial;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_unconstrained_call_returns_value() {
    let direct = (1..=10u64).product::<u64>();
    let result = submit(
        Target::closure(|| Ok((1..=10u64).product::<u64>())),
        ResourceLimits::unlimited(),
        ExecutionOptions::default(),
    );
    assert!(result.is_ok(), "Should run without limits: {:?}", result);
    assert_eq!(result.unwrap(), Outcome::Success(direct));
}

#[test]
#[serial]
fn test_unit_result_is_not_empty() {
    let result = submit(Target::closure(|| Ok(())), ResourceLimits::unlimited(), ExecutionOptions::default())
        .expect("Closure should run");
    assert_eq!(result, Outcome::Success(()));
    assert!(!result.is_empty(), "Success(()) must differ from Empty");

    let result = submit(
        Target::closure(|| Ok(None::<u32>)),
        ResourceLimits::unlimited(),
        ExecutionOptions::default(),
    )
    .expect("Closure should run");
    assert_eq!(result, Outcome::Success(None));
}

#[test]
#[serial]
fn test_named_task_runs_in_fork_mode() {
    let sandbox = crate::create_test_sandbox(SpawnMode::CopyOnWrite);
    let call = Call::new("echo").arg("apple").expect("Serializable argument");
    let result = sandbox.call::<String>(call);
    assert_eq!(result.expect("Echo should succeed"), Outcome::Success("apple".to_string()));
}

#[test]
#[serial]
fn test_captured_output_lands_in_report() {
    let sandbox = crate::create_test_sandbox(SpawnMode::CopyOnWrite).with_options(ExecutionOptions {
        capture_output: true,
        ..ExecutionOptions::default()
    });
    let execution = sandbox
        .run(Target::closure(|| {
            println!("hello from the child");
            eprintln!("and its stderr");
            Ok(7u8)
        }))
        .expect("Run should complete");

    assert_eq!(execution.outcome, Outcome::Success(7));
    let stdout = execution.report.stdout.unwrap_or_default();
    let stderr = execution.report.stderr.unwrap_or_default();
    assert!(stdout.contains("hello from the child"), "Captured stdout: {:?}", stdout);
    assert!(stderr.contains("and its stderr"), "Captured stderr: {:?}", stderr);
}

#[test]
#[serial]
fn test_report_carries_usage() {
    let sandbox = crate::create_test_sandbox(SpawnMode::CopyOnWrite);
    let execution = sandbox
        .run::<u64>(Target::named(Call::new("spin").arg(0.5).expect("Serializable argument")))
        .expect("Run should complete");

    assert!(execution.outcome.is_success(), "Spin should succeed: {:?}", execution.outcome);
    let report = execution.report;
    let usage = report.usage.expect("Usage should be recorded once the child is reaped");
    assert!(usage.cpu_time() > 0.2, "Child should have used CPU: {:?}", usage);
    assert!(report.wall_time >= 0.5, "Wall time covers the spin: {}", report.wall_time);
    assert!(report.pid.is_some());
}

#[test]
#[serial]
fn test_cancel_token_stops_the_call() {
    let token = CancelToken::new();
    let canceller = token.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        canceller.cancel();
    });

    let start = Instant::now();
    let result = submit(
        Target::closure(|| {
            std::thread::sleep(Duration::from_secs(10));
            Ok(())
        }),
        ResourceLimits::unlimited(),
        ExecutionOptions {
            cancel: Some(token),
            ..ExecutionOptions::default()
        },
    );
    handle.join().expect("Canceller thread");

    assert!(
        matches!(result, Err(SandboxError::Cancelled { signal: None })),
        "Should be cancelled: {:?}",
        result
    );
    assert!(start.elapsed() < Duration::from_secs(5), "Cancellation took {:?}", start.elapsed());
}

#[test]
#[serial]
fn test_cancelled_token_never_spawns() {
    let token = CancelToken::new();
    token.cancel();
    let result = submit(
        Target::closure(|| Ok(1u8)),
        ResourceLimits::unlimited(),
        ExecutionOptions {
            cancel: Some(token),
            ..ExecutionOptions::default()
        },
    );
    assert!(matches!(result, Err(SandboxError::Cancelled { .. })), "Got {:?}", result);
}

static HOST_SIGTERMS: AtomicI32 = AtomicI32::new(0);

extern "C" fn count_sigterm(_signal: libc::c_int) {
    HOST_SIGTERMS.fetch_add(1, Ordering::SeqCst);
}

#[test]
#[serial]
fn test_signal_watch_ends_with_its_token() {
    let host = SigAction::new(SigHandler::Handler(count_sigterm), SaFlags::empty(), SigSet::empty());
    let original = unsafe { sigaction(Signal::SIGTERM, &host) }.expect("Install host handler");
    HOST_SIGTERMS.store(0, Ordering::SeqCst);

    let token = CancelToken::watch_signals().expect("Watch signals");
    assert!(!token.is_cancelled());
    nix::sys::signal::raise(Signal::SIGTERM).expect("Raise SIGTERM");
    assert_eq!(token.signal(), Some(libc::SIGTERM));
    assert_eq!(HOST_SIGTERMS.load(Ordering::SeqCst), 1, "The host handler should still run");
    drop(token);

    let fresh = CancelToken::watch_signals().expect("Watch signals again");
    assert!(!fresh.is_cancelled(), "A new watch should not inherit the old interrupt");
    let result = submit(
        Target::closure(|| Ok(1u8)),
        ResourceLimits::unlimited(),
        ExecutionOptions {
            cancel: Some(fresh),
            ..ExecutionOptions::default()
        },
    );
    assert!(matches!(result, Ok(Outcome::Success(1))), "Should run normally: {:?}", result);

    // Every watching token is gone, so the host handler is installed directly again
    let current = unsafe { sigaction(Signal::SIGTERM, &original) }.expect("Restore original handler");
    assert!(
        matches!(current.handler(), SigHandler::Handler(h) if h as usize == count_sigterm as usize),
        "Host handler should be back: {:?}",
        current.handler()
    );
}

static MARKER_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn note_interrupt(_signal: libc::c_int) {
    let note = b"interrupted";
    unsafe {
        libc::write(
            MARKER_FD.load(Ordering::SeqCst),
            note.as_ptr() as *const libc::c_void,
            note.len(),
        );
        libc::_exit(0);
    }
}

#[test]
#[serial]
fn test_gentle_cancel_interrupts_the_child() {
    let dir = tempfile::tempdir().expect("Temp dir");
    let marker = dir.path().join("interrupted");
    let child_marker = marker.clone();

    let token = CancelToken::new();
    let canceller = token.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        canceller.cancel();
    });

    let start = Instant::now();
    let result = submit(
        Target::closure(move || {
            let file = std::fs::File::create(&child_marker)?;
            MARKER_FD.store(file.into_raw_fd(), Ordering::SeqCst);
            let action = SigAction::new(SigHandler::Handler(note_interrupt), SaFlags::empty(), SigSet::empty());
            unsafe { sigaction(Signal::SIGINT, &action) }?;
            std::thread::sleep(Duration::from_secs(30));
            Ok(())
        }),
        ResourceLimits::unlimited(),
        ExecutionOptions {
            cancel: Some(token),
            forceful_interrupt: false,
            ..ExecutionOptions::default()
        },
    );
    handle.join().expect("Canceller thread");

    assert!(
        matches!(result, Err(SandboxError::Cancelled { signal: None })),
        "Should be cancelled: {:?}",
        result
    );
    let note = std::fs::read_to_string(&marker).expect("Marker file");
    assert_eq!(note, "interrupted", "The child should have seen SIGINT");
    assert!(start.elapsed() < Duration::from_secs(5), "Cancellation took {:?}", start.elapsed());
}
