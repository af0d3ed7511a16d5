/// Process tree reaping
///
/// Finds every descendant of a child, signals them, waits, escalates to
/// SIGKILL and reports who is still around. The calling process and its own
/// process group are never targeted.
use crate::types::{Result, SandboxError};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgrp, getpid, Pid};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Who went away and who did not
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub terminated: Vec<i32>,
    pub still_alive: Vec<i32>,
}

impl ReapReport {
    pub fn is_clean(&self) -> bool {
        self.still_alive.is_empty()
    }
}

/// Signal `root`'s tree with `signal`, wait up to `timeout`, then SIGKILL survivors.
///
/// The tree is snapshotted before anything is signalled so that orphans are
/// still found. The process group led by `root` is signalled as well.
pub fn terminate(root: i32, include_root: bool, signal: Signal, timeout: Duration) -> ReapReport {
    let me = getpid().as_raw();
    let mut targets: Vec<i32> = descendants(root)
        .into_iter()
        .filter(|&pid| pid != me && pid > 1)
        .collect();
    if include_root && root != me && root > 1 {
        targets.insert(0, root);
    }
    let group = owned_group(root);

    log::debug!(
        "Terminating {} process(es) under {} with {:?} (group: {:?})",
        targets.len(),
        root,
        signal,
        group
    );

    let mut pending = send_signal(&targets, group, signal);
    let mut report = ReapReport::default();

    if !pending.is_empty() && signal != Signal::SIGKILL {
        pending = wait_for_exit(pending, timeout, &mut report);
        if !pending.is_empty() {
            log::debug!("{} process(es) ignored {:?}, escalating", pending.len(), signal);
            pending = send_signal(&pending, group, Signal::SIGKILL);
        }
    }
    let pending = wait_for_exit(pending, timeout, &mut report);

    for pid in &targets {
        if !pending.contains(pid) && !report.terminated.contains(pid) {
            report.terminated.push(*pid);
        }
    }
    report.still_alive = pending;
    if !report.is_clean() {
        log::warn!("Processes still alive after reaping: {:?}", report.still_alive);
    }
    report
}

/// Deliver `signal` to `root` and the process group it leads, without waiting
pub fn interrupt(root: i32, signal: Signal) {
    if root <= 1 || root == getpid().as_raw() {
        return;
    }
    log::debug!("Interrupting {} with {:?}", root, signal);
    send_signal(&[root], owned_group(root), signal);
}

/// Kill every descendant of the calling process
pub fn terminate_own_children(timeout: Duration) -> ReapReport {
    terminate(getpid().as_raw(), false, Signal::SIGTERM, timeout)
}

/// The group `root` leads, unless it is the caller's own group
fn owned_group(root: i32) -> Option<Pid> {
    if root <= 1 || Pid::from_raw(root) == getpgrp() {
        None
    } else {
        Some(Pid::from_raw(root))
    }
}

/// Returns the targets that may still be alive
fn send_signal(targets: &[i32], group: Option<Pid>, signal: Signal) -> Vec<i32> {
    if let Some(group) = group {
        match signal::killpg(group, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to signal process group {}: {}", group, e),
        }
    }

    let mut pending = Vec::new();
    for &pid in targets {
        match signal::kill(Pid::from_raw(pid), signal) {
            Ok(()) => pending.push(pid),
            Err(Errno::ESRCH) => {}
            Err(e) => {
                log::warn!("Failed to send {:?} to {}: {}", signal, pid, e);
                pending.push(pid);
            }
        }
    }
    pending
}

fn wait_for_exit(mut pending: Vec<i32>, timeout: Duration, report: &mut ReapReport) -> Vec<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        pending.retain(|&pid| {
            if is_process_alive(pid) {
                true
            } else {
                report.terminated.push(pid);
                false
            }
        });
        if pending.is_empty() || Instant::now() >= deadline {
            return pending;
        }
        thread::sleep(WAIT_INTERVAL);
    }
}

/// Alive means running or stopped; zombies count as gone.
/// Exit status of our own children is left for the owner to collect.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match peek_child(pid) {
        Ok(true) => return false,
        Ok(false) => return true,
        Err(_) => {}
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Err(Errno::ESRCH) => false,
        _ => !is_zombie(pid),
    }
}

/// `Ok(true)` when our child `pid` has exited, without reaping it
fn peek_child(pid: i32) -> std::result::Result<bool, Errno> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(unsafe { info.si_pid() } != 0)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    proc_stat(pid).map_or(false, |stat| stat.state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}

/// Every process below `root`, plus the members of the group `root` leads
pub fn descendants(root: i32) -> Vec<i32> {
    let mut found = BTreeSet::new();
    let group = owned_group(root);

    #[cfg(target_os = "linux")]
    {
        let table = process_table();
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for (&pid, stat) in &table {
            children.entry(stat.ppid).or_default().push(pid);
            if group.map_or(false, |g| g.as_raw() == stat.pgrp) && pid != root {
                found.insert(pid);
            }
        }
        walk(root, &mut found, |pid| children.get(&pid).cloned().unwrap_or_default());
    }

    #[cfg(target_os = "macos")]
    {
        let _ = group;
        walk(root, &mut found, list_child_pids);
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        // Only the process group is visible here; killpg covers its members
        let _ = group;
    }

    found.into_iter().collect()
}

#[allow(dead_code)]
fn walk<F>(root: i32, found: &mut BTreeSet<i32>, mut children_of: F)
where
    F: FnMut(i32) -> Vec<i32>,
{
    let mut queue = VecDeque::from([root]);
    let mut seen = BTreeSet::from([root]);
    while let Some(pid) = queue.pop_front() {
        for child in children_of(pid) {
            if seen.insert(child) {
                found.insert(child);
                queue.push_back(child);
            }
        }
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, PartialEq)]
struct ProcStat {
    state: char,
    ppid: i32,
    pgrp: i32,
}

/// Parse `/proc/<pid>/stat`; the command name may contain spaces and parens
#[cfg(target_os = "linux")]
fn parse_stat(content: &str) -> Option<ProcStat> {
    let after = &content[content.rfind(')')? + 1..];
    let mut fields = after.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { state, ppid, pgrp })
}

#[cfg(target_os = "linux")]
fn proc_stat(pid: i32) -> Option<ProcStat> {
    let content = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&content)
}

#[cfg(target_os = "linux")]
fn process_table() -> HashMap<i32, ProcStat> {
    let mut table = HashMap::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Failed to read /proc: {}", e);
            return table;
        }
    };
    for entry in entries.flatten() {
        let pid: i32 = match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        if let Some(stat) = proc_stat(pid) {
            table.insert(pid, stat);
        }
    }
    table
}

#[cfg(target_os = "macos")]
fn list_child_pids(pid: i32) -> Vec<i32> {
    let mut buffer = vec![0 as libc::pid_t; 1024];
    let count = unsafe {
        libc::proc_listchildpids(
            pid,
            buffer.as_mut_ptr() as *mut libc::c_void,
            (buffer.len() * std::mem::size_of::<libc::pid_t>()) as libc::c_int,
        )
    };
    if count <= 0 {
        return Vec::new();
    }
    buffer.truncate(count as usize);
    buffer.retain(|&p| p > 0);
    buffer
}

/// RAII wrapper that reaps a child's tree if nobody else did
pub struct ProcessGuard {
    root: i32,
    timeout: Duration,
    armed: bool,
}

impl ProcessGuard {
    pub fn new(root: i32, timeout: Duration) -> Self {
        Self {
            root,
            timeout,
            armed: true,
        }
    }

    pub fn pid(&self) -> i32 {
        self.root
    }

    /// Reap the whole tree now and disarm
    pub fn reap(&mut self, signal: Signal) -> ReapReport {
        self.armed = false;
        terminate(self.root, true, signal, self.timeout)
    }

    /// Reap only the descendants, leaving the root to its owner
    pub fn reap_descendants(&self, signal: Signal) -> ReapReport {
        terminate(self.root, false, signal, self.timeout)
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let report = terminate(self.root, true, Signal::SIGKILL, self.timeout);
        if let Err(e) = collect_zombie(self.root, self.timeout) {
            log::warn!("Failed to collect {} during drop: {}", self.root, e);
        }
        if !report.is_clean() {
            log::warn!("Cleanup during drop left {:?} alive", report.still_alive);
        }
    }
}

/// Wait for our child `pid` to be collectable and collect it
pub fn collect_zombie(pid: i32, timeout: Duration) -> Result<()> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) if Instant::now() < deadline => thread::sleep(WAIT_INTERVAL),
            Ok(WaitStatus::StillAlive) => {
                return Err(SandboxError::Process(format!("{} did not exit in time", pid)))
            }
            Ok(_) | Err(Errno::ECHILD) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SandboxError::Process(format!("waitpid({}) failed: {}", pid, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_stat_with_odd_name() {
        let stat = parse_stat("4242 (my (weird) proc) S 17 4242 4242 0 -1").unwrap();
        assert_eq!(
            stat,
            ProcStat {
                state: 'S',
                ppid: 17,
                pgrp: 4242
            }
        );
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    #[serial]
    fn test_never_targets_self() {
        let report = terminate(getpid().as_raw(), true, Signal::SIGTERM, Duration::from_millis(50));
        assert!(!report.terminated.contains(&getpid().as_raw()));
        assert!(!report.still_alive.contains(&getpid().as_raw()));
    }

    #[test]
    fn test_missing_process_counts_as_terminated() {
        assert!(!is_process_alive(i32::MAX - 1));
        let report = terminate(i32::MAX - 1, true, Signal::SIGTERM, Duration::from_millis(50));
        assert!(report.is_clean());
    }

    #[test]
    #[serial]
    fn test_terminate_child_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(is_process_alive(pid));

        let report = terminate(pid, true, Signal::SIGTERM, Duration::from_secs(1));
        assert!(report.is_clean(), "Child should be gone: {:?}", report);
        assert!(report.terminated.contains(&pid));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    #[serial]
    fn test_guard_reaps_on_drop() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        {
            let _guard = ProcessGuard::new(pid, Duration::from_secs(1));
        }
        assert!(!is_process_alive(pid));
        drop(child);
    }
}
