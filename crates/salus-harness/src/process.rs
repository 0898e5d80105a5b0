//! Process lifecycle primitives: spawning into a fresh process group, reaping with a timeout
//! and escalating termination of whole process trees.
//!
//! Descendants are discovered through `/proc`, so tree operations are Linux-only.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::runner::SpawnSpec;

pub type Pid = u32;

/// Default grace window between termination steps.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Int,
    Term,
    Kill,
}

impl Signal {
    fn raw(&self) -> libc::c_int {
        match self {
            Signal::Int => libc::SIGINT,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Sends `signal` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: Pid, signal: Signal) -> io::Result<()> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal.raw()) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Return code of an exited child: the exit code, or `-signal` when killed by a signal.
pub fn return_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s)).unwrap_or(-1)
}

/// Something that can be polled for exit and signalled.
pub trait Reapable {
    fn pid(&self) -> Pid;

    /// Returns the return code once the process has exited, without blocking.
    fn poll(&mut self) -> io::Result<Option<i32>>;

    fn signal(&self, signal: Signal) -> io::Result<()> {
        send_signal(self.pid(), signal)
    }
}

impl Reapable for Child {
    fn pid(&self) -> Pid {
        self.id()
    }

    fn poll(&mut self) -> io::Result<Option<i32>> {
        Ok(self.try_wait()?.map(return_code))
    }
}

/// A process we did not spawn ourselves, e.g. a grandchild. Its exit status is not
/// observable, so it reports 0 once `/proc` shows it gone or defunct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForeignProcess {
    pub pid: Pid,
}

impl Reapable for ForeignProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn poll(&mut self) -> io::Result<Option<i32>> {
        Ok(if is_running(self.pid) { None } else { Some(0) })
    }
}

/// Spawns `spec` in a new process group so that tree termination later reaches every descendant.
pub fn spawn(spec: &SpawnSpec, stdin: Stdio, stdout: Stdio, stderr: Stdio) -> io::Result<Child> {
    use std::os::unix::process::CommandExt;

    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(spec.env.iter())
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    let child = cmd.spawn()?;
    debug!("spawned pid {}: {}", child.id(), spec.argv.join(" "));
    Ok(child)
}

/// Polls `procs` until all have exited or `timeout` elapses, calling `on_exit` for every exit
/// as it is observed. Returns `(exited, still_alive)`.
///
/// A zero timeout polls exactly once, `None` blocks until every process has exited.
pub fn wait_any<P, F>(procs: Vec<P>, timeout: Option<Duration>, mut on_exit: F) -> (Vec<P>, Vec<P>)
where
    P: Reapable,
    F: FnMut(&mut P, i32),
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut alive = procs;
    let mut exited = Vec::new();
    loop {
        let mut still_alive = Vec::with_capacity(alive.len());
        for mut p in alive.drain(..) {
            match p.poll() {
                Ok(Some(code)) => {
                    on_exit(&mut p, code);
                    exited.push(p);
                }
                Ok(None) => still_alive.push(p),
                Err(e) => {
                    warn!("failed to poll pid {}: {}", p.pid(), e);
                    on_exit(&mut p, -1);
                    exited.push(p);
                }
            }
        }
        alive = still_alive;
        if alive.is_empty() {
            break;
        }
        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                POLL_INTERVAL.min(deadline - now)
            }
            None => POLL_INTERVAL,
        };
        thread::sleep(pause);
    }
    (exited, alive)
}

/// Sends SIGTERM, then SIGKILL after `grace`, then gives up after another `grace`.
/// Processes that survive are logged and left behind. Never fails.
pub fn terminate_hard<P, F>(procs: Vec<P>, grace: Duration, mut on_exit: F) -> Vec<P>
where
    P: Reapable,
    F: FnMut(&mut P, i32),
{
    if procs.is_empty() {
        return procs;
    }
    for p in procs.iter() {
        if let Err(e) = p.signal(Signal::Term) {
            debug!("failed to terminate pid {}: {}", p.pid(), e);
        }
    }
    let (_, alive) = wait_any(procs, Some(grace), &mut on_exit);
    if alive.is_empty() {
        return alive;
    }
    for p in alive.iter() {
        debug!("pid {} ignored SIGTERM, killing", p.pid());
        if let Err(e) = p.signal(Signal::Kill) {
            debug!("failed to kill pid {}: {}", p.pid(), e);
        }
    }
    let (_, alive) = wait_any(alive, Some(grace), &mut on_exit);
    if !alive.is_empty() {
        warn!(
            "giving up on processes that survived SIGKILL: {:?}",
            alive.iter().map(|p| p.pid()).collect::<Vec<_>>()
        );
    }
    alive
}

/// Signals every descendant of `leader` (and `leader` itself when `include_leader`), then waits
/// for them with `timeout`. Returns `(exited, still_alive)`.
pub fn kill_tree<F>(
    leader: Pid,
    signal: Signal,
    include_leader: bool,
    timeout: Option<Duration>,
    on_exit: F,
) -> Result<(Vec<ForeignProcess>, Vec<ForeignProcess>)>
where
    F: FnMut(&mut ForeignProcess, i32),
{
    if leader == std::process::id() {
        return Err(Error::RefuseSuicide);
    }
    let targets = tree(leader, include_leader);
    for p in targets.iter() {
        if let Err(e) = p.signal(signal) {
            debug!("failed to signal pid {}: {}", p.pid, e);
        }
    }
    Ok(wait_any(targets, timeout, on_exit))
}

/// [`terminate_hard`] applied to the whole process tree rooted at `leader`.
pub fn terminate_tree_hard(leader: Pid, include_leader: bool, grace: Duration) -> Result<Vec<ForeignProcess>> {
    if leader == std::process::id() {
        return Err(Error::RefuseSuicide);
    }
    Ok(terminate_hard(tree(leader, include_leader), grace, |_, _| {}))
}

/// Terminates every descendant of the current process.
pub fn reap_children<F>(grace: Duration, on_exit: F) -> Vec<ForeignProcess>
where
    F: FnMut(&mut ForeignProcess, i32),
{
    let procs = descendants(std::process::id())
        .into_iter()
        .map(|pid| ForeignProcess { pid })
        .collect::<Vec<_>>();
    terminate_hard(procs, grace, on_exit)
}

fn tree(leader: Pid, include_leader: bool) -> Vec<ForeignProcess> {
    let mut targets: Vec<_> = descendants(leader)
        .into_iter()
        .map(|pid| ForeignProcess { pid })
        .collect();
    if include_leader && is_running(leader) {
        targets.push(ForeignProcess { pid: leader });
    }
    targets
}

/// Reads `(state, ppid)` from `/proc/<pid>/stat`.
fn proc_stat(pid: Pid) -> Option<(char, Pid)> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // the command name is parenthesized and may itself contain spaces or parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Whether `pid` exists and is not defunct.
pub fn is_running(pid: Pid) -> bool {
    matches!(proc_stat(pid), Some((state, _)) if state != 'Z' && state != 'X')
}

/// Live descendants of `pid`, parents before children.
pub fn descendants(pid: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(child) = entry.file_name().to_str().and_then(|s| s.parse::<Pid>().ok()) else {
                continue;
            };
            if let Some((state, ppid)) = proc_stat(child) {
                if state != 'Z' && state != 'X' {
                    children.entry(ppid).or_default().push(child);
                }
            }
        }
    }
    let mut result = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                result.push(kid);
                frontier.push(kid);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn sh(script: &str) -> Child {
        let spec = SpawnSpec {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: None,
            env: BTreeMap::new(),
        };
        spawn(&spec, Stdio::null(), Stdio::null(), Stdio::null()).unwrap()
    }

    #[test]
    fn test_spawn_uses_new_process_group() {
        let mut child = sh("sleep 5");
        let pgid = unsafe { libc::getpgid(child.id() as libc::pid_t) };
        assert_eq!(pgid as u32, child.id());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_wait_any_reports_codes() {
        let procs = vec![sh("exit 3"), sh("exit 0")];
        let mut codes = Vec::new();
        let (exited, alive) = wait_any(procs, None, |_, code| codes.push(code));
        assert_eq!(exited.len(), 2);
        assert!(alive.is_empty());
        codes.sort();
        assert_eq!(codes, vec![0, 3]);
    }

    #[test]
    fn test_wait_any_zero_timeout_returns_immediately() {
        let start = Instant::now();
        let (exited, alive) = wait_any(vec![sh("sleep 5")], Some(Duration::ZERO), |_, _| {});
        assert!(exited.is_empty());
        assert_eq!(alive.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        let left = terminate_hard(alive, Duration::from_secs(1), |_, _| {});
        assert!(left.is_empty());
    }

    #[test]
    fn test_terminate_hard_escalates() {
        let child = sh("trap '' TERM; while true; do sleep 0.1; done");
        thread::sleep(Duration::from_millis(200));
        let start = Instant::now();
        let mut codes = Vec::new();
        let left = terminate_hard(vec![child], Duration::from_millis(300), |_, code| codes.push(code));
        assert!(left.is_empty());
        assert_eq!(codes, vec![-libc::SIGKILL]);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_kill_tree_twice() {
        let mut child = sh("sleep 30 & sleep 30 & wait");
        thread::sleep(Duration::from_millis(300));
        let leader = child.id();
        assert_eq!(descendants(leader).len(), 2);
        let (exited, alive) = kill_tree(leader, Signal::Kill, true, Some(Duration::from_secs(3)), |_, _| {}).unwrap();
        assert_eq!(exited.len(), 3);
        assert!(alive.is_empty());
        let (exited, alive) = kill_tree(leader, Signal::Kill, true, Some(Duration::from_secs(3)), |_, _| {}).unwrap();
        assert!(exited.is_empty());
        assert!(alive.is_empty());
        assert_eq!(return_code(child.wait().unwrap()), -libc::SIGKILL);
    }

    #[test]
    fn test_kill_tree_refuses_self() {
        let err = kill_tree(std::process::id(), Signal::Term, false, None, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::RefuseSuicide));
    }
}
