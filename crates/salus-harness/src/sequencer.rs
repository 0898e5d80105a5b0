//! Runs a fixed list of actions in order: launch a workload, pause, or call back into user code.

use std::io::{self, BufRead};
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::process::{self, DEFAULT_GRACE};
use crate::runner::RunnerConfig;
use crate::server::{ServerConfig, ServerSupervisor};
use crate::timeline::{EventKind, TimelineLog};
use crate::workload::Workload;

/// Interval between server health probes while waiting.
pub const HEALTH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pause {
    Fixed(Duration),
    /// Until every workload launched so far has exited.
    WaitForAll,
    /// Until the gate opens, by default on a line read from stdin.
    Manual,
}

pub type Callable<'a> = Box<dyn FnOnce(&mut [Workload]) -> Result<()> + 'a>;

pub enum Action<'a> {
    Workload(Workload),
    Pause(Pause),
    /// Receives the workloads launched so far.
    Callable(Callable<'a>),
}

impl std::fmt::Debug for Action<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Workload(w) => write!(f, "Workload({})", w.canonical_name()),
            Action::Pause(p) => write!(f, "Pause({:?})", p),
            Action::Callable(_) => write!(f, "Callable"),
        }
    }
}

type Gate<'a> = Box<dyn FnMut(Duration) -> Result<bool> + 'a>;

/// Waits up to `timeout` for a line on stdin. End of input opens the gate as well.
fn stdin_gate(timeout: Duration) -> Result<bool> {
    if !wait_readable(libc::STDIN_FILENO, timeout)? {
        return Ok(false);
    }
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(true)
}

/// Polls `fd` for input. A signal ends the wait early and counts as no input.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    match unsafe { libc::poll(&mut pollfd, 1, millis) } {
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

pub struct ActionSequencer<'a> {
    runners: &'a RunnerConfig,
    server: Option<ServerConfig>,
    grace: Duration,
    ignore_error: bool,
    interrupt: Interrupt,
    gate: Gate<'a>,
}

impl<'a> ActionSequencer<'a> {
    pub fn new(runners: &'a RunnerConfig) -> Self {
        Self {
            runners,
            server: None,
            grace: DEFAULT_GRACE,
            ignore_error: false,
            interrupt: Interrupt::new(),
            gate: Box::new(stdin_gate),
        }
    }

    /// Starts a server with `config` around action lists that launch workloads.
    pub fn with_server(mut self, config: ServerConfig) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn ignore_error(mut self, ignore_error: bool) -> Self {
        self.ignore_error = ignore_error;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Replaces the stdin gate of manual pauses. The gate is called with the longest time it
    /// may block and returns whether the pause is over.
    pub fn with_gate<F: FnMut(Duration) -> Result<bool> + 'a>(mut self, gate: F) -> Self {
        self.gate = Box::new(gate);
        self
    }

    /// Executes `actions` and waits for every launched workload. Live children are killed and
    /// output paths rewritten into `final_dir` whatever the result.
    pub fn run(
        &mut self,
        actions: Vec<Action<'_>>,
        scratch: &Path,
        final_dir: &Path,
        timeline: &mut TimelineLog,
    ) -> Result<Vec<Workload>> {
        let needs_server = actions.iter().any(|a| matches!(a, Action::Workload(_)));
        let mut server = match (&self.server, needs_server) {
            (Some(config), true) => {
                let mut server = ServerSupervisor::new(config.clone()).with_grace(self.grace);
                server.start()?;
                Some(server)
            }
            _ => None,
        };

        let mut launched = Vec::new();
        let mut finished = Vec::new();
        let mut result = self.run_actions(actions, scratch, &mut launched, &mut finished, server.as_mut(), timeline);
        if result.is_ok() {
            result = self.wait_all(&mut launched, &mut finished, server.as_mut(), timeline);
        }
        if result.is_ok() {
            result = self.check_interrupt();
        }

        for mut w in launched.drain(..) {
            w.kill_hard(self.grace);
            if let Err(e) = timeline.log(EventKind::Finished, &w.event_name()) {
                warn!("failed to record end of {}: {}", w.event_name(), e);
            }
            finished.push(w);
        }
        for w in finished.iter_mut() {
            w.relocate_output(final_dir);
        }
        let stopped = match server {
            Some(server) => server.stop(),
            None => Ok(()),
        };
        result?;
        stopped?;

        if !self.ignore_error {
            if let Some(w) = finished.iter().find(|w| w.returncode() != Some(0)) {
                return Err(Error::WorkloadFailed {
                    name: w.event_name(),
                    code: w.returncode().unwrap_or(-1),
                });
            }
        }
        Ok(finished)
    }

    fn run_actions(
        &mut self,
        actions: Vec<Action<'_>>,
        scratch: &Path,
        launched: &mut Vec<Workload>,
        finished: &mut Vec<Workload>,
        mut server: Option<&mut ServerSupervisor>,
        timeline: &mut TimelineLog,
    ) -> Result<()> {
        for (idx, action) in actions.into_iter().enumerate() {
            self.check_interrupt()?;
            debug!("action {}: {:?}", idx, action);
            match action {
                Action::Workload(mut w) => {
                    if w.job_id.is_none() {
                        w.job_id = Some(idx.to_string());
                    }
                    timeline.log(EventKind::Queued, &w.event_name())?;
                    let output = scratch.join(w.output_file_name());
                    w.run(self.runners, output)?;
                    timeline.log(EventKind::Started, &w.event_name())?;
                    info!("launched {}", w.event_name());
                    launched.push(w);
                }
                Action::Pause(Pause::Fixed(duration)) => self.sleep(duration, server.as_deref_mut())?,
                Action::Pause(Pause::WaitForAll) => {
                    self.wait_all(launched, finished, server.as_deref_mut(), timeline)?
                }
                Action::Pause(Pause::Manual) => self.manual(server.as_deref_mut())?,
                Action::Callable(f) => f(launched.as_mut_slice())?,
            }
        }
        Ok(())
    }

    /// Waits for every workload in `launched`, moving them to `finished` as they exit.
    fn wait_all(
        &self,
        launched: &mut Vec<Workload>,
        finished: &mut Vec<Workload>,
        mut server: Option<&mut ServerSupervisor>,
        timeline: &mut TimelineLog,
    ) -> Result<()> {
        loop {
            let mut log_error = None;
            let (exited, alive) = process::wait_any(mem::take(launched), Some(HEALTH_INTERVAL), |w, code| {
                if code != 0 {
                    warn!("{} exited with {}", w.event_name(), code);
                }
                if let Err(e) = timeline.log(EventKind::Finished, &w.event_name()) {
                    log_error.get_or_insert(e);
                }
            });
            finished.extend(exited);
            *launched = alive;
            if let Some(e) = log_error {
                return Err(e);
            }
            if launched.is_empty() {
                return Ok(());
            }
            self.check_interrupt()?;
            if let Some(server) = server.as_deref_mut() {
                server.check()?;
            }
        }
    }

    fn sleep(&self, duration: Duration, mut server: Option<&mut ServerSupervisor>) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupt()?;
            if let Some(server) = server.as_deref_mut() {
                server.check()?;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(HEALTH_INTERVAL.min(deadline - now));
        }
    }

    fn manual(&mut self, mut server: Option<&mut ServerSupervisor>) -> Result<()> {
        info!("paused, press enter to continue");
        loop {
            self.check_interrupt()?;
            if let Some(server) = server.as_deref_mut() {
                server.check()?;
            }
            if (self.gate)(HEALTH_INTERVAL)? {
                return Ok(());
            }
        }
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.is_set() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}
