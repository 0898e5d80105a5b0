//! Trace-driven orchestration: submits workloads at their trace times, admits them under an
//! [`AdmissionPolicy`] and supervises them to completion.
//!
//! The loop is single threaded. It suspends only in the per-tick sleep and in the final drain,
//! and reaps children with a zero timeout on every tick.

use std::collections::VecDeque;
use std::mem;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::admission::{AdmissionPolicy, RunMode};
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::process::{self, DEFAULT_GRACE};
use crate::runner::RunnerConfig;
use crate::server::ServerSupervisor;
use crate::timeline::{EventKind, TimelineLog};
use crate::workload::Workload;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub policy: AdmissionPolicy,
    pub tick: Duration,
    pub grace: Duration,
    pub ignore_error: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: AdmissionPolicy::default(),
            tick: DEFAULT_TICK,
            grace: DEFAULT_GRACE,
            ignore_error: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// First workload that exited with a non-zero return code.
    FailedAt { workload: String, code: i32 },
    ServerCrashed(i32),
    Interrupted,
}

impl Outcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            Outcome::Completed => Ok(()),
            Outcome::FailedAt { workload, code } => Err(Error::WorkloadFailed { name: workload, code }),
            Outcome::ServerCrashed(code) => Err(Error::ServerCrashed(code)),
            Outcome::Interrupted => Err(Error::Interrupted),
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub outcome: Outcome,
    /// Every workload that was started, in the order their exits were observed.
    pub finished: Vec<Workload>,
    /// Workloads never started because the run stopped early.
    pub skipped: Vec<Workload>,
}

/// Workloads moving through the loop. Every workload is in exactly one of the collections.
#[derive(Default)]
struct RunState {
    pending: VecDeque<Workload>,
    queued: VecDeque<Workload>,
    alive: Vec<Workload>,
    finished: Vec<Workload>,
}

type FinishCallback<'a> = Box<dyn FnMut(&Workload) + 'a>;

pub struct TraceOrchestrator<'a> {
    config: OrchestratorConfig,
    runners: &'a RunnerConfig,
    server: Option<&'a mut ServerSupervisor>,
    interrupt: Interrupt,
    on_finish: Option<FinishCallback<'a>>,
}

impl<'a> TraceOrchestrator<'a> {
    pub fn new(config: OrchestratorConfig, runners: &'a RunnerConfig) -> Self {
        Self {
            config,
            runners,
            server: None,
            interrupt: Interrupt::new(),
            on_finish: None,
        }
    }

    /// Probes `server` every tick. A crash stops the run.
    pub fn with_server(mut self, server: &'a mut ServerSupervisor) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn on_finish<F: FnMut(&Workload) + 'a>(mut self, callback: F) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    /// Runs `workloads` (each carrying its `submit_time`) with outputs under `scratch`.
    ///
    /// Configuration errors are returned before any child is spawned. Once the loop has started,
    /// live children are always killed and output paths rewritten into `final_dir`, whatever
    /// the outcome.
    pub fn run(
        &mut self,
        workloads: Vec<Workload>,
        scratch: &Path,
        final_dir: &Path,
        timeline: &mut TimelineLog,
    ) -> Result<RunSummary> {
        self.config.policy.validate(workloads.iter())?;
        let mut workloads = workloads;
        if self.config.policy.mode == RunMode::Overcommit {
            for w in workloads.iter_mut() {
                w.env.insert("TF_GPU_ALLOCATOR".to_string(), "cuda_managed".to_string());
            }
        }
        // stable: equal submit times keep their order
        workloads.sort_by(|a, b| {
            let (a, b) = (a.submit_time.unwrap_or(0.), b.submit_time.unwrap_or(0.));
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut state = RunState {
            pending: workloads.into(),
            ..Default::default()
        };
        info!(
            "running {} workloads in {} mode (cap {})",
            state.pending.len(),
            self.config.policy.mode,
            self.config.policy.cap
        );
        let result = self.run_loop(&mut state, scratch, timeline);
        self.finalize(&mut state, final_dir, timeline);

        let outcome = result?;
        let outcome = match outcome {
            Outcome::Completed if !self.config.ignore_error => {
                first_failure(&state.finished).unwrap_or(Outcome::Completed)
            }
            other => other,
        };
        match &outcome {
            Outcome::Completed => info!("all workloads finished"),
            other => error!("run stopped: {:?}", other),
        }
        let mut skipped: Vec<Workload> = state.queued.into();
        skipped.extend(state.pending);
        Ok(RunSummary {
            outcome,
            finished: state.finished,
            skipped,
        })
    }

    fn run_loop(&mut self, state: &mut RunState, scratch: &Path, timeline: &mut TimelineLog) -> Result<Outcome> {
        let origin = Instant::now();
        loop {
            if self.interrupt.is_set() {
                return Ok(Outcome::Interrupted);
            }
            if let Some(code) = self.server_crash()? {
                return Ok(Outcome::ServerCrashed(code));
            }

            let now = origin.elapsed().as_secs_f64();
            while state
                .pending
                .front()
                .map_or(false, |w| w.submit_time.unwrap_or(0.) <= now)
            {
                let Some(w) = state.pending.pop_front() else {
                    break;
                };
                timeline.log(EventKind::Queued, &w.event_name())?;
                debug!("queued {}", w.event_name());
                state.queued.push_back(w);
            }

            self.reap(state, Some(Duration::ZERO), timeline)?;

            while let Some(candidate) = state.queued.front() {
                if !self.config.policy.admits(candidate, &state.alive) {
                    break;
                }
                let Some(mut w) = state.queued.pop_front() else {
                    break;
                };
                let output = scratch.join(w.output_file_name());
                if let Err(e) = w.run(self.runners, output) {
                    state.finished.push(w);
                    return Err(e);
                }
                timeline.log(EventKind::Started, &w.event_name())?;
                info!("started {} ({} alive)", w.event_name(), state.alive.len() + 1);
                state.alive.push(w);
            }

            if state.pending.is_empty() && state.queued.is_empty() {
                return self.drain(state, timeline);
            }

            let tick = self.config.tick.as_nanos().max(1);
            let into_tick = origin.elapsed().as_nanos() % tick;
            thread::sleep(Duration::from_nanos((tick - into_tick) as u64));
        }
    }

    /// Waits for every live workload while still honouring interrupts and server crashes.
    fn drain(&mut self, state: &mut RunState, timeline: &mut TimelineLog) -> Result<Outcome> {
        debug!("nothing left to admit, draining {} workloads", state.alive.len());
        while !state.alive.is_empty() {
            if self.interrupt.is_set() {
                return Ok(Outcome::Interrupted);
            }
            if let Some(code) = self.server_crash()? {
                return Ok(Outcome::ServerCrashed(code));
            }
            self.reap(state, Some(self.config.tick), timeline)?;
        }
        Ok(Outcome::Completed)
    }

    fn reap(&mut self, state: &mut RunState, timeout: Option<Duration>, timeline: &mut TimelineLog) -> Result<()> {
        let mut log_error = None;
        let on_finish = &mut self.on_finish;
        let (exited, alive) = process::wait_any(mem::take(&mut state.alive), timeout, |w: &mut Workload, code| {
            if code == 0 {
                info!("finished {}", w.event_name());
            } else {
                warn!("{} exited with {}", w.event_name(), code);
            }
            if let Err(e) = timeline.log(EventKind::Finished, &w.event_name()) {
                log_error.get_or_insert(e);
            }
            if let Some(callback) = on_finish.as_mut() {
                callback(w);
            }
        });
        state.alive = alive;
        state.finished.extend(exited);
        log_error.map_or(Ok(()), Err)
    }

    fn server_crash(&mut self) -> Result<Option<i32>> {
        let Some(server) = self.server.as_mut() else {
            return Ok(None);
        };
        match server.check() {
            Ok(()) => Ok(None),
            Err(Error::ServerCrashed(code)) => {
                error!("server exited with {}", code);
                Ok(Some(code))
            }
            Err(e) => Err(e),
        }
    }

    fn finalize(&mut self, state: &mut RunState, final_dir: &Path, timeline: &mut TimelineLog) {
        for mut w in state.alive.drain(..) {
            w.kill_hard(self.config.grace);
            if let Err(e) = timeline.log(EventKind::Finished, &w.event_name()) {
                warn!("failed to record end of {}: {}", w.event_name(), e);
            }
            state.finished.push(w);
        }
        for w in state.finished.iter_mut() {
            w.relocate_output(final_dir);
        }
    }
}

fn first_failure(finished: &[Workload]) -> Option<Outcome> {
    finished.iter().find_map(|w| match w.returncode() {
        Some(0) => None,
        code => Some(Outcome::FailedAt {
            workload: w.event_name(),
            code: code.unwrap_or(-1),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Catalogue;
    use crate::executor::Executor;
    use crate::runner::RunnerKind;

    fn catalogue(script: &str) -> Catalogue {
        let mut c = Catalogue::new();
        c.define(
            "job",
            vec![],
            RunnerKind::Command {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
        )
        .unwrap();
        c
    }

    fn workloads(c: &Catalogue, submit_times: &[f64]) -> Vec<Workload> {
        submit_times
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut w = c.create("job", 1, 20, Executor::TF).unwrap();
                w.job_id = Some(i.to_string());
                w.submit_time = Some(*t);
                w
            })
            .collect()
    }

    fn fast(mode: RunMode, cap: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            policy: AdmissionPolicy {
                mode,
                cap,
                ..Default::default()
            },
            tick: Duration::from_millis(20),
            grace: Duration::from_millis(500),
            ignore_error: false,
        }
    }

    #[test]
    fn test_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let runners = RunnerConfig::default();
        let mut timeline = TimelineLog::in_memory();
        let summary = TraceOrchestrator::new(fast(RunMode::Salus, 2), &runners)
            .run(vec![], dir.path(), dir.path(), &mut timeline)
            .unwrap();
        assert_eq!(summary.outcome, Outcome::Completed);
        assert!(timeline.records().is_empty());
    }

    #[test]
    fn test_failure_is_reported_unless_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let runners = RunnerConfig::default();
        let c = catalogue("exit 1");

        let mut timeline = TimelineLog::in_memory();
        let summary = TraceOrchestrator::new(fast(RunMode::Salus, 2), &runners)
            .run(workloads(&c, &[0.]), dir.path(), dir.path(), &mut timeline)
            .unwrap();
        assert!(matches!(summary.outcome, Outcome::FailedAt { code: 1, .. }));

        let mut config = fast(RunMode::Salus, 2);
        config.ignore_error = true;
        let mut timeline = TimelineLog::in_memory();
        let summary = TraceOrchestrator::new(config, &runners)
            .run(workloads(&c, &[0.]), dir.path(), dir.path(), &mut timeline)
            .unwrap();
        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(timeline.records().last().unwrap().event, EventKind::Finished);
    }

    #[test]
    fn test_on_finish_and_relocation() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let runners = RunnerConfig::default();
        let c = catalogue("echo hi");
        let mut seen = Vec::new();
        let mut timeline = TimelineLog::in_memory();
        let summary = TraceOrchestrator::new(fast(RunMode::Salus, 2), &runners)
            .on_finish(|w| seen.push(w.event_name()))
            .run(workloads(&c, &[0., 0.]), &scratch, Path::new("/final"), &mut timeline)
            .unwrap();
        assert_eq!(summary.finished.len(), 2);
        assert_eq!(seen.len(), 2);
        for w in summary.finished.iter() {
            assert!(w.output_file().unwrap().starts_with("/final"));
        }
        assert_eq!(std::fs::read_to_string(scratch.join("job_20.20iter.0.output")).unwrap(), "hi\n");
    }

    #[test]
    fn test_interrupt_kills_alive() {
        let dir = tempfile::tempdir().unwrap();
        let runners = RunnerConfig::default();
        let c = catalogue("sleep 30");
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let mut timeline = TimelineLog::in_memory();
        let summary = TraceOrchestrator::new(fast(RunMode::Salus, 2), &runners)
            .with_interrupt(interrupt)
            .run(workloads(&c, &[0.]), dir.path(), dir.path(), &mut timeline)
            .unwrap();
        assert_eq!(summary.outcome, Outcome::Interrupted);
        assert!(summary.finished.is_empty());
        assert_eq!(summary.skipped.len(), 1);
    }
}
