//! A workload template bound to a run configuration, and the child process running it.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};

use crate::catalogue::{ResourceGeometry, RunConfig, WorkloadTemplate, DEFAULT_BATCH_NUM};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::process::{self, Pid, Reapable, Signal};
use crate::runner::RunnerConfig;

#[derive(Debug)]
pub struct Workload {
    pub template: Rc<WorkloadTemplate>,
    pub rcfg: RunConfig,
    pub executor: Executor,
    /// Snapshot of the template's geometry for `(rcfg, executor)` taken at creation.
    pub geometry: ResourceGeometry,
    pub job_id: Option<String>,
    /// Seconds after the start of the run at which the workload is submitted.
    pub submit_time: Option<f64>,
    /// Extra environment for the child, applied over the runner's defaults.
    pub env: BTreeMap<String, String>,
    proc: Option<Child>,
    output_file: Option<PathBuf>,
    returncode: Option<i32>,
}

impl Workload {
    pub fn new(template: Rc<WorkloadTemplate>, rcfg: RunConfig, executor: Executor) -> Self {
        let geometry = template.geometry(&rcfg, executor);
        Self {
            template,
            rcfg,
            executor,
            geometry,
            job_id: None,
            submit_time: None,
            env: BTreeMap::new(),
            proc: None,
            output_file: None,
            returncode: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    /// `<name>_<batch_size>`, the form used by trace files.
    pub fn canonical_name(&self) -> String {
        format!("{}_{}", self.name(), self.rcfg.batch_size)
    }

    /// Base name of the artefacts, kept stable for the downstream parsers.
    pub fn output_name(&self) -> String {
        match &self.rcfg.cfg {
            Some(cfg) if self.rcfg.batch_num != DEFAULT_BATCH_NUM => {
                format!("{}_{}_{}", self.name(), self.rcfg.batch_num, cfg)
            }
            _ => format!("{}_{}", self.name(), self.rcfg.batch_num),
        }
    }

    /// `<output_name>.<batch_num>iter.<job_id>`, the identifier used in the timeline log.
    pub fn event_name(&self) -> String {
        format!(
            "{}.{}iter.{}",
            self.output_name(),
            self.rcfg.batch_num,
            self.job_id.as_deref().unwrap_or("0")
        )
    }

    pub fn output_file_name(&self) -> String {
        format!("{}.output", self.event_name())
    }

    pub fn output_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    pub fn has_started(&self) -> bool {
        self.proc.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.proc.is_some() && self.returncode.is_none()
    }

    /// Launches the child. A workload runs at most once.
    pub fn run(&mut self, config: &RunnerConfig, output_file: PathBuf) -> Result<()> {
        if self.proc.is_some() {
            return Err(Error::AlreadyStarted(self.event_name()));
        }
        let runner = self.template.runner.clone();
        let child = runner.launch(self, config, &output_file)?;
        self.proc = Some(child);
        self.output_file = Some(output_file);
        Ok(())
    }

    /// Points the recorded output file into `dir`, keeping its file name.
    pub fn relocate_output(&mut self, dir: &Path) {
        if let Some(file) = self.output_file.take() {
            let relocated = match file.file_name() {
                Some(name) => dir.join(name),
                None => file,
            };
            self.output_file = Some(relocated);
        }
    }

    /// Terminates the whole process tree of a live child and reaps it.
    pub fn kill_hard(&mut self, grace: Duration) {
        let Some(pid) = self.proc.as_ref().map(|c| c.id()) else {
            return;
        };
        if self.returncode.is_some() {
            return;
        }
        debug!("killing process tree of {} (pid {})", self.event_name(), pid);
        if let Err(e) = process::terminate_tree_hard(pid, true, grace) {
            warn!("failed to kill {}: {}", self.event_name(), e);
        }
        match self.poll() {
            Ok(Some(_)) => {}
            Ok(None) => warn!("{} (pid {}) is still running", self.event_name(), pid),
            Err(e) => warn!("failed to reap {}: {}", self.event_name(), e),
        }
    }
}

impl Reapable for Workload {
    fn pid(&self) -> Pid {
        self.proc.as_ref().map(|c| c.id()).unwrap_or(0)
    }

    fn poll(&mut self) -> io::Result<Option<i32>> {
        if self.returncode.is_some() {
            return Ok(self.returncode);
        }
        let Some(child) = self.proc.as_mut() else {
            return Ok(Some(0));
        };
        let code = child.poll()?;
        self.returncode = code;
        Ok(code)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        match &self.proc {
            Some(child) if self.returncode.is_none() => process::send_signal(child.id(), signal),
            _ => Ok(()),
        }
    }
}
