//! Named experiment actions selectable from the command line.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::Deserialize;

use crate::admission::RunMode;
use crate::catalogue::{BatchSize, Catalogue, DEFAULT_BATCH_NUM};
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::fifo::{simulate_fifo, write_simulation};
use crate::interrupt::Interrupt;
use crate::orchestrator::{Outcome, TraceOrchestrator};
use crate::output::AtomicOutputArea;
use crate::scope::Scope;
use crate::sequencer::{Action, ActionSequencer, Pause};
use crate::server::ServerSupervisor;
use crate::timeline::{job_times, makespan, write_job_times, TimelineLog};
use crate::trace::SubmissionTrace;

pub const TIMELINE_FILE: &str = "timeline.log";
pub const JCT_FILE: &str = "jct.csv";

/// Everything an action needs, resolved from the configuration and the command line.
pub struct Experiment {
    pub config: HarnessConfig,
    pub catalogue: Catalogue,
    pub executor: Executor,
    pub save_dir: PathBuf,
    pub scale_down: u64,
    pub interrupt: Interrupt,
}

pub type ActionFn = fn(&Experiment, &[String]) -> Result<()>;

pub fn default_action_resolver(name: &str) -> Option<ActionFn> {
    match name {
        "trace" => Some(run_trace),
        "seq" => Some(run_seq),
        "fifo-sim" => Some(run_fifo_sim),
        "jct" => Some(run_jct),
        "list" => Some(run_list),
        _ => None,
    }
}

impl Experiment {
    pub fn new(config: HarnessConfig, executor: Executor, save_dir: PathBuf) -> Result<Self> {
        let catalogue = config.build_catalogue()?;
        Ok(Self {
            config,
            catalogue,
            executor,
            save_dir,
            scale_down: 1,
            interrupt: Interrupt::new(),
        })
    }

    pub fn run(&self, action: &str, args: &[String], resolver: fn(&str) -> Option<ActionFn>) -> Result<()> {
        let f = resolver(action).ok_or_else(|| Error::Usage(format!("unknown action {}", action)))?;
        info!("running {} {}", action, args.join(" "));
        f(self, args)
    }

    fn output_dir(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        self.save_dir.join(stem)
    }

    fn enter_output_area(&self, final_dir: &Path) -> Result<AtomicOutputArea> {
        let section = &self.config.orchestrator;
        AtomicOutputArea::enter(final_dir, &section.scratch_root, section.merge_on_failure)
    }
}

fn input_arg<'a>(args: &'a [String], what: &str) -> Result<&'a Path> {
    args.first()
        .map(Path::new)
        .ok_or_else(|| Error::Usage(format!("missing {} argument", what)))
}

/// Replays a submission trace against the configured executor.
pub fn run_trace(exp: &Experiment, args: &[String]) -> Result<()> {
    let path = input_arg(args, "trace")?;
    let trace = SubmissionTrace::from_csv(path)?.scale_down(exp.scale_down);
    let workloads = trace.workloads(&exp.catalogue, exp.executor)?;
    let final_dir = exp.output_dir(path);

    let succeeded = Cell::new(false);
    let server: RefCell<Option<ServerSupervisor>> = RefCell::new(None);
    let mut scope = Scope::new();

    let area = exp.enter_output_area(&final_dir)?;
    let scratch = area.scratch().to_path_buf();
    scope.defer("output area", || area.exit(succeeded.get()));

    if exp.executor == Executor::Salus {
        let config = exp.config.server.copy_with(|c| c.output_dir = Some(scratch.clone()));
        let mut supervisor = ServerSupervisor::new(config).with_grace(exp.config.orchestrator.grace());
        supervisor.start()?;
        *server.borrow_mut() = Some(supervisor);
        scope.defer("server", || server.borrow_mut().take().map_or(Ok(()), ServerSupervisor::stop));
    }

    let mut timeline = TimelineLog::create(&scratch.join(TIMELINE_FILE))?;
    let summary = {
        let mut guard = server.borrow_mut();
        let mut orchestrator = TraceOrchestrator::new(exp.config.orchestrator.orchestrator_config(), &exp.config.runners)
            .with_interrupt(exp.interrupt.clone());
        if let Some(s) = guard.as_mut() {
            orchestrator = orchestrator.with_server(s);
        }
        orchestrator.run(workloads, &scratch, &final_dir, &mut timeline)
    };

    let result = summary.and_then(|summary| {
        let jobs = job_times(timeline.records());
        write_job_times(&scratch.join(JCT_FILE), &jobs)?;
        if let Some(makespan) = makespan(timeline.records()) {
            info!("makespan of {} jobs: {:.2}s", jobs.len(), makespan);
        }
        succeeded.set(summary.outcome == Outcome::Completed);
        summary.outcome.into_result()
    });
    let closed = scope.close();
    result.and(closed)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WaitKind {
    All,
    Manual,
}

fn default_batch_num() -> u64 {
    DEFAULT_BATCH_NUM
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawAction {
    Workload {
        name: String,
        batch_size: BatchSize,
        #[serde(default = "default_batch_num")]
        batch_num: u64,
    },
    Sleep(f64),
    Wait(WaitKind),
}

/// Parses a YAML action list into sequencer actions.
pub fn parse_actions(s: &str, catalogue: &Catalogue, executor: Executor) -> Result<Vec<Action<'static>>> {
    let raw: Vec<RawAction> = serde_yaml::from_str(s)?;
    raw.into_iter()
        .map(|a| {
            Ok(match a {
                RawAction::Workload {
                    name,
                    batch_size,
                    batch_num,
                } => Action::Workload(catalogue.create(&name, batch_size, batch_num, executor)?),
                RawAction::Sleep(secs) => Action::Pause(Pause::Fixed(Duration::from_secs_f64(secs.max(0.)))),
                RawAction::Wait(WaitKind::All) => Action::Pause(Pause::WaitForAll),
                RawAction::Wait(WaitKind::Manual) => Action::Pause(Pause::Manual),
            })
        })
        .collect()
}

/// Runs a YAML list of actions in order.
pub fn run_seq(exp: &Experiment, args: &[String]) -> Result<()> {
    let path = input_arg(args, "action file")?;
    let content = std::fs::read_to_string(path).map_err(|_| Error::NotFound(path.to_path_buf()))?;
    let actions = parse_actions(&content, &exp.catalogue, exp.executor)?;
    let final_dir = exp.output_dir(path);

    let succeeded = Cell::new(false);
    let mut scope = Scope::new();
    let area = exp.enter_output_area(&final_dir)?;
    let scratch = area.scratch().to_path_buf();
    scope.defer("output area", || area.exit(succeeded.get()));

    let mut sequencer = ActionSequencer::new(&exp.config.runners)
        .with_grace(exp.config.orchestrator.grace())
        .ignore_error(exp.config.orchestrator.ignore_error)
        .with_interrupt(exp.interrupt.clone());
    if exp.executor == Executor::Salus {
        sequencer = sequencer.with_server(exp.config.server.copy_with(|c| c.output_dir = Some(scratch.clone())));
    }
    let result = TimelineLog::create(&scratch.join(TIMELINE_FILE)).and_then(|mut timeline| {
        let finished = sequencer.run(actions, &scratch, &final_dir, &mut timeline)?;
        write_job_times(&scratch.join(JCT_FILE), &job_times(timeline.records()))?;
        info!("{} workloads finished", finished.len());
        succeeded.set(true);
        Ok(())
    });
    let closed = scope.close();
    result.and(closed)
}

/// Simulates the trace under FIFO admission with `concurrent` slots.
pub fn run_fifo_sim(exp: &Experiment, args: &[String]) -> Result<()> {
    let path = input_arg(args, "trace")?;
    let trace = SubmissionTrace::from_csv(path)?.scale_down(exp.scale_down);
    let section = &exp.config.orchestrator;
    let slots = match section.mode {
        RunMode::Fifo => 1,
        _ => section.concurrent.max(1),
    };
    let jobs = simulate_fifo(&trace, slots)?;
    let final_dir = exp.output_dir(path);
    std::fs::create_dir_all(&final_dir)?;
    let out = final_dir.join("fifo.csv");
    write_simulation(&out, &jobs)?;
    let makespan = jobs.iter().map(|j| j.finished).fold(0., f64::max);
    info!("simulated {} jobs on {} slots, makespan {:.2}s, written to {}", jobs.len(), slots, makespan, out.display());
    Ok(())
}

/// Computes per-job JCT and queuing delay of a recorded timeline.
pub fn run_jct(_exp: &Experiment, args: &[String]) -> Result<()> {
    let path = input_arg(args, "timeline")?;
    let records = TimelineLog::parse(path)?;
    let jobs = job_times(&records);
    let out = path.with_file_name(JCT_FILE);
    write_job_times(&out, &jobs)?;
    match makespan(&records) {
        Some(makespan) => info!("{} jobs, makespan {:.2}s, written to {}", jobs.len(), makespan, out.display()),
        None => info!("{} jobs, no complete run, written to {}", jobs.len(), out.display()),
    }
    Ok(())
}

/// Writes the catalogue to `<save_dir>/catalogue.csv`, one row per legal run configuration.
pub fn run_list(exp: &Experiment, _args: &[String]) -> Result<()> {
    std::fs::create_dir_all(&exp.save_dir)?;
    let out = exp.save_dir.join("catalogue.csv");
    let mut writer = csv::Writer::from_writer(File::create(&out)?);
    writer.write_record(["name", "batch_size", "batch_num", "peakmem"])?;
    for template in exp.catalogue.templates() {
        for rcfg in template.run_configs.iter() {
            let geometry = template.geometry(rcfg, exp.executor);
            writer.write_record([
                template.name.clone(),
                rcfg.batch_size.to_string(),
                rcfg.batch_num.to_string(),
                geometry.peakmem.map(|m| m.to_string()).unwrap_or_default(),
            ])?;
        }
    }
    writer.flush()?;
    info!("{} workloads listed in {}", exp.catalogue.len(), out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver() {
        assert!(default_action_resolver("trace").is_some());
        assert!(default_action_resolver("fifo-sim").is_some());
        assert!(default_action_resolver("bogus").is_none());

        let dir = tempfile::tempdir().unwrap();
        let exp = Experiment::new(HarnessConfig::default(), Executor::TF, dir.path().to_path_buf()).unwrap();
        let err = exp.run("bogus", &[], default_action_resolver).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert!(matches!(exp.run("trace", &[], default_action_resolver), Err(Error::Usage(_))));
    }

    #[test]
    fn test_parse_actions() {
        let actions = parse_actions(
            "- workload: {name: resnet50, batch_size: 50}\n\
             - sleep: 1.5\n\
             - wait: all\n\
             - workload: {name: seq2seq, batch_size: small, batch_num: 100}\n\
             - wait: manual\n",
            &Catalogue::builtin().unwrap(),
            Executor::Salus,
        )
        .unwrap();
        assert_eq!(actions.len(), 5);
        match &actions[0] {
            Action::Workload(w) => assert_eq!(w.output_name(), "resnet50_20"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(actions[1], Action::Pause(Pause::Fixed(d)) if d == Duration::from_millis(1500)));
        assert!(matches!(actions[2], Action::Pause(Pause::WaitForAll)));
        assert!(matches!(actions[4], Action::Pause(Pause::Manual)));

        let err = parse_actions("- workload: {name: nope, batch_size: 1}\n", &Catalogue::builtin().unwrap(), Executor::TF);
        assert!(matches!(err, Err(Error::UnknownWorkload(_))));
    }

    #[test]
    fn test_list_writes_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let exp = Experiment::new(HarnessConfig::default(), Executor::TF, dir.path().to_path_buf()).unwrap();
        exp.run("list", &[], default_action_resolver).unwrap();
        let content = std::fs::read_to_string(dir.path().join("catalogue.csv")).unwrap();
        assert!(content.starts_with("name,batch_size,batch_num,peakmem\n"));
        assert!(content.contains("resnet50,"));
    }
}
