use std::io::Write;
use std::path::PathBuf;

use atty::Stream;
use chrono::Local;
use clap::Parser;
use colored::{Color, ColoredString, Colorize};
use env_logger::{Builder, Env};
use log::{error, warn, Level};

use salus_harness::admission::RunMode;
use salus_harness::config::HarnessConfig;
use salus_harness::executor::Executor;
use salus_harness::experiment::{default_action_resolver, Experiment};
use salus_harness::interrupt::Interrupt;
use salus_harness::process::{self, DEFAULT_GRACE};
use salus_harness::{Error, ErrorKind, Result};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
/// Runs GPU-sharing experiments
struct Args {
    /// Experiment action: trace, seq, fifo-sim, jct or list
    action: String,

    /// Arguments of the action, e.g. the trace file
    args: Vec<String>,

    /// Path to YAML file with harness configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server build directory
    #[arg(long = "build_dir")]
    build_dir: Option<PathBuf>,

    /// Directory receiving the results
    #[arg(long = "save_dir", default_value = "templogs")]
    save_dir: PathBuf,

    /// Header-less CSV with extra workload geometry
    #[arg(long = "extra_wl")]
    extra_wl: Option<PathBuf>,

    /// Run workloads against the shared server
    #[arg(long = "use_salus")]
    use_salus: bool,

    /// Executor used without --use_salus (tf or tfdist)
    #[arg(long)]
    executor: Option<Executor>,

    /// Maximum number of workloads running together
    #[arg(long)]
    concurrent: Option<usize>,

    /// Run one workload at a time
    #[arg(long)]
    fifo: bool,

    /// Admit workloads while their peak memory fits into this multiple of the physical memory
    #[arg(long)]
    overcommit: Option<f64>,

    /// Physical GPU memory in bytes
    #[arg(long)]
    phymem: Option<u64>,

    /// Divide trace iterations and submit times by this factor
    #[arg(long = "scale_down", default_value_t = 1)]
    scale_down: u64,

    /// Server preset from the configuration to apply
    #[arg(long = "force_preset")]
    force_preset: Option<String>,

    /// Do not fail when a workload exits with non-zero status
    #[arg(long = "ignore_error")]
    ignore_error: bool,
}

fn get_colored(s: &str, color: Color) -> ColoredString {
    if atty::is(Stream::Stderr) {
        s.color(color)
    } else {
        s.normal()
    }
}

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => get_colored("ERROR", Color::Red),
                Level::Warn => get_colored("WARN", Color::Yellow),
                Level::Info => get_colored("INFO", Color::Green),
                Level::Debug => get_colored("DEBUG", Color::Blue),
                Level::Trace => get_colored("TRACE", Color::Magenta),
            };
            writeln!(
                buf,
                "[{} {} {}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                level,
                record.target(),
                record.args()
            )
        })
        .init();
}

fn load_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(build_dir) = &args.build_dir {
        config.server.build_dir = build_dir.clone();
    }
    if let Some(extra_wl) = &args.extra_wl {
        config.extra_wl = Some(extra_wl.clone());
    }
    if let Some(preset) = &args.force_preset {
        config.apply_preset(preset)?;
    }

    let section = &mut config.orchestrator;
    if let Some(concurrent) = args.concurrent {
        section.concurrent = concurrent;
    }
    if let Some(phymem) = args.phymem {
        section.phymem = phymem;
    }
    match (args.fifo, args.overcommit) {
        (true, Some(_)) => return Err(Error::Usage("--fifo and --overcommit are exclusive".to_string())),
        (true, None) => section.mode = RunMode::Fifo,
        (false, Some(factor)) => {
            section.mode = RunMode::Overcommit;
            section.overcommit = factor;
        }
        (false, None) => {}
    }
    if args.ignore_error {
        section.ignore_error = true;
    }
    Ok(config)
}

fn run(args: Args, interrupt: Interrupt) -> Result<()> {
    let config = load_config(&args)?;
    let executor = match (args.use_salus, args.executor) {
        (true, _) => Executor::Salus,
        (false, Some(executor)) => executor,
        (false, None) => Executor::TF,
    };
    let mut experiment = Experiment::new(config, executor, args.save_dir)?;
    experiment.scale_down = args.scale_down.max(1);
    experiment.interrupt = interrupt;
    experiment.run(&args.action, &args.args, default_action_resolver)
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { ErrorKind::Usage.exit_code() } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logger();
    let interrupt = Interrupt::install();

    let code = match run(args, interrupt) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.kind().exit_code()
        }
    };
    process::reap_children(DEFAULT_GRACE, |p, _| warn!("reaped leftover process {}", p.pid));
    std::process::exit(code);
}
