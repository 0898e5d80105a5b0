mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::*;

use salus_harness::admission::RunMode;
use salus_harness::interrupt::Interrupt;
use salus_harness::orchestrator::{Outcome, TraceOrchestrator};
use salus_harness::output::AtomicOutputArea;
use salus_harness::process;
use salus_harness::runner::RunnerConfig;
use salus_harness::timeline::{EventKind, TimelineLog};

#[test]
fn test_interrupt_kills_child_tree() {
    let root = tempfile::tempdir().unwrap();
    let final_dir = root.path().join("out");
    // the child ignores SIGTERM and keeps a grandchild around
    let catalogue = shell_catalogue(&[("stubborn", "trap '' TERM; sleep 30 & while true; do sleep 0.1; done", None)]);
    let config = fast_config(RunMode::Salus, 1);
    let grace = config.grace;

    let area = AtomicOutputArea::enter(&final_dir, root.path(), true).unwrap();
    let scratch = area.scratch().to_path_buf();
    let timeline_path = scratch.join("timeline.log");
    let mut timeline = TimelineLog::create(&timeline_path).unwrap();

    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        trigger.trigger();
        Instant::now()
    });

    let runners = RunnerConfig::default();
    let summary = TraceOrchestrator::new(config, &runners)
        .with_interrupt(interrupt)
        .run(
            vec![workload(&catalogue, "stubborn", "0", 0.)],
            &scratch,
            &final_dir,
            &mut timeline,
        )
        .unwrap();
    let done = Instant::now();
    let triggered = signaller.join().unwrap();

    assert_eq!(summary.outcome, Outcome::Interrupted);
    assert!(summary.outcome.clone().into_result().is_err());
    assert!(done - triggered < 2 * grace + Duration::from_millis(500));
    assert!(process::descendants(std::process::id()).is_empty());

    let killed = &summary.finished[0];
    assert_eq!(killed.returncode(), Some(-libc::SIGKILL));
    assert!(killed.output_file().unwrap().starts_with(&final_dir));

    area.exit(false).unwrap();
    assert!(final_dir.is_dir());
    let records = TimelineLog::parse(&final_dir.join("timeline.log")).unwrap();
    let name = event_name("stubborn", "0");
    assert_complete_lifecycles(&records, &[name.clone()]);
    assert_eq!(records.last().unwrap().event, EventKind::Finished);
    assert!(final_dir.join(format!("{}.output", name)).exists());
}
