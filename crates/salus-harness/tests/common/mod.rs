#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;

use salus_harness::admission::{AdmissionPolicy, RunMode, GIB};
use salus_harness::catalogue::{Catalogue, ResourceGeometry, RunConfig};
use salus_harness::executor::Executor;
use salus_harness::orchestrator::OrchestratorConfig;
use salus_harness::runner::RunnerKind;
use salus_harness::server::ServerConfig;
use salus_harness::timeline::{EventKind, TimelineRecord};
use salus_harness::workload::Workload;

/// Catalogue of `sh -c <script>` workloads with an optional peak memory in GiB.
pub fn shell_catalogue(jobs: &[(&str, &str, Option<u64>)]) -> Catalogue {
    let mut catalogue = Catalogue::new();
    for (name, script, peakmem) in jobs {
        catalogue
            .define(
                name,
                vec![RunConfig::new(1, 20)],
                RunnerKind::Command {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), script.to_string()],
                },
            )
            .unwrap();
        let geometry = ResourceGeometry {
            peakmem: peakmem.map(|g| g * GIB),
            ..Default::default()
        };
        catalogue
            .add_geometry(name, RunConfig::new(1, 20), Executor::TF, &geometry)
            .unwrap();
    }
    catalogue
}

pub fn workload(catalogue: &Catalogue, name: &str, job_id: &str, submit_time: f64) -> Workload {
    let mut w = catalogue.create(name, 1, 20, Executor::TF).unwrap();
    w.job_id = Some(job_id.to_string());
    w.submit_time = Some(submit_time);
    w
}

pub fn event_name(name: &str, job_id: &str) -> String {
    format!("{}_20.20iter.{}", name, job_id)
}

pub fn fast_config(mode: RunMode, cap: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        policy: AdmissionPolicy {
            mode,
            cap,
            overcommit: 1.5,
            phymem: 14 * GIB,
        },
        tick: Duration::from_millis(20),
        grace: Duration::from_millis(500),
        ignore_error: false,
    }
}

pub fn event_time(records: &[TimelineRecord], event: EventKind, workload: &str) -> NaiveDateTime {
    let matching: Vec<_> = records
        .iter()
        .filter(|r| r.event == event && r.workload == workload)
        .collect();
    assert_eq!(matching.len(), 1, "expected one {} event for {}", event, workload);
    matching[0].timestamp
}

/// Largest number of workloads between STARTED and FINISHED at any point of the log.
pub fn max_alive(records: &[TimelineRecord]) -> usize {
    let mut alive = 0_usize;
    let mut max = 0;
    for r in records {
        match r.event {
            EventKind::Started => alive += 1,
            EventKind::Finished => alive -= 1,
            EventKind::Queued => {}
        }
        max = max.max(alive);
    }
    max
}

/// Every workload has exactly one QUEUED, STARTED and FINISHED event, in that order.
pub fn assert_complete_lifecycles(records: &[TimelineRecord], workloads: &[String]) {
    for w in workloads {
        let queued = event_time(records, EventKind::Queued, w);
        let started = event_time(records, EventKind::Started, w);
        let finished = event_time(records, EventKind::Finished, w);
        assert!(queued <= started && started <= finished, "bad lifecycle of {}", w);
    }
}

/// A fake server tree under `root`: an executable that runs `script`, a project README and
/// the `disable` log configuration.
pub fn fake_server(root: &Path, script: &str) -> ServerConfig {
    let bin = root.join("build").join("Release").join("bin");
    fs::create_dir_all(&bin).unwrap();
    let exe = bin.join("executor");
    fs::write(&exe, format!("#!/bin/sh\n{}\n", script)).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(root.join("README.md"), "salus\n").unwrap();
    let logconf = root.join("scripts").join("logconf");
    fs::create_dir_all(&logconf).unwrap();
    fs::write(logconf.join("disable.config"), "").unwrap();

    let artefacts = root.join("artefacts");
    fs::create_dir_all(&artefacts).unwrap();
    ServerConfig {
        build_dir: root.join("build"),
        artefact_dir: artefacts,
        readiness_wait_secs: 0.2,
        ..Default::default()
    }
}
