//! Timeline of workload lifecycle events, and the job-level metrics derived from it.
//!
//! One event per line: `<local ISO 8601 timestamp>: <QUEUED|STARTED|FINISHED> workload <name>`.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{Local, NaiveDateTime};
use indexmap::IndexMap;
use serde::Serialize;

use crate::error::{Error, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Queued,
    Started,
    Finished,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Queued => "QUEUED",
            EventKind::Started => "STARTED",
            EventKind::Finished => "FINISHED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(EventKind::Queued),
            "STARTED" => Ok(EventKind::Started),
            "FINISHED" => Ok(EventKind::Finished),
            _ => Err(Error::Config(format!("unknown timeline event {s}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimelineRecord {
    pub timestamp: NaiveDateTime,
    pub event: EventKind,
    pub workload: String,
}

impl Display for TimelineRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} workload {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.event,
            self.workload
        )
    }
}

impl FromStr for TimelineRecord {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let bad = || Error::Config(format!("malformed timeline line {:?}", line));
        let (timestamp, rest) = line.split_once(": ").ok_or_else(bad)?;
        let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).map_err(|_| bad())?;
        let mut parts = rest.splitn(3, ' ');
        let event = parts.next().ok_or_else(bad)?.parse()?;
        if parts.next() != Some("workload") {
            return Err(bad());
        }
        let workload = parts.next().filter(|w| !w.is_empty()).ok_or_else(bad)?.to_string();
        Ok(Self {
            timestamp,
            event,
            workload,
        })
    }
}

/// Append-only event log. Each line is flushed immediately so a crashed run keeps its events.
pub struct TimelineLog {
    file: Option<File>,
    records: Vec<TimelineRecord>,
}

impl TimelineLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: Some(File::create(path)?),
            records: Vec::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            file: None,
            records: Vec::new(),
        }
    }

    pub fn log(&mut self, event: EventKind, workload: &str) -> Result<()> {
        let record = TimelineRecord {
            timestamp: Local::now().naive_local(),
            event,
            workload: workload.to_string(),
        };
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{}", record)?;
            file.flush()?;
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[TimelineRecord] {
        &self.records
    }

    pub fn parse(path: &Path) -> Result<Vec<TimelineRecord>> {
        let f = File::open(path).map_err(|_| Error::NotFound(path.to_path_buf()))?;
        let mut records = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(line.parse()?);
        }
        Ok(records)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobTimes {
    pub workload: String,
    pub queued: Option<NaiveDateTime>,
    pub started: Option<NaiveDateTime>,
    pub finished: Option<NaiveDateTime>,
}

fn seconds_between(from: Option<NaiveDateTime>, to: Option<NaiveDateTime>) -> Option<f64> {
    Some((to? - from?).num_microseconds()? as f64 / 1e6)
}

impl JobTimes {
    /// Job completion time: FINISHED - QUEUED.
    pub fn jct(&self) -> Option<f64> {
        seconds_between(self.queued, self.finished)
    }

    /// Queuing delay: STARTED - QUEUED.
    pub fn queuing(&self) -> Option<f64> {
        seconds_between(self.queued, self.started)
    }
}

/// Groups events per workload, in order of first appearance.
pub fn job_times(records: &[TimelineRecord]) -> Vec<JobTimes> {
    let mut jobs: IndexMap<&str, JobTimes> = IndexMap::new();
    for r in records {
        let job = jobs.entry(r.workload.as_str()).or_insert_with(|| JobTimes {
            workload: r.workload.clone(),
            queued: None,
            started: None,
            finished: None,
        });
        let slot = match r.event {
            EventKind::Queued => &mut job.queued,
            EventKind::Started => &mut job.started,
            EventKind::Finished => &mut job.finished,
        };
        slot.get_or_insert(r.timestamp);
    }
    jobs.into_values().collect()
}

/// Time from the first QUEUED to the last FINISHED event, in seconds.
pub fn makespan(records: &[TimelineRecord]) -> Option<f64> {
    let first = records.iter().filter(|r| r.event == EventKind::Queued).map(|r| r.timestamp).min();
    let last = records.iter().filter(|r| r.event == EventKind::Finished).map(|r| r.timestamp).max();
    seconds_between(first, last)
}

#[derive(Serialize)]
struct JobRow<'a> {
    workload: &'a str,
    jct: Option<f64>,
    queuing: Option<f64>,
}

pub fn write_job_times(path: &Path, jobs: &[JobTimes]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for job in jobs {
        writer.serialize(JobRow {
            workload: &job.workload,
            jct: job.jct(),
            queuing: job.queuing(),
        })?;
    }
    writer.flush()?;
    Ok(())
}
