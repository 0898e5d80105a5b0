//! Offline replay of a trace under FIFO admission, using the expected durations from the trace.

use std::path::Path;

use itertools::Itertools;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::trace::SubmissionTrace;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulatedJob {
    pub job_id: String,
    pub model_name: String,
    pub queued: f64,
    pub started: f64,
    pub finished: f64,
}

impl SimulatedJob {
    pub fn jct(&self) -> f64 {
        self.finished - self.queued
    }
}

/// Jobs start in submission order on the first of `slots` free slots.
pub fn simulate_fifo(trace: &SubmissionTrace, slots: usize) -> Result<Vec<SimulatedJob>> {
    if slots == 0 {
        return Err(Error::Usage("FIFO simulation needs at least one slot".to_string()));
    }
    let mut free_at = vec![0.0_f64; slots];
    let mut jobs = Vec::with_capacity(trace.len());
    for row in trace.rows.iter() {
        let duration = row.duration.ok_or_else(|| Error::MissingGeometry {
            workload: row.job_id.clone(),
            field: "duration",
        })?;
        let slot = free_at
            .iter()
            .position_min_by(|a, b| a.total_cmp(b))
            .unwrap_or(0);
        let started = row.submit_time.max(free_at[slot]);
        let finished = started + duration;
        free_at[slot] = finished;
        jobs.push(SimulatedJob {
            job_id: row.job_id.clone(),
            model_name: row.model_name.clone(),
            queued: row.submit_time,
            started,
            finished,
        });
    }
    Ok(jobs)
}

pub fn write_simulation(path: &Path, jobs: &[SimulatedJob]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for job in jobs {
        writer.serialize(job)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceRow;

    fn trace(rows: &[(f64, Option<f64>)]) -> SubmissionTrace {
        SubmissionTrace::new(
            rows.iter()
                .enumerate()
                .map(|(i, (submit_time, duration))| TraceRow {
                    model_name: "alexnet_25".to_string(),
                    iterations: 20,
                    submit_time: *submit_time,
                    duration: *duration,
                    job_id: format!("j{}", i),
                })
                .collect(),
        )
    }

    #[test]
    fn test_single_slot_serializes() {
        let jobs = simulate_fifo(&trace(&[(0., Some(5.)), (1., Some(2.)), (10., Some(1.))]), 1).unwrap();
        let times: Vec<_> = jobs.iter().map(|j| (j.started, j.finished)).collect();
        assert_eq!(times, vec![(0., 5.), (5., 7.), (10., 11.)]);
        assert_eq!(jobs[1].jct(), 6.);
    }

    #[test]
    fn test_two_slots() {
        let jobs = simulate_fifo(&trace(&[(0., Some(5.)), (0., Some(2.)), (0., Some(1.))]), 2).unwrap();
        assert_eq!(jobs[2].started, 2.);
        assert_eq!(jobs[2].finished, 3.);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            simulate_fifo(&trace(&[(0., None)]), 1),
            Err(Error::MissingGeometry { field: "duration", .. })
        ));
        assert!(matches!(simulate_fifo(&trace(&[]), 0), Err(Error::Usage(_))));
    }
}
