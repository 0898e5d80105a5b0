//! Submission traces: when each job enters the system.

use std::cmp::Ordering;
use std::path::Path;

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::catalogue::{BatchSize, Catalogue};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::workload::Workload;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    pub model_name: String,
    pub iterations: u64,
    pub submit_time: f64,
    /// Expected runtime in seconds. Only the FIFO simulation needs it.
    #[serde(default)]
    pub duration: Option<f64>,
    pub job_id: String,
}

impl TraceRow {
    /// Splits `model_name` of the form `<name>_<batch_size>`.
    pub fn split_model_name(&self) -> Result<(&str, BatchSize)> {
        let (name, batch_size) = self
            .model_name
            .rsplit_once('_')
            .ok_or_else(|| Error::Config(format!("model name {:?} has no batch size", self.model_name)))?;
        Ok((name, BatchSize::from(batch_size)))
    }
}

/// Rows ordered by submit time.
#[derive(Clone, Debug, Default)]
pub struct SubmissionTrace {
    pub rows: Vec<TraceRow>,
}

impl SubmissionTrace {
    pub fn new(mut rows: Vec<TraceRow>) -> Self {
        // stable, so jobs submitted together keep their file order
        rows.sort_by(|a, b| a.submit_time.partial_cmp(&b.submit_time).unwrap_or(Ordering::Equal));
        Self { rows }
    }

    /// Reads a CSV trace with a header row. Unknown columns are ignored.
    pub fn from_csv(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let rows = reader.deserialize().collect::<std::result::Result<Vec<TraceRow>, _>>()?;
        Ok(Self::new(rows))
    }

    /// Divides iteration counts (rounding down) and submit times by `factor`.
    pub fn scale_down(mut self, factor: u64) -> Self {
        if factor <= 1 {
            return self;
        }
        for row in self.rows.iter_mut() {
            row.iterations /= factor;
            row.submit_time /= factor as f64;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Creates one workload per row, in submission order.
    pub fn workloads(&self, catalogue: &Catalogue, executor: Executor) -> Result<Vec<Workload>> {
        self.rows
            .iter()
            .map(|row| {
                let (name, batch_size) = row.split_model_name()?;
                let mut w = catalogue.create(name, batch_size, row.iterations, executor)?;
                w.job_id = Some(row.job_id.clone());
                w.submit_time = Some(row.submit_time);
                Ok(w)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_trace(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_parse_sorted_with_extra_columns() {
        let f = write_trace(
            "job_id,model_name,iterations,submit_time,duration,comment\n\
             B,resnet50_50,100,5,12.5,later\n\
             A,seq2seq_small,20,0,,first\n",
        );
        let trace = SubmissionTrace::from_csv(f.path()).unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.rows[0].job_id, "A");
        assert_eq!(trace.rows[0].duration, None);
        assert_eq!(trace.rows[1].duration, Some(12.5));

        let workloads = trace.workloads(&Catalogue::builtin().unwrap(), Executor::Salus).unwrap();
        assert_eq!(workloads[0].canonical_name(), "seq2seq_small");
        assert_eq!(workloads[1].canonical_name(), "resnet50_50");
        assert_eq!(workloads[1].submit_time, Some(5.0));
        assert_eq!(workloads[1].job_id.as_deref(), Some("B"));
    }

    #[test]
    fn test_scale_down() {
        let trace = SubmissionTrace::new(vec![TraceRow {
            model_name: "vgg16_25".to_string(),
            iterations: 101,
            submit_time: 9.0,
            duration: None,
            job_id: "x".to_string(),
        }])
        .scale_down(2);
        assert_eq!(trace.rows[0].iterations, 50);
        assert_eq!(trace.rows[0].submit_time, 4.5);
    }

    #[test]
    fn test_unknown_model_and_missing_file() {
        let f = write_trace("model_name,iterations,submit_time,job_id\nbogus_10,1,0,a\n");
        let trace = SubmissionTrace::from_csv(f.path()).unwrap();
        assert!(matches!(
            trace.workloads(&Catalogue::builtin().unwrap(), Executor::TF),
            Err(Error::UnknownWorkload(_))
        ));
        assert!(matches!(
            SubmissionTrace::from_csv(Path::new("/nonexistent/trace.csv")),
            Err(Error::NotFound(_))
        ));
    }
}
