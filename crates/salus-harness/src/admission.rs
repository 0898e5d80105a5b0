//! Admission policies deciding when a queued workload may start.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::workload::Workload;

pub const GIB: u64 = 1 << 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Up to `cap` workloads share the GPU.
    Salus,
    /// One workload at a time.
    Fifo,
    /// Admit while the summed peak memory stays under the overcommitted physical memory.
    Overcommit,
}

impl Display for RunMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Salus => write!(f, "salus"),
            RunMode::Fifo => write!(f, "fifo"),
            RunMode::Overcommit => write!(f, "overcommit"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdmissionPolicy {
    pub mode: RunMode,
    pub cap: usize,
    pub overcommit: f64,
    pub phymem: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            mode: RunMode::Salus,
            cap: 1,
            overcommit: 1.0,
            phymem: 14 * GIB,
        }
    }
}

impl AdmissionPolicy {
    pub fn memory_budget(&self) -> f64 {
        self.overcommit * self.phymem as f64
    }

    /// Fails on the first workload without a peak memory when memory based admission is used,
    /// and on any workload that would not be admitted even with nothing alive.
    pub fn validate<'a, I: IntoIterator<Item = &'a Workload>>(&self, candidates: I) -> Result<()> {
        for w in candidates {
            let peakmem = match (self.mode, w.geometry.peakmem) {
                (RunMode::Overcommit, None) => {
                    return Err(Error::MissingGeometry {
                        workload: w.canonical_name(),
                        field: "peakmem",
                    })
                }
                (_, peakmem) => peakmem.unwrap_or(0),
            };
            if !admits(self, peakmem, 0, 0) {
                return Err(Error::Config(format!(
                    "{} can never be admitted in {} mode (cap {}, peakmem {}, budget {:.0})",
                    w.canonical_name(),
                    self.mode,
                    self.cap,
                    peakmem,
                    self.memory_budget()
                )));
            }
        }
        Ok(())
    }

    pub fn admits(&self, candidate: &Workload, alive: &[Workload]) -> bool {
        let peakmem = |w: &Workload| w.geometry.peakmem.unwrap_or(0);
        admits(
            self,
            peakmem(candidate),
            alive.len(),
            alive.iter().map(peakmem).sum(),
        )
    }
}

/// Pure admission rule over the numbers that matter to it.
pub fn admits(policy: &AdmissionPolicy, candidate_peakmem: u64, alive: usize, alive_peakmem: u64) -> bool {
    match policy.mode {
        RunMode::Fifo => alive == 0,
        RunMode::Salus => alive < policy.cap,
        RunMode::Overcommit => ((candidate_peakmem + alive_peakmem) as f64) < policy.memory_budget(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: RunMode, cap: usize) -> AdmissionPolicy {
        AdmissionPolicy {
            mode,
            cap,
            overcommit: 1.5,
            phymem: 14 * GIB,
        }
    }

    #[test]
    fn test_fifo_and_salus() {
        let fifo = policy(RunMode::Fifo, 5);
        assert!(admits(&fifo, 0, 0, 0));
        assert!(!admits(&fifo, 0, 1, 0));

        let salus = policy(RunMode::Salus, 2);
        assert!(admits(&salus, 0, 1, 0));
        assert!(!admits(&salus, 0, 2, 0));

        // a cap of one behaves like fifo
        let one = policy(RunMode::Salus, 1);
        for alive in 0..3 {
            assert_eq!(admits(&one, 0, alive, 0), admits(&fifo, 0, alive, 0));
        }
    }

    #[test]
    fn test_overcommit_budget() {
        let p = policy(RunMode::Overcommit, 1);
        // budget is 21 GiB
        assert!(admits(&p, 10 * GIB, 0, 0));
        assert!(admits(&p, 8 * GIB, 1, 10 * GIB));
        assert!(!admits(&p, 4 * GIB, 2, 18 * GIB));
        assert!(admits(&p, 4 * GIB, 1, 8 * GIB));
        assert!(!admits(&p, 21 * GIB, 0, 0));
    }

    #[test]
    fn test_validate_rejects_salus_without_slots() {
        let catalogue = crate::catalogue::Catalogue::builtin().unwrap();
        let w = catalogue.create("resnet50", 50, 20, crate::executor::Executor::TF).unwrap();
        assert!(policy(RunMode::Salus, 1).validate([&w]).is_ok());
        assert!(matches!(policy(RunMode::Salus, 0).validate([&w]), Err(Error::Config(_))));
        assert!(policy(RunMode::Fifo, 0).validate([&w]).is_ok());
    }
}
