//! Backends a workload can run against.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Executor {
    /// Shared GPU server, reached over its RPC endpoint.
    Salus,
    /// In-process TensorFlow session.
    TF,
    /// Distributed TensorFlow runtime on a local gRPC worker.
    TFDist,
}

impl Executor {
    pub fn all() -> [Executor; 3] {
        [Executor::Salus, Executor::TF, Executor::TFDist]
    }

    /// Session target passed to the ML front-ends.
    pub fn endpoint(&self, salus_endpoint: &str) -> String {
        match self {
            Executor::Salus => salus_endpoint.to_string(),
            Executor::TF => String::new(),
            Executor::TFDist => "grpc://localhost:2345".to_string(),
        }
    }
}

impl Display for Executor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Executor::Salus => "salus",
            Executor::TF => "tf",
            Executor::TFDist => "tfdist",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Executor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "salus" => Ok(Executor::Salus),
            "tf" => Ok(Executor::TF),
            "tfdist" => Ok(Executor::TFDist),
            _ => Err(Error::Usage(format!("unknown executor {s}"))),
        }
    }
}
