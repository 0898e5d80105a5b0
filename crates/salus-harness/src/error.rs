//! Error type shared by all harness components.

use std::path::PathBuf;

/// Coarse classification of errors, used to pick the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Config,
    NotFound,
    SpawnFailed,
    ServerCrashed,
    WorkloadFailed,
    Io,
    Interrupted,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Usage => 64,
            ErrorKind::ServerCrashed => 2,
            ErrorKind::Interrupted => 130,
            _ => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("usage: {0}")]
    Usage(String),
    #[error("workload {0} is already defined")]
    DuplicateName(String),
    #[error("unknown workload {0}")]
    UnknownWorkload(String),
    #[error("workload {workload} has no {field} geometry")]
    MissingGeometry { workload: String, field: &'static str },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("server executable not found under {0}")]
    ServerNotFound(PathBuf),
    #[error("log configuration not found: {0}")]
    LogconfNotFound(PathBuf),
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("workload {0} was already started")]
    AlreadyStarted(String),
    #[error("server was never started")]
    ServerNotStarted,
    #[error("server crashed with return code {0}")]
    ServerCrashed(i32),
    #[error("workload {name} failed with return code {code}")]
    WorkloadFailed { name: String, code: i32 },
    #[error("destination exists and is not a directory: {0}")]
    DestExistsNotDir(PathBuf),
    #[error("refusing to kill the process tree of the current process")]
    RefuseSuicide,
    #[error("interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) => ErrorKind::Usage,
            Error::DuplicateName(_)
            | Error::UnknownWorkload(_)
            | Error::MissingGeometry { .. }
            | Error::Config(_)
            | Error::AlreadyStarted(_)
            | Error::ServerNotStarted
            | Error::RefuseSuicide
            | Error::Yaml(_) => ErrorKind::Config,
            Error::ServerNotFound(_) | Error::LogconfNotFound(_) | Error::NotFound(_) => ErrorKind::NotFound,
            Error::Spawn { .. } => ErrorKind::SpawnFailed,
            Error::ServerCrashed(_) => ErrorKind::ServerCrashed,
            Error::WorkloadFailed { .. } => ErrorKind::WorkloadFailed,
            Error::DestExistsNotDir(_) | Error::Io(_) | Error::Csv(_) => ErrorKind::Io,
            Error::Interrupted => ErrorKind::Interrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Usage("bad".into()).kind().exit_code(), 64);
        assert_eq!(Error::ServerCrashed(-9).kind().exit_code(), 2);
        assert_eq!(Error::Interrupted.kind().exit_code(), 130);
        let failed = Error::WorkloadFailed {
            name: "resnet50_25".into(),
            code: 1,
        };
        assert_eq!(failed.kind(), ErrorKind::WorkloadFailed);
        assert_eq!(failed.kind().exit_code(), 1);
        assert_eq!(Error::NotFound("trace.csv".into()).kind(), ErrorKind::NotFound);
    }
}
