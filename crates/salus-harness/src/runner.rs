//! Turns a workload instance into a child process invocation.
//!
//! Each ML front-end is a [`RunnerKind`]. All of them share the same launch path: the
//! adapter only decides the working directory and the argument vector, while the environment
//! and output redirection are common.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::process;
use crate::workload::Workload;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// `tf_cnn_benchmarks.py` from the TensorFlow benchmarks repository.
    TfBenchmarks,
    /// Model test cases driven through python's unittest module.
    Unittest,
    /// The Fathom reference workloads.
    Fathom,
    /// Any program. Arguments may use `{name}`, `{batch_size}`, `{batch_num}`, `{executor}`
    /// and `{endpoint}` placeholders.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Site configuration shared by all runner kinds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub python: String,
    pub tf_benchmarks_dir: PathBuf,
    pub unittest_dir: PathBuf,
    pub fathom_dir: PathBuf,
    /// GPUs visible to workload children. Kept disjoint from the server's.
    pub gpus: String,
    /// Endpoint of the shared server as seen by the front-ends.
    pub salus_endpoint: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            tf_benchmarks_dir: PathBuf::from("../tf_benchmarks"),
            unittest_dir: PathBuf::from("../tf_unittests"),
            fathom_dir: PathBuf::from("../fathom"),
            gpus: "0,1".to_string(),
            salus_endpoint: "zrpc://tcp://127.0.0.1:5501".to_string(),
        }
    }
}

/// Fully formed invocation of a workload child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl RunnerKind {
    /// Builds the invocation of `workload` against its executor.
    pub fn spawn_spec(&self, workload: &Workload, config: &RunnerConfig) -> SpawnSpec {
        let executor = workload.executor;
        let endpoint = executor.endpoint(&config.salus_endpoint);
        let rcfg = &workload.rcfg;
        let (cwd, argv) = match self {
            RunnerKind::TfBenchmarks => {
                let cwd = config.tf_benchmarks_dir.join("scripts").join("tf_cnn_benchmarks");
                let mut argv = vec![
                    config.python.clone(),
                    "tf_cnn_benchmarks.py".to_string(),
                    "--display_every=1".to_string(),
                    "--num_gpus=1".to_string(),
                    "--variable_update=parameter_server".to_string(),
                    "--nodistortions".to_string(),
                    format!("--executor={}", executor),
                    format!("--num_batches={}", rcfg.batch_num),
                    format!("--model={}", workload.name()),
                    format!("--batch_size={}", rcfg.batch_size),
                ];
                if !endpoint.is_empty() {
                    argv.push(format!("--sess_target={}", endpoint));
                }
                (Some(cwd), argv)
            }
            RunnerKind::Unittest => {
                let test_class = match executor {
                    Executor::Salus => "TestSalus",
                    Executor::TF => "TestTF",
                    Executor::TFDist => "TestDist",
                };
                let argv = vec![
                    config.python.clone(),
                    "-m".to_string(),
                    format!("test_tf.test_{}", workload.name()),
                    format!("{}.test_rpc_only_{}_{}", test_class, workload.name(), rcfg.batch_size),
                ];
                (Some(config.unittest_dir.clone()), argv)
            }
            RunnerKind::Fathom => {
                let mut argv = vec![
                    config.python.clone(),
                    "-m".to_string(),
                    "fathom.cli".to_string(),
                    "--workload".to_string(),
                    workload.name().to_string(),
                    "--action".to_string(),
                    "train".to_string(),
                    "--num_iters".to_string(),
                    rcfg.batch_num.to_string(),
                    "--batch_size".to_string(),
                    rcfg.batch_size.to_string(),
                    "--dev".to_string(),
                    "/gpu:0".to_string(),
                ];
                if !endpoint.is_empty() {
                    argv.push("--target".to_string());
                    argv.push(endpoint.clone());
                }
                (Some(config.fathom_dir.clone()), argv)
            }
            RunnerKind::Command { program, args } => {
                let substitute = |s: &str| {
                    s.replace("{name}", workload.name())
                        .replace("{batch_size}", &rcfg.batch_size.to_string())
                        .replace("{batch_num}", &rcfg.batch_num.to_string())
                        .replace("{executor}", &executor.to_string())
                        .replace("{endpoint}", &endpoint)
                };
                let mut argv = vec![substitute(program)];
                argv.extend(args.iter().map(|a| substitute(a)));
                (None, argv)
            }
        };

        let mut env = BTreeMap::new();
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), config.gpus.clone());
        env.insert("TF_CPP_MIN_LOG_LEVEL".to_string(), "4".to_string());
        if let RunnerKind::Unittest = self {
            env.insert("EXEC_ITER_NUMBER".to_string(), rcfg.batch_num.to_string());
        }
        for (k, v) in workload.env.iter() {
            env.insert(k.clone(), v.clone());
        }
        SpawnSpec { argv, cwd, env }
    }

    /// Starts the workload child with its stdout bound to `output_file`.
    pub fn launch(&self, workload: &Workload, config: &RunnerConfig, output_file: &Path) -> Result<Child> {
        let spec = self.spawn_spec(workload, config);
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = File::create(output_file)?;
        debug!(
            "launching {} > {}: {}",
            workload.canonical_name(),
            output_file.display(),
            spec.argv.join(" ")
        );
        process::spawn(&spec, Stdio::null(), Stdio::from(stdout), Stdio::null()).map_err(|source| Error::Spawn {
            program: spec.argv.first().cloned().unwrap_or_default(),
            source,
        })
    }
}
