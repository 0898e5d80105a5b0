//! Supervision of the shared GPU server process.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::output::move_path;
use crate::process::{self, Reapable, DEFAULT_GRACE};
use crate::runner::SpawnSpec;

/// Server log artefacts collected into the output directory.
pub const ARTEFACTS: [&str; 3] = ["server.output", "perf.output", "alloc.output"];

const EXECUTABLE_CANDIDATES: [&str; 3] = ["src/executor", "bin/executor", "bin/salus-server"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profiler {
    #[default]
    None,
    Nvprof,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub build_dir: PathBuf,
    /// Build flavour directory under `build_dir`, e.g. `Release` or `Debug`.
    pub build_type: String,
    /// Name of the log configuration, resolved to `<logconf_dir>/<logconf>.config`.
    pub logconf: String,
    pub logconf_dir: Option<PathBuf>,
    pub scheduler: String,
    pub disable_wc: bool,
    pub disable_adc: bool,
    pub profiler: Profiler,
    pub extra_args: Vec<String>,
    pub endpoint: String,
    /// GPUs visible to the server.
    pub gpus: String,
    pub env: BTreeMap<String, String>,
    /// Where artefacts are moved on exit. Left in `artefact_dir` when unset.
    pub output_dir: Option<PathBuf>,
    /// Directory the server writes its artefacts to while running.
    pub artefact_dir: PathBuf,
    pub readiness_wait_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("../build"),
            build_type: "Release".to_string(),
            logconf: "disable".to_string(),
            logconf_dir: None,
            scheduler: "pack".to_string(),
            disable_wc: false,
            disable_adc: false,
            profiler: Profiler::None,
            extra_args: Vec::new(),
            endpoint: "tcp://*:5501".to_string(),
            gpus: "2,3".to_string(),
            env: BTreeMap::new(),
            output_dir: None,
            artefact_dir: PathBuf::from("/tmp"),
            readiness_wait_secs: 5.0,
        }
    }
}

/// Partial server configuration applied on top of another one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPreset {
    pub logconf: Option<String>,
    pub scheduler: Option<String>,
    pub disable_wc: Option<bool>,
    pub disable_adc: Option<bool>,
    pub extra_args: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
}

impl ServerPreset {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(logconf) = &self.logconf {
            config.logconf = logconf.clone();
        }
        if let Some(scheduler) = &self.scheduler {
            config.scheduler = scheduler.clone();
        }
        if let Some(disable_wc) = self.disable_wc {
            config.disable_wc = disable_wc;
        }
        if let Some(disable_adc) = self.disable_adc {
            config.disable_adc = disable_adc;
        }
        if let Some(extra_args) = &self.extra_args {
            config.extra_args = extra_args.clone();
        }
        for (k, v) in self.env.iter() {
            config.env.insert(k.clone(), v.clone());
        }
    }
}

impl ServerConfig {
    /// Returns a copy with `overrides` applied.
    pub fn copy_with<F: FnOnce(&mut ServerConfig)>(&self, overrides: F) -> ServerConfig {
        let mut copy = self.clone();
        overrides(&mut copy);
        copy
    }

    pub fn artefact_path(&self, name: &str) -> PathBuf {
        self.artefact_dir.join(name)
    }

    /// First existing executable among the known locations in the build tree.
    pub fn locate_executable(&self) -> Result<PathBuf> {
        let base = self.build_dir.join(&self.build_type);
        EXECUTABLE_CANDIDATES
            .iter()
            .map(|c| base.join(c))
            .find(|p| is_executable(p))
            .ok_or_else(|| Error::ServerNotFound(base.clone()))
    }

    /// Resolves the log configuration file. Without an explicit directory, the project root is
    /// found by walking up from the build directory to the first `README.md`.
    pub fn locate_logconf(&self) -> Result<PathBuf> {
        let dir = match &self.logconf_dir {
            Some(dir) => dir.clone(),
            None => {
                let start = self.build_dir.canonicalize().unwrap_or_else(|_| self.build_dir.clone());
                let root = start
                    .ancestors()
                    .find(|p| p.join("README.md").is_file())
                    .ok_or_else(|| Error::LogconfNotFound(self.build_dir.clone()))?;
                root.join("scripts").join("logconf")
            }
        };
        let path = dir.join(format!("{}.config", self.logconf));
        if !path.is_file() {
            return Err(Error::LogconfNotFound(path));
        }
        Ok(path)
    }

    pub fn build_argv(&self) -> Result<Vec<String>> {
        let mut argv = Vec::new();
        if let Profiler::Nvprof = self.profiler {
            let dir = self.output_dir.as_ref().unwrap_or(&self.artefact_dir);
            argv.extend([
                "nvprof".to_string(),
                "--profile-child-processes".to_string(),
                "-o".to_string(),
                dir.join("profile.%p.nvvp").display().to_string(),
            ]);
        }
        argv.push(self.locate_executable()?.display().to_string());
        argv.extend([
            "--listen".to_string(),
            self.endpoint.clone(),
            "--logconf".to_string(),
            self.locate_logconf()?.display().to_string(),
            "--sched".to_string(),
            self.scheduler.clone(),
        ]);
        argv.extend(self.extra_args.iter().cloned());
        if self.disable_adc {
            argv.push("--disable-adc".to_string());
        }
        if self.disable_wc {
            argv.push("--disable-wc".to_string());
        }
        Ok(argv)
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Owns the server child. Dropping the supervisor kills the server.
pub struct ServerSupervisor {
    config: ServerConfig,
    child: Option<Child>,
    grace: Duration,
}

impl ServerSupervisor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            child: None,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Clears stale artefacts, launches the server and waits for it to come up.
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::AlreadyStarted("server".to_string()));
        }
        let argv = self.config.build_argv()?;
        fs::create_dir_all(&self.config.artefact_dir)?;
        for name in ARTEFACTS {
            let path = self.config.artefact_path(name);
            if path.exists() {
                debug!("removing stale {}", path.display());
                fs::remove_file(&path)?;
            }
        }

        let mut env = self.config.env.clone();
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), self.config.gpus.clone());
        let spec = SpawnSpec { argv, cwd: None, env };
        let stdout = File::create(self.config.artefact_path(ARTEFACTS[0]))?;
        let stderr = stdout.try_clone()?;
        info!("starting server: {}", spec.argv.join(" "));
        let child = process::spawn(&spec, Stdio::null(), Stdio::from(stdout), Stdio::from(stderr)).map_err(
            |source| Error::Spawn {
                program: spec.argv[0].clone(),
                source,
            },
        )?;
        self.child = Some(child);

        thread::sleep(Duration::from_secs_f64(self.config.readiness_wait_secs.max(0.)));
        self.check()?;
        info!("server is up");
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Fails if the server was never started or has exited.
    pub fn check(&mut self) -> Result<()> {
        let child = self.child.as_mut().ok_or(Error::ServerNotStarted)?;
        match child.poll()? {
            Some(code) => Err(Error::ServerCrashed(code)),
            None => Ok(()),
        }
    }

    /// Terminates the server process tree. Safe to call repeatedly.
    pub fn kill(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Ok(Some(_)) = child.poll() {
            return;
        }
        let pid = child.id();
        debug!("stopping server (pid {})", pid);
        if let Err(e) = process::terminate_tree_hard(pid, true, self.grace) {
            warn!("failed to stop server: {}", e);
        }
        if let Err(e) = child.poll() {
            warn!("failed to reap server: {}", e);
        }
    }

    /// Kills the server and moves its artefacts into the output directory.
    pub fn stop(mut self) -> Result<()> {
        self.kill();
        let Some(output_dir) = self.config.output_dir.clone() else {
            return Ok(());
        };
        fs::create_dir_all(&output_dir)?;
        for name in ARTEFACTS {
            let from = self.config.artefact_path(name);
            if from.exists() {
                move_path(&from, &output_dir.join(name))?;
            }
        }
        Ok(())
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_with_and_presets() {
        let base = ServerConfig::default();
        let copy = base.copy_with(|c| c.scheduler = "fair".to_string());
        assert_eq!(base.scheduler, "pack");
        assert_eq!(copy.scheduler, "fair");

        let preset = ServerPreset {
            disable_wc: Some(true),
            scheduler: Some("preempt".to_string()),
            ..Default::default()
        };
        let mut config = base.clone();
        preset.apply(&mut config);
        assert!(config.disable_wc);
        assert_eq!(config.scheduler, "preempt");
        assert_eq!(config.logconf, base.logconf);
    }

    #[test]
    fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            build_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(matches!(config.locate_executable(), Err(Error::ServerNotFound(_))));
    }

    #[test]
    fn test_check_before_start() {
        let mut server = ServerSupervisor::new(ServerConfig::default());
        assert!(matches!(server.check(), Err(Error::ServerNotStarted)));
        server.kill();
    }
}
