//! Harness configuration read from YAML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionPolicy, RunMode, GIB};
use crate::catalogue::Catalogue;
use crate::error::{Error, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::output::default_scratch_root;
use crate::runner::RunnerConfig;
use crate::server::{ServerConfig, ServerPreset};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub tick_ms: u64,
    pub grace_secs: f64,
    pub mode: RunMode,
    pub concurrent: usize,
    pub overcommit: f64,
    pub phymem: u64,
    pub scratch_root: PathBuf,
    /// Publish partial results of a failed run instead of discarding them.
    pub merge_on_failure: bool,
    pub ignore_error: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            grace_secs: 3.,
            mode: RunMode::Salus,
            concurrent: 1,
            overcommit: 1.,
            phymem: 14 * GIB,
            scratch_root: default_scratch_root(),
            merge_on_failure: true,
            ignore_error: false,
        }
    }
}

impl OrchestratorSection {
    pub fn grace(&self) -> Duration {
        Duration::from_secs_f64(self.grace_secs.max(0.))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            policy: AdmissionPolicy {
                mode: self.mode,
                cap: self.concurrent.max(1),
                overcommit: self.overcommit,
                phymem: self.phymem,
            },
            tick: Duration::from_millis(self.tick_ms.max(1)),
            grace: self.grace(),
            ignore_error: self.ignore_error,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    pub runners: RunnerConfig,
    pub orchestrator: OrchestratorSection,
    /// Workload manifest. The built-in catalogue is used when unset.
    pub manifest: Option<PathBuf>,
    /// Header-less CSV with extra resource geometry.
    pub extra_wl: Option<PathBuf>,
    pub presets: BTreeMap<String, ServerPreset>,
}

impl HarnessConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        // an empty document deserializes to unit, not to the defaults
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|_| Error::NotFound(path.to_path_buf()))?;
        let config = Self::from_yaml_str(&content)?;
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Applies the named server preset.
    pub fn apply_preset(&mut self, name: &str) -> Result<()> {
        let preset = self
            .presets
            .get(name)
            .ok_or_else(|| Error::Usage(format!("unknown server preset {}", name)))?;
        preset.apply(&mut self.server);
        Ok(())
    }

    /// Builds the catalogue from the manifest (or the built-in one) and merges extra geometry.
    pub fn build_catalogue(&self) -> Result<Catalogue> {
        let mut catalogue = match &self.manifest {
            Some(path) => Catalogue::from_manifest(path)?,
            None => Catalogue::builtin()?,
        };
        if let Some(extra) = &self.extra_wl {
            catalogue.load_extra(extra)?;
        }
        Ok(catalogue)
    }
}
