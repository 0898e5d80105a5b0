//! Registry of known workloads and their measured resource geometry.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

use csv::ReaderBuilder;
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::runner::RunnerKind;
use crate::workload::Workload;

/// Iteration count used by most preset experiments. Output names omit the
/// configuration label for it.
pub const DEFAULT_BATCH_NUM: u64 = 20;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchSize {
    Num(u32),
    /// Enumerated sizes such as `small`, `medium` or `large`.
    Named(String),
}

impl FromStr for BatchSize {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().parse::<u32>() {
            Ok(n) => BatchSize::Num(n),
            Err(_) => BatchSize::Named(s.trim().to_string()),
        })
    }
}

impl Display for BatchSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchSize::Num(n) => write!(f, "{}", n),
            BatchSize::Named(s) => write!(f, "{}", s),
        }
    }
}

impl From<u32> for BatchSize {
    fn from(value: u32) -> Self {
        BatchSize::Num(value)
    }
}

impl From<&str> for BatchSize {
    fn from(value: &str) -> Self {
        // parsing a batch size never fails
        match value.parse() {
            Ok(bs) => bs,
            Err(never) => match never {},
        }
    }
}

/// One runnable variant of a workload template.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RunConfig {
    pub batch_size: BatchSize,
    pub batch_num: u64,
    pub cfg: Option<String>,
}

impl RunConfig {
    pub fn new(batch_size: impl Into<BatchSize>, batch_num: u64) -> Self {
        Self {
            batch_size: batch_size.into(),
            batch_num,
            cfg: None,
        }
    }

    pub fn with_cfg(mut self, cfg: Option<String>) -> Self {
        self.cfg = cfg.filter(|c| !c.is_empty());
        self
    }
}

/// Measured resource usage of a run configuration. Every field may be unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGeometry {
    /// Job completion time in seconds.
    pub jct: Option<f64>,
    /// Peak GPU memory in bytes.
    pub peakmem: Option<u64>,
    /// Persistent GPU memory in bytes.
    pub persistmem: Option<u64>,
}

impl ResourceGeometry {
    /// Fills the unknown fields of `self` from `other`. Known fields are never overwritten.
    pub fn merge(&mut self, other: &ResourceGeometry) {
        if self.jct.is_none() {
            self.jct = other.jct;
        }
        if self.peakmem.is_none() {
            self.peakmem = other.peakmem;
        }
        if self.persistmem.is_none() {
            self.persistmem = other.persistmem;
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkloadTemplate {
    pub name: String,
    pub runner: RunnerKind,
    pub run_configs: IndexSet<RunConfig>,
    geometry: HashMap<(RunConfig, Executor), ResourceGeometry>,
}

impl WorkloadTemplate {
    pub fn new(name: &str, run_configs: impl IntoIterator<Item = RunConfig>, runner: RunnerKind) -> Self {
        Self {
            name: name.to_string(),
            runner,
            run_configs: run_configs.into_iter().collect(),
            geometry: HashMap::new(),
        }
    }

    pub fn is_legal(&self, rcfg: &RunConfig) -> bool {
        self.run_configs.contains(rcfg)
    }

    /// Geometry recorded for the configuration, or an empty record when nothing was measured.
    pub fn geometry(&self, rcfg: &RunConfig, executor: Executor) -> ResourceGeometry {
        self.geometry
            .get(&(rcfg.clone(), executor))
            .copied()
            .unwrap_or_default()
    }

    pub fn add_geometry(&mut self, rcfg: RunConfig, executor: Executor, geometry: &ResourceGeometry) {
        self.run_configs.insert(rcfg.clone());
        self.geometry.entry((rcfg, executor)).or_default().merge(geometry);
    }
}

#[derive(Deserialize)]
struct RawGeometry {
    batch_size: BatchSize,
    batch_num: u64,
    #[serde(default)]
    cfg: Option<String>,
    #[serde(default = "default_executor")]
    executor: Executor,
    #[serde(default)]
    jct: Option<f64>,
    #[serde(default)]
    peakmem: Option<u64>,
    #[serde(default)]
    persistmem: Option<u64>,
}

fn default_executor() -> Executor {
    Executor::Salus
}

#[derive(Deserialize)]
struct RawTemplate {
    name: String,
    runner: RunnerKind,
    #[serde(default)]
    batch_sizes: Vec<BatchSize>,
    #[serde(default)]
    batch_nums: Vec<u64>,
    #[serde(default)]
    geometry: Vec<RawGeometry>,
}

/// YAML-serializable workload manifest.
#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    workloads: Vec<RawTemplate>,
}

/// Workload templates keyed by name, in registration order.
#[derive(Clone, Debug, Default)]
pub struct Catalogue {
    templates: IndexMap<String, Rc<WorkloadTemplate>>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template. Names are unique.
    pub fn define(
        &mut self,
        name: &str,
        run_configs: impl IntoIterator<Item = RunConfig>,
        runner: RunnerKind,
    ) -> Result<()> {
        if self.templates.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let template = WorkloadTemplate::new(name, run_configs, runner);
        self.templates.insert(name.to_string(), Rc::new(template));
        Ok(())
    }

    pub fn from_name(&self, name: &str) -> Result<Rc<WorkloadTemplate>> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownWorkload(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &WorkloadTemplate> + '_ {
        self.templates.values().map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Binds a template to a run configuration and executor.
    pub fn create(
        &self,
        name: &str,
        batch_size: impl Into<BatchSize>,
        batch_num: u64,
        executor: Executor,
    ) -> Result<Workload> {
        self.create_with(name, RunConfig::new(batch_size, batch_num), executor)
    }

    pub fn create_with(&self, name: &str, rcfg: RunConfig, executor: Executor) -> Result<Workload> {
        let template = self.from_name(name)?;
        if !template.is_legal(&rcfg) {
            debug!("{} runs with unlisted configuration {:?}", name, rcfg);
        }
        Ok(Workload::new(template, rcfg, executor))
    }

    pub fn add_geometry(
        &mut self,
        name: &str,
        rcfg: RunConfig,
        executor: Executor,
        geometry: &ResourceGeometry,
    ) -> Result<()> {
        let template = self
            .templates
            .get_mut(name)
            .ok_or_else(|| Error::UnknownWorkload(name.to_string()))?;
        Rc::make_mut(template).add_geometry(rcfg, executor, geometry);
        Ok(())
    }

    /// Loads extra geometry rows measured against the shared server.
    pub fn load_extra(&mut self, path: &Path) -> Result<()> {
        self.load_extra_for(path, Executor::Salus)
    }

    /// Loads a header-less CSV with columns `name, batch_size, batch_num, cfgname, jct, peakmem, persistmem`.
    ///
    /// Rows naming an unknown workload are skipped with a warning.
    pub fn load_extra_for(&mut self, path: &Path, executor: Executor) -> Result<()> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let field = |i: usize| record.get(i).unwrap_or("");
            let name = field(0);
            if name.is_empty() {
                continue;
            }
            if !self.contains(name) {
                warn!("{}:{}: skipping geometry of unknown workload {}", path.display(), line + 1, name);
                continue;
            }
            let batch_num = field(2)
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("{}:{}: bad batch_num: {}", path.display(), line + 1, e)))?;
            let rcfg = RunConfig::new(field(1), batch_num).with_cfg(Some(field(3).to_string()));
            let geometry = ResourceGeometry {
                jct: parse_optional(field(4), path, line)?,
                peakmem: parse_optional(field(5), path, line)?,
                persistmem: parse_optional(field(6), path, line)?,
            };
            self.add_geometry(name, rcfg, executor, &geometry)?;
        }
        Ok(())
    }

    /// Builds a catalogue from a YAML manifest.
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let f = File::open(path).map_err(|_| Error::NotFound(path.to_path_buf()))?;
        let raw: RawManifest = serde_yaml::from_reader(f)?;
        Self::from_raw(raw)
    }

    pub fn from_manifest_str(s: &str) -> Result<Self> {
        Self::from_raw(serde_yaml::from_str(s)?)
    }

    fn from_raw(raw: RawManifest) -> Result<Self> {
        let mut me = Self::new();
        for tpl in raw.workloads {
            let run_configs = tpl
                .batch_sizes
                .iter()
                .cartesian_product(tpl.batch_nums.iter())
                .map(|(bs, bn)| RunConfig::new(bs.clone(), *bn));
            me.define(&tpl.name, run_configs, tpl.runner)?;
            for geo in tpl.geometry {
                let rcfg = RunConfig::new(geo.batch_size, geo.batch_num).with_cfg(geo.cfg);
                let geometry = ResourceGeometry {
                    jct: geo.jct,
                    peakmem: geo.peakmem,
                    persistmem: geo.persistmem,
                };
                me.add_geometry(&tpl.name, rcfg, geo.executor, &geometry)?;
            }
        }
        Ok(me)
    }

    /// The standard CNN benchmarks and Fathom models.
    pub fn builtin() -> Result<Self> {
        let mut me = Self::new();
        let batch_nums = [DEFAULT_BATCH_NUM, 100, 500];
        let cnns: [(&str, [u32; 3]); 11] = [
            ("alexnet", [25, 50, 100]),
            ("googlenet", [25, 50, 100]),
            ("inception3", [25, 50, 100]),
            ("inception4", [25, 50, 75]),
            ("overfeat", [25, 50, 100]),
            ("resnet50", [25, 50, 75]),
            ("resnet101", [25, 50, 75]),
            ("resnet152", [25, 50, 75]),
            ("vgg11", [25, 50, 100]),
            ("vgg16", [25, 50, 100]),
            ("vgg19", [25, 50, 100]),
        ];
        let fathom: [(&str, [&str; 3]); 6] = [
            ("seq2seq", ["small", "medium", "large"]),
            ("mnistsf", ["25", "50", "100"]),
            ("mnistcv", ["25", "50", "100"]),
            ("mnistlg", ["25", "50", "100"]),
            ("speech", ["25", "50", "75"]),
            ("superres", ["32", "64", "128"]),
        ];
        let mut define = |name: &str, sizes: Vec<BatchSize>, runner: RunnerKind| {
            let run_configs = sizes
                .into_iter()
                .cartesian_product(batch_nums.iter())
                .map(|(bs, bn)| RunConfig::new(bs, *bn));
            me.define(name, run_configs, runner)
        };
        for (name, sizes) in cnns {
            define(name, sizes.iter().map(|&s| BatchSize::Num(s)).collect(), RunnerKind::TfBenchmarks)?;
        }
        for (name, sizes) in fathom {
            let runner = if name == "seq2seq" || name == "superres" {
                RunnerKind::Unittest
            } else {
                RunnerKind::Fathom
            };
            define(name, sizes.iter().map(|&s| BatchSize::from(s)).collect(), runner)?;
        }
        Ok(me)
    }
}

fn parse_optional<T: FromStr>(s: &str, path: &Path, line: usize) -> Result<Option<T>>
where
    T::Err: Display,
{
    if s.is_empty() {
        return Ok(None);
    }
    s.parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{}:{}: bad value {:?}: {}", path.display(), line + 1, s, e)))
}
