//! JSON configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use regex::Regex;
use serde::Deserialize;

use backhaul_core::Result;

/// One backup job: a tree to save and the paths to leave out.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub base_path: PathBuf,
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// The on-disk configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub jobs: BTreeMap<String, JobConfig>,

    pub access_key_id: String,
    pub access_key_secret: String,

    /// Bucket holding blob objects.
    pub bucket: String,
    pub region: String,
    /// Custom S3-compatible endpoint; AWS when absent.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Namespace for the registry's records.
    pub domain: String,
    #[serde(default)]
    pub domain_region: Option<String>,

    /// Where local state (record database, state snapshot) lives.
    /// Defaults to `~/.backhaul`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {path:?}"))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            bail!("config defines no jobs");
        }
        for (name, job) in &self.jobs {
            if name.is_empty() {
                bail!("job names must be non-empty");
            }
            if !job.base_path.is_absolute() {
                bail!(
                    "job {name:?}: base path {:?} must be absolute",
                    job.base_path
                );
            }
            for pattern in &job.excludes {
                Regex::new(pattern)
                    .with_context(|| format!("job {name:?}: invalid exclude {pattern:?}"))?;
            }
        }
        if self.bucket.is_empty() || self.domain.is_empty() {
            bail!("bucket and domain must be non-empty");
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig> {
        self.jobs
            .get(name)
            .with_context(|| format!("no job named {name:?} in config"))
    }

    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
        PathBuf::from(home).join(".backhaul")
    }
}

impl JobConfig {
    /// The exclude patterns, compiled. Validation at load time guarantees
    /// this cannot fail for a loaded config.
    pub fn compiled_excludes(&self) -> Result<Vec<Regex>> {
        self.excludes
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid exclude {pattern:?}"))
            })
            .collect()
    }
}
