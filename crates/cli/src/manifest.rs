//! Job manifests.
//!
//! ```toml
//! [[group]]
//! id = 1
//! critical = true
//!
//! [[group.job]]
//! worker_type = "vs"
//! source = "void main() {}"
//!
//! [[group.job]]
//! worker_type = "ps"
//! file = "shaders/lit.ps"    # relative to the manifest
//! ```
//!
//! A job gives exactly one of `source`, `file` or an `input` table; the
//! first two become `{ "source": ... }` payloads.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use kiln_core::{GroupId, Job};

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupSpec>,
}

#[derive(Debug, Deserialize)]
pub struct GroupSpec {
    pub id: u64,
    /// Drained ahead of everything else.
    #[serde(default)]
    pub critical: bool,
    /// Hand results to the result handler instead of staging them.
    #[serde(default)]
    pub apply: bool,
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Deserialize)]
pub struct JobSpec {
    pub worker_type: String,
    pub source: Option<String>,
    pub file: Option<PathBuf>,
    pub input: Option<toml::Value>,
}

impl Manifest {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(toml_str).context("invalid manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            bail!("manifest has no [[group]] tables");
        }
        let mut seen = HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.id) {
                bail!("group {} is declared twice", group.id);
            }
            if group.jobs.is_empty() {
                bail!("group {} has no jobs", group.id);
            }
            for (i, job) in group.jobs.iter().enumerate() {
                let given = [job.source.is_some(), job.file.is_some(), job.input.is_some()]
                    .iter()
                    .filter(|b| **b)
                    .count();
                if given != 1 {
                    bail!(
                        "group {} job {i}: give exactly one of `source`, `file` or `input`",
                        group.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Build the jobs of every group. `base_dir` resolves relative `file` paths.
    pub fn build_jobs(&self, base_dir: &Path) -> Result<Vec<(&GroupSpec, Vec<Job>)>> {
        self.groups
            .iter()
            .map(|group| {
                let jobs = group
                    .jobs
                    .iter()
                    .map(|entry| {
                        let input = entry.payload(base_dir)?;
                        Ok(Job::new(GroupId(group.id), entry.worker_type.as_str(), input))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((group, jobs))
            })
            .collect()
    }
}

impl JobSpec {
    fn payload(&self, base_dir: &Path) -> Result<Value> {
        if let Some(source) = &self.source {
            return Ok(json!({ "source": source }));
        }
        if let Some(file) = &self.file {
            let path = base_dir.join(file);
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read job source {}", path.display()))?;
            return Ok(json!({ "source": source }));
        }
        match &self.input {
            Some(input) => serde_json::to_value(input).context("job input is not representable"),
            None => bail!("job has no payload"),
        }
    }
}
