//! On-disk configuration: maps workdirs to servers and stores user-defined
//! command aliases.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const BO_VERSION: &str = "v0.1.0";

/// One server a workdir can sync to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub host: String,
    pub port: u16,
    pub target_dir: String,
    pub cache_path: String,
}

/// Everything known about a single configured workdir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkdirConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, WorkspaceConfig>,
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
}

/// The whole `$HOME/.bo-by-sea5kg/config.yml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoConfig {
    pub bo_version: String,
    #[serde(default)]
    pub workdirs: BTreeMap<String, WorkdirConfig>,
}

impl Default for BoConfig {
    fn default() -> Self {
        Self {
            bo_version: BO_VERSION.to_string(),
            workdirs: BTreeMap::new(),
        }
    }
}

/// `$HOME/.bo-by-sea5kg` — created on first use.
pub fn home_config_dir() -> Result<PathBuf> {
    let expanded = shellexpand::tilde("~/.bo-by-sea5kg");
    Ok(PathBuf::from(expanded.into_owned()))
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(home_config_dir()?.join("config.yml"))
}

impl BoConfig {
    /// Load the config, creating the home directory and an empty config on
    /// first run. A malformed file is a fatal error.
    pub fn load() -> Result<Self> {
        let dir = home_config_dir()?;
        if !dir.is_dir() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let path = config_file_path()?;
        if !path.is_file() {
            let cfg = Self::default();
            cfg.save()?;
            return Ok(cfg);
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: Self = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.bo_version = BO_VERSION.to_string();
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let path = config_file_path()?;
        let yaml = serde_yaml::to_string(self)?;
        fs::write(&path, yaml).with_context(|| format!("writing config {}", path.display()))
    }

    /// Deterministic cache path for `(workdir, target_dir, host)`, matching
    /// `md5(workdir|target_dir|host)`.
    pub fn cache_path_for(&self, workdir: &str, target_dir: &str, host: &str) -> Result<PathBuf> {
        let key = format!("{workdir}|{target_dir}|{host}");
        let digest = {
            let mut ctx = md5::Context::new();
            ctx.consume(key.as_bytes());
            format!("{:x}", ctx.compute())
        };
        Ok(home_config_dir()?.join(format!("{digest}.yml")))
    }

    /// Find the configured workdir that is `current_dir` or one of its
    /// ancestors, the way the CLI resolves "am I inside a known workdir".
    pub fn find_workdir<'a>(&'a self, current_dir: &Path) -> Option<(&'a str, &'a WorkdirConfig)> {
        let mut candidate = current_dir.to_path_buf();
        loop {
            let key = candidate.to_string_lossy();
            if let Some((k, v)) = self.workdirs.get_key_value(key.as_ref()) {
                return Some((k.as_str(), v));
            }
            if !candidate.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_is_deterministic() {
        let cfg = BoConfig::default();
        let a = cfg.cache_path_for("/home/u/proj", "/srv/app", "example.com").unwrap();
        let b = cfg.cache_path_for("/home/u/proj", "/srv/app", "example.com").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_path_differs_for_different_tuples() {
        let cfg = BoConfig::default();
        let a = cfg.cache_path_for("/home/u/proj", "/srv/app", "example.com").unwrap();
        let b = cfg.cache_path_for("/home/u/proj", "/srv/other", "example.com").unwrap();
        assert_ne!(a, b);
    }
}
