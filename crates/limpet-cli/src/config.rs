//! CLI configuration file.
//!
//! Optional `limpet.toml` in the working directory (or wherever `--config`
//! points) supplying defaults for flags that are tedious to repeat. Every
//! field has a sensible default, and a missing file is not an error.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Default target architecture for structure decoding.
    pub arch: String,
    /// Consecutive valid records required for a command-table match.
    pub threshold: usize,
    /// Minimum definitions for an environment match.
    pub env_min_entries: usize,
    /// Longest source window the synthesizer tries per start offset.
    pub max_source_len: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            arch: "arm".to_string(),
            threshold: 5,
            env_min_entries: 5,
            max_source_len: 4096,
        }
    }
}

impl CliConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(Some(config))
    }
}
