// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<BasaltConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

fn default_vector_size() -> usize {
    1024
}

fn default_block_size_bytes() -> usize {
    256 * 1024
}

fn default_initial_radix_bits() -> usize {
    4
}

fn default_join_memory_budget_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_partition_threads() -> usize {
    4
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static BasaltConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = BasaltConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static BasaltConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env() {
        Some(path) => BasaltConfig::load_from_file(&path)?,
        None => BasaltConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static BasaltConfig> {
    init_from_env_or_default()
}

fn config_path_from_env() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("BASALT_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let candidate = PathBuf::from("basalt.toml");
    if candidate.exists() {
        return Some(candidate);
    }
    None
}

#[derive(Debug, Deserialize)]
pub struct BasaltConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Rows per column-major batch.
    #[serde(default = "default_vector_size")]
    pub vector_size: usize,
    /// Target byte size of a row or heap block.
    #[serde(default = "default_block_size_bytes")]
    pub block_size_bytes: usize,
    /// Radix bits used by per-worker histograms; reduced during external build.
    #[serde(default = "default_initial_radix_bits")]
    pub initial_radix_bits: usize,
    /// Memory budget for a finalized hash-table round.
    #[serde(default = "default_join_memory_budget_bytes")]
    pub join_memory_budget_bytes: usize,
    /// Threads used by the partition event.
    #[serde(default = "default_partition_threads")]
    pub partition_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector_size: default_vector_size(),
            block_size_bytes: default_block_size_bytes(),
            initial_radix_bits: default_initial_radix_bits(),
            join_memory_budget_bytes: default_join_memory_budget_bytes(),
            partition_threads: default_partition_threads(),
        }
    }
}

impl BasaltConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: BasaltConfig = toml::from_str(&text)
            .map_err(|e| anyhow!("parse config file {}: {e}", path.display()))?;
        if cfg.engine.vector_size == 0 {
            return Err(anyhow!("engine.vector_size must be positive"));
        }
        if cfg.engine.initial_radix_bits == 0 || cfg.engine.initial_radix_bits > 16 {
            return Err(anyhow!("engine.initial_radix_bits must be in 1..=16"));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::BasaltConfig;

    #[test]
    fn test_default_config() {
        let cfg = BasaltConfig::default();
        assert_eq!(cfg.engine.vector_size, 1024);
        assert_eq!(cfg.engine.initial_radix_bits, 4);
        assert_eq!(cfg.log.level, "info");
    }
}
