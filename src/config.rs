//! 引擎运行参数
//!
//! 默认值可由环境变量覆盖：
//!
//! | 变量                          | 字段                      |
//! |-------------------------------|---------------------------|
//! | `ACE_DENSE_CHUNK_THRESHOLD`   | `dense_chunk_threshold`   |
//! | `ACE_SPARSE_CHUNK_INIT_SIZE`  | `sparse_chunk_init_size`  |
//! | `ACE_TILE_SIZE`               | `tile_size`               |
//! | `ACE_CHUNK_SIZE_LIMIT_MIB`    | `chunk_size_limit_mib`    |
//! | `ACE_ENFORCE_DATA_INTEGRITY`  | `enforce_data_integrity`  |

use std::str::FromStr;
use crate::common::{EngineError, Result};

pub const DEFAULT_DENSE_CHUNK_THRESHOLD:  f64   = 0.5;
pub const DEFAULT_SPARSE_CHUNK_INIT_SIZE: f64   = 0.01;
pub const DEFAULT_TILE_SIZE:              usize = 10_000;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Sparse chunk 在 flush 时占用率超过该比例即改写为 Plain
    pub dense_chunk_threshold:  f64,
    /// Sparse chunk 条目区初始容量（占逻辑空间的比例）
    pub sparse_chunk_init_size: f64,
    /// Tile 模式下每批解码的单元数
    pub tile_size:              usize,
    /// 合并后 chunk 的大小上限，0 表示不限制
    pub chunk_size_limit_mib:   usize,
    pub enforce_data_integrity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dense_chunk_threshold:  DEFAULT_DENSE_CHUNK_THRESHOLD,
            sparse_chunk_init_size: DEFAULT_SPARSE_CHUNK_INIT_SIZE,
            tile_size:              DEFAULT_TILE_SIZE,
            chunk_size_limit_mib:   0,
            enforce_data_integrity: true,
        }
    }
}

impl EngineConfig {
    pub fn with_dense_chunk_threshold(mut self, ratio: f64) -> Self {
        self.dense_chunk_threshold = ratio; self
    }
    pub fn with_sparse_chunk_init_size(mut self, ratio: f64) -> Self {
        self.sparse_chunk_init_size = ratio; self
    }
    pub fn with_tile_size(mut self, n: usize) -> Self {
        self.tile_size = n; self
    }
    pub fn with_chunk_size_limit_mib(mut self, mib: usize) -> Self {
        self.chunk_size_limit_mib = mib; self
    }
    pub fn with_enforce_data_integrity(mut self, enforce: bool) -> Self {
        self.enforce_data_integrity = enforce; self
    }

    pub fn chunk_size_limit_bytes(&self) -> usize {
        self.chunk_size_limit_mib.saturating_mul(MIB)
    }

    /// 读取 `ACE_*` 环境变量覆盖默认值
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(raw) = lookup("ACE_DENSE_CHUNK_THRESHOLD") {
            cfg.dense_chunk_threshold = parse("ACE_DENSE_CHUNK_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("ACE_SPARSE_CHUNK_INIT_SIZE") {
            cfg.sparse_chunk_init_size = parse("ACE_SPARSE_CHUNK_INIT_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("ACE_TILE_SIZE") {
            cfg.tile_size = parse("ACE_TILE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("ACE_CHUNK_SIZE_LIMIT_MIB") {
            cfg.chunk_size_limit_mib = parse("ACE_CHUNK_SIZE_LIMIT_MIB", &raw)?;
        }
        if let Some(raw) = lookup("ACE_ENFORCE_DATA_INTEGRITY") {
            cfg.enforce_data_integrity = parse_bool("ACE_ENFORCE_DATA_INTEGRITY", &raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dense_chunk_threshold >= 0.0 && self.dense_chunk_threshold <= 1.0) {
            return Err(EngineError::Config(format!(
                "dense_chunk_threshold must be in [0, 1], got {}", self.dense_chunk_threshold)));
        }
        if !(self.sparse_chunk_init_size >= 0.0 && self.sparse_chunk_init_size <= 1.0) {
            return Err(EngineError::Config(format!(
                "sparse_chunk_init_size must be in [0, 1], got {}", self.sparse_chunk_init_size)));
        }
        if self.tile_size == 0 {
            return Err(EngineError::Config("tile_size must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>()
        .map_err(|_| EngineError::Config(format!("{key}: cannot parse '{raw}'")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on"  => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.chunk_size_limit_bytes(), 0);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("ACE_DENSE_CHUNK_THRESHOLD", "0.25"),
            ("ACE_TILE_SIZE", "64"),
            ("ACE_CHUNK_SIZE_LIMIT_MIB", "2"),
            ("ACE_ENFORCE_DATA_INTEGRITY", "off"),
        ])).unwrap();
        assert_eq!(cfg.dense_chunk_threshold, 0.25);
        assert_eq!(cfg.tile_size, 64);
        assert_eq!(cfg.chunk_size_limit_bytes(), 2 * 1024 * 1024);
        assert!(!cfg.enforce_data_integrity);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("ACE_TILE_SIZE", "lots")])),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("ACE_DENSE_CHUNK_THRESHOLD", "1.5")])),
            Err(EngineError::Config(_))
        ));
        assert!(EngineConfig::default().with_tile_size(0).validate().is_err());
    }
}
