//! Application configuration
//!
//! Loaded from YAML; every section and field has a default so an empty
//! file (or no file) yields a working in-memory configuration.

use serde::Deserialize;
use std::path::Path;

use crate::models::TaxLotMethod;

/// Complete application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub contract_rules: ContractRulesConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
        }
    }
}

/// Engine tuning: retry budget, deadlines, worker pools, defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Optimistic retry attempts per hotpath trade.
    pub max_retries: u32,
    /// Upper bound of the random backoff between retries.
    pub retry_jitter_ms: u64,
    /// Hotpath latency budget.
    pub hotpath_deadline_ms: u64,
    /// Coldpath job retries on a commit race with the hotpath.
    pub coldpath_retries: u32,
    /// Hash partitions for the storage layer.
    pub partitions: u16,
    /// Hotpath worker pool size (input is partitioned by position key).
    pub hotpath_workers: usize,
    /// Coldpath worker pool size, isolated from the hotpath pool.
    pub coldpath_workers: usize,
    /// Per-worker queue capacity.
    pub queue_capacity: usize,
    /// Fallback allocation method when contract rules are unavailable.
    pub default_tax_lot_method: TaxLotMethod,
    /// Furthest allowed forward effective date.
    pub max_forward_days: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_jitter_ms: 5,
            hotpath_deadline_ms: 100,
            coldpath_retries: 3,
            partitions: 16,
            hotpath_workers: 4,
            coldpath_workers: 2,
            queue_capacity: 1024,
            default_tax_lot_method: TaxLotMethod::Fifo,
            max_forward_days: 365,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContractRulesConfig {
    /// Contract Service base URL; empty means a static default-method
    /// client (tests, standalone runs).
    pub base_url: String,
    /// Hard lookup timeout - the hotpath never waits longer.
    pub timeout_ms: u64,
    /// Cache entry lifetime.
    pub ttl_secs: u64,
}

impl Default for ContractRulesConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: 40,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; empty means in-memory stores.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file: String,
    pub level: String,
    /// "hourly" | "daily" | anything else = never rotate
    pub rotation: String,
    pub json: bool,
    pub enable_tracing: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            file: "position_core.log".to_string(),
            level: "info".to_string(),
            rotation: "daily".to_string(),
            json: false,
            enable_tracing: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.engine.hotpath_deadline_ms, 100);
        assert_eq!(config.engine.partitions, 16);
        assert_eq!(config.contract_rules.timeout_ms, 40);
        assert_eq!(config.engine.default_tax_lot_method, TaxLotMethod::Fifo);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
engine:
  max_retries: 5
  default_tax_lot_method: HIFO
server:
  port: 9000
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.engine.default_tax_lot_method, TaxLotMethod::Hifo);
        assert_eq!(config.server.port, 9000);
        // untouched sections keep defaults
        assert_eq!(config.engine.hotpath_deadline_ms, 100);
        assert_eq!(config.database.max_connections, 10);
    }
}
