use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "minermon.toml")]
    pub config: String,

    /// API server port (overrides config)
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Disable API server
    #[arg(long)]
    pub no_api: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub scanner: ScannerConfig,
    pub polling: PollingConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub generic: GenericAdapterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
    pub pid_file: Option<PathBuf>,
}

/// 网络扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// 默认探测端口
    pub default_ports: Vec<u16>,
    /// 单主机探测超时（秒）
    pub probe_timeout_secs: u64,
    /// 并发探测上限
    pub max_concurrency: usize,
    /// 主机数安全上限，防止误扫超大网段
    pub max_hosts: usize,
}

/// 轮询与退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// 正常轮询间隔（秒）
    pub interval_secs: u64,
    /// 单次适配器调用超时（秒）
    pub adapter_timeout_secs: u64,
    /// 连续失败多少次后标记 offline
    pub failure_threshold: u32,
    /// 退避基数（秒）
    pub backoff_base_secs: u64,
    /// 退避上限（秒）
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite 数据库路径
    pub path: String,
    /// 样本保留天数
    pub retention_days: u32,
    /// 清理周期（秒）
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
}

/// 通用适配器的路径/字段映射，按部署配置一份
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericAdapterConfig {
    pub status_path: String,
    pub hashrate_field: String,
    pub temperature_field: String,
    pub power_field: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                log_level: "info".to_string(),
                pid_file: None,
            },
            scanner: ScannerConfig {
                default_ports: vec![80, 4028],
                probe_timeout_secs: 2,
                max_concurrency: 50,
                max_hosts: 65536,
            },
            polling: PollingConfig {
                interval_secs: 30,
                adapter_timeout_secs: 10,
                failure_threshold: 5,
                backoff_base_secs: 2,
                backoff_cap_secs: 60,
            },
            storage: StorageConfig {
                path: "minermon.db".to_string(),
                retention_days: 30,
                prune_interval_secs: 86400,
            },
            api: ApiConfig {
                enabled: true,
                bind_address: "0.0.0.0".to_string(),
                port: 8077,
                allow_origins: vec!["*".to_string()],
            },
            generic: GenericAdapterConfig {
                status_path: "/api/status".to_string(),
                hashrate_field: "hashrate".to_string(),
                temperature_field: "temperature".to_string(),
                power_field: "power".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// 配置文件存在则加载，否则使用默认值
    pub fn load_or_default(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let config_content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scanner.default_ports.is_empty() {
            anyhow::bail!("At least one scan port must be configured");
        }

        if self.scanner.max_concurrency == 0 {
            anyhow::bail!("Scanner max_concurrency must be greater than 0");
        }

        if self.scanner.max_hosts == 0 || self.scanner.max_hosts > 1 << 20 {
            anyhow::bail!("Scanner max_hosts must be between 1 and 1048576");
        }

        if self.polling.interval_secs == 0 {
            anyhow::bail!("Polling interval must be greater than 0");
        }

        if self.polling.failure_threshold == 0 {
            anyhow::bail!("Polling failure_threshold must be greater than 0");
        }

        if self.polling.backoff_base_secs == 0
            || self.polling.backoff_base_secs > self.polling.backoff_cap_secs
        {
            anyhow::bail!("Polling backoff_base_secs must be between 1 and backoff_cap_secs");
        }

        if self.storage.retention_days == 0 {
            anyhow::bail!("Storage retention_days must be greater than 0");
        }

        if self.api.port < 1024 {
            anyhow::bail!("API port {} is out of range (1024-65535)", self.api.port);
        }

        Ok(())
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_ports() {
        let mut config = Config::default();
        config.scanner.default_ports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_backoff_base_above_cap() {
        let mut config = Config::default();
        config.polling.backoff_base_secs = 120;
        config.polling.backoff_cap_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_roundtrip() {
        let config = Config::default();
        let temp_file = std::env::temp_dir().join("minermon_test_config.toml");
        config.save(temp_file.to_str().unwrap()).expect("save config");

        let loaded = Config::load(temp_file.to_str().unwrap()).expect("load config");
        assert_eq!(loaded.scanner.default_ports, vec![80, 4028]);
        assert_eq!(loaded.polling.failure_threshold, 5);
        assert_eq!(loaded.storage.retention_days, 30);

        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/minermon.toml").expect("defaults");
        assert_eq!(config.polling.interval_secs, 30);
    }
}
