pub mod avalon;
pub mod bitaxe;
pub mod generic;
pub mod magic_miner;

use crate::config::GenericAdapterConfig;
use crate::error::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use avalon::AvalonAdapter;
pub use bitaxe::BitaxeAdapter;
pub use generic::GenericAdapter;
pub use magic_miner::MagicMinerAdapter;

/// 矿机类型 - 分类时一次确定，之后静态分发到对应适配器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerType {
    Bitaxe,
    AvalonNano,
    MagicMiner,
    Generic,
}

impl MinerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MinerType::Bitaxe => "bitaxe",
            MinerType::AvalonNano => "avalon_nano",
            MinerType::MagicMiner => "magic_miner",
            MinerType::Generic => "generic",
        }
    }

    /// 扫描分类的固定优先级，首个命中即停止
    pub fn classification_order() -> [MinerType; 3] {
        [MinerType::Bitaxe, MinerType::AvalonNano, MinerType::MagicMiner]
    }
}

impl fmt::Display for MinerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MinerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitaxe" => Ok(MinerType::Bitaxe),
            "avalon_nano" => Ok(MinerType::AvalonNano),
            "magic_miner" => Ok(MinerType::MagicMiner),
            "generic" => Ok(MinerType::Generic),
            other => Err(format!("Unknown miner type: {}", other)),
        }
    }
}

/// 一次适配器调用的目标设备，无状态，每次调用重新建立连接
#[derive(Debug, Clone)]
pub struct AdapterTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl AdapterTarget {
    pub fn new(ip: IpAddr, port: u16, timeout: Duration) -> Self {
        Self {
            ip,
            port,
            username: None,
            password: None,
            timeout,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// 设备状态快照（非指标），缺失字段保持 None
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub uptime_secs: Option<u64>,
    pub fan_rpm: Option<u64>,
}

/// 一次指标读数，由轮询器打上 miner_id / 时间戳后落库
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricReading {
    /// 算力（GH/s）
    pub hashrate: Option<f64>,
    /// 温度（摄氏度）
    pub temperature: Option<f64>,
    /// 功耗（瓦）
    pub power: Option<f64>,
    /// 矿池连接状态
    pub pool_status: Option<String>,
}

/// 协议适配器统一契约
///
/// 每个方法都受 target.timeout 约束，所有失败路径返回 AdapterError，
/// 编排器据此套用统一的重试策略。
#[async_trait]
pub trait MinerAdapter: Send + Sync {
    fn miner_type(&self) -> MinerType;

    /// 探测目标是否为本家族设备（分类用，失败按"不匹配"处理）
    async fn classify(&self, ip: IpAddr, port: u16, timeout: Duration) -> bool;

    async fn fetch_status(&self, target: &AdapterTarget) -> Result<StatusSnapshot, AdapterError>;

    async fn fetch_metrics(&self, target: &AdapterTarget) -> Result<MetricReading, AdapterError>;

    async fn restart(&self, target: &AdapterTarget) -> Result<(), AdapterError>;
}

/// 按矿机类型创建适配器
pub fn adapter_for(
    miner_type: MinerType,
    generic_config: &GenericAdapterConfig,
) -> Arc<dyn MinerAdapter> {
    match miner_type {
        MinerType::Bitaxe => Arc::new(BitaxeAdapter::new()),
        MinerType::AvalonNano => Arc::new(AvalonAdapter::new()),
        MinerType::MagicMiner => Arc::new(MagicMinerAdapter::new()),
        MinerType::Generic => Arc::new(GenericAdapter::new(generic_config.clone())),
    }
}

/// 按固定优先级对开放端口分类，首个命中返回
pub async fn classify_port(ip: IpAddr, port: u16, timeout: Duration) -> Option<MinerType> {
    for miner_type in MinerType::classification_order() {
        let matched = match miner_type {
            MinerType::Bitaxe => BitaxeAdapter::new().classify(ip, port, timeout).await,
            MinerType::AvalonNano => AvalonAdapter::new().classify(ip, port, timeout).await,
            MinerType::MagicMiner => MagicMinerAdapter::new().classify(ip, port, timeout).await,
            MinerType::Generic => false,
        };
        if matched {
            return Some(miner_type);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miner_type_roundtrip() {
        for t in [
            MinerType::Bitaxe,
            MinerType::AvalonNano,
            MinerType::MagicMiner,
            MinerType::Generic,
        ] {
            assert_eq!(t.as_str().parse::<MinerType>().unwrap(), t);
        }
    }

    #[test]
    fn test_classification_order_excludes_generic() {
        assert!(!MinerType::classification_order().contains(&MinerType::Generic));
    }
}
