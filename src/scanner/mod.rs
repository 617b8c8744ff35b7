mod engine;

use crate::adapter::MinerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

pub use engine::Scanner;

/// 扫描会话状态机，终态之后只读保留直到被新会话替换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    NotStarted,
    Starting,
    Scanning,
    Completed,
    Cancelled,
    Error,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Cancelled | ScanStatus::Error
        )
    }
}

/// 扫描发现的一台设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundMiner {
    pub ip: IpAddr,
    pub port: u16,
    pub miner_type: MinerType,
}

/// 一次网络发现过程的进度状态
///
/// 只有扫描任务自身可以改写字段；计数器在到达终态前单调不减。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: Uuid,
    pub network_cidr: String,
    pub ports: Vec<u16>,
    pub timeout_secs: u64,
    pub status: ScanStatus,
    pub total_hosts: usize,
    pub scanned_hosts: usize,
    pub current_ip: Option<IpAddr>,
    pub found_miners: Vec<FoundMiner>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ScanSession {
    pub fn new(network_cidr: String, ports: Vec<u16>, timeout_secs: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            network_cidr,
            ports,
            timeout_secs,
            status: ScanStatus::NotStarted,
            total_hosts: 0,
            scanned_hosts: 0,
            current_ip: None,
            found_miners: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }
}

/// 扫描请求参数
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub network: String,
    pub ports: Option<Vec<u16>>,
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_allow_new_scan() {
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());
        assert!(ScanStatus::Error.is_terminal());

        assert!(!ScanStatus::NotStarted.is_terminal());
        assert!(!ScanStatus::Starting.is_terminal());
        assert!(!ScanStatus::Scanning.is_terminal());
    }
}
