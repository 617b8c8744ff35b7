pub mod manager;

use crate::registry::MinerState;
use crate::scanner::ScanSession;
use crate::storage::MetricSample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use manager::MonitorManager;

/// 推送到 Hub 的引擎事件，序列化格式即 WebSocket 线上格式
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// 扫描进度快照
    DiscoveryUpdate(ScanSession),
    /// 新样本
    MetricUpdate(MetricSample),
    /// 矿机在线状态翻转
    StatusChange {
        miner_id: Uuid,
        status: MinerState,
        last_seen: Option<DateTime<Utc>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_change_wire_format() {
        let event = MonitorEvent::StatusChange {
            miner_id: Uuid::nil(),
            status: MinerState::Offline,
            last_seen: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_change");
        assert_eq!(json["data"]["status"], "offline");
    }
}
