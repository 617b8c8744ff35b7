use crate::adapter::{AdapterTarget, MetricReading, MinerAdapter, MinerType, StatusSnapshot};
use crate::error::AdapterError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Bitaxe 适配器 - ESP-Miner 固件的 HTTP+JSON 接口
///
/// `GET /api/system/info` 返回全部状态与指标，非 2xx 或 JSON
/// 解析失败一律视为协议错误。
pub struct BitaxeAdapter {
    client: reqwest::Client,
}

impl BitaxeAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn system_info(
        &self,
        target: &AdapterTarget,
    ) -> Result<serde_json::Value, AdapterError> {
        let address = target.address();
        let url = format!("http://{}/api/system/info", address);

        let response = self
            .client
            .get(&url)
            .timeout(target.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout {
                        address: address.clone(),
                    }
                } else {
                    AdapterError::Connection {
                        address: address.clone(),
                        error: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(AdapterError::Protocol {
                address,
                reason: format!("Unexpected status: {}", response.status()),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AdapterError::Protocol {
                address,
                reason: format!("Malformed JSON: {}", e),
            })
    }
}

impl Default for BitaxeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MinerAdapter for BitaxeAdapter {
    fn miner_type(&self) -> MinerType {
        MinerType::Bitaxe
    }

    async fn classify(&self, ip: IpAddr, port: u16, timeout: Duration) -> bool {
        let target = AdapterTarget::new(ip, port, timeout);
        match self.system_info(&target).await {
            // ESP-Miner 固件必带 ASICModel 字段
            Ok(info) => info.get("ASICModel").is_some() || info.get("hashRate").is_some(),
            Err(e) => {
                debug!("Bitaxe probe miss at {}:{}: {}", ip, port, e);
                false
            }
        }
    }

    async fn fetch_status(&self, target: &AdapterTarget) -> Result<StatusSnapshot, AdapterError> {
        let info = self.system_info(target).await?;

        Ok(StatusSnapshot {
            model: info
                .get("ASICModel")
                .and_then(|v| v.as_str())
                .map(String::from),
            firmware_version: info
                .get("version")
                .and_then(|v| v.as_str())
                .map(String::from),
            uptime_secs: info.get("uptimeSeconds").and_then(|v| v.as_u64()),
            fan_rpm: info.get("fanrpm").and_then(|v| v.as_u64()),
        })
    }

    async fn fetch_metrics(&self, target: &AdapterTarget) -> Result<MetricReading, AdapterError> {
        let info = self.system_info(target).await?;

        Ok(MetricReading {
            // hashRate 已经是 GH/s
            hashrate: info.get("hashRate").and_then(|v| v.as_f64()),
            temperature: info.get("temp").and_then(|v| v.as_f64()),
            power: info.get("power").and_then(|v| v.as_f64()),
            pool_status: info
                .get("stratumURL")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    async fn restart(&self, target: &AdapterTarget) -> Result<(), AdapterError> {
        let address = target.address();
        let url = format!("http://{}/api/system/restart", address);

        let response = self
            .client
            .post(&url)
            .timeout(target.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout {
                        address: address.clone(),
                    }
                } else {
                    AdapterError::Connection {
                        address: address.clone(),
                        error: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(AdapterError::Protocol {
                address,
                reason: format!("Restart rejected: {}", response.status()),
            });
        }

        Ok(())
    }
}
