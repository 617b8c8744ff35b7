use crate::adapter::{AdapterTarget, MetricReading, MinerAdapter, MinerType, StatusSnapshot};
use crate::config::GenericAdapterConfig;
use crate::error::AdapterError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// 通用适配器 - 用户提供 HTTP 路径与字段映射
///
/// 面向未内置支持的设备：只要有一个返回 JSON 的状态接口就能接入。
/// 不参与扫描分类，只能手动添加。
pub struct GenericAdapter {
    client: reqwest::Client,
    config: GenericAdapterConfig,
}

impl GenericAdapter {
    pub fn new(config: GenericAdapterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch_json(
        &self,
        target: &AdapterTarget,
    ) -> Result<serde_json::Value, AdapterError> {
        let address = target.address();
        let path = self.config.status_path.trim_start_matches('/');
        let url = format!("http://{}/{}", address, path);

        let mut request = self.client.get(&url).timeout(target.timeout);
        if let (Some(user), Some(pass)) = (&target.username, &target.password) {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| {
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

    /// 支持 "a.b.c" 形式的嵌套字段路径
    fn field<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
        let mut current = value;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }
}

#[async_trait]
impl MinerAdapter for GenericAdapter {
    fn miner_type(&self) -> MinerType {
        MinerType::Generic
    }

    async fn classify(&self, _ip: IpAddr, _port: u16, _timeout: Duration) -> bool {
        // 通用适配器没有协议签名，不参与自动分类
        false
    }

    async fn fetch_status(&self, target: &AdapterTarget) -> Result<StatusSnapshot, AdapterError> {
        // 映射只覆盖指标字段，状态快照保持空
        self.fetch_json(target).await?;
        Ok(StatusSnapshot {
            model: None,
            firmware_version: None,
            uptime_secs: None,
            fan_rpm: None,
        })
    }

    async fn fetch_metrics(&self, target: &AdapterTarget) -> Result<MetricReading, AdapterError> {
        let json = self.fetch_json(target).await?;

        Ok(MetricReading {
            hashrate: Self::field(&json, &self.config.hashrate_field).and_then(|v| v.as_f64()),
            temperature: Self::field(&json, &self.config.temperature_field)
                .and_then(|v| v.as_f64()),
            power: Self::field(&json, &self.config.power_field).and_then(|v| v.as_f64()),
            pool_status: None,
        })
    }

    async fn restart(&self, target: &AdapterTarget) -> Result<(), AdapterError> {
        Err(AdapterError::Protocol {
            address: target.address(),
            reason: "Restart is not supported for generic miners".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_field_lookup() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"stats":{"hashrate":123.4},"temp":60}"#).unwrap();

        assert_eq!(
            GenericAdapter::field(&json, "stats.hashrate").and_then(|v| v.as_f64()),
            Some(123.4)
        );
        assert_eq!(
            GenericAdapter::field(&json, "temp").and_then(|v| v.as_f64()),
            Some(60.0)
        );
        assert!(GenericAdapter::field(&json, "stats.power").is_none());
    }
}
