use crate::adapter::{AdapterTarget, MetricReading, MinerAdapter, MinerType, StatusSnapshot};
use crate::error::AdapterError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Avalon Nano 适配器 - CGMiner JSON-RPC 接口（默认 4028 端口）
///
/// 每次调用新建 TCP 连接，发送一条命令后读到 EOF，回复可能带
/// NUL 结尾。连接不跨轮询保持。
pub struct AvalonAdapter;

impl AvalonAdapter {
    pub fn new() -> Self {
        Self
    }

    /// 发送单条 CGMiner API 命令并解析 JSON 回复
    async fn send_command(
        &self,
        target: &AdapterTarget,
        command: &str,
    ) -> Result<serde_json::Value, AdapterError> {
        let address = target.address();

        let io = async {
            let mut stream = TcpStream::connect((target.ip, target.port)).await?;
            let request = format!("{{\"command\":\"{}\"}}", command);
            stream.write_all(request.as_bytes()).await?;
            stream.shutdown().await?;

            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };

        let reply = tokio::time::timeout(target.timeout, io)
            .await
            .map_err(|_| AdapterError::Timeout {
                address: address.clone(),
            })?
            .map_err(|e| AdapterError::Connection {
                address: address.clone(),
                error: e.to_string(),
            })?;

        // CGMiner 以 NUL 结尾
        let text = String::from_utf8_lossy(&reply);
        let text = text.trim_end_matches('\0').trim();

        serde_json::from_str(text).map_err(|e| AdapterError::Protocol {
            address,
            reason: format!("Malformed JSON-RPC reply: {}", e),
        })
    }

    /// 取 summary 回复中的第一条 SUMMARY 记录
    fn summary_record(reply: &serde_json::Value) -> Option<&serde_json::Value> {
        reply.get("SUMMARY").and_then(|s| s.as_array()).and_then(|a| a.first())
    }
}

impl Default for AvalonAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MinerAdapter for AvalonAdapter {
    fn miner_type(&self) -> MinerType {
        MinerType::AvalonNano
    }

    async fn classify(&self, ip: IpAddr, port: u16, timeout: Duration) -> bool {
        let target = AdapterTarget::new(ip, port, timeout);
        match self.send_command(&target, "version").await {
            Ok(reply) => reply.get("STATUS").is_some() || reply.get("VERSION").is_some(),
            Err(e) => {
                debug!("Avalon probe miss at {}:{}: {}", ip, port, e);
                false
            }
        }
    }

    async fn fetch_status(&self, target: &AdapterTarget) -> Result<StatusSnapshot, AdapterError> {
        let reply = self.send_command(target, "version").await?;
        let version = reply
            .get("VERSION")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first());

        Ok(StatusSnapshot {
            model: version
                .and_then(|v| v.get("PROD"))
                .and_then(|v| v.as_str())
                .map(String::from),
            firmware_version: version
                .and_then(|v| v.get("CGMiner"))
                .and_then(|v| v.as_str())
                .map(String::from),
            uptime_secs: None,
            fan_rpm: None,
        })
    }

    async fn fetch_metrics(&self, target: &AdapterTarget) -> Result<MetricReading, AdapterError> {
        let reply = self.send_command(target, "summary").await?;

        let summary = Self::summary_record(&reply).ok_or_else(|| AdapterError::Protocol {
            address: target.address(),
            reason: "Reply missing SUMMARY section".to_string(),
        })?;

        // MHS av 换算成 GH/s，与其他适配器统一
        let hashrate = summary
            .get("MHS av")
            .and_then(|v| v.as_f64())
            .map(|mhs| mhs / 1000.0);

        Ok(MetricReading {
            hashrate,
            temperature: summary.get("Temperature").and_then(|v| v.as_f64()),
            power: summary.get("Power").and_then(|v| v.as_f64()),
            pool_status: summary
                .get("Pool Stale%")
                .map(|_| "connected".to_string()),
        })
    }

    async fn restart(&self, target: &AdapterTarget) -> Result<(), AdapterError> {
        let reply = self.send_command(target, "restart").await?;

        // restart 命令成功时 CGMiner 返回 STATUS=I（info）
        let accepted = reply
            .get("STATUS")
            .and_then(|s| s.as_array())
            .and_then(|a| a.first())
            .and_then(|s| s.get("STATUS"))
            .and_then(|s| s.as_str())
            .map(|s| s == "I" || s == "S")
            .unwrap_or(false);

        if accepted {
            Ok(())
        } else {
            Err(AdapterError::Protocol {
                address: target.address(),
                reason: "Restart command rejected".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_record_extraction() {
        let reply: serde_json::Value = serde_json::from_str(
            r#"{"STATUS":[{"STATUS":"S"}],"SUMMARY":[{"MHS av":3400.5,"Temperature":41.0}]}"#,
        )
        .unwrap();

        let summary = AvalonAdapter::summary_record(&reply).expect("summary record");
        assert_eq!(summary.get("MHS av").and_then(|v| v.as_f64()), Some(3400.5));
    }

    #[test]
    fn test_summary_record_missing() {
        let reply: serde_json::Value =
            serde_json::from_str(r#"{"STATUS":[{"STATUS":"E"}]}"#).unwrap();
        assert!(AvalonAdapter::summary_record(&reply).is_none());
    }
}
