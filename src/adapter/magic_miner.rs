use crate::adapter::{AdapterTarget, MetricReading, MinerAdapter, MinerType, StatusSnapshot};
use crate::error::AdapterError;
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// MagicMiner 适配器 - 抓取设备自带的 HTML 状态页
///
/// 页面没有 JSON 接口，只能按已知 DOM 锚点提取字段。缺失的锚点
/// 视为部分数据（对应字段置 None），只有传输失败或整页不可解析
/// 才算错误。
pub struct MagicMinerAdapter {
    client: reqwest::Client,
}

/// 状态页上提取到的字段集合
#[derive(Debug, Default)]
struct StatusPage {
    title_matches: bool,
    model: Option<String>,
    firmware_version: Option<String>,
    hashrate: Option<f64>,
    temperature: Option<f64>,
    power: Option<f64>,
    pool_status: Option<String>,
}

impl MagicMinerAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_page(&self, target: &AdapterTarget) -> Result<String, AdapterError> {
        let address = target.address();
        let url = format!("http://{}/", address);

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

        response.text().await.map_err(|e| AdapterError::Protocol {
            address,
            reason: format!("Failed to read body: {}", e),
        })
    }

    /// 同步解析状态页，Html 不跨 await 持有
    fn parse_page(html: &str) -> StatusPage {
        let doc = Html::parse_document(html);
        let mut page = StatusPage::default();

        if let Ok(selector) = Selector::parse("title") {
            page.title_matches = doc
                .select(&selector)
                .next()
                .map(|t| t.text().collect::<String>().contains("Magic Miner"))
                .unwrap_or(false);
        }

        page.model = Self::text_at(&doc, "#miner-model");
        page.firmware_version = Self::text_at(&doc, "#fw-version");
        page.hashrate = Self::number_at(&doc, "#hashrate");
        page.temperature = Self::number_at(&doc, "#temperature");
        page.power = Self::number_at(&doc, "#power");
        page.pool_status = Self::text_at(&doc, "#pool-status");

        page
    }

    fn text_at(doc: &Html, selector_str: &str) -> Option<String> {
        let selector = Selector::parse(selector_str).ok()?;
        let text = doc
            .select(&selector)
            .next()?
            .text()
            .collect::<String>()
            .trim()
            .to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// 锚点文本形如 "3.2 TH/s" / "55 °C"，取首个数字部分
    fn number_at(doc: &Html, selector_str: &str) -> Option<f64> {
        let text = Self::text_at(doc, selector_str)?;
        let numeric: String = text
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        numeric.parse().ok()
    }
}

impl Default for MagicMinerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MinerAdapter for MagicMinerAdapter {
    fn miner_type(&self) -> MinerType {
        MinerType::MagicMiner
    }

    async fn classify(&self, ip: IpAddr, port: u16, timeout: Duration) -> bool {
        let target = AdapterTarget::new(ip, port, timeout);
        match self.fetch_page(&target).await {
            Ok(html) => Self::parse_page(&html).title_matches,
            Err(e) => {
                debug!("MagicMiner probe miss at {}:{}: {}", ip, port, e);
                false
            }
        }
    }

    async fn fetch_status(&self, target: &AdapterTarget) -> Result<StatusSnapshot, AdapterError> {
        let html = self.fetch_page(target).await?;
        let page = Self::parse_page(&html);

        Ok(StatusSnapshot {
            model: page.model,
            firmware_version: page.firmware_version,
            uptime_secs: None,
            fan_rpm: None,
        })
    }

    async fn fetch_metrics(&self, target: &AdapterTarget) -> Result<MetricReading, AdapterError> {
        let html = self.fetch_page(target).await?;
        let page = Self::parse_page(&html);

        Ok(MetricReading {
            hashrate: page.hashrate,
            temperature: page.temperature,
            power: page.power,
            pool_status: page.pool_status,
        })
    }

    async fn restart(&self, target: &AdapterTarget) -> Result<(), AdapterError> {
        // 状态页没有重启入口
        Err(AdapterError::Protocol {
            address: target.address(),
            reason: "Restart is not supported by this device family".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PAGE: &str = r#"
        <html><head><title>Magic Miner BM1</title></head><body>
        <span id="miner-model">BM1366</span>
        <span id="hashrate">512.3 GH/s</span>
        <span id="temperature">55 &#176;C</span>
        <span id="pool-status">Connected</span>
        </body></html>
    "#;

    #[test]
    fn test_parse_full_page() {
        let page = MagicMinerAdapter::parse_page(SAMPLE_PAGE);
        assert!(page.title_matches);
        assert_eq!(page.model.as_deref(), Some("BM1366"));
        assert_eq!(page.hashrate, Some(512.3));
        assert_eq!(page.temperature, Some(55.0));
        assert_eq!(page.pool_status.as_deref(), Some("Connected"));
    }

    #[test]
    fn test_missing_anchor_is_partial_data() {
        let page = MagicMinerAdapter::parse_page(
            "<html><head><title>Magic Miner</title></head><body><span id=\"hashrate\">10</span></body></html>",
        );
        assert!(page.title_matches);
        assert_eq!(page.hashrate, Some(10.0));
        assert!(page.temperature.is_none());
        assert!(page.power.is_none());
    }

    #[test]
    fn test_foreign_page_does_not_match() {
        let page = MagicMinerAdapter::parse_page(
            "<html><head><title>Router Admin</title></head><body></body></html>",
        );
        assert!(!page.title_matches);
    }
}
