use crate::adapter::MinerAdapter;
use crate::config::PollingConfig;
use crate::hub::{Hub, Topic};
use crate::monitor::MonitorEvent;
use crate::registry::{Miner, MinerState, MinerStatus};
use crate::storage::{MetricSample, MetricStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// 指数退避延迟：base * 2^(failures-1)，封顶后加 ±25% 抖动
pub fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent).min(cap);

    let jitter = delay.as_millis() as f64 * 0.25 * (fastrand::f64() * 2.0 - 1.0);
    let jittered = (delay.as_millis() as f64 + jitter).max(0.0) as u64;
    Duration::from_millis(jittered)
}

/// 单台矿机的轮询循环
///
/// 循环内严格串行，样本天然有序；失败只影响本机的退避节奏，
/// 到达阈值翻转 offline 后继续以退避上限轮询，设备恢复即自愈。
pub(crate) async fn poll_loop(
    miner: Miner,
    adapter: Arc<dyn MinerAdapter>,
    store: Arc<MetricStore>,
    hub: Arc<Hub>,
    polling: PollingConfig,
    status: Arc<RwLock<MinerStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let target = crate::adapter::AdapterTarget {
        ip: miner.ip_address,
        port: miner.port,
        username: miner.username.clone(),
        password: miner.password.clone(),
        timeout: polling.adapter_timeout(),
    };

    debug!("Poll loop started for {} ({})", miner.name, miner.id);
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // 在途请求不阻塞关停
        let fetched = tokio::select! {
            result = adapter.fetch_metrics(&target) => result,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match fetched {
            Ok(reading) => {
                failures = 0;
                let now = Utc::now();

                let recovered = {
                    let mut s = status.write().await;
                    let recovered = s.state != MinerState::Online;
                    s.state = MinerState::Online;
                    s.last_seen = Some(now);
                    s.consecutive_failures = 0;
                    recovered
                };

                if recovered {
                    info!("Miner {} is online", miner.name);
                    hub.publish(
                        Topic::Metrics,
                        MonitorEvent::StatusChange {
                            miner_id: miner.id,
                            status: MinerState::Online,
                            last_seen: Some(now),
                        },
                    )
                    .await;
                }

                let sample = MetricSample {
                    miner_id: miner.id,
                    timestamp: now,
                    hashrate: reading.hashrate,
                    temperature: reading.temperature,
                    power: reading.power,
                    pool_status: reading.pool_status,
                    status: MinerState::Online,
                };

                // 单个样本写失败不致命，丢一个点继续轮询
                if let Err(e) = store.insert_sample(&sample).await {
                    warn!("Failed to persist sample for {}: {}", miner.name, e);
                }

                hub.publish(Topic::Metrics, MonitorEvent::MetricUpdate(sample))
                    .await;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                debug!(
                    "Poll failure {} for {} ({}): {}",
                    failures, miner.name, miner.id, e
                );

                let went_offline = {
                    let mut s = status.write().await;
                    s.consecutive_failures = failures;
                    if failures == polling.failure_threshold && s.state != MinerState::Offline {
                        s.state = MinerState::Offline;
                        true
                    } else {
                        false
                    }
                };

                if went_offline {
                    let last_seen = status.read().await.last_seen;
                    warn!(
                        "Miner {} marked offline after {} consecutive failures",
                        miner.name, failures
                    );
                    hub.publish(
                        Topic::Metrics,
                        MonitorEvent::StatusChange {
                            miner_id: miner.id,
                            status: MinerState::Offline,
                            last_seen,
                        },
                    )
                    .await;
                }
            }
        }

        let delay = if failures == 0 {
            polling.interval()
        } else {
            backoff_delay(polling.backoff_base(), polling.backoff_cap(), failures)
        };

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Poll loop stopped for {} ({})", miner.name, miner.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_is_capped() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);

        for failures in 1..=20 {
            let delay = backoff_delay(base, cap, failures);
            // 抖动幅度 ±25%
            assert!(delay <= cap + cap / 4, "failures={}: {:?}", failures, delay);
        }
    }

    #[test]
    fn test_backoff_first_failure_near_base() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);

        let delay = backoff_delay(base, cap, 1);
        assert!(delay >= base / 2 && delay <= base * 2);
    }

    #[test]
    fn test_backoff_does_not_overflow_on_large_failure_counts() {
        let delay = backoff_delay(Duration::from_secs(2), Duration::from_secs(60), u32::MAX);
        assert!(delay <= Duration::from_secs(75));
    }
}
