use crate::adapter::classify_port;
use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::hub::{Hub, Topic};
use crate::monitor::MonitorEvent;
use crate::scanner::{FoundMiner, ScanRequest, ScanSession, ScanStatus};
use chrono::Utc;
use ipnet::Ipv4Net;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 单台主机的探测结果
struct HostResult {
    ip: IpAddr,
    found: Vec<FoundMiner>,
    /// 被取消跳过的主机不计入 scanned_hosts
    probed: bool,
}

/// 网络扫描器 - CIDR × 端口集的有界并发探测
///
/// 同一时间至多一个活动会话；会话字段只由扫描任务改写，取消是
/// 协作式的，在途探测允许完成。
pub struct Scanner {
    config: ScannerConfig,
    hub: Arc<Hub>,
    session: Arc<RwLock<Option<ScanSession>>>,
    cancel: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(config: ScannerConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            hub,
            session: Arc::new(RwLock::new(None)),
            cancel: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// 启动扫描，已有活动会话时快速失败
    pub async fn start(&self, request: ScanRequest) -> Result<ScanSession, ScanError> {
        let mut guard = self.session.write().await;

        if let Some(active) = guard.as_ref() {
            if !active.status.is_terminal() {
                return Err(ScanError::AlreadyRunning {
                    session_id: active.id,
                });
            }
        }

        let network: Ipv4Net =
            request
                .network
                .parse()
                .map_err(|_| ScanError::InvalidCidr {
                    input: request.network.clone(),
                })?;

        let hosts: Vec<IpAddr> = network.hosts().map(IpAddr::V4).collect();
        if hosts.is_empty() {
            return Err(ScanError::InvalidCidr {
                input: request.network.clone(),
            });
        }
        if hosts.len() > self.config.max_hosts {
            return Err(ScanError::RangeTooLarge {
                hosts: hosts.len(),
                limit: self.config.max_hosts,
            });
        }

        let ports = request
            .ports
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.config.default_ports.clone());
        let timeout_secs = request.timeout.unwrap_or(self.config.probe_timeout_secs);

        let mut session = ScanSession::new(request.network.clone(), ports.clone(), timeout_secs);
        session.total_hosts = hosts.len();
        session.status = ScanStatus::Starting;

        *guard = Some(session.clone());
        drop(guard);

        self.cancel.store(false, Ordering::SeqCst);

        info!(
            "Starting scan {} over {} ({} hosts, ports {:?})",
            session.id, session.network_cidr, session.total_hosts, ports
        );

        let task = run_scan(
            hosts,
            ports,
            Duration::from_secs(timeout_secs),
            self.config.max_concurrency,
            self.session.clone(),
            self.cancel.clone(),
            self.hub.clone(),
        );

        let mut handle = self.handle.lock().await;
        *handle = Some(tokio::spawn(task));

        Ok(session)
    }

    /// 请求取消当前扫描，在途探测完成后会话转入 cancelled
    pub async fn stop(&self) -> Result<(), ScanError> {
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(session) if !session.status.is_terminal() => {
                info!("Cancelling scan {}", session.id);
                self.cancel.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(ScanError::NotRunning),
        }
    }

    /// 当前会话快照（含已终态的上一次会话）
    pub async fn status(&self) -> Option<ScanSession> {
        self.session.read().await.clone()
    }

    /// 等待扫描任务退出，关停与测试用
    pub async fn wait(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scan task ended abnormally: {}", e);
            }
        }
    }
}

/// 扫描主体：有界并发探测所有主机，逐台回报进度
async fn run_scan(
    hosts: Vec<IpAddr>,
    ports: Vec<u16>,
    probe_timeout: Duration,
    max_concurrency: usize,
    session: Arc<RwLock<Option<ScanSession>>>,
    cancel: Arc<AtomicBool>,
    hub: Arc<Hub>,
) {
    update_session(&session, &hub, |s| {
        s.status = ScanStatus::Scanning;
    })
    .await;

    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<HostResult>();

    let mut workers = Vec::with_capacity(hosts.len());
    for ip in hosts {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let ports = ports.clone();
        let result_tx = result_tx.clone();

        workers.push(tokio::spawn(async move {
            // 信号量只会随扫描任务一起消亡；关闭时不再探测
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = result_tx.send(HostResult {
                    ip,
                    found: Vec::new(),
                    probed: false,
                });
                return;
            };
            // 取消标志在取得探测许可后、发起探测前检查
            if cancel.load(Ordering::SeqCst) {
                let _ = result_tx.send(HostResult {
                    ip,
                    found: Vec::new(),
                    probed: false,
                });
                return;
            }

            let found = probe_host(ip, &ports, probe_timeout).await;
            let _ = result_tx.send(HostResult {
                ip,
                found,
                probed: true,
            });
        }));
    }
    drop(result_tx);

    // 进度更新只在这里发生，保证会话单写者与计数器单调
    while let Some(result) = result_rx.recv().await {
        update_session(&session, &hub, |s| {
            if result.probed {
                s.scanned_hosts += 1;
                s.current_ip = Some(result.ip);
            }
            for miner in result.found {
                if !s.found_miners.contains(&miner) {
                    s.found_miners.push(miner);
                }
            }
        })
        .await;
    }

    let mut failed_probes = 0usize;
    for worker in workers {
        if worker.await.is_err() {
            failed_probes += 1;
        }
    }

    let cancelled = cancel.load(Ordering::SeqCst);
    update_session(&session, &hub, |s| {
        if cancelled {
            s.status = ScanStatus::Cancelled;
        } else if failed_probes > 0 {
            // 探测任务异常退出（panic 或被中止），会话以错误收尾
            s.status = ScanStatus::Error;
            s.error = Some(format!("{} probe tasks aborted unexpectedly", failed_probes));
        } else {
            s.status = ScanStatus::Completed;
        }
        s.end_time = Some(Utc::now());
    })
    .await;

    let final_session = session.read().await.clone();
    if let Some(s) = final_session {
        info!(
            "Scan {} finished: {:?}, {}/{} hosts, {} miners found",
            s.id,
            s.status,
            s.scanned_hosts,
            s.total_hosts,
            s.found_miners.len()
        );
    }
}

/// 改写会话并把快照广播到 discovery 主题
async fn update_session<F>(session: &Arc<RwLock<Option<ScanSession>>>, hub: &Arc<Hub>, mutate: F)
where
    F: FnOnce(&mut ScanSession),
{
    let snapshot = {
        let mut guard = session.write().await;
        match guard.as_mut() {
            Some(s) => {
                mutate(s);
                s.clone()
            }
            None => return,
        }
    };

    hub.publish(Topic::Discovery, MonitorEvent::DiscoveryUpdate(snapshot))
        .await;
}

/// 探测一台主机的全部端口：TCP 可达再做协议分类
async fn probe_host(ip: IpAddr, ports: &[u16], probe_timeout: Duration) -> Vec<FoundMiner> {
    let mut found = Vec::new();

    for &port in ports {
        let connect = TcpStream::connect((ip, port));
        match tokio::time::timeout(probe_timeout, connect).await {
            Ok(Ok(_stream)) => {
                debug!("Open port {}:{}", ip, port);
                if let Some(miner_type) = classify_port(ip, port, probe_timeout).await {
                    found.push(FoundMiner {
                        ip,
                        port,
                        miner_type,
                    });
                } else {
                    // 端口开放但协议未识别，不计入发现结果
                    debug!("Unclassified responder at {}:{}", ip, port);
                }
            }
            Ok(Err(_)) | Err(_) => {}
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScannerConfig;

    fn test_config() -> ScannerConfig {
        ScannerConfig {
            default_ports: vec![80],
            probe_timeout_secs: 1,
            max_concurrency: 8,
            max_hosts: 1024,
        }
    }

    #[tokio::test]
    async fn test_invalid_cidr_rejected() {
        let scanner = Scanner::new(test_config(), Arc::new(Hub::new(8)));
        let result = scanner
            .start(ScanRequest {
                network: "not-a-network".to_string(),
                ports: None,
                timeout: None,
            })
            .await;
        assert!(matches!(result, Err(ScanError::InvalidCidr { .. })));
    }

    #[tokio::test]
    async fn test_oversized_range_rejected() {
        let mut config = test_config();
        config.max_hosts = 16;
        let scanner = Scanner::new(config, Arc::new(Hub::new(8)));

        let result = scanner
            .start(ScanRequest {
                network: "10.0.0.0/16".to_string(),
                ports: None,
                timeout: None,
            })
            .await;
        assert!(matches!(result, Err(ScanError::RangeTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_second_start_conflicts_while_running() {
        let scanner = Scanner::new(test_config(), Arc::new(Hub::new(8)));

        // 不可达网段 + 1s 超时，扫描会运行一小段时间
        let first = scanner
            .start(ScanRequest {
                network: "192.0.2.0/28".to_string(),
                ports: Some(vec![9]),
                timeout: Some(1),
            })
            .await
            .expect("first scan starts");

        let second = scanner
            .start(ScanRequest {
                network: "192.0.2.0/28".to_string(),
                ports: Some(vec![9]),
                timeout: Some(1),
            })
            .await;

        match second {
            Err(ScanError::AlreadyRunning { session_id }) => assert_eq!(session_id, first.id),
            other => panic!("Expected AlreadyRunning, got {:?}", other.map(|s| s.status)),
        }

        scanner.stop().await.expect("cancel scan");
        scanner.wait().await;
    }

    #[tokio::test]
    async fn test_scan_unreachable_range_completes_with_full_progress() {
        let scanner = Scanner::new(test_config(), Arc::new(Hub::new(64)));

        scanner
            .start(ScanRequest {
                network: "192.0.2.0/30".to_string(),
                ports: Some(vec![9]),
                timeout: Some(1),
            })
            .await
            .expect("scan starts");
        scanner.wait().await;

        let session = scanner.status().await.expect("session retained");
        assert_eq!(session.status, ScanStatus::Completed);
        assert_eq!(session.total_hosts, 2);
        assert_eq!(session.scanned_hosts, session.total_hosts);
        assert!(session.found_miners.is_empty());
        assert!(session.end_time.is_some());
    }

    #[tokio::test]
    async fn test_stop_without_scan_errors() {
        let scanner = Scanner::new(test_config(), Arc::new(Hub::new(8)));
        assert!(matches!(scanner.stop().await, Err(ScanError::NotRunning)));
    }
}
