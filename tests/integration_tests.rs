use minermon_rs::config::{Config, GenericAdapterConfig, PollingConfig, ScannerConfig};
use minermon_rs::monitor::MonitorManager;
use minermon_rs::error::{MonitorError, RegistryError};
use minermon_rs::hub::Hub;
use minermon_rs::registry::{MinerRegistry, MinerState, NewMiner};
use minermon_rs::scanner::{ScanRequest, Scanner, ScanStatus};
use minermon_rs::storage::MetricStore;
use minermon_rs::registry::MinerView;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

fn fast_polling() -> PollingConfig {
    PollingConfig {
        interval_secs: 1,
        adapter_timeout_secs: 1,
        failure_threshold: 2,
        backoff_base_secs: 1,
        backoff_cap_secs: 1,
    }
}

fn generic_config() -> GenericAdapterConfig {
    GenericAdapterConfig {
        status_path: "/api/status".to_string(),
        hashrate_field: "hashrate".to_string(),
        temperature_field: "temperature".to_string(),
        power_field: "power".to_string(),
    }
}

async fn test_registry() -> (MinerRegistry, Arc<MetricStore>) {
    let store = Arc::new(MetricStore::open_in_memory().await.expect("open store"));
    let hub = Arc::new(Hub::new(64));
    let registry = MinerRegistry::new(store.clone(), hub, fast_polling(), generic_config());
    (registry, store)
}

fn new_miner(ip: &str, port: u16) -> NewMiner {
    NewMiner {
        miner_type: "bitaxe".to_string(),
        ip_address: ip.to_string(),
        port,
        name: None,
        username: None,
        password: None,
        mac_address: None,
    }
}

/// 返回一个只会应答 Bitaxe 风格 JSON 的 HTTP 服务
async fn spawn_fake_bitaxe() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;

                let body = r#"{"ASICModel":"BM1366","version":"2.1.8","hashRate":512.5,"temp":55.0,"power":15.2,"stratumURL":"public-pool.io","uptimeSeconds":3600,"fanrpm":4800}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Bitaxe 风格服务，healthy 置 false 时对所有请求返回 500
async fn spawn_toggleable_bitaxe() -> (SocketAddr, Arc<AtomicBool>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let healthy = Arc::new(AtomicBool::new(true));
    let flag = healthy.clone();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let flag = flag.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;

                let response = if flag.load(Ordering::SeqCst) {
                    let body = r#"{"ASICModel":"BM1366","hashRate":512.5,"temp":55.0,"power":15.2,"stratumURL":"public-pool.io"}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, healthy, handle)
}

async fn wait_for_state(
    registry: &MinerRegistry,
    miner_id: uuid::Uuid,
    want: MinerState,
) -> MinerView {
    for _ in 0..40 {
        let view = registry.get_miner(miner_id).await.expect("get miner");
        if view.status == want {
            return view;
        }
        sleep(Duration::from_millis(300)).await;
    }
    panic!("miner never reached {:?}", want);
}

#[tokio::test]
async fn test_duplicate_endpoint_rejected_regardless_of_name() {
    let (registry, _store) = test_registry().await;

    registry
        .add_miner(new_miner("192.0.2.10", 80))
        .await
        .expect("first add");

    let mut duplicate = new_miner("192.0.2.10", 80);
    duplicate.name = Some("different name".to_string());
    duplicate.miner_type = "generic".to_string();

    let result = registry.add_miner(duplicate).await;
    assert!(matches!(
        result,
        Err(MonitorError::Registry(RegistryError::Conflict { .. }))
    ));
    assert_eq!(registry.miner_count().await, 1);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_unreachable_miner_goes_offline_after_threshold() {
    let (registry, _store) = test_registry().await;

    // 本机关闭端口，连接立即被拒绝
    let miner = registry
        .add_miner(new_miner("127.0.0.1", 1))
        .await
        .expect("add miner");

    let mut state = MinerState::Unknown;
    for _ in 0..20 {
        sleep(Duration::from_millis(500)).await;
        state = registry.get_miner(miner.id).await.expect("get miner").status;
        if state == MinerState::Offline {
            break;
        }
    }
    assert_eq!(state, MinerState::Offline);

    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_miner_flips_offline_at_threshold_and_recovers_online() {
    let (registry, _store) = test_registry().await;
    let (addr, healthy, server) = spawn_toggleable_bitaxe().await;
    let threshold = fast_polling().failure_threshold;

    let miner = registry
        .add_miner(new_miner("127.0.0.1", addr.port()))
        .await
        .expect("add miner");

    wait_for_state(&registry, miner.id, MinerState::Online).await;

    // 设备开始报错：阈值之前不得翻转 offline
    healthy.store(false, Ordering::SeqCst);
    let mut offline = None;
    for _ in 0..60 {
        let view = registry.get_miner(miner.id).await.expect("get miner");
        if view.status == MinerState::Offline {
            offline = Some(view);
            break;
        }
        assert!(
            view.consecutive_failures < threshold,
            "still {:?} after {} failures",
            view.status,
            view.consecutive_failures
        );
        sleep(Duration::from_millis(200)).await;
    }
    let offline = offline.expect("miner never went offline");
    assert!(offline.consecutive_failures >= threshold);
    assert!(offline.last_seen.is_some());

    // 设备恢复：下一次成功拉取即回到 online，计数器清零
    healthy.store(true, Ordering::SeqCst);
    let recovered = wait_for_state(&registry, miner.id, MinerState::Online).await;
    assert_eq!(recovered.consecutive_failures, 0);
    assert!(recovered.last_seen >= offline.last_seen);

    registry.shutdown_all().await;
    server.abort();
}

#[tokio::test]
async fn test_removed_miner_stops_producing_samples() {
    let (registry, store) = test_registry().await;
    let (addr, server) = spawn_fake_bitaxe().await;

    let miner = registry
        .add_miner(new_miner("127.0.0.1", addr.port()))
        .await
        .expect("add miner");

    // 等第一批样本落库
    let mut count = 0;
    for _ in 0..20 {
        sleep(Duration::from_millis(500)).await;
        count = store.sample_count(miner.id).await.expect("count");
        if count > 0 {
            break;
        }
    }
    assert!(count > 0, "expected at least one sample before removal");

    registry.remove_miner(miner.id).await.expect("remove miner");

    // 记录删除后（级联删除清空）不再产生新样本
    let after_remove = store.sample_count(miner.id).await.expect("count");
    assert_eq!(after_remove, 0);

    sleep(Duration::from_millis(2500)).await;
    let later = store.sample_count(miner.id).await.expect("count");
    assert_eq!(later, 0);

    server.abort();
}

#[tokio::test]
async fn test_removing_unknown_miner_is_not_found() {
    let (registry, _store) = test_registry().await;
    let result = registry.remove_miner(uuid::Uuid::new_v4()).await;
    assert!(matches!(
        result,
        Err(MonitorError::Registry(RegistryError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_scan_discovers_local_bitaxe() {
    let (addr, server) = spawn_fake_bitaxe().await;

    let config = ScannerConfig {
        default_ports: vec![addr.port()],
        probe_timeout_secs: 2,
        max_concurrency: 4,
        max_hosts: 16,
    };
    let scanner = Scanner::new(config, Arc::new(Hub::new(64)));

    scanner
        .start(ScanRequest {
            network: "127.0.0.1/32".to_string(),
            ports: None,
            timeout: None,
        })
        .await
        .expect("scan starts");
    scanner.wait().await;

    let session = scanner.status().await.expect("session retained");
    assert_eq!(session.status, ScanStatus::Completed);
    assert_eq!(session.total_hosts, 1);
    assert_eq!(session.scanned_hosts, 1);
    assert_eq!(session.found_miners.len(), 1);
    assert_eq!(session.found_miners[0].port, addr.port());
    assert_eq!(session.found_miners[0].miner_type.as_str(), "bitaxe");

    server.abort();
}

#[tokio::test]
async fn test_manager_lifecycle() {
    let mut config = Config::default();
    config.api.enabled = false;

    let manager = MonitorManager::new_in_memory(config)
        .await
        .expect("create manager");
    assert!(!manager.is_running().await);

    manager.start().await.expect("start");
    assert!(manager.is_running().await);

    manager
        .registry()
        .add_miner(new_miner("192.0.2.77", 80))
        .await
        .expect("add miner");
    assert_eq!(manager.registry().miner_count().await, 1);

    manager.stop().await.expect("stop");
    assert!(!manager.is_running().await);
    assert_eq!(manager.registry().miner_count().await, 0);
}

#[tokio::test]
async fn test_polled_metrics_match_device_payload() {
    let (registry, store) = test_registry().await;
    let (addr, server) = spawn_fake_bitaxe().await;

    let miner = registry
        .add_miner(new_miner("127.0.0.1", addr.port()))
        .await
        .expect("add miner");

    let mut samples = Vec::new();
    for _ in 0..20 {
        sleep(Duration::from_millis(500)).await;
        let from = chrono::Utc::now() - chrono::Duration::minutes(5);
        samples = store
            .query_range(miner.id, from, chrono::Utc::now())
            .await
            .expect("query range");
        if !samples.is_empty() {
            break;
        }
    }

    assert!(!samples.is_empty(), "expected a persisted sample");
    let sample = &samples[0];
    assert_eq!(sample.hashrate, Some(512.5));
    assert_eq!(sample.temperature, Some(55.0));
    assert_eq!(sample.power, Some(15.2));
    assert_eq!(sample.pool_status.as_deref(), Some("public-pool.io"));
    assert_eq!(sample.status, MinerState::Online);

    registry.shutdown_all().await;
    server.abort();
}
