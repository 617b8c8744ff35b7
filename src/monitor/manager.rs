use crate::config::Config;
use crate::error::MonitorError;
use crate::hub::Hub;
use crate::registry::MinerRegistry;
use crate::scanner::Scanner;
use crate::storage::MetricStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

/// 每个 WebSocket 客户端的出站队列长度，溢出即断开
const CLIENT_QUEUE_CAPACITY: usize = 64;

/// 监控引擎管理器 - 组装并协调所有子系统
///
/// 注册表、扫描器、存储、Hub 都在这里构造并显式注入，
/// 生命周期为 init → start → stop，没有全局可变状态。
pub struct MonitorManager {
    config: Config,
    store: Arc<MetricStore>,
    hub: Arc<Hub>,
    registry: Arc<MinerRegistry>,
    scanner: Arc<Scanner>,
    prune_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
}

impl MonitorManager {
    pub async fn new(config: Config) -> Result<Self, MonitorError> {
        info!("Creating monitor manager");

        let store = Arc::new(MetricStore::open(&config.storage).await?);
        Ok(Self::assemble(config, store))
    }

    /// 内存库版本，测试用
    pub async fn new_in_memory(config: Config) -> Result<Self, MonitorError> {
        let store = Arc::new(MetricStore::open_in_memory().await?);
        Ok(Self::assemble(config, store))
    }

    fn assemble(config: Config, store: Arc<MetricStore>) -> Self {
        let hub = Arc::new(Hub::new(CLIENT_QUEUE_CAPACITY));
        let registry = Arc::new(MinerRegistry::new(
            store.clone(),
            hub.clone(),
            config.polling.clone(),
            config.generic.clone(),
        ));
        let scanner = Arc::new(Scanner::new(config.scanner.clone(), hub.clone()));

        Self {
            config,
            store,
            hub,
            registry,
            scanner,
            prune_handle: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 启动引擎：恢复持久化矿机的轮询循环并启动保留期清理
    pub async fn start(&self) -> Result<(), MonitorError> {
        if *self.running.read().await {
            warn!("Monitor manager is already running");
            return Ok(());
        }

        let miners = self.store.load_miners().await?;
        info!("Restoring {} persisted miners", miners.len());
        for miner in miners {
            self.registry.adopt(miner).await;
        }

        self.start_retention_sweep().await;
        *self.running.write().await = true;

        info!("Monitor manager started successfully");
        Ok(())
    }

    /// 停止引擎：停轮询、撤销扫描、停清理任务
    pub async fn stop(&self) -> Result<(), MonitorError> {
        if !*self.running.read().await {
            warn!("Monitor manager is already stopped");
            return Ok(());
        }

        self.registry.shutdown_all().await;

        if self.scanner.stop().await.is_ok() {
            self.scanner.wait().await;
        }

        if let Some(handle) = self.prune_handle.lock().await.take() {
            handle.abort();
        }

        *self.running.write().await = false;
        info!("Monitor manager stopped successfully");
        Ok(())
    }

    async fn start_retention_sweep(&self) {
        let store = self.store.clone();
        let retention_days = self.config.storage.retention_days;
        let period = Duration::from_secs(self.config.storage.prune_interval_secs);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = store.prune_older_than(retention_days).await {
                    error!("Retention sweep failed: {}", e);
                }
            }
        });

        *self.prune_handle.lock().await = Some(handle);
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn registry(&self) -> &Arc<MinerRegistry> {
        &self.registry
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
