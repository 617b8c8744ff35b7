mod poller;

use crate::adapter::{adapter_for, AdapterTarget, MinerType, StatusSnapshot};
use crate::config::{GenericAdapterConfig, PollingConfig};
use crate::error::{MonitorError, RegistryError};
use crate::hub::Hub;
use crate::storage::MetricStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub use poller::backoff_delay;

/// 矿机在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerState {
    Online,
    Offline,
    Unknown,
}

impl MinerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MinerState::Online => "online",
            MinerState::Offline => "offline",
            MinerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MinerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MinerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(MinerState::Online),
            "offline" => Ok(MinerState::Offline),
            "unknown" => Ok(MinerState::Unknown),
            other => Err(format!("Unknown miner state: {}", other)),
        }
    }
}

/// 注册的矿机，配置持久化，运行时状态在内存
#[derive(Debug, Clone, Serialize)]
pub struct Miner {
    pub id: Uuid,
    pub miner_type: MinerType,
    pub name: String,
    pub ip_address: IpAddr,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub mac_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 轮询循环维护的运行时状态
#[derive(Debug, Clone)]
pub struct MinerStatus {
    pub state: MinerState,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for MinerStatus {
    fn default() -> Self {
        Self {
            state: MinerState::Unknown,
            last_seen: None,
            consecutive_failures: 0,
        }
    }
}

/// 列表/详情接口返回的矿机视图
#[derive(Debug, Clone, Serialize)]
pub struct MinerView {
    #[serde(flatten)]
    pub miner: Miner,
    pub status: MinerState,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// 新增矿机请求，字段在任何 I/O 之前完成校验
#[derive(Debug, Clone, Deserialize)]
pub struct NewMiner {
    #[serde(rename = "type")]
    pub miner_type: String,
    pub ip_address: String,
    pub port: u16,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mac_address: Option<String>,
}

/// 更新矿机请求，未提供的字段保持不变
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinerUpdate {
    #[serde(rename = "type")]
    pub miner_type: Option<String>,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mac_address: Option<String>,
}

/// 批量重启的单机结果
#[derive(Debug, Clone, Serialize)]
pub struct RestartOutcome {
    pub miner_id: Uuid,
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

/// 注册表内部条目：矿机 + 其轮询任务
struct MinerEntry {
    miner: Miner,
    status: Arc<RwLock<MinerStatus>>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// 矿机注册表与轮询编排器
///
/// 注册表是矿机集合的唯一写入者；每台矿机拥有一个独立的轮询任务，
/// 删除矿机先停任务再删记录，保证不会有孤儿任务继续写样本。
pub struct MinerRegistry {
    miners: Arc<RwLock<HashMap<Uuid, MinerEntry>>>,
    store: Arc<MetricStore>,
    hub: Arc<Hub>,
    polling: PollingConfig,
    generic: GenericAdapterConfig,
}

impl MinerRegistry {
    pub fn new(
        store: Arc<MetricStore>,
        hub: Arc<Hub>,
        polling: PollingConfig,
        generic: GenericAdapterConfig,
    ) -> Self {
        Self {
            miners: Arc::new(RwLock::new(HashMap::new())),
            store,
            hub,
            polling,
            generic,
        }
    }

    fn validate(request: &NewMiner) -> Result<(MinerType, IpAddr), RegistryError> {
        let miner_type: MinerType =
            request
                .miner_type
                .parse()
                .map_err(|e: String| RegistryError::Validation {
                    field: "type".to_string(),
                    reason: e,
                })?;

        let ip_address: IpAddr =
            request
                .ip_address
                .parse()
                .map_err(|_| RegistryError::Validation {
                    field: "ip_address".to_string(),
                    reason: format!("Invalid IP address: {}", request.ip_address),
                })?;

        if request.port == 0 {
            return Err(RegistryError::Validation {
                field: "port".to_string(),
                reason: "Port must be between 1 and 65535".to_string(),
            });
        }

        Ok((miner_type, ip_address))
    }

    /// 新增矿机：校验、查重、落库、再启动轮询任务
    pub async fn add_miner(&self, request: NewMiner) -> Result<Miner, MonitorError> {
        let (miner_type, ip_address) = Self::validate(&request)?;

        let mut miners = self.miners.write().await;

        let duplicate = miners
            .values()
            .any(|e| e.miner.ip_address == ip_address && e.miner.port == request.port);
        if duplicate {
            return Err(RegistryError::Conflict {
                ip: ip_address,
                port: request.port,
            }
            .into());
        }

        let miner = Miner {
            id: Uuid::new_v4(),
            miner_type,
            name: request
                .name
                .unwrap_or_else(|| format!("{} {}", miner_type, ip_address)),
            ip_address,
            port: request.port,
            username: request.username,
            password: request.password,
            mac_address: request.mac_address,
            created_at: Utc::now(),
        };

        self.store.insert_miner(&miner).await?;

        let entry = self.spawn_entry(miner.clone());
        miners.insert(miner.id, entry);

        info!("Miner added: {} ({} at {}:{})", miner.id, miner.miner_type, miner.ip_address, miner.port);
        Ok(miner)
    }

    /// 启动时接管已持久化的矿机（不重复落库）
    pub async fn adopt(&self, miner: Miner) {
        let mut miners = self.miners.write().await;
        info!("Adopting persisted miner: {} ({})", miner.id, miner.name);
        let entry = self.spawn_entry(miner.clone());
        miners.insert(miner.id, entry);
    }

    fn spawn_entry(&self, miner: Miner) -> MinerEntry {
        let status = Arc::new(RwLock::new(MinerStatus::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let adapter = adapter_for(miner.miner_type, &self.generic);

        let handle = tokio::spawn(poller::poll_loop(
            miner.clone(),
            adapter,
            self.store.clone(),
            self.hub.clone(),
            self.polling.clone(),
            status.clone(),
            shutdown_rx,
        ));

        MinerEntry {
            miner,
            status,
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// 更新矿机：端点或类型变化时重启其轮询任务
    pub async fn update_miner(
        &self,
        miner_id: Uuid,
        update: MinerUpdate,
    ) -> Result<Miner, MonitorError> {
        let mut miners = self.miners.write().await;

        let entry = miners
            .get(&miner_id)
            .ok_or(RegistryError::NotFound { miner_id })?;
        let mut miner = entry.miner.clone();

        if let Some(t) = &update.miner_type {
            miner.miner_type = t.parse().map_err(|e: String| RegistryError::Validation {
                field: "type".to_string(),
                reason: e,
            })?;
        }
        if let Some(ip) = &update.ip_address {
            miner.ip_address = ip.parse().map_err(|_| RegistryError::Validation {
                field: "ip_address".to_string(),
                reason: format!("Invalid IP address: {}", ip),
            })?;
        }
        if let Some(port) = update.port {
            if port == 0 {
                return Err(RegistryError::Validation {
                    field: "port".to_string(),
                    reason: "Port must be between 1 and 65535".to_string(),
                }
                .into());
            }
            miner.port = port;
        }
        if let Some(name) = update.name {
            miner.name = name;
        }
        if update.username.is_some() {
            miner.username = update.username;
        }
        if update.password.is_some() {
            miner.password = update.password;
        }
        if update.mac_address.is_some() {
            miner.mac_address = update.mac_address;
        }

        let duplicate = miners.values().any(|e| {
            e.miner.id != miner_id
                && e.miner.ip_address == miner.ip_address
                && e.miner.port == miner.port
        });
        if duplicate {
            return Err(RegistryError::Conflict {
                ip: miner.ip_address,
                port: miner.port,
            }
            .into());
        }

        self.store.update_miner(&miner).await?;

        // 旧任务停掉后再以新配置重启
        if let Some(old) = miners.remove(&miner_id) {
            let _ = old.shutdown.send(true);
            let _ = old.handle.await;
        }

        let entry = self.spawn_entry(miner.clone());
        miners.insert(miner_id, entry);

        info!("Miner updated: {}", miner_id);
        Ok(miner)
    }

    /// 删除矿机：先等轮询任务退出，再删数据库记录（样本级联删除）
    pub async fn remove_miner(&self, miner_id: Uuid) -> Result<(), MonitorError> {
        let entry = {
            let mut miners = self.miners.write().await;
            miners
                .remove(&miner_id)
                .ok_or(RegistryError::NotFound { miner_id })?
        };

        let _ = entry.shutdown.send(true);
        if let Err(e) = entry.handle.await {
            warn!("Poll task for {} ended abnormally: {}", miner_id, e);
        }

        self.store.delete_miner(miner_id).await?;

        info!("Miner removed: {}", miner_id);
        Ok(())
    }

    pub async fn list_miners(&self) -> Vec<MinerView> {
        let miners = self.miners.read().await;
        let mut views = Vec::with_capacity(miners.len());
        for entry in miners.values() {
            let status = entry.status.read().await;
            views.push(MinerView {
                miner: entry.miner.clone(),
                status: status.state,
                last_seen: status.last_seen,
                consecutive_failures: status.consecutive_failures,
            });
        }
        views.sort_by_key(|v| v.miner.created_at);
        views
    }

    pub async fn get_miner(&self, miner_id: Uuid) -> Result<MinerView, MonitorError> {
        let miners = self.miners.read().await;
        let entry = miners
            .get(&miner_id)
            .ok_or(RegistryError::NotFound { miner_id })?;
        let status = entry.status.read().await;
        Ok(MinerView {
            miner: entry.miner.clone(),
            status: status.state,
            last_seen: status.last_seen,
            consecutive_failures: status.consecutive_failures,
        })
    }

    /// 读取设备状态快照（直连设备，不走轮询）
    pub async fn fetch_status(&self, miner_id: Uuid) -> Result<StatusSnapshot, MonitorError> {
        let (miner, adapter) = {
            let miners = self.miners.read().await;
            let entry = miners
                .get(&miner_id)
                .ok_or(RegistryError::NotFound { miner_id })?;
            (
                entry.miner.clone(),
                adapter_for(entry.miner.miner_type, &self.generic),
            )
        };

        let target = Self::target_for(&miner, &self.polling);
        Ok(adapter.fetch_status(&target).await?)
    }

    /// 重启单台矿机
    pub async fn restart_miner(&self, miner_id: Uuid) -> Result<(), MonitorError> {
        let (miner, adapter) = {
            let miners = self.miners.read().await;
            let entry = miners
                .get(&miner_id)
                .ok_or(RegistryError::NotFound { miner_id })?;
            (
                entry.miner.clone(),
                adapter_for(entry.miner.miner_type, &self.generic),
            )
        };

        let target = Self::target_for(&miner, &self.polling);
        adapter.restart(&target).await?;
        info!("Restart issued to miner {}", miner_id);
        Ok(())
    }

    /// 批量重启：逐台独立下发，单台失败不影响其余
    pub async fn restart_all(&self) -> Vec<RestartOutcome> {
        let targets: Vec<(Miner, Arc<dyn crate::adapter::MinerAdapter>)> = {
            let miners = self.miners.read().await;
            miners
                .values()
                .map(|e| {
                    (
                        e.miner.clone(),
                        adapter_for(e.miner.miner_type, &self.generic),
                    )
                })
                .collect()
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for (miner, adapter) in targets {
            let target = Self::target_for(&miner, &self.polling);
            let result = adapter.restart(&target).await;
            outcomes.push(RestartOutcome {
                miner_id: miner.id,
                name: miner.name.clone(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        outcomes
    }

    /// 停掉所有轮询任务（进程关停用），不删除任何矿机
    pub async fn shutdown_all(&self) {
        let entries: Vec<MinerEntry> = {
            let mut miners = self.miners.write().await;
            miners.drain().map(|(_, e)| e).collect()
        };

        for entry in entries {
            let _ = entry.shutdown.send(true);
            let _ = entry.handle.await;
        }
        info!("All polling loops stopped");
    }

    pub async fn miner_count(&self) -> usize {
        self.miners.read().await.len()
    }

    fn target_for(miner: &Miner, polling: &PollingConfig) -> AdapterTarget {
        AdapterTarget {
            ip: miner.ip_address,
            port: miner.port,
            username: miner.username.clone(),
            password: miner.password.clone(),
            timeout: polling.adapter_timeout(),
        }
    }
}
