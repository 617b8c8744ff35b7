use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

/// 注册表错误 - 校验失败在任何 I/O 之前返回
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Validation failed: {field}, reason: {reason}")]
    Validation { field: String, reason: String },

    #[error("Miner already registered at {ip}:{port}")]
    Conflict { ip: IpAddr, port: u16 },

    #[error("Miner not found: {miner_id}")]
    NotFound { miner_id: Uuid },
}

/// 适配器错误 - 设备不可达或响应异常
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("Connection failed: {address}, error: {error}")]
    Connection { address: String, error: String },

    #[error("Protocol error: {address}, reason: {reason}")]
    Protocol { address: String, reason: String },

    #[error("Request timeout: {address}")]
    Timeout { address: String },
}

/// 扫描错误
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan already running: {session_id}")]
    AlreadyRunning { session_id: Uuid },

    #[error("No scan is running")]
    NotRunning,

    #[error("Invalid CIDR range: {input}")]
    InvalidCidr { input: String },

    #[error("Range too large: {hosts} hosts exceeds limit of {limit}")]
    RangeTooLarge { hosts: usize, limit: usize },
}

/// 存储错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Column not allowed: {column}")]
    DisallowedColumn { column: String },
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Server start failed: {error}")]
    ServerStartFailed { error: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}
