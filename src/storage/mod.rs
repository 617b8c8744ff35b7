use crate::adapter::MinerType;
use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::registry::{Miner, MinerState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// 落库的单条指标样本，只追加不修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub miner_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub hashrate: Option<f64>,
    pub temperature: Option<f64>,
    pub power: Option<f64>,
    pub pool_status: Option<String>,
    pub status: MinerState,
}

/// 范围查询允许的排序列，防止 API 透传任意列名
const ALLOWED_ORDER_COLUMNS: &[&str] = &["timestamp", "hashrate", "temperature", "power"];

fn ensure_allowed_column(column: &str) -> Result<(), StorageError> {
    if ALLOWED_ORDER_COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(StorageError::DisallowedColumn {
            column: column.to_string(),
        })
    }
}

/// 时序存储 - SQLite 持久化矿机配置与指标样本
///
/// 所有查询参数化绑定；矿机删除通过外键级联清掉其样本。
pub struct MetricStore {
    pool: SqlitePool,
}

impl MetricStore {
    /// 打开（必要时创建）数据库并建表
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(StorageError::Database)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;

        info!("Metric store opened: {}", config.path);
        Ok(store)
    }

    /// 内存库，测试用
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StorageError::Database)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS miners (
                id TEXT PRIMARY KEY,
                miner_type TEXT NOT NULL,
                name TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password TEXT,
                mac_address TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (ip_address, port)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metric_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                miner_id TEXT NOT NULL REFERENCES miners (id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                hashrate REAL,
                temperature REAL,
                power REAL,
                pool_status TEXT,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_miner_time
             ON metric_samples (miner_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_miner(&self, miner: &Miner) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO miners
             (id, miner_type, name, ip_address, port, username, password, mac_address, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(miner.id.to_string())
        .bind(miner.miner_type.as_str())
        .bind(&miner.name)
        .bind(miner.ip_address.to_string())
        .bind(miner.port as i64)
        .bind(&miner.username)
        .bind(&miner.password)
        .bind(&miner.mac_address)
        .bind(miner.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_miner(&self, miner: &Miner) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE miners SET miner_type = ?2, name = ?3, ip_address = ?4, port = ?5,
             username = ?6, password = ?7, mac_address = ?8 WHERE id = ?1",
        )
        .bind(miner.id.to_string())
        .bind(miner.miner_type.as_str())
        .bind(&miner.name)
        .bind(miner.ip_address.to_string())
        .bind(miner.port as i64)
        .bind(&miner.username)
        .bind(&miner.password)
        .bind(&miner.mac_address)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 删除矿机，样本随外键级联删除
    pub async fn delete_miner(&self, miner_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM miners WHERE id = ?1")
            .bind(miner_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// 启动时恢复已注册的矿机
    pub async fn load_miners(&self) -> Result<Vec<Miner>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, miner_type, name, ip_address, port, username, password,
             mac_address, created_at FROM miners ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut miners = Vec::with_capacity(rows.len());
        for row in rows {
            miners.push(Self::miner_from_row(&row)?);
        }
        Ok(miners)
    }

    fn miner_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Miner, StorageError> {
        let id: String = row.try_get("id")?;
        let miner_type: String = row.try_get("miner_type")?;
        let ip_address: String = row.try_get("ip_address")?;
        let port: i64 = row.try_get("port")?;

        Ok(Miner {
            id: Uuid::parse_str(&id).map_err(|e| StorageError::Database(
                sqlx::Error::Decode(Box::new(e)),
            ))?,
            miner_type: miner_type.parse().map_err(|e: String| {
                StorageError::Database(sqlx::Error::Decode(e.into()))
            })?,
            name: row.try_get("name")?,
            ip_address: ip_address.parse().map_err(
                |e: std::net::AddrParseError| StorageError::Database(sqlx::Error::Decode(Box::new(e))),
            )?,
            port: port as u16,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            mac_address: row.try_get("mac_address")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn insert_sample(&self, sample: &MetricSample) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO metric_samples
             (miner_id, timestamp, hashrate, temperature, power, pool_status, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(sample.miner_id.to_string())
        .bind(sample.timestamp)
        .bind(sample.hashrate)
        .bind(sample.temperature)
        .bind(sample.power)
        .bind(&sample.pool_status)
        .bind(sample.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 区间查询，供图表使用
    pub async fn query_range(
        &self,
        miner_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StorageError> {
        self.query_range_ordered(miner_id, from, to, "timestamp").await
    }

    /// 带排序列的区间查询，列名须在允许列表内
    pub async fn query_range_ordered(
        &self,
        miner_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order_by: &str,
    ) -> Result<Vec<MetricSample>, StorageError> {
        ensure_allowed_column(order_by)?;

        let query = format!(
            "SELECT miner_id, timestamp, hashrate, temperature, power, pool_status, status
             FROM metric_samples
             WHERE miner_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY {} ASC",
            order_by
        );

        let rows = sqlx::query(&query)
            .bind(miner_id.to_string())
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            samples.push(Self::sample_from_row(&row)?);
        }
        Ok(samples)
    }

    fn sample_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MetricSample, StorageError> {
        let miner_id: String = row.try_get("miner_id")?;
        let status: String = row.try_get("status")?;

        Ok(MetricSample {
            miner_id: Uuid::parse_str(&miner_id).map_err(|e| {
                StorageError::Database(sqlx::Error::Decode(Box::new(e)))
            })?,
            timestamp: row.try_get("timestamp")?,
            hashrate: row.try_get("hashrate")?,
            temperature: row.try_get("temperature")?,
            power: row.try_get("power")?,
            pool_status: row.try_get("pool_status")?,
            status: status.parse().map_err(|e: String| {
                StorageError::Database(sqlx::Error::Decode(e.into()))
            })?,
        })
    }

    /// 删除早于保留期限的样本，返回删除行数。幂等：连续运行第二次删 0 行
    pub async fn prune_older_than(&self, retention_days: u32) -> Result<u64, StorageError> {
        let horizon = Utc::now() - ChronoDuration::days(retention_days as i64);

        let result = sqlx::query("DELETE FROM metric_samples WHERE timestamp < ?1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("Pruned {} metric samples older than {} days", deleted, retention_days);
        } else {
            debug!("Retention sweep found nothing to prune");
        }
        Ok(deleted)
    }

    pub async fn sample_count(&self, miner_id: Uuid) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM metric_samples WHERE miner_id = ?1")
            .bind(miner_id.to_string())
            .fetch_one(&self.pool)
            .await?;

        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}
