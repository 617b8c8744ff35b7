pub mod handlers;
pub mod server;
pub mod websocket;

use crate::monitor::MonitorManager;
use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use handlers::*;
pub use server::ApiServer;

/// API 响应结构
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// 指标查询参数，缺省时间窗为最近 24 小时
#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub miner_id: uuid::Uuid,
    pub from: Option<chrono::DateTime<Utc>>,
    pub to: Option<chrono::DateTime<Utc>>,
    pub order_by: Option<String>,
}

/// 健康检查响应
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub version: String,
    pub miners: usize,
    pub ws_clients: usize,
}

/// 批量重启响应
#[derive(Debug, Serialize)]
pub struct RestartAllResponse {
    pub total: usize,
    pub succeeded: usize,
    pub results: Vec<crate::registry::RestartOutcome>,
}

/// API 应用状态
#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<MonitorManager>,
}

/// 创建 API 路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 网络发现路由
        .route("/api/discovery", post(start_discovery))
        .route("/api/discovery/stop", post(stop_discovery))
        .route("/api/discovery/status", get(discovery_status))
        // 矿机管理路由
        .route("/api/miners", post(add_miner).get(list_miners))
        .route("/api/miners/restart", post(restart_all_miners))
        .route(
            "/api/miners/:id",
            get(get_miner).put(update_miner).delete(remove_miner),
        )
        .route("/api/miners/:id/status", get(miner_device_status))
        .route("/api/miners/:id/restart", post(restart_miner))
        // 历史指标路由
        .route("/api/metrics", get(query_metrics))
        // WebSocket 路由
        .route("/ws", get(websocket::websocket_handler))
        // 健康检查
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
