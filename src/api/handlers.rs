use crate::adapter::StatusSnapshot;
use crate::api::{ApiResponse, AppState, HealthResponse, MetricsQuery, RestartAllResponse};
use crate::error::{MonitorError, RegistryError, ScanError, StorageError};
use crate::registry::{Miner, MinerUpdate, MinerView, NewMiner};
use crate::scanner::{ScanRequest, ScanSession};
use crate::storage::MetricSample;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// 引擎错误到 HTTP 状态码的映射
fn error_response(err: MonitorError) -> ApiError {
    let status = match &err {
        MonitorError::Registry(RegistryError::Validation { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        MonitorError::Registry(RegistryError::Conflict { .. }) => StatusCode::CONFLICT,
        MonitorError::Registry(RegistryError::NotFound { .. }) => StatusCode::NOT_FOUND,
        MonitorError::Scan(ScanError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
        MonitorError::Scan(ScanError::NotRunning) => StatusCode::CONFLICT,
        MonitorError::Scan(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MonitorError::Adapter(_) => StatusCode::BAD_GATEWAY,
        MonitorError::Storage(StorageError::DisallowedColumn { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        MonitorError::Storage(_) | MonitorError::Api(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

/// 启动网络扫描
pub async fn start_discovery(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<ScanSession> {
    let session = state
        .monitor
        .scanner()
        .start(request)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(ApiResponse::success(session)))
}

/// 取消当前扫描
pub async fn stop_discovery(State(state): State<AppState>) -> ApiResult<()> {
    state
        .monitor
        .scanner()
        .stop()
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(ApiResponse::success(())))
}

/// 当前（或上一次）扫描会话快照
pub async fn discovery_status(State(state): State<AppState>) -> ApiResult<Option<ScanSession>> {
    let session = state.monitor.scanner().status().await;
    Ok(Json(ApiResponse::success(session)))
}

/// 注册新矿机
pub async fn add_miner(
    State(state): State<AppState>,
    Json(request): Json<NewMiner>,
) -> Result<(StatusCode, Json<ApiResponse<Miner>>), ApiError> {
    let miner = state
        .monitor
        .registry()
        .add_miner(request)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(miner))))
}

/// 列出所有矿机及其运行状态
pub async fn list_miners(State(state): State<AppState>) -> ApiResult<Vec<MinerView>> {
    let miners = state.monitor.registry().list_miners().await;
    Ok(Json(ApiResponse::success(miners)))
}

/// 单台矿机详情
pub async fn get_miner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<MinerView> {
    let miner = state
        .monitor
        .registry()
        .get_miner(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::success(miner)))
}

/// 更新矿机配置
pub async fn update_miner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<MinerUpdate>,
) -> ApiResult<Miner> {
    let miner = state
        .monitor
        .registry()
        .update_miner(id, update)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::success(miner)))
}

/// 删除矿机（历史样本级联删除）
pub async fn remove_miner(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<()> {
    state
        .monitor
        .registry()
        .remove_miner(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::success(())))
}

/// 直连设备读取状态快照
pub async fn miner_device_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusSnapshot> {
    let snapshot = state
        .monitor
        .registry()
        .fetch_status(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// 重启单台矿机
pub async fn restart_miner(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<()> {
    state
        .monitor
        .registry()
        .restart_miner(id)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::success(())))
}

/// 批量重启全部矿机，逐台独立下发
pub async fn restart_all_miners(State(state): State<AppState>) -> ApiResult<RestartAllResponse> {
    let results = state.monitor.registry().restart_all().await;
    let succeeded = results.iter().filter(|r| r.success).count();
    Ok(Json(ApiResponse::success(RestartAllResponse {
        total: results.len(),
        succeeded,
        results,
    })))
}

/// 查询历史指标样本
pub async fn query_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Vec<MetricSample>> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - ChronoDuration::hours(24));

    let samples = match query.order_by.as_deref() {
        Some(column) => state
            .monitor
            .store()
            .query_range_ordered(query.miner_id, from, to, column)
            .await,
        None => state.monitor.store().query_range(query.miner_id, from, to).await,
    }
    .map_err(|e| error_response(e.into()))?;

    Ok(Json(ApiResponse::success(samples)))
}

/// 健康检查处理器
pub async fn health_check(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    Ok(Json(ApiResponse::success(HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        miners: state.monitor.registry().miner_count().await,
        ws_clients: state.monitor.hub().client_count().await,
    })))
}
