use crate::api::{create_routes, AppState};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::monitor::MonitorManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

/// API 服务器
pub struct ApiServer {
    config: ApiConfig,
    monitor: Arc<MonitorManager>,
    server_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
    running: Arc<RwLock<bool>>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, monitor: Arc<MonitorManager>) -> Self {
        Self {
            config,
            monitor,
            server_handle: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 启动 API 服务器
    pub async fn start(&self) -> Result<(), ApiError> {
        if !self.config.enabled {
            info!("API server is disabled");
            return Ok(());
        }

        if *self.running.read().await {
            warn!("API server is already running");
            return Ok(());
        }

        info!(
            "Starting API server on {}:{}",
            self.config.bind_address, self.config.port
        );

        let app_state = AppState {
            monitor: self.monitor.clone(),
        };

        let app = create_routes(app_state).layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(Duration::from_secs(30)))
                .layer(self.create_cors_layer()),
        );

        let addr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| ApiError::ServerStartFailed {
                error: format!("Invalid bind address: {}", e),
            })?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ApiError::ServerStartFailed {
                error: format!("Failed to bind to address: {}", e),
            })?;

        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            *running.write().await = true;

            if let Err(e) = axum::serve(listener, app).await {
                error!("API server error: {}", e);
            }

            *running.write().await = false;
        });

        *self.server_handle.write().await = Some(handle);

        info!("API server started successfully on http://{}", addr);
        Ok(())
    }

    /// 停止 API 服务器
    pub async fn stop(&self) -> Result<(), ApiError> {
        if !*self.running.read().await {
            warn!("API server is not running");
            return Ok(());
        }

        if let Some(handle) = self.server_handle.write().await.take() {
            handle.abort();
        }

        *self.running.write().await = false;
        info!("API server stopped successfully");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn get_address(&self) -> String {
        format!("{}:{}", self.config.bind_address, self.config.port)
    }

    fn create_cors_layer(&self) -> CorsLayer {
        let mut cors = CorsLayer::new()
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::ACCEPT,
            ]);

        if self.config.allow_origins.contains(&"*".to_string()) {
            cors = cors.allow_origin(Any);
        } else {
            for origin in &self.config.allow_origins {
                if let Ok(origin_header) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(origin_header);
                }
            }
        }

        cors
    }
}
