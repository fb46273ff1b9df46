//! `RelayServer`: the axum HTTP + WebSocket front of the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use relay_core::World;
use relay_core::protocol::CubeBatch;
use relay_settings::RelaySettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::hub::{Hub, HubHandle};
use crate::metrics::render;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::ConnectionFactory;
use crate::websocket::echo::run_echo;
use crate::websocket::snapshot::run_snapshot_publisher;
use crate::websocket::transport::split_axum;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Builds and registers relay connections.
    pub factory: ConnectionFactory,
    /// Handle to the running hub.
    pub hub: HubHandle,
    /// Position store, when tracking is enabled.
    pub world: Option<Arc<World>>,
    /// Effective settings.
    pub settings: Arc<RelaySettings>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    settings: Arc<RelaySettings>,
    hub: Mutex<Option<Hub>>,
    handle: HubHandle,
    world: Option<Arc<World>>,
    factory: ConnectionFactory,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a server. Nothing runs until [`listen`](Self::listen).
    pub fn new(settings: RelaySettings) -> Self {
        let (hub, handle) = Hub::new(settings.hub.command_capacity);
        let world = settings.hub.track_world.then(|| Arc::new(World::new()));
        let factory = ConnectionFactory::new(
            handle.clone(),
            world.clone(),
            settings.connection.clone(),
            &settings.hub,
        );
        Self {
            settings: Arc::new(settings),
            hub: Mutex::new(Some(hub)),
            handle,
            world,
            factory,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            factory: self.factory.clone(),
            hub: self.handle.clone(),
            world: self.world.clone(),
            settings: Arc::clone(&self.settings),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/echo", get(echo_handler))
            .route("/health", get(health_handler))
            .route("/world", get(world_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the listener, start the hub (and the snapshot publisher when
    /// configured), and serve until shutdown.
    ///
    /// Returns the bound address and the serving task. Can be called once.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        if self.hub.lock().is_none() {
            return Err(ServerError::AlreadyListening);
        }

        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let Some(hub) = self.hub.lock().take() else {
            return Err(ServerError::AlreadyListening);
        };
        let token = self.shutdown.token();
        self.shutdown.track(tokio::spawn(hub.run(token.clone())));

        if let (Some(world), Some(period)) = (&self.world, self.settings.hub.snapshot_interval()) {
            let publisher = run_snapshot_publisher(
                Arc::clone(world),
                self.handle.clone(),
                period,
                token.clone(),
            );
            self.shutdown.track(tokio::spawn(async move {
                let _ = publisher.await;
            }));
        }

        let router = self.router();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(
            %local_addr,
            inbound_policy = %self.settings.hub.inbound_policy,
            sender_policy = %self.settings.hub.sender_policy,
            "relay server listening"
        );
        Ok((local_addr, server))
    }

    /// Handle to the hub.
    pub fn hub(&self) -> &HubHandle {
        &self.handle
    }

    /// The world, when position tracking is enabled.
    pub fn world(&self) -> Option<&Arc<World>> {
        self.world.as_ref()
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Effective settings.
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let live = state.hub.live_count();
    if live >= state.settings.server.max_connections {
        warn!(live, "connection limit reached, rejecting upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    ws.max_message_size(state.settings.server.max_message_size)
        .on_upgrade(move |socket| async move {
            let (stream, sink) = split_axum(socket);
            match state.factory.accept(stream, sink).await {
                Ok(conn) => info!(conn_id = %conn.id, "connection accepted"),
                Err(e) => warn!(error = %e, "connection dropped before registration"),
            }
        })
        .into_response()
}

/// GET /echo
async fn echo_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let write_wait = state.settings.connection.write_wait();
    ws.max_message_size(state.settings.server.max_message_size)
        .on_upgrade(move |socket| async move {
            let (stream, sink) = split_axum(socket);
            let echoed = run_echo(stream, sink, write_wait).await;
            info!(echoed, "echo connection closed");
        })
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let players = state.world.as_ref().map_or(0, |world| world.len());
    Json(health::health_check(
        state.start_time,
        state.hub.live_count(),
        players,
    ))
}

/// GET /world
async fn world_handler(State(state): State<AppState>) -> Json<CubeBatch> {
    Json(
        state
            .world
            .as_ref()
            .map_or_else(|| CubeBatch::new(Vec::new()), |world| world.snapshot()),
    )
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use relay_core::{ConnectionId, Position};
    use tower::ServiceExt;

    use super::*;

    fn local_settings() -> RelaySettings {
        let mut settings = RelaySettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        settings
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[test]
    fn world_follows_track_world_setting() {
        assert!(RelayServer::new(local_settings()).world().is_some());

        let mut settings = local_settings();
        settings.hub.track_world = false;
        assert!(RelayServer::new(settings).world().is_none());
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let server = RelayServer::new(local_settings());
        server
            .world()
            .unwrap()
            .update_position(&ConnectionId::from("p1"), Position::new(0.0, 0.0, 0.0));

        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["players"], 1);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn world_endpoint_returns_cubes() {
        let server = RelayServer::new(local_settings());
        server
            .world()
            .unwrap()
            .update_position(&ConnectionId::from("p1"), Position::new(1.0, 2.0, 3.0));

        let (status, body) = get_json(server.router(), "/world").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "cubes");
        assert_eq!(body["cubes"][0]["id"], "p1");
        assert_eq!(body["cubes"][0]["color"], "#FFFFFF");
        assert_eq!(body["cubes"][0]["qw"], 1.0);
    }

    #[tokio::test]
    async fn world_endpoint_without_tracking_is_empty() {
        let mut settings = local_settings();
        settings.hub.track_world = false;
        let server = RelayServer::new(settings);

        let (status, body) = get_json(server.router(), "/world").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cubes"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn metrics_endpoint_requires_handle() {
        let server = RelayServer::new(local_settings());
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = RelayServer::new(local_settings()).with_metrics(handle);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let server = RelayServer::new(local_settings());
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = RelayServer::new(local_settings());
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_starts_hub_once() {
        let server = RelayServer::new(local_settings());
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.hub().is_running());
        assert!(server.hub().members().await.unwrap().is_empty());

        assert!(matches!(
            server.listen().await,
            Err(ServerError::AlreadyListening)
        ));

        server.shutdown().graceful_shutdown(None).await;
        handle.await.unwrap();
        assert!(!server.hub().is_running());
    }

    #[tokio::test]
    async fn bind_failure_keeps_hub_available() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = local_settings();
        settings.server.port = blocker.local_addr().unwrap().port();
        let server = RelayServer::new(settings);

        assert!(matches!(
            server.listen().await,
            Err(ServerError::Bind { .. })
        ));
        assert!(server.hub.lock().is_some());
    }
}
