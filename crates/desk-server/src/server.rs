use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use desk_telemetry::SqliteLogSink;

use crate::api;
use crate::config::ServerConfig;
use crate::orchestrator::SessionHub;
use crate::ws;

/// Upper bound on waiting for open connections during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub config: Arc<ServerConfig>,
    pub log_sink: Option<Arc<SqliteLogSink>>,
    /// Cancelled on shutdown; open sockets close when it fires.
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(ws::user_socket))
        .route("/operator/{session_id}", get(ws::operator_socket))
        .route("/generate-session-id", get(api::generate_session_id))
        .route("/sessions", get(api::list_sessions))
        .route("/sessions/{id}", get(api::get_session))
        .route("/sessions/{id}/resolve", post(api::resolve))
        .route("/sessions/{id}/toggle-resolve", post(api::toggle_resolve))
        .route("/sessions/{id}/flag/{turn_id}", post(api::toggle_flag))
        .route("/sessions/{id}/close", post(api::close_session))
        .route(
            "/override/{id}",
            post(api::enable_override).delete(api::release_override),
        )
        .route("/telemetry/logs", get(api::query_logs))
        .route("/health", get(api::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    hub: Arc<SessionHub>,
    log_sink: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState {
        hub: Arc::clone(&hub),
        config: Arc::new(config),
        log_sink,
        shutdown: shutdown.clone(),
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "desk server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    hub: Arc<SessionHub>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    /// Stop accepting, close open sockets, then stop every session after
    /// its final flush.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("connections still open after grace period");
        }
        self.hub.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desk_core::{AgentId, Responder, SessionId};
    use desk_engine::{MockReply, MockResponder};
    use desk_store::{Database, EventStore, SqliteEventStore};
    use serde_json::Value;

    use crate::connections::ConnectionRegistry;
    use crate::orchestrator::OrchestratorSettings;

    fn hub(replies: Vec<MockReply>) -> Arc<SessionHub> {
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(Database::in_memory().unwrap()));
        let responder: Arc<dyn Responder> = Arc::new(MockResponder::new(replies));
        Arc::new(SessionHub::new(
            store,
            responder,
            Arc::new(ConnectionRegistry::new(32)),
            OrchestratorSettings::default(),
        ))
    }

    async fn serve(replies: Vec<MockReply>) -> ServerHandle {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0, // Random port
            ..Default::default()
        };
        start(config, hub(replies), None).await.unwrap()
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", handle.port, path)
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = serve(vec![]).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["live_sessions"], 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn generates_twelve_hex_session_ids() {
        let handle = serve(vec![]).await;
        let body: Value = reqwest::get(url(&handle, "/generate-session-id"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = body["session_id"].as_str().unwrap();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let handle = serve(vec![]).await;
        let client = reqwest::Client::new();

        let resp = client.get(url(&handle, "/sessions/zzz")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let resp = client.post(url(&handle, "/override/zzz")).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.post(url(&handle, "/sessions/zzz/resolve")).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        // Nothing was created along the way.
        let list: Vec<Value> = client
            .get(url(&handle, "/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn override_round_trip_over_http() {
        let handle = serve(vec![]).await;
        let id = SessionId::from_raw("abc123");
        handle.hub().open(&id).await.unwrap();
        let client = reqwest::Client::new();

        let body: Value = client.post(url(&handle, "/override/abc123")).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["human_override"], true);
        assert_eq!(body["changed"], true);

        let body: Value = client.post(url(&handle, "/override/abc123")).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["changed"], false);

        let body: Value = client.delete(url(&handle, "/override/abc123")).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["human_override"], false);
        assert_eq!(body["changed"], true);

        let detail: Value = client.get(url(&handle, "/sessions/abc123")).send().await.unwrap().json().await.unwrap();
        assert_eq!(detail["id"], "abc123");
        assert_eq!(detail["human_override"], false);
        assert_eq!(detail["transcript"].as_array().unwrap().len(), 2);
        assert_eq!(detail["transcript"][0]["kind"], "system");
    }

    #[tokio::test]
    async fn transcript_flags_and_resolution() {
        let handle = serve(vec![MockReply::message(AgentId::Triage, "How can I help?")]).await;
        let id = SessionId::from_raw("s1");
        handle.hub().user_message(&id, "hello".into()).await.unwrap();
        handle.hub().snapshot(&id).await.unwrap();
        let client = reqwest::Client::new();

        let detail: Value = client.get(url(&handle, "/sessions/s1")).send().await.unwrap().json().await.unwrap();
        let transcript = detail["transcript"].as_array().unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0]["role"], "user");
        assert_eq!(transcript[1]["agent_name"], "TriageAgent");
        assert_eq!(transcript[1]["flags"]["ai_active"], true);

        let flag: Value = client.post(url(&handle, "/sessions/s1/flag/2")).send().await.unwrap().json().await.unwrap();
        assert_eq!(flag["flagged"], true);
        let resp = client.post(url(&handle, "/sessions/s1/flag/42")).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resolved: Value = client.post(url(&handle, "/sessions/s1/resolve")).send().await.unwrap().json().await.unwrap();
        assert_eq!(resolved["resolved"], true);
        let toggled: Value = client
            .post(url(&handle, "/sessions/s1/toggle-resolve"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(toggled["resolved"], false);

        let unresolved: Vec<Value> = client
            .get(url(&handle, "/sessions?resolved=false&limit=10"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0]["active_agent"], "TriageAgent");

        let closed: Value = client.post(url(&handle, "/sessions/s1/close")).send().await.unwrap().json().await.unwrap();
        assert_eq!(closed["closed"], true);
        assert!(!handle.hub().is_live(&id));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn logs_route_reports_disabled_sink() {
        let handle = serve(vec![]).await;
        let resp = reqwest::get(url(&handle, "/telemetry/logs?level=error")).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "LOGS_DISABLED");
    }
}
