use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::dispatch::Dispatcher;
use crate::journal::ConversationLog;
use crate::mail::OutgoingMail;
use crate::registry::{self, Broadcaster, ConnectionRegistry};
use crate::session::{self, InboundFrame, ServerMessage, Session};

const EMAILS_NOTICE: &str =
    "Email monitoring requires Gmail API. Using basic SMTP for sending only.";
const AUTH_NOTICE: &str =
    "Using basic SMTP authentication. Email sending is ready if credentials are configured.";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    log: Arc<ConversationLog>,
    registry: Arc<ConnectionRegistry>,
    session: SessionSettings,
    static_dir: PathBuf,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        log: Arc<ConversationLog>,
        session: SessionSettings,
        static_dir: PathBuf,
    ) -> Self {
        Self {
            dispatcher,
            log,
            registry: Arc::new(ConnectionRegistry::new()),
            session,
            static_dir,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Start the `systemStats` broadcaster for this state's connections.
    pub fn start_broadcaster(&self) -> Broadcaster {
        Broadcaster::start(
            self.registry(),
            Arc::clone(&self.dispatcher.providers().stats),
            self.session.stats_interval(),
        )
    }
}

#[derive(Debug, Serialize)]
struct ApiFailure {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ApiFailure {
            success: false,
            error: self.message,
            details: self.details,
        });
        (self.status, payload).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct TestEmailRequest {
    to: Option<String>,
    subject: Option<String>,
    body: Option<String>,
}

impl TestEmailRequest {
    fn into_mail(self) -> OutgoingMail {
        let pick = |value: Option<String>, default: &str| {
            value
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        OutgoingMail {
            to: pick(self.to, "test@example.com"),
            subject: pick(self.subject, "Test Email"),
            body: pick(self.body, "This is a test email from the server"),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/test-email", post(test_email_handler))
        .route("/api/emails", get(emails_handler))
        .route("/auth/google", get(auth_handler))
        .fallback(static_handler)
        .with_state(state)
}

/// Bind `listen_addr` and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, listen_addr: &str, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind assistant listener at {listen_addr}"))?;
    let local = listener
        .local_addr()
        .context("failed to read listener address")?;
    let broadcaster = state.start_broadcaster();
    info!(addr = %local, static_dir = %state.static_dir.display(), "starting sidekick server");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("assistant server terminated unexpectedly");
    broadcaster.shutdown();
    result
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
    }))
}

async fn test_email_handler(
    State(state): State<AppState>,
    request: Option<Json<TestEmailRequest>>,
) -> Result<Json<Value>, ApiError> {
    let mail = request.map(|Json(body)| body).unwrap_or_default().into_mail();
    info!(to = %mail.to, "sending test email");
    match state.dispatcher.providers().mail.send(&mail).await {
        Ok(receipt) => Ok(Json(json!({
            "success": true,
            "message": format!("Email sent successfully to {}", mail.to),
            "messageId": receipt.message_id,
        }))),
        Err(failure) => {
            let details = serde_json::to_value(&failure.details).unwrap_or(Value::Null);
            Err(ApiError::internal(failure.error).with_details(details))
        }
    }
}

async fn emails_handler() -> Json<Value> {
    Json(json!({ "message": EMAILS_NOTICE }))
}

async fn auth_handler() -> &'static str {
    AUTH_NOTICE
}

/// Relative path under the asset root, or `None` for anything that could
/// escape it.
fn asset_path(uri_path: &str) -> Option<PathBuf> {
    let trimmed = uri_path.trim_start_matches('/');
    let relative = if trimmed.is_empty() || trimmed.ends_with('/') {
        format!("{trimmed}index.html")
    } else {
        trimmed.to_string()
    };
    if relative.contains("..") || relative.contains('\\') {
        return None;
    }
    let path = PathBuf::from(relative);
    if path
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        Some(path)
    } else {
        None
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn static_handler(State(state): State<AppState>, uri: Uri) -> Result<Response, ApiError> {
    let relative =
        asset_path(uri.path()).ok_or_else(|| ApiError::bad_request("invalid asset path"))?;
    let path = state.static_dir.join(&relative);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, content_type(&path))], bytes).into_response()),
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
            Err(ApiError::not_found(format!("{} not found", uri.path())))
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read static asset");
            Err(ApiError::internal("failed to read asset"))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

fn inbound_frame(item: Result<Message, axum::Error>) -> InboundFrame {
    match item {
        Ok(Message::Text(text)) => InboundFrame::Text(text),
        Ok(Message::Binary(bytes)) => InboundFrame::Binary(bytes.len()),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => InboundFrame::Control,
        Ok(Message::Close(_)) => InboundFrame::Close,
        Err(err) => {
            debug!(error = %err, "websocket read failed");
            InboundFrame::Close
        }
    }
}

async fn serve_socket(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4();
    let (mut sink, stream) = socket.split();
    let (outbound, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(state.session.outbound_buffer.max(1));
    state.registry.connect(id, outbound.clone());
    info!(connection = %id, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = match message.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(connection = %id, error = %format!("{err:#}"), "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let providers = state.dispatcher.providers();
    let timers = vec![
        registry::spawn_time_updates(
            id,
            outbound.clone(),
            Arc::clone(&providers.clock),
            state.session.time_interval(),
        ),
        registry::spawn_weather_updates(
            id,
            outbound.clone(),
            Arc::clone(&providers.weather),
            state.session.weather_interval(),
        ),
    ];
    state.registry.activate(id, timers);

    let session = Session::new(
        id,
        Arc::clone(&state.dispatcher),
        Arc::clone(&state.log),
        state.session.history_limit,
    );
    let worker = session::drive(
        session,
        stream.map(inbound_frame),
        outbound,
        state.session.outbound_buffer,
    )
    .await;

    state.registry.remove(id);
    writer.abort();
    // An in-flight command keeps running until it has been logged.
    drop(worker);
    info!(connection = %id, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersonaSettings;
    use crate::mail::{MailDiagnostics, MailFailure};
    use crate::testing::TestRig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    struct Harness {
        rig: TestRig,
        state: AppState,
        _logs: TempDir,
        assets: TempDir,
    }

    fn harness() -> Harness {
        let rig = TestRig::new();
        let logs = tempdir().expect("logs");
        let assets = tempdir().expect("assets");
        std::fs::write(assets.path().join("index.html"), "<h1>sidekick</h1>").expect("index");
        std::fs::write(assets.path().join("script.js"), "console.log(1)").expect("script");
        let dispatcher = Dispatcher::new(rig.providers(), PersonaSettings::default());
        let state = AppState::new(
            Arc::new(dispatcher),
            Arc::new(ConversationLog::new(logs.path().to_path_buf()).expect("log")),
            SessionSettings::default(),
            assets.path().to_path_buf(),
        );
        Harness {
            rig,
            state,
            _logs: logs,
            assets,
        }
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
        let response = router(state.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec();
        (status, body, content_type)
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).expect("request")
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn json_body(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_connection_count() {
        let h = harness();
        let (status, body, _) = call(&h.state, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({ "status": "ok", "connections": 0 }));
    }

    #[tokio::test]
    async fn test_email_sends_with_defaults() {
        let h = harness();
        let (status, body, _) = call(&h.state, post_json("/api/test-email", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Email sent successfully to test@example.com");
        assert_eq!(
            h.rig.mail.sent(),
            vec![OutgoingMail {
                to: "test@example.com".into(),
                subject: "Test Email".into(),
                body: "This is a test email from the server".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_email_without_body_uses_defaults() {
        let h = harness();
        let request = Request::builder()
            .method("POST")
            .uri("/api/test-email")
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = call(&h.state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.rig.mail.sent()[0].to, "test@example.com");
    }

    #[tokio::test]
    async fn test_email_failure_is_500_with_details() {
        let h = harness();
        h.rig.mail.fail_with(MailFailure {
            error: "Invalid login".into(),
            details: MailDiagnostics {
                code: Some("535".into()),
                response: None,
            },
        });
        let (status, body, _) = call(
            &h.state,
            post_json("/api/test-email", json!({ "to": "a@b.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(&body);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Invalid login");
        assert_eq!(body["details"]["code"], "535");
    }

    #[tokio::test]
    async fn informational_email_routes() {
        let h = harness();
        let (status, body, _) = call(&h.state, get_request("/api/emails")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["message"], EMAILS_NOTICE);

        let (status, body, _) = call(&h.state, get_request("/auth/google")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(String::from_utf8(body).expect("utf8"), AUTH_NOTICE);
    }

    #[tokio::test]
    async fn static_assets_are_served_from_root() {
        let h = harness();
        let (status, body, content_type) = call(&h.state, get_request("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<h1>sidekick</h1>");
        assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));

        let (status, _, content_type) = call(&h.state, get_request("/script.js")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/javascript; charset=utf-8"));

        let (status, _, _) = call(&h.state, get_request("/missing.css")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.assets.path().join("index.html").exists());
    }

    #[test]
    fn traversal_paths_are_rejected() {
        assert_eq!(asset_path("/"), Some(PathBuf::from("index.html")));
        assert_eq!(asset_path("/css/app.css"), Some(PathBuf::from("css/app.css")));
        assert_eq!(asset_path("/../secret"), None);
        assert_eq!(asset_path("/a/../../b"), None);
        assert_eq!(asset_path("/a\\b"), None);
    }

    #[tokio::test]
    async fn encoded_traversal_is_rejected() {
        let h = harness();
        let (status, _, _) = call(&h.state, get_request("/..%2f..%2fetc/passwd")).await;
        assert_ne!(status, StatusCode::OK);
    }
}
