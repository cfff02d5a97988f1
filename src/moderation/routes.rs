//! WebSocket server + REST endpoints for photo moderation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        FromRequestParts, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Actor, NewPhoto, PhotoSubmission, QueueEvent};
use super::processor::ModerationProcessor;
use super::queue::{ModerationQueue, SYNC_LIMIT};
use crate::error::ModerationError;

/// Header naming the reviewer behind a request.
pub const REVIEWER_HEADER: &str = "x-reviewer";

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<ModerationQueue>,
    pub processor: Arc<ModerationProcessor>,
    /// Bearer token required on reviewer endpoints.
    pub admin_token: SecretString,
    /// Start analysis as soon as a photo is submitted instead of waiting for the sweep.
    pub analyze_on_submit: bool,
}

/// Build the Axum router with moderation WebSocket and REST routes.
pub fn moderation_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(REVIEWER_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/photos", post(submit_photo))
        .route("/api/photos/{id}", get(get_photo))
        .route("/api/photos/{id}/audit", get(photo_audit))
        .route("/api/photos/{id}/analyze", post(analyze_photo))
        .route("/api/moderation/queue", get(review_queue))
        .route("/api/moderation/stats", get(stats))
        .route("/api/moderation/audit", get(recent_audit))
        .route("/api/moderation/{id}/approve", post(approve_photo))
        .route("/api/moderation/{id}/reject", post(reject_photo))
        .route("/api/moderation/{id}/feature", post(feature_photo))
        .route("/api/moderation/{id}/escalate", post(escalate_photo))
        .route("/api/moderation/{id}/requeue", post(requeue_photo))
        .layer(cors)
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Handler error: request problems plus everything the queue can report.
pub enum ApiError {
    BadRequest(String),
    Unauthorized(&'static str),
    Moderation(ModerationError),
}

impl From<ModerationError> for ApiError {
    fn from(e: ModerationError) -> Self {
        Self::Moderation(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": msg}))).into_response()
            }
            Self::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": msg}))).into_response()
            }
            Self::Moderation(e) => e.into_response(),
        }
    }
}

fn parse_photo_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest("Invalid photo ID".into()))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))
}

/// Parse an optional JSON body; empty means defaults.
fn parse_optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_json(body)
}

// ── Auth ────────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn token_matches(presented: &str, expected: &SecretString) -> bool {
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// A request authorized with the admin token, naming its reviewer.
pub struct Reviewer(pub String);

impl FromRequestParts<AppState> for Reviewer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or(ApiError::Unauthorized("Missing bearer token"))?;
        if !token_matches(token, &state.admin_token) {
            warn!(path = %parts.uri.path(), "Rejected reviewer request with bad token");
            return Err(ApiError::Unauthorized("Invalid token"));
        }

        let reviewer = parts
            .headers
            .get(REVIEWER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::Unauthorized("Missing x-reviewer header"))?;
        Ok(Reviewer(reviewer.to_string()))
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "open-draft-moderation"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Browsers cannot set headers on upgrade requests, so accept `?token=` too.
    let token = bearer_token(&headers).or(query.token.as_deref());
    if !token.is_some_and(|t| token_matches(t, &state.admin_token)) {
        return ApiError::Unauthorized("Invalid token").into_response();
    }

    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.queue))
}

async fn queue_sync(queue: &ModerationQueue) -> Option<String> {
    match queue.review_queue(SYNC_LIMIT, 0).await {
        Ok(photos) => serde_json::to_string(&QueueEvent::QueueSync { photos }).ok(),
        Err(e) => {
            warn!(error = %e, "Failed to load review queue for sync");
            None
        }
    }
}

async fn handle_socket(mut socket: WebSocket, queue: Arc<ModerationQueue>) {
    info!("WebSocket client connected");

    // Subscribe first so nothing between the sync and the loop is missed
    let mut rx = queue.subscribe();

    // Send the review queue on connect
    if let Some(json) = queue_sync(&queue).await {
        if socket.send(Message::Text(json.into())).await.is_err() {
            warn!("Failed to send initial sync, client disconnected");
            return;
        }
    }

    loop {
        tokio::select! {
            // Forward broadcast events to this client
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        // Re-sync by sending the whole review queue
                        if let Some(json) = queue_sync(&queue).await {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(text = text.as_str(), "Ignoring WS message from client");
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

// ── Photos ──────────────────────────────────────────────────────────────

async fn submit_photo(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<PhotoSubmission>), ApiError> {
    let new: NewPhoto = parse_json(&body)?;
    let photo = state.queue.submit(new).await?;

    if state.analyze_on_submit {
        let processor = Arc::clone(&state.processor);
        let id = photo.id;
        tokio::spawn(async move {
            if let Err(e) = processor.process(id).await {
                debug!(photo_id = %id, error = %e, "Analysis on submit did not complete");
            }
        });
    }

    Ok((StatusCode::CREATED, Json(photo)))
}

async fn get_photo(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    Ok(Json(state.queue.get(id).await?))
}

async fn photo_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_photo_id(&id)?;
    Ok(Json(state.queue.audit(id).await?))
}

async fn analyze_photo(
    State(state): State<AppState>,
    Reviewer(reviewer): Reviewer,
    Path(id): Path<String>,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    info!(photo_id = %id, reviewer = %reviewer, "Manual analysis requested");
    Ok(Json(state.processor.process(id).await?))
}

// ── Moderation ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

async fn review_queue(
    State(state): State<AppState>,
    _reviewer: Reviewer,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let photos = state
        .queue
        .review_queue(page.limit(), page.offset.unwrap_or(0))
        .await?;
    Ok(Json(photos))
}

async fn stats(
    State(state): State<AppState>,
    _reviewer: Reviewer,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queue.stats().await?))
}

async fn recent_audit(
    State(state): State<AppState>,
    _reviewer: Reviewer,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.queue.recent_audit(page.limit()).await?))
}

#[derive(Deserialize, Default)]
struct NoteRequest {
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize, Default)]
struct RejectRequest {
    #[serde(default)]
    reason: String,
}

async fn approve_photo(
    State(state): State<AppState>,
    Reviewer(reviewer): Reviewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    let req: NoteRequest = parse_optional_json(&body)?;
    Ok(Json(state.queue.approve(id, &reviewer, req.note).await?))
}

async fn reject_photo(
    State(state): State<AppState>,
    Reviewer(reviewer): Reviewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    let req: RejectRequest = parse_optional_json(&body)?;
    Ok(Json(state.queue.reject(id, &reviewer, &req.reason).await?))
}

async fn feature_photo(
    State(state): State<AppState>,
    Reviewer(reviewer): Reviewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    let req: NoteRequest = parse_optional_json(&body)?;
    Ok(Json(state.queue.feature(id, &reviewer, req.note).await?))
}

async fn escalate_photo(
    State(state): State<AppState>,
    Reviewer(reviewer): Reviewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    let req: NoteRequest = parse_optional_json(&body)?;
    let photo = state
        .queue
        .escalate(id, &Actor::human(reviewer), req.note)
        .await?;
    Ok(Json(photo))
}

async fn requeue_photo(
    State(state): State<AppState>,
    Reviewer(reviewer): Reviewer,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<PhotoSubmission>, ApiError> {
    let id = parse_photo_id(&id)?;
    let req: NoteRequest = parse_optional_json(&body)?;
    let photo = state
        .queue
        .requeue(id, &Actor::human(reviewer), req.note)
        .await?;
    Ok(Json(photo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::llm::LlmProvider;
    use crate::moderation::analyzer::VisionAnalyzer;
    use crate::moderation::prescreen::PrescreenRules;
    use crate::moderation::processor::ProcessorConfig;
    use crate::store::LibSqlBackend;

    struct NoLlm;

    #[async_trait::async_trait]
    impl LlmProvider for NoLlm {
        fn model_name(&self) -> &str {
            "none"
        }
        fn cost_per_token(&self) -> (rust_decimal::Decimal, rust_decimal::Decimal) {
            (rust_decimal::Decimal::ZERO, rust_decimal::Decimal::ZERO)
        }
        async fn complete(
            &self,
            _request: crate::llm::CompletionRequest,
        ) -> Result<crate::llm::CompletionResponse, crate::error::LlmError> {
            Err(crate::error::LlmError::RequestFailed {
                provider: "none".into(),
                reason: "offline".into(),
            })
        }
    }

    async fn app() -> (Router, Arc<ModerationQueue>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ModerationQueue::new(db);
        let processor = Arc::new(ModerationProcessor::new(
            Arc::clone(&queue),
            VisionAnalyzer::new(Arc::new(NoLlm), "/tmp", 1024),
            PrescreenRules::empty(),
            ProcessorConfig::default(),
        ));
        let state = AppState {
            queue: Arc::clone(&queue),
            processor,
            admin_token: SecretString::from("s3cret".to_string()),
            analyze_on_submit: false,
        };
        (moderation_routes(state), queue)
    }

    fn reviewer_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer s3cret")
            .header(REVIEWER_HEADER, "sam")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submitted(queue: &ModerationQueue) -> Uuid {
        queue
            .submit(NewPhoto {
                uploader: "dana".into(),
                image_ref: "https://cdn.example.org/a.jpg".into(),
                caption: None,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn token_comparison() {
        let expected = SecretString::from("abc".to_string());
        assert!(token_matches("abc", &expected));
        assert!(!token_matches("abd", &expected));
        assert!(!token_matches("ab", &expected));
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_returns_created() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(
                Request::post("/api/photos")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"uploader":"dana","image_ref":"https://cdn/x.jpg"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["status"], "pending");
    }

    #[tokio::test]
    async fn submit_bad_json_is_400() {
        let (app, _) = app().await;
        let resp = app
            .oneshot(Request::post("/api/photos").body(Body::from("{")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reviewer_routes_need_token_and_name() {
        let (app, queue) = app().await;
        let id = submitted(&queue).await;
        let uri = format!("/api/moderation/{id}/approve");

        let no_token = Request::post(&uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(no_token).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let no_name = Request::post(&uri)
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(no_name).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app.oneshot(reviewer_post(&uri, "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["reviewed_by"], "sam");
    }

    #[tokio::test]
    async fn reject_without_reason_is_400() {
        let (app, queue) = app().await;
        let id = submitted(&queue).await;
        let resp = app
            .oneshot(reviewer_post(&format!("/api/moderation/{id}/reject"), r#"{"reason":" "}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requeue_after_approval_is_409() {
        let (app, queue) = app().await;
        let id = submitted(&queue).await;
        queue.approve(id, "sam", None).await.unwrap();

        let resp = app
            .oneshot(reviewer_post(&format!("/api/moderation/{id}/requeue"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let (app, _) = app().await;
        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/photos/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(Request::get("/api/photos/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn provider_failure_is_502() {
        let (app, queue) = app().await;
        let id = submitted(&queue).await;
        let resp = app
            .oneshot(reviewer_post(&format!("/api/photos/{id}/analyze"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
