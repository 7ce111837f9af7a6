use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path as UrlPath, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use easel_contracts::events::{GenerationEvent, Subscription};
use easel_contracts::history::HistoryRecord;
use easel_contracts::paths::ImagePath;
use easel_engine::{
    SessionController, SessionError, SessionSnapshot, StartRequest, DEFAULT_COUNT, DEFAULT_HEIGHT,
    DEFAULT_WIDTH,
};
use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{resolve_upload_reference, DataLayout};

pub const UPLOAD_LIMIT_BYTES: usize = 16 * 1024 * 1024;
const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];
const EVENT_PUMP_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct AppState {
    controller: SessionController,
    layout: Arc<DataLayout>,
    presets: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(controller: SessionController, layout: DataLayout, presets: Vec<String>) -> Self {
        Self {
            controller,
            layout: Arc::new(layout),
            presets: Arc::new(presets),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/status", get(status))
        .route("/api/add_more", post(add_more))
        .route("/api/delete_image", post(delete_image))
        .route("/api/switch_prompt", post(switch_prompt))
        .route("/api/history", get(list_history))
        .route("/api/history/stats", get(history_stats))
        .route(
            "/api/history/{prompt_id}",
            get(get_history).delete(delete_history),
        )
        .route("/api/prompts", get(preset_prompt))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)),
        )
        .route("/generated/{prompt_id}/{filename}", get(generated_image))
        .route("/ws", get(events_socket))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// JSON error body `{success: false, message}` with a status derived from
/// the session error kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidArgument(_) => Self::bad_request(err.to_string()),
            SessionError::NotFound(_) => Self::not_found(err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"success": false, "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs a controller call that touches disk on the blocking pool.
async fn blocking<T, F>(call: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> easel_engine::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| ApiError::internal(format!("blocking task failed: {err}")))?
        .map_err(ApiError::from)
}

/// JSON request body. An empty body means `T::default()`; anything that
/// does not parse is rejected with the usual error body.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default + Send,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|err| ApiError::new(err.status(), err.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(Self)
            .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StartBody {
    prompt: Option<String>,
    count: u64,
    width: u32,
    height: u32,
    image_path: Option<String>,
}

impl Default for StartBody {
    fn default() -> Self {
        Self {
            prompt: None,
            count: DEFAULT_COUNT,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            image_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AddMoreBody {
    count: u64,
}

impl Default for AddMoreBody {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeleteImageBody {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SwitchPromptBody {
    prompt_id: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    success: bool,
    running: bool,
    stop_requested: bool,
    prompt_text: Option<String>,
    prompt_id: Option<String>,
    positive_prompt: Option<String>,
    negative_prompt: Option<String>,
    image_path: Option<String>,
    width: u32,
    height: u32,
    target_count: u64,
    produced_count: u64,
    images: Vec<String>,
    last_error: Option<String>,
}

impl From<SessionSnapshot> for StatusView {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            success: true,
            running: snapshot.running,
            stop_requested: snapshot.stop_requested,
            prompt_text: snapshot.prompt_text,
            prompt_id: snapshot.prompt_id,
            positive_prompt: snapshot.positive_prompt,
            negative_prompt: snapshot.negative_prompt,
            image_path: snapshot.reference_image,
            width: snapshot.width,
            height: snapshot.height,
            target_count: snapshot.target_count,
            produced_count: snapshot.produced_count,
            images: snapshot.images,
            last_error: snapshot.last_error,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordView {
    #[serde(flatten)]
    record: HistoryRecord,
    image_count: usize,
    image_paths: Vec<String>,
}

impl From<HistoryRecord> for RecordView {
    fn from(record: HistoryRecord) -> Self {
        Self {
            image_count: record.image_count(),
            image_paths: record.image_paths(),
            record,
        }
    }
}

async fn start(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<StartBody>,
) -> ApiResult<Json<Value>> {
    let reference_image = match body.image_path.as_deref() {
        Some(raw) => resolve_upload_reference(&state.layout, raw)
            .map_err(|err| ApiError::bad_request(format!("{err:#}")))?,
        None => None,
    };
    let outcome = state.controller.start(StartRequest {
        prompt: body.prompt,
        count: body.count,
        width: body.width,
        height: body.height,
        reference_image,
    })?;
    Ok(Json(json!({
        "success": true,
        "prompt_text": outcome.prompt_text,
        "target_count": outcome.target_count,
    })))
}

async fn stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.controller.stop()?;
    Ok(Json(json!({"success": true})))
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusView>> {
    Ok(Json(state.controller.status()?.into()))
}

async fn add_more(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<AddMoreBody>,
) -> ApiResult<Json<Value>> {
    let target_count = state.controller.add_more(body.count)?;
    Ok(Json(json!({"success": true, "target_count": target_count})))
}

async fn delete_image(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<DeleteImageBody>,
) -> ApiResult<Json<Value>> {
    let controller = state.controller.clone();
    let images = blocking(move || controller.delete_image(&body.path)).await?;
    Ok(Json(json!({
        "success": true,
        "remaining_count": images.len(),
        "images": images,
    })))
}

async fn switch_prompt(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<SwitchPromptBody>,
) -> ApiResult<Json<Value>> {
    let controller = state.controller.clone();
    let (record, images) = blocking(move || controller.switch_prompt(&body.prompt_id)).await?;
    Ok(Json(json!({
        "success": true,
        "record": RecordView::from(record),
        "images": images,
    })))
}

async fn list_history(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let controller = state.controller.clone();
    let records = blocking(move || controller.list_history()).await?;
    let history: Vec<RecordView> = records.into_iter().map(RecordView::from).collect();
    Ok(Json(json!({"success": true, "history": history})))
}

async fn get_history(
    State(state): State<AppState>,
    UrlPath(prompt_id): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    let controller = state.controller.clone();
    let record = blocking(move || controller.get_history(&prompt_id)).await?;
    Ok(Json(json!({"success": true, "record": RecordView::from(record)})))
}

async fn delete_history(
    State(state): State<AppState>,
    UrlPath(prompt_id): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    let controller = state.controller.clone();
    blocking(move || controller.delete_history(&prompt_id)).await?;
    Ok(Json(json!({"success": true})))
}

async fn history_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let controller = state.controller.clone();
    let stats = blocking(move || controller.history_stats()).await?;
    Ok(Json(json!({
        "success": true,
        "total_prompts": stats.total_prompts,
        "total_images": stats.total_images,
    })))
}

async fn preset_prompt(State(state): State<AppState>) -> Json<Value> {
    let picked = state.presets.choose(&mut rand::thread_rng()).cloned();
    match picked {
        Some(prompt) => Json(json!({
            "success": true,
            "prompt": prompt,
            "all_prompts": state.presets.as_slice(),
        })),
        None => Json(json!({
            "success": false,
            "message": "no preset prompts configured",
        })),
    }
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::new(err.status(), err.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original = field.file_name().unwrap_or_default().to_string();
        let stored_name = upload_filename(&original)?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::new(err.status(), err.body_text()))?;

        let target = state.layout.upload.join(&stored_name);
        tokio::fs::create_dir_all(&state.layout.upload)
            .await
            .map_err(|err| ApiError::internal(format!("failed to create upload dir: {err}")))?;
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|err| ApiError::internal(format!("failed to store upload: {err}")))?;
        tracing::info!(file = %target.display(), bytes = bytes.len(), "reference image uploaded");
        return Ok(Json(json!({
            "success": true,
            "filename": stored_name,
            "filepath": target.to_string_lossy(),
        })));
    }
    Err(ApiError::bad_request("no file was uploaded"))
}

/// `<uuid>_<sanitized name>`, keeping only an allowed image extension.
fn upload_filename(original: &str) -> ApiResult<String> {
    let base = original.rsplit(['/', '\\']).next().unwrap_or(original).trim();
    if base.is_empty() {
        return Err(ApiError::bad_request("no file selected"));
    }
    let extension = base
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| ApiError::bad_request(format!("unsupported file type: {base}")))?;

    let sanitized: String = base
        .chars()
        .filter_map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => Some(ch),
            ch if ch.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let sanitized = sanitized.trim_start_matches(['.', '_']);
    let stem = sanitized
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|stem| !stem.is_empty())
        .unwrap_or("upload");
    Ok(format!("{}_{}.{}", Uuid::new_v4().simple(), stem, extension))
}

async fn generated_image(
    State(state): State<AppState>,
    UrlPath((prompt_id, filename)): UrlPath<(String, String)>,
) -> ApiResult<Response> {
    let path =
        ImagePath::new(prompt_id, filename).map_err(|err| ApiError::bad_request(err.to_string()))?;
    match tokio::fs::read(path.resolve(state.controller.images_dir())).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ApiError::not_found(format!("image {path}")))
        }
        Err(err) => Err(ApiError::internal(format!("failed to read {path}: {err}"))),
    }
}

/// Subscribes before handing back the upgrade so nothing emitted after the
/// handshake is missed.
async fn events_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let subscription = state.controller.subscribe();
    let clients = state.controller.events().subscriber_count();
    tracing::info!(clients, "event client connected");
    ws.on_upgrade(move |socket| forward_events(socket, subscription, state))
}

async fn forward_events(socket: WebSocket, subscription: Subscription, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Err(err) = spawn_event_pump(subscription, tx) {
        tracing::error!(error = %err, "failed to start event pump");
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, kind = event.kind(), "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(rx);
    let clients = state.controller.events().subscriber_count();
    tracing::info!(clients, "event client disconnected");
}

/// Moves events from the hub's blocking subscription onto the socket task.
/// Each client gets its own thread so idle observers never hold a slot in
/// the runtime's blocking pool; the thread exits within one poll interval of
/// the socket closing.
fn spawn_event_pump(
    subscription: Subscription,
    tx: mpsc::UnboundedSender<GenerationEvent>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("easel-ws-pump".to_string())
        .spawn(move || {
            while !tx.is_closed() {
                if let Some(event) = subscription.recv_timeout(EVENT_PUMP_POLL) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
        })
        .map(drop)
}
