//! HTTP server with REST API and WebSocket change feed.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::autopilot::Autopilot;
use crate::compose::{acknowledgement, Reply, SIGNATURE_KEY};
use crate::error::{Error, ProviderError};
use crate::fetch::{parse_date, FetchParams};
use crate::model::{AttachmentRecord, MessageRecord, Ticket, TicketCategory, TicketStatus};
use crate::provider::MailProvider;
use crate::remind::Reminders;
use crate::store::{ListQuery, Tab, TicketStore, DEFAULT_PAGE_SIZE};
use crate::sync::{SyncService, CHECK_UPDATES_MAX_THREADS};

/// Embedded HTML UI.
const INDEX_HTML: &str = include_str!("../public/index.html");

const FLUSH_CONFIRMATION: &str = "FLUSH";

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TicketStore>,
    pub provider: Arc<dyn MailProvider>,
    pub sync: Arc<SyncService>,
    pub autopilot: Arc<Autopilot>,
    pub reminders: Arc<Reminders>,
    pub notify: broadcast::Sender<()>,
}

/// [`Error`] rendered as `{"detail": ...}` with a matching status code.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        Self(Error::Provider(e))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self(Error::InvalidInput(e.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(Error::InvalidInput(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::Provider(ProviderError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::SyncInProgress(_) => StatusCode::CONFLICT,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Io(_) | Error::Database(_) | Error::Malformed(_) | Error::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/index.html", get(serve_index))
        .route("/health", get(health_check))
        .route("/sync", post(run_sync))
        .route("/sync/check-updates", post(check_updates))
        .route("/tickets", get(list_tickets))
        .route("/tickets/{thread_id}", get(get_ticket))
        .route("/tickets/{thread_id}/audit", get(get_audit))
        .route("/tickets/{thread_id}/status", patch(update_status))
        .route("/tickets/{thread_id}/category", patch(update_category))
        .route("/tickets/{thread_id}/assign", patch(update_assignee))
        .route("/tickets/{thread_id}/reply", post(send_reply))
        .route("/tickets/{thread_id}/draft-ack", post(draft_ack))
        .route(
            "/tickets/{thread_id}/messages/{message_id}/attachments/{attachment_id}",
            get(get_attachment),
        )
        .route(
            "/tickets/{thread_id}/messages/{message_id}/cid/{cid}",
            get(get_attachment_by_cid),
        )
        .route("/autopilot/start", post(start_autopilot))
        .route("/autopilot/stop", post(stop_autopilot))
        .route("/autopilot/status", get(autopilot_status))
        .route("/tasks/escalate", post(escalate))
        .route("/tasks/remind", post(remind))
        .route("/settings/signature", get(get_signature).put(put_signature))
        .route(
            "/blacklist",
            get(list_blacklist).post(add_blacklist).delete(remove_blacklist),
        )
        .route("/admin/flush", post(flush))
        .route("/ws", get(ws_handler))
        .fallback(not_found)
        .with_state(state)
}

/// Run the HTTP server.
pub async fn run_http_server(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
    {
        tracing::error!("HTTP server error: {e}");
    }
}

async fn serve_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let cursor = state.store.cursor(state.provider.mailbox())?;
    Ok(Json(json!({
        "status": "ok",
        "mailbox": state.provider.mailbox(),
        "last_synced_at": cursor.map(|c| c.last_synced_at),
        "autopilot_running": state.autopilot.status().running,
    })))
}

/// Query parameters of `POST /sync`.
#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    start: Option<String>,
    end: Option<String>,
    max_threads: Option<i64>,
    incremental: Option<bool>,
    include_anywhere: Option<bool>,
}

impl TryFrom<SyncQuery> for FetchParams {
    type Error = Error;

    fn try_from(q: SyncQuery) -> Result<Self, Error> {
        let defaults = Self::default();
        Ok(Self {
            start: q.start.as_deref().filter(|s| !s.is_empty()).map(parse_date).transpose()?,
            end: q.end.as_deref().filter(|s| !s.is_empty()).map(parse_date).transpose()?,
            max_threads: q.max_threads.unwrap_or(defaults.max_threads),
            incremental: q.incremental.unwrap_or(defaults.incremental),
            include_anywhere: q.include_anywhere.unwrap_or(defaults.include_anywhere),
        })
    }
}

async fn run_sync(
    State(state): State<AppState>,
    query: Result<Query<SyncQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let params = FetchParams::try_from(query)?;
    let report = state.sync.run(&params).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct CheckUpdatesQuery {
    max_threads: Option<i64>,
}

async fn check_updates(
    State(state): State<AppState>,
    query: Result<Query<CheckUpdatesQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let max = query.max_threads.unwrap_or(CHECK_UPDATES_MAX_THREADS);
    let report = state.sync.check_updates(max).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct TicketListQuery {
    tab: Option<String>,
    query: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
    start: Option<String>,
    end: Option<String>,
}

impl TryFrom<TicketListQuery> for ListQuery {
    type Error = Error;

    fn try_from(q: TicketListQuery) -> Result<Self, Error> {
        Ok(Self {
            tab: q.tab.as_deref().map_or(Ok(Tab::All), str::parse)?,
            query: q.query,
            page: q.page.unwrap_or(1),
            page_size: q.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            start: q.start.as_deref().filter(|s| !s.is_empty()).map(parse_date).transpose()?,
            end: q.end.as_deref().filter(|s| !s.is_empty()).map(parse_date).transpose()?,
        })
    }
}

async fn list_tickets(
    State(state): State<AppState>,
    query: Result<Query<TicketListQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let page = state.store.list_tickets(&ListQuery::try_from(query)?)?;
    Ok(Json(page).into_response())
}

/// A stored message with inline parts split from downloadable files.
#[derive(Serialize)]
struct MessageView {
    #[serde(flatten)]
    message: MessageRecord,
    inline_parts: Vec<AttachmentRecord>,
}

#[derive(Serialize)]
struct TicketDetail {
    ticket: Ticket,
    messages: Vec<MessageView>,
}

fn find_ticket(state: &AppState, thread_id: &str) -> Result<Ticket, Error> {
    state
        .store
        .ticket(thread_id)?
        .ok_or_else(|| Error::NotFound(format!("ticket {thread_id}")))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<TicketDetail>> {
    let ticket = find_ticket(&state, &thread_id)?;
    let messages = state
        .store
        .messages(&thread_id)?
        .into_iter()
        .map(|message| {
            let files = message.downloadable_attachments().cloned().collect();
            let inline_parts = message
                .attachments
                .iter()
                .filter(|a| a.is_inline)
                .cloned()
                .collect();
            MessageView {
                message: MessageRecord {
                    attachments: files,
                    ..message
                },
                inline_parts,
            }
        })
        .collect();
    Ok(Json(TicketDetail { ticket, messages }))
}

async fn get_audit(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Response> {
    find_ticket(&state, &thread_id)?;
    Ok(Json(state.store.audit(&thread_id)?).into_response())
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

async fn update_status(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    payload: Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult<Json<Ticket>> {
    let Json(payload) = payload?;
    let status: TicketStatus = payload.status.parse()?;
    Ok(Json(state.store.set_status(&thread_id, status)?))
}

#[derive(Debug, Deserialize)]
struct CategoryUpdate {
    category: String,
}

async fn update_category(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    payload: Result<Json<CategoryUpdate>, JsonRejection>,
) -> ApiResult<Json<Ticket>> {
    let Json(payload) = payload?;
    let category: TicketCategory = payload.category.parse()?;
    Ok(Json(state.store.set_category(&thread_id, category)?))
}

#[derive(Debug, Deserialize)]
struct AssignUpdate {
    assignee_user_id: Option<i64>,
}

async fn update_assignee(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    payload: Result<Json<AssignUpdate>, JsonRejection>,
) -> ApiResult<Json<Ticket>> {
    let Json(payload) = payload?;
    Ok(Json(state.store.assign(&thread_id, payload.assignee_user_id)?))
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    body: String,
    subject: Option<String>,
    #[serde(default)]
    mark_as_responded: bool,
}

async fn send_reply(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    payload: Result<Json<ReplyRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(payload) = payload?;
    let ticket = find_ticket(&state, &thread_id)?;
    let messages = state.store.messages(&thread_id)?;
    let recipient = state.sync.normalizer().reply_recipient(&messages);
    let (to_email, to_name) = recipient
        .as_ref()
        .and_then(|r| Some((r.email.as_deref()?, r.name.as_deref())))
        .ok_or_else(|| Error::InvalidInput("no external sender to reply to".into()))?;

    let references: Vec<&str> = messages
        .iter()
        .filter_map(|m| m.rfc822_message_id.as_deref())
        .collect();
    let signature = state.store.setting(SIGNATURE_KEY)?;

    let raw = Reply {
        from: state.provider.mailbox(),
        to_email,
        to_name,
        subject: payload.subject.as_deref().unwrap_or(&ticket.subject),
        body: &payload.body,
        in_reply_to: references.last().copied(),
        references: references.clone(),
        signature: signature.as_deref(),
    }
    .render()?;

    let sent_id = state.provider.send_raw(Some(&thread_id), &raw).await?;
    tracing::info!("sent reply {sent_id} in thread {thread_id}");
    let ticket = state
        .store
        .record_reply(&thread_id, &sent_id, payload.mark_as_responded)?;
    Ok(Json(json!({ "ok": true, "message_id": sent_id, "ticket": ticket })).into_response())
}

#[derive(Debug, Serialize)]
struct DraftAck {
    subject: String,
    body: String,
}

async fn draft_ack(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<DraftAck>> {
    let ticket = find_ticket(&state, &thread_id)?;
    let (subject, body) = acknowledgement(&ticket);
    Ok(Json(DraftAck { subject, body }))
}

fn attachment_bytes_response(att: &AttachmentRecord, data: Vec<u8>, download: bool) -> Response {
    let filename = att.filename.replace(['"', '\\', '\r', '\n'], "_");
    let disposition = if download {
        format!("attachment; filename=\"{filename}\"")
    } else {
        format!("inline; filename=\"{filename}\"")
    };
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, att.mime_type.clone()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response()
}

async fn fetch_attachment(state: &AppState, att: &AttachmentRecord) -> ApiResult<Vec<u8>> {
    let handle = att
        .provider_ref
        .as_deref()
        .ok_or_else(|| Error::NotFound(format!("data of attachment {}", att.id)))?;
    Ok(state.provider.get_attachment(&att.message_id, handle).await?)
}

async fn get_attachment(
    State(state): State<AppState>,
    Path((thread_id, message_id, attachment_id)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let att = state
        .store
        .attachment(&thread_id, &message_id, &attachment_id)?
        .ok_or_else(|| Error::NotFound(format!("attachment {attachment_id}")))?;
    let data = fetch_attachment(&state, &att).await?;
    Ok(attachment_bytes_response(&att, data, true))
}

async fn get_attachment_by_cid(
    State(state): State<AppState>,
    Path((thread_id, message_id, cid)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let att = state
        .store
        .attachment_by_cid(&thread_id, &message_id, &cid)?
        .ok_or_else(|| Error::NotFound(format!("inline part {cid}")))?;
    let data = fetch_attachment(&state, &att).await?;
    Ok(attachment_bytes_response(&att, data, false))
}

async fn start_autopilot(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.autopilot.start()?).into_response())
}

async fn stop_autopilot(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.autopilot.stop()?).into_response())
}

async fn autopilot_status(State(state): State<AppState>) -> Response {
    Json(state.autopilot.status()).into_response()
}

async fn escalate(State(state): State<AppState>) -> ApiResult<Response> {
    let escalated = state.store.escalate_overdue(chrono::Utc::now())?;
    Ok(Json(json!({ "count": escalated.len(), "escalated": escalated })).into_response())
}

async fn remind(State(state): State<AppState>) -> ApiResult<Response> {
    let report = state.reminders.run(chrono::Utc::now()).await?;
    Ok(Json(json!({
        "count": report.reminded.len(),
        "reminded": report.reminded,
        "message_id": report.message_id,
        "to": state.reminders.recipient(),
    }))
    .into_response())
}

#[derive(Debug, Serialize, Deserialize)]
struct Signature {
    signature: String,
}

async fn get_signature(State(state): State<AppState>) -> ApiResult<Json<Signature>> {
    let signature = state.store.setting(SIGNATURE_KEY)?.unwrap_or_default();
    Ok(Json(Signature { signature }))
}

async fn put_signature(
    State(state): State<AppState>,
    payload: Result<Json<Signature>, JsonRejection>,
) -> ApiResult<Json<Signature>> {
    let Json(payload) = payload?;
    let signature = payload.signature.trim().to_string();
    state.store.put_setting(SIGNATURE_KEY, &signature)?;
    Ok(Json(Signature { signature }))
}

#[derive(Debug, Deserialize)]
struct EmailQuery {
    email: String,
}

async fn list_blacklist(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.store.blacklist()?).into_response())
}

async fn add_blacklist(
    State(state): State<AppState>,
    query: Result<Query<EmailQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let entry = state.store.add_blacklist(&query.email)?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn remove_blacklist(
    State(state): State<AppState>,
    query: Result<Query<EmailQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    let Query(query) = query?;
    if state.store.remove_blacklist(&query.email)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("blacklist entry {}", query.email)).into())
    }
}

#[derive(Debug, Deserialize)]
struct FlushRequest {
    confirm: String,
}

async fn flush(
    State(state): State<AppState>,
    payload: Result<Json<FlushRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(payload) = payload?;
    if payload.confirm != FLUSH_CONFIRMATION {
        return Err(Error::InvalidInput(format!(
            "confirm must be \"{FLUSH_CONFIRMATION}\""
        ))
        .into());
    }
    state.store.flush()?;
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn not_found() -> ApiError {
    ApiError(Error::NotFound("route".into()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

/// Current per-tab counts, pushed on connect and after every store change.
fn counts_event(state: &AppState) -> Option<String> {
    match state.store.list_tickets(&ListQuery::default()) {
        Ok(page) => Some(json!({ "event": "tickets", "counts": page.counts }).to_string()),
        Err(e) => {
            tracing::warn!("cannot load ticket counts for websocket: {e}");
            None
        }
    }
}

async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribed before the snapshot so no change falls in between.
    let mut change_rx = state.notify.subscribe();

    // Send initial state
    if let Some(msg) = counts_event(&state) {
        if sender.send(Message::Text(msg.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            // Wait for store changes
            result = change_rx.recv() => {
                if matches!(result, Err(broadcast::error::RecvError::Closed)) {
                    break;
                }
                let Some(msg) = counts_event(&state) else {
                    continue;
                };
                if sender.send(Message::Text(msg.into())).await.is_err() {
                    break;
                }
            }
            // Handle incoming messages (mainly for ping/pong and close)
            msg = receiver.next() => {
                match msg {
                    None | Some(Ok(Message::Close(_)) | Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
