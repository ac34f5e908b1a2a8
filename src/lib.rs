pub mod config;
pub mod db;
pub mod fetcher;
pub mod graph;
pub mod identity;
pub mod relay;
pub mod webhook;

pub use config::Config;

use self::config::{load_config, resolve_database_url};
use self::db::{DbKind, PageRecord};
use self::fetcher::FetchError;
use self::graph::{GraphClient, GraphError};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub graph: GraphClient,
    pub db_kind: DbKind,
}

/// Account resolved by the auth middleware, injected as a request extension.
#[derive(Debug, Clone)]
pub struct AccountId(pub String);

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Upstream(FetchError),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        ApiError::Upstream(err)
    }
}

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        ApiError::Upstream(FetchError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Upstream(err) => {
                let status = match err {
                    FetchError::NoAccessiblePage => StatusCode::NOT_FOUND,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, err.to_string())
            }
            ApiError::Internal(err) => {
                error!("internal error: {err:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub pages: i64,
    pub conversations: i64,
    pub messages: i64,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailablePagesRequest {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectPageRequest {
    pub access_token: String,
    pub page_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendReplyRequest {
    pub text: String,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();
    let config = load_config();
    build_app(config).await
}

pub async fn build_app(config: Config) -> anyhow::Result<(AppState, Router)> {
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let graph = GraphClient::new(&config.graph);
    let state = AppState {
        config: config.clone(),
        pool,
        graph,
        db_kind,
    };

    let authed_routes = Router::new()
        .route("/api/pages/available", post(available_pages))
        .route("/api/pages/connect", post(connect_page))
        .route("/api/pages", get(list_pages))
        .route("/api/pages/:page_id", delete(disconnect_page))
        .route("/api/pages/:page_id/conversations", get(page_conversations))
        .route("/api/pages/:page_id/inbox", get(page_inbox))
        .route(
            "/api/conversations/:conversation_id/messages",
            get(conversation_messages).post(send_reply),
        )
        .route(
            "/api/conversations/:conversation_id/history",
            get(conversation_history),
        )
        .route(
            "/api/conversations/:conversation_id/read",
            post(conversation_mark_read),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route(
            &config.webhook.path,
            get(verify_webhook).post(receive_webhook),
        );

    let app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    Ok((state, app))
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    if state.config.auth.tokens.is_empty() {
        req.extensions_mut()
            .insert(AccountId("default".to_string()));
        return next.run(req).await;
    }

    let token = headers
        .get("X-Page-Bridge-Token")
        .and_then(|v| v.to_str().ok());
    match token.and_then(|t| state.config.auth.account_for_token(t)) {
        Some(account) => {
            let account = account.to_string();
            req.extensions_mut().insert(AccountId(account));
            next.run(req).await
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let pages = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM pages WHERE is_active = 1")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    let conversations = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    let messages = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    Json(StatusResponse {
        pages,
        conversations,
        messages,
    })
}

async fn verify_webhook(
    State(state): State<AppState>,
    Query(query): Query<HubQuery>,
) -> Response {
    let expected = state.config.graph.verify_token.as_deref();
    if query.mode.as_deref() == Some("subscribe")
        && expected.is_some()
        && query.verify_token.as_deref() == expected
    {
        (StatusCode::OK, query.challenge.unwrap_or_default()).into_response()
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.config.graph.app_secret.as_deref() {
        let signature = headers
            .get("X-Hub-Signature")
            .and_then(|v| v.to_str().ok());
        if !webhook::verify_signature(secret, &body, signature) {
            warn!("webhook signature mismatch, rejecting payload");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: webhook::WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("malformed payload: {err}")})),
            )
                .into_response();
        }
    };

    if payload.object.as_deref() != Some("page") {
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Err(err) = webhook::process_payload(&state, &payload).await {
        error!("webhook processing error: {err:?}");
    }
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

fn page_summary(page: &PageRecord) -> serde_json::Value {
    json!({
        "id": page.page_id,
        "name": page.page_name,
        "picture": page.profile_picture,
        "category": page.category,
        "connected_at": page.created_at.to_rfc3339(),
    })
}

fn graph_app_credentials(state: &AppState) -> Result<(&str, &str), ApiError> {
    match (
        state.config.graph.app_id.as_deref(),
        state.config.graph.app_secret.as_deref(),
    ) {
        (Some(app_id), Some(app_secret)) => Ok((app_id, app_secret)),
        _ => Err(ApiError::BadRequest(
            "graph app credentials are not configured".to_string(),
        )),
    }
}

async fn available_pages(
    State(state): State<AppState>,
    Json(req): Json<AvailablePagesRequest>,
) -> Result<Response, ApiError> {
    if req.access_token.trim().is_empty() {
        return Err(ApiError::BadRequest("access token is required".to_string()));
    }
    let (app_id, app_secret) = graph_app_credentials(&state)?;
    let long_lived = state
        .graph
        .exchange_token(app_id, app_secret, &req.access_token)
        .await?;
    let pages = state.graph.list_accounts(&long_lived).await?;

    let pages: Vec<serde_json::Value> = pages
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "category": p.category,
                "picture": p.picture_url,
            })
        })
        .collect();
    Ok(Json(json!({"pages": pages})).into_response())
}

async fn connect_page(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Json(req): Json<ConnectPageRequest>,
) -> Result<Response, ApiError> {
    if req.access_token.trim().is_empty() || req.page_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "access token and page id are required".to_string(),
        ));
    }
    let (app_id, app_secret) = graph_app_credentials(&state)?;

    let long_lived = state
        .graph
        .exchange_token(app_id, app_secret, &req.access_token)
        .await?;
    let pages = state.graph.list_accounts(&long_lived).await?;
    let selected = pages
        .into_iter()
        .find(|p| p.id == req.page_id)
        .ok_or_else(|| {
            ApiError::NotFound("page not found or you do not have permission to manage it".to_string())
        })?;

    let info = state
        .graph
        .get_page_info(&req.page_id, &selected.access_token)
        .await?;

    let existing = db::find_page(&state.pool, state.db_kind, &req.page_id).await?;
    if let Some(existing) = existing.as_ref() {
        if existing.is_active && existing.account_id != account {
            return Err(ApiError::Conflict(
                "this page is already connected to another account".to_string(),
            ));
        }
    }

    let subscribed = state
        .graph
        .subscribe_webhook(&req.page_id, &selected.access_token)
        .await?;

    let now = Utc::now();
    let record = PageRecord {
        page_id: info.id.clone(),
        account_id: account,
        page_name: info.name.clone(),
        access_token: selected.access_token.clone(),
        profile_picture: info.picture_url.clone(),
        category: info.category.clone(),
        about: info.about.clone(),
        website: info.website.clone(),
        phone: info.phone.clone(),
        email: info.email.clone(),
        webhook_verified: subscribed,
        is_active: true,
        last_sync_at: Some(now),
        disconnected_at: None,
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_at: now,
    };
    db::upsert_page(&state.pool, state.db_kind, &record).await?;

    Ok(Json(json!({"page": page_summary(&record)})).into_response())
}

async fn list_pages(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
) -> Result<Response, ApiError> {
    let pages = db::list_active_pages(&state.pool, state.db_kind, &account).await?;
    let pages: Vec<serde_json::Value> = pages.iter().map(page_summary).collect();
    Ok(Json(json!({"pages": pages})).into_response())
}

async fn disconnect_page(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(page_id): Path<String>,
) -> Result<Response, ApiError> {
    let removed =
        db::deactivate_page(&state.pool, state.db_kind, &page_id, &account, Utc::now()).await?;
    if !removed {
        return Err(ApiError::NotFound("page not found".to_string()));
    }
    Ok(Json(json!({"status": "disconnected"})).into_response())
}

async fn owned_active_page(
    state: &AppState,
    account: &str,
    page_id: &str,
) -> Result<PageRecord, ApiError> {
    db::find_active_page(&state.pool, state.db_kind, page_id)
        .await?
        .filter(|p| p.account_id == account)
        .ok_or_else(|| ApiError::NotFound("page not found".to_string()))
}

async fn page_conversations(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(page_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Response, ApiError> {
    let record = owned_active_page(&state, &account, &page_id).await?;
    let limit = page
        .limit
        .unwrap_or(state.config.sync.conversation_fetch_limit)
        .min(100);

    let conversations = fetcher::list_conversations(&state.graph, &record, limit).await?;
    db::touch_page_sync(&state.pool, state.db_kind, &record.page_id, Utc::now()).await?;

    Ok(Json(json!({"conversations": conversations})).into_response())
}

async fn page_inbox(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(page_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Response, ApiError> {
    let record = owned_active_page(&state, &account, &page_id).await?;
    let limit = page.limit.unwrap_or(100).min(500);
    let offset = page.offset.unwrap_or(0);

    let conversations =
        db::list_conversations(&state.pool, state.db_kind, &record.page_id, limit, offset).await?;
    Ok(Json(json!({"conversations": conversations})).into_response())
}

async fn conversation_messages(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(conversation_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Response, ApiError> {
    let pages = db::list_active_pages(&state.pool, state.db_kind, &account).await?;
    if pages.is_empty() {
        return Err(ApiError::Forbidden("no active pages connected".to_string()));
    }
    let limit = page
        .limit
        .unwrap_or(state.config.sync.message_fetch_limit)
        .min(200);

    let messages =
        fetcher::list_messages(&state.graph, &conversation_id, &pages, limit).await?;
    Ok(Json(json!({"messages": messages})).into_response())
}

async fn send_reply(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendReplyRequest>,
) -> Result<Response, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("message text is required".to_string()));
    }
    let pages = db::list_active_pages(&state.pool, state.db_kind, &account).await?;
    if pages.is_empty() {
        return Err(ApiError::Forbidden("no active pages connected".to_string()));
    }

    let outcome = relay::send(&state.graph, &conversation_id, &req.text, &pages).await;
    Ok(Json(json!({"message": outcome})).into_response())
}

async fn owned_conversation(
    state: &AppState,
    account: &str,
    conversation_id: &str,
) -> Result<db::ConversationRecord, ApiError> {
    let conversation = db::get_conversation(&state.pool, state.db_kind, conversation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))?;
    let page = db::find_page(&state.pool, state.db_kind, &conversation.page_id).await?;
    match page {
        Some(page) if page.account_id == account => Ok(conversation),
        _ => Err(ApiError::NotFound("conversation not found".to_string())),
    }
}

async fn conversation_history(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(conversation_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Response, ApiError> {
    let conversation = owned_conversation(&state, &account, &conversation_id).await?;
    let limit = page.limit.unwrap_or(200).min(500);
    let offset = page.offset.unwrap_or(0);

    let messages =
        db::list_messages(&state.pool, state.db_kind, &conversation.id, limit, offset).await?;
    Ok(Json(json!({"messages": messages})).into_response())
}

async fn conversation_mark_read(
    State(state): State<AppState>,
    Extension(AccountId(account)): Extension<AccountId>,
    Path(conversation_id): Path<String>,
) -> Result<Response, ApiError> {
    let conversation = owned_conversation(&state, &account, &conversation_id).await?;
    db::mark_conversation_read(&state.pool, state.db_kind, &conversation.id).await?;
    Ok(Json(json!({"status": "ok"})).into_response())
}
