//! Axum + Askama chat surface for Aura.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use aura_core::{ResearchRecord, TurnResult};
use aura_research::{ResearchAgent, ResearchConfig, ResearchPipeline};
use aura_storage::SessionRegistry;
use chrono::Utc;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, info_span, Instrument};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub const CRATE_NAME: &str = "aura-web";

pub const TURN_FAILED_REPLY: &str =
    "I apologize, but something went wrong while handling that message. Please try again.";

pub struct AppState {
    pub workspace_root: PathBuf,
    pub pipeline: Arc<ResearchPipeline>,
    pub sessions: SessionRegistry<ResearchAgent>,
    pub scrape_enabled: bool,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>, pipeline: ResearchPipeline) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            pipeline: Arc::new(pipeline),
            sessions: SessionRegistry::new(),
            scrape_enabled: true,
        }
    }

    pub fn with_scrape_enabled(mut self, enabled: bool) -> Self {
        self.scrape_enabled = enabled;
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub data: Option<ResearchRecord>,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub session_id: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    model_id: String,
    scrape_enabled: bool,
}

pub fn app(state: AppState) -> Router {
    router(Arc::new(state))
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/chat", post(chat_handler))
        .route("/reset", post(reset_handler))
        .route("/report", get(report_handler))
        .route("/health", get(health_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(state)
}

pub async fn serve(config: &ResearchConfig, pipeline: ResearchPipeline) -> anyhow::Result<()> {
    let state = Arc::new(
        AppState::new(config.workspace_root.clone(), pipeline)
            .with_scrape_enabled(config.scrape_enabled),
    );
    tokio::spawn(sweep_idle_sessions(
        Arc::clone(&state),
        Duration::from_secs(config.session_ttl_secs),
    ));

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "aura web listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn sweep_idle_sessions(state: Arc<AppState>, ttl: Duration) {
    let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let evicted = state.sessions.evict_idle(ttl).await;
        if evicted > 0 {
            info!(evicted, "evicted idle sessions");
        }
    }
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ResearchConfig::from_env();
    let pipeline = ResearchPipeline::from_config(&config)?;
    serve(&config, pipeline).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(IndexTemplate {
        model_id: state.pipeline.model().model_id().to_string(),
        scrape_enabled: state.scrape_enabled,
    })
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.trim().is_empty() {
        return bad_request("message must not be empty");
    }

    let pipeline = Arc::clone(&state.pipeline);
    let session = state
        .sessions
        .resolve(request.session_id.as_deref(), || ResearchAgent::new(pipeline))
        .await;
    let session_id = session.id;
    let agent = session.state;
    let turn_agent = Arc::clone(&agent);
    let message = request.message;

    // Turns on one session queue on its lock; a panicking turn is contained
    // to this request.
    let span = info_span!("chat", session_id = %session_id);
    let turn = tokio::spawn(
        async move {
            let mut agent = turn_agent.lock_owned().await;
            agent.process_message(&message).await
        }
        .instrument(span),
    );
    let result = match turn.await {
        Ok(result) => result,
        Err(err) => {
            error!(%session_id, error = %err, "chat turn aborted");
            agent.lock().await.close_interrupted_turn(TURN_FAILED_REPLY);
            TurnResult::text_only(TURN_FAILED_REPLY)
        }
    };

    Json(ChatResponse {
        response: result.text,
        data: result.data,
        session_id,
    })
    .into_response()
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetRequest>,
) -> Response {
    if let Some(id) = request.session_id.as_deref() {
        state.sessions.remove(id).await;
    }
    Json(serde_json::json!({ "status": "reset" })).into_response()
}

/// Markdown report of the session's latest answered turn.
async fn report_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let Some(agent) = state.sessions.get(&query.session_id).await else {
        return not_found("unknown session");
    };
    let today = Utc::now().date_naive();
    let Some(report) = agent.lock().await.report(today) else {
        return not_found("no answered turn to report yet");
    };
    let disposition = format!("attachment; filename=\"research-{today}.md\"");
    (
        [
            (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        report,
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.len().await,
    }))
    .into_response()
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: &str) -> Response {
    json_error(StatusCode::NOT_FOUND, message)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
