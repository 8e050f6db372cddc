//! Collaborator contracts (search, page fetch, language model) plus live and
//! fixture-first implementations.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aura_core::{ConversationTurn, Role, WebsiteSnapshot};
use aura_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "aura-adapters";

pub const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Paragraphs considered when building a website excerpt.
pub const MAX_SNAPSHOT_PARAGRAPHS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    Basic,
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("{0} is not configured")]
    MissingCredential(&'static str),
    #[error("model returned no text")]
    EmptyReply,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn search(
        &self,
        query: &str,
        depth: SearchDepth,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, AdapterError>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Raw HTML of `url`.
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// `history` holds prior turns only; `user_turn` is the message to answer.
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ConversationTurn],
        user_turn: &str,
    ) -> Result<String, AdapterError>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: SearchDepth,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

pub struct TavilySearch {
    http: Arc<HttpFetcher>,
    api_key: String,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: TAVILY_SEARCH_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    fn provider_id(&self) -> &'static str {
        "tavily"
    }

    async fn search(
        &self,
        query: &str,
        depth: SearchDepth,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, AdapterError> {
        let request = TavilyRequest {
            api_key: &self.api_key,
            query,
            search_depth: depth,
            max_results,
        };
        let response: TavilyResponse = self.http.post_json(self.endpoint(), &[], &request).await?;
        debug!(query, hits = response.results.len(), "tavily search complete");
        Ok(response.results.into_iter().take(max_results).collect())
    }
}

pub struct HttpPageFetcher {
    http: Arc<HttpFetcher>,
}

impl HttpPageFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        let response = self.http.fetch_bytes(url).await?;
        Ok(response.text())
    }
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiReplyContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyContent {
    #[serde(default)]
    parts: Vec<GeminiReplyPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyPart {
    #[serde(default)]
    text: Option<String>,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn gemini_request<'a>(
    system_prompt: &'a str,
    history: &'a [ConversationTurn],
    user_turn: &'a str,
) -> GeminiRequest<'a> {
    let mut contents: Vec<GeminiContent<'a>> = history
        .iter()
        .map(|turn| GeminiContent {
            role: Some(gemini_role(turn.role)),
            parts: vec![GeminiPart { text: &turn.content }],
        })
        .collect();
    contents.push(GeminiContent {
        role: Some("user"),
        parts: vec![GeminiPart { text: user_turn }],
    });

    GeminiRequest {
        system_instruction: GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: system_prompt,
            }],
        },
        contents,
    }
}

/// First candidate's text parts, concatenated. Blocked or empty replies map
/// to [`AdapterError::EmptyReply`].
fn gemini_reply_text(response: GeminiResponse) -> Result<String, AdapterError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AdapterError::EmptyReply);
    }
    Ok(text)
}

pub struct GeminiModel {
    http: Arc<HttpFetcher>,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiModel {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            api_base: GEMINI_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ConversationTurn],
        user_turn: &str,
    ) -> Result<String, AdapterError> {
        let request = gemini_request(system_prompt, history, user_turn);
        let headers = [("x-goog-api-key", self.api_key.clone())];
        let response: GeminiResponse = self
            .http
            .post_json(&self.endpoint(), &headers, &request)
            .await?;
        gemini_reply_text(response)
    }
}

/// Stand-in for a collaborator whose credential is missing. Every call fails,
/// so the turn degrades the same way it would on an outage.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured {
    pub credential: &'static str,
}

#[async_trait]
impl SearchProvider for Unconfigured {
    fn provider_id(&self) -> &'static str {
        "unconfigured"
    }

    async fn search(
        &self,
        _query: &str,
        _depth: SearchDepth,
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, AdapterError> {
        Err(AdapterError::MissingCredential(self.credential))
    }
}

#[async_trait]
impl LanguageModel for Unconfigured {
    fn model_id(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        _history: &[ConversationTurn],
        _user_turn: &str,
    ) -> Result<String, AdapterError> {
        Err(AdapterError::MissingCredential(self.credential))
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn select_first_text(document: &Html, sel: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(document: &Html, sel: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(sel)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Title, meta description and a body excerpt built from the first ten
/// paragraphs. Missing pieces come back as empty strings.
pub fn parse_website_snapshot(url: &str, html: &str) -> Result<WebsiteSnapshot, AdapterError> {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, "title")?.unwrap_or_default();
    let description =
        select_first_attr(&document, r#"meta[name="description"]"#, "content")?.unwrap_or_default();

    let paragraphs = selector("p")?;
    let excerpt = document
        .select(&paragraphs)
        .take(MAX_SNAPSHOT_PARAGRAPHS)
        .filter_map(|p| text_or_none(p.text().collect::<String>()))
        .collect::<Vec<_>>()
        .join(" ");
    let key_points = excerpt
        .chars()
        .take(WebsiteSnapshot::MAX_KEY_POINTS_CHARS)
        .collect();

    Ok(WebsiteSnapshot {
        url: url.to_string(),
        title,
        description,
        key_points,
    })
}

/// A captured research turn: canned search results, pages and a model reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub entity: String,
    pub captured_at: DateTime<Utc>,
    pub searches: Vec<FixtureSearch>,
    #[serde(default)]
    pub pages: Vec<FixturePage>,
    pub reply: FixtureText,
    pub notes: Option<String>,
}

/// Results served for any query containing `query_contains`
/// (case-insensitive). The first matching entry wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSearch {
    pub query_contains: String,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub url: String,
    pub content_type: String,
    #[serde(flatten)]
    pub body: FixtureText,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureText {
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

impl FixtureText {
    fn hydrate(&mut self, bundle_dir: &Path) -> Result<()> {
        if self.inline_text.is_some() {
            return Ok(());
        }
        let Some(rel_path) = &self.path else {
            return Ok(());
        };
        let raw_path = bundle_dir.join(rel_path);
        if !raw_path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&raw_path)
            .with_context(|| format!("reading fixture artifact {}", raw_path.display()))?;
        self.inline_text = Some(raw);
        Ok(())
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    let bundle_dir = path.parent().unwrap_or_else(|| Path::new("."));
    for page in &mut bundle.pages {
        page.body.hydrate(bundle_dir)?;
    }
    bundle.reply.hydrate(bundle_dir)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct StaticSearchProvider {
    searches: Vec<FixtureSearch>,
}

impl StaticSearchProvider {
    pub fn new(searches: Vec<FixtureSearch>) -> Self {
        Self { searches }
    }

    pub fn from_bundle(bundle: &FixtureBundle) -> Self {
        Self::new(bundle.searches.clone())
    }
}

#[async_trait]
impl SearchProvider for StaticSearchProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(
        &self,
        query: &str,
        _depth: SearchDepth,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, AdapterError> {
        let query = query.to_lowercase();
        Ok(self
            .searches
            .iter()
            .find(|s| query.contains(&s.query_contains.to_lowercase()))
            .map(|s| s.results.iter().take(max_results).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixturePageFetcher {
    pages: HashMap<String, String>,
}

impl FixturePageFetcher {
    pub fn from_bundle(bundle: &FixtureBundle) -> Self {
        let pages = bundle
            .pages
            .iter()
            .filter_map(|p| Some((p.url.clone(), p.body.inline_text.clone()?)))
            .collect();
        Self { pages }
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| AdapterError::Message(format!("no fixture page for {url}")))
    }
}

/// Replies with the same captured text on every call.
#[derive(Debug, Clone)]
pub struct CannedLanguageModel {
    reply: Option<String>,
}

impl CannedLanguageModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
        }
    }

    pub fn from_bundle(bundle: &FixtureBundle) -> Self {
        Self {
            reply: bundle.reply.inline_text.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for CannedLanguageModel {
    fn model_id(&self) -> &str {
        "canned"
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        _history: &[ConversationTurn],
        _user_turn: &str,
    ) -> Result<String, AdapterError> {
        self.reply.clone().ok_or(AdapterError::EmptyReply)
    }
}
