//! Research turn orchestration: configuration, corpus gathering, record
//! assembly and the per-session conversational agent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aura_adapters::{
    parse_website_snapshot, CannedLanguageModel, FixtureBundle, FixturePageFetcher, GeminiModel,
    HttpPageFetcher, LanguageModel, PageFetcher, SearchDepth, SearchHit, SearchProvider,
    StaticSearchProvider, TavilySearch, Unconfigured,
};
use aura_core::{ConversationTurn, ResearchRecord, Role, TurnResult, WebsiteSnapshot};
use aura_extract::{
    extract_chart_tables, extract_entity_name, should_search, CorpusExtractor, ExtractionRules,
    RulesError,
};
use aura_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "aura-research";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; aura-research/0.1)";

pub const FALLBACK_REPLY: &str = "I apologize, but I was unable to generate a response. This might be due to safety filters or an API issue. Please try rephrasing your request.";

pub const SYSTEM_PROMPT: &str = "\
You are Aura, a company research assistant. You help people research companies, \
size up markets and draft account plans, and you lean on numbers wherever you can.

Tone: professional and warm, with a light futuristic flair.

Read the user and adapt:
- Unsure or vague: make a sensible first guess and deliver something useful. Ask at most one clarifying question.
- In a hurry: answer tightly with bullet points and hard figures.
- Chatty: acknowledge the aside briefly, then steer back to the business question.
- Impossible or off-topic requests: say plainly what you cannot do and offer a realistic alternative.

Rules:
- When research results are provided, build on them without asking permission.
- Organise answers under markdown section headers (## Topic). Present comparable figures as markdown tables.
- Account plans use these sections: Executive Summary, Overview, Priorities, Decision Makers, Opportunities, Action Plan.
- If the data does not say, admit it. Never invent figures.
- Bold the key metrics.";

/// The prompt sent in place of the raw user message when research ran.
pub fn synthesis_prompt(user_message: &str, entity: &str, corpus: &str) -> String {
    format!(
        "User asked: \"{user_message}\"\n\n\
Research results for {entity}:\n\n\
{corpus}\n\n\
Turn these results into a helpful answer:\n\
1. Organise key sections under markdown headers (## Topic).\n\
2. Match the user's tone.\n\
3. Quote concrete numbers and metrics.\n\
4. If an account plan was requested, produce one with the standard sections.\n\
5. Cover financial metrics, growth trends and competitive position where the data allows.\n\
6. Draw on earlier turns of the conversation when relevant.\n"
    )
}

/// A downloadable markdown report for one answered turn: the reply followed
/// by a summary of the turn's record, when it had one.
pub fn markdown_report(reply: &str, record: Option<&ResearchRecord>, date: NaiveDate) -> String {
    let mut out = format!("# Research Report - {date}\n\n{reply}\n");
    let Some(record) = record else {
        return out;
    };

    out.push_str("\n## Data Summary\n\n");
    out.push_str(&format!("**Company:** {}\n\n", record.company));
    out.push_str(&format!(
        "**Confidence:** {}% | **Reliability:** {}%\n",
        record.confidence_score, record.reliability_score
    ));

    let metrics: Vec<String> = record
        .metrics
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect();
    push_list(&mut out, "Metrics", &metrics);
    push_list(&mut out, "Competitors", &record.competitors);
    push_list(&mut out, "Strategic Priorities", &record.priorities);
    push_list(&mut out, "Opportunities", &record.opportunities);
    if let Some(sentiment) = &record.sentiment {
        out.push_str(&format!(
            "\n### Sentiment\n- Positive: {}%\n- Negative: {}%\n- Neutral: {}%\n",
            sentiment.positive, sentiment.negative, sentiment.neutral
        ));
    }
    let conflicts: Vec<String> = record.conflicts.iter().map(|c| c.message.clone()).collect();
    push_list(&mut out, "Conflicts", &conflicts);
    push_list(&mut out, "Sources", &record.sources);
    out
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n### {heading}\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub tavily_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub model: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub user_agent: String,
    pub tavily_endpoint: Option<String>,
    pub gemini_api_base: Option<String>,
    pub scrape_enabled: bool,
    pub rules_file: Option<PathBuf>,
    pub web_port: u16,
    pub session_ttl_secs: u64,
    pub workspace_root: PathBuf,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ResearchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            tavily_api_key: non_empty("TAVILY_API_KEY"),
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            model: non_empty("AURA_MODEL")
                .unwrap_or_else(|| aura_adapters::DEFAULT_GEMINI_MODEL.to_string()),
            http_timeout_secs: non_empty("AURA_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            http_max_retries: non_empty("AURA_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            user_agent: non_empty("AURA_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            tavily_endpoint: non_empty("AURA_TAVILY_URL"),
            gemini_api_base: non_empty("AURA_GEMINI_API_BASE"),
            scrape_enabled: non_empty("AURA_SCRAPE_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            rules_file: non_empty("AURA_RULES_FILE").map(PathBuf::from),
            web_port: non_empty("AURA_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            session_ttl_secs: non_empty("AURA_SESSION_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            workspace_root: non_empty("AURA_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Extraction rules from `rules_file` (relative to the workspace root),
    /// or the built-in rules when unset.
    pub fn load_extractor(&self) -> Result<CorpusExtractor, ResearchError> {
        let rules = match &self.rules_file {
            Some(path) => ExtractionRules::from_yaml_file(self.workspace_root.join(path))?,
            None => ExtractionRules::default(),
        };
        Ok(CorpusExtractor::new(rules)?)
    }
}

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error("record assembly for {entity} failed: {reason}")]
    Assembly { entity: String, reason: String },
}

#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub pages: Arc<dyn PageFetcher>,
    pub model: Arc<dyn LanguageModel>,
}

impl Collaborators {
    /// Network-backed collaborators sharing one fetcher. A missing API key
    /// swaps in an [`Unconfigured`] stand-in.
    pub fn live(config: &ResearchConfig) -> Result<Self> {
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config()).context("building http fetcher")?,
        );

        let search: Arc<dyn SearchProvider> = match &config.tavily_api_key {
            Some(key) => {
                let tavily = TavilySearch::new(Arc::clone(&http), key.clone());
                Arc::new(match &config.tavily_endpoint {
                    Some(endpoint) => tavily.with_endpoint(endpoint.clone()),
                    None => tavily,
                })
            }
            None => {
                warn!("TAVILY_API_KEY not set; research turns will have no search results");
                Arc::new(Unconfigured {
                    credential: "TAVILY_API_KEY",
                })
            }
        };
        let model: Arc<dyn LanguageModel> = match &config.gemini_api_key {
            Some(key) => {
                let gemini = GeminiModel::new(Arc::clone(&http), key.clone(), config.model.clone());
                Arc::new(match &config.gemini_api_base {
                    Some(base) => gemini.with_api_base(base.clone()),
                    None => gemini,
                })
            }
            None => {
                warn!("GEMINI_API_KEY not set; replies fall back to a canned apology");
                Arc::new(Unconfigured {
                    credential: "GEMINI_API_KEY",
                })
            }
        };

        Ok(Self {
            search,
            pages: Arc::new(HttpPageFetcher::new(http)),
            model,
        })
    }

    /// Collaborators replaying a captured fixture bundle.
    pub fn offline(bundle: &FixtureBundle) -> Self {
        Self {
            search: Arc::new(StaticSearchProvider::from_bundle(bundle)),
            pages: Arc::new(FixturePageFetcher::from_bundle(bundle)),
            model: Arc::new(CannedLanguageModel::from_bundle(bundle)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchQuery {
    pub query: String,
    pub depth: SearchDepth,
    pub max_results: usize,
}

/// Corpus queries for one entity, in the order their results are joined.
pub fn corpus_queries(entity: &str) -> Vec<ResearchQuery> {
    vec![
        ResearchQuery {
            query: format!(
                "{entity} company overview news financials strategy market share competitors"
            ),
            depth: SearchDepth::Advanced,
            max_results: 3,
        },
        ResearchQuery {
            query: format!("{entity} latest news financial results 2024 2025"),
            depth: SearchDepth::Advanced,
            max_results: 3,
        },
        ResearchQuery {
            query: format!("{entity} revenue earnings market cap stock price"),
            depth: SearchDepth::Advanced,
            max_results: 2,
        },
    ]
}

pub fn website_query(entity: &str) -> ResearchQuery {
    ResearchQuery {
        query: format!("{entity} official website"),
        depth: SearchDepth::Basic,
        max_results: 1,
    }
}

pub fn corpus_block(hit: &SearchHit) -> String {
    let url = if hit.url.is_empty() { "N/A" } else { &hit.url };
    format!("**{}**\n{}\nSource: {}", hit.title, hit.content, url)
}

pub fn website_block(snapshot: &WebsiteSnapshot) -> String {
    format!(
        "\n\n**Website Information ({}):**\nTitle: {}\nDescription: {}\nContent: {}\n",
        snapshot.url, snapshot.title, snapshot.description, snapshot.key_points
    )
}

/// Mine a corpus into a record, logging any degraded extraction stage.
pub fn assemble_record(
    extractor: &CorpusExtractor,
    entity: &str,
    corpus: &str,
    timestamp: DateTime<Utc>,
) -> ResearchRecord {
    let extraction = extractor.extract(entity, corpus, timestamp);
    for stage in extraction.degraded_stages() {
        debug!(
            stage = %stage.stage,
            status = ?stage.status,
            rejected = stage.rejected,
            "extraction stage degraded"
        );
    }
    extraction.record
}

/// What one research pass produced. `record` is `None` only when assembly
/// itself failed.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub entity: String,
    pub corpus: String,
    pub record: Option<ResearchRecord>,
}

pub struct ResearchPipeline {
    collaborators: Collaborators,
    extractor: Arc<CorpusExtractor>,
    scrape_enabled: bool,
}

impl ResearchPipeline {
    pub fn new(collaborators: Collaborators, extractor: CorpusExtractor) -> Self {
        Self {
            collaborators,
            extractor: Arc::new(extractor),
            scrape_enabled: true,
        }
    }

    pub fn from_config(config: &ResearchConfig) -> Result<Self> {
        let extractor = config.load_extractor().context("loading extraction rules")?;
        let collaborators = Collaborators::live(config)?;
        Ok(Self::new(collaborators, extractor).with_scrape_enabled(config.scrape_enabled))
    }

    pub fn offline(bundle: &FixtureBundle, config: &ResearchConfig) -> Result<Self> {
        let extractor = config.load_extractor().context("loading extraction rules")?;
        Ok(Self::new(Collaborators::offline(bundle), extractor)
            .with_scrape_enabled(config.scrape_enabled))
    }

    pub fn with_scrape_enabled(mut self, enabled: bool) -> Self {
        self.scrape_enabled = enabled;
        self
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.collaborators.model.as_ref()
    }

    pub fn extractor(&self) -> &CorpusExtractor {
        &self.extractor
    }

    /// Run the corpus queries in order. A failed query is logged and
    /// contributes nothing.
    pub async fn gather_corpus(&self, entity: &str) -> String {
        let mut blocks = Vec::new();
        for q in corpus_queries(entity) {
            match self
                .collaborators
                .search
                .search(&q.query, q.depth, q.max_results)
                .await
            {
                Ok(hits) => blocks.extend(hits.iter().map(corpus_block)),
                Err(err) => warn!(query = %q.query, error = %err, "search failed; skipping query"),
            }
        }
        blocks.join("\n\n")
    }

    /// Locate the entity's site with one search and scrape it. Any failure
    /// yields `None`.
    pub async fn scrape_website(&self, entity: &str) -> Option<WebsiteSnapshot> {
        let q = website_query(entity);
        let hits = match self
            .collaborators
            .search
            .search(&q.query, q.depth, q.max_results)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(entity, error = %err, "website lookup failed");
                return None;
            }
        };
        let url = hits.into_iter().next().map(|h| h.url).filter(|u| !u.is_empty())?;

        let html = match self.collaborators.pages.fetch_page(&url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(%url, error = %err, "website fetch failed");
                return None;
            }
        };
        match parse_website_snapshot(&url, &html) {
            Ok(snapshot) => {
                debug!(%url, "scraped website");
                Some(snapshot)
            }
            Err(err) => {
                warn!(%url, error = %err, "website parse failed");
                None
            }
        }
    }

    pub async fn research(&self, entity: &str) -> ResearchOutcome {
        let mut corpus = self.gather_corpus(entity).await;
        let scraped = if self.scrape_enabled {
            self.scrape_website(entity).await
        } else {
            None
        };
        if let Some(snapshot) = &scraped {
            corpus.push_str(&website_block(snapshot));
        }
        info!(entity, corpus_chars = corpus.len(), scraped = scraped.is_some(), "corpus gathered");

        let record = match self.assemble_off_thread(entity, &corpus).await {
            Ok(mut record) => {
                record.scraped_info = scraped;
                Some(record)
            }
            Err(err) => {
                error!(error = %err, "research record unavailable");
                None
            }
        };

        ResearchOutcome {
            entity: entity.to_string(),
            corpus,
            record,
        }
    }

    /// Regex-heavy assembly runs on the blocking pool; a panic there only
    /// costs this turn its record.
    async fn assemble_off_thread(
        &self,
        entity: &str,
        corpus: &str,
    ) -> Result<ResearchRecord, ResearchError> {
        let extractor = Arc::clone(&self.extractor);
        let owned_entity = entity.to_string();
        let owned_corpus = corpus.to_string();
        tokio::task::spawn_blocking(move || {
            assemble_record(&extractor, &owned_entity, &owned_corpus, Utc::now())
        })
        .await
        .map_err(|err| ResearchError::Assembly {
            entity: entity.to_string(),
            reason: err.to_string(),
        })
    }
}

/// Per-session conversation state plus the records researched so far.
pub struct ResearchAgent {
    pipeline: Arc<ResearchPipeline>,
    history: Vec<ConversationTurn>,
    research_data: HashMap<String, ResearchRecord>,
    last_turn: Option<TurnResult>,
}

impl ResearchAgent {
    pub fn new(pipeline: Arc<ResearchPipeline>) -> Self {
        Self {
            pipeline,
            history: Vec::new(),
            research_data: HashMap::new(),
            last_turn: None,
        }
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn record_for(&self, entity: &str) -> Option<&ResearchRecord> {
        self.research_data.get(entity)
    }

    pub fn researched_entities(&self) -> impl Iterator<Item = &str> {
        self.research_data.keys().map(String::as_str)
    }

    pub fn last_turn(&self) -> Option<&TurnResult> {
        self.last_turn.as_ref()
    }

    /// Markdown report of the most recent answered turn.
    pub fn report(&self, date: NaiveDate) -> Option<String> {
        self.last_turn
            .as_ref()
            .map(|turn| markdown_report(&turn.text, turn.data.as_ref(), date))
    }

    /// Close out a turn that was aborted before it replied, so the history
    /// keeps alternating between user and assistant.
    pub fn close_interrupted_turn(&mut self, reply: &str) {
        if self.history.last().is_some_and(|turn| turn.role == Role::User) {
            self.history.push(ConversationTurn::assistant(reply));
            self.last_turn = Some(TurnResult::text_only(reply));
        }
    }

    /// Answer one user message. Always yields a reply; `data` is set only
    /// when research ran and a record could be assembled.
    pub async fn process_message(&mut self, message: &str) -> TurnResult {
        let span = info_span!("research_turn", history_len = self.history.len());
        self.process_inner(message).instrument(span).await
    }

    async fn process_inner(&mut self, message: &str) -> TurnResult {
        self.history.push(ConversationTurn::user(message));

        let (prompt, mut record, entity) = if should_search(message) {
            let entity = extract_entity_name(message);
            info!(%entity, "research triggered");
            let outcome = self.pipeline.research(&entity).await;
            let prompt = synthesis_prompt(message, &entity, &outcome.corpus);
            (prompt, outcome.record, Some(entity))
        } else {
            debug!("no research needed");
            (message.to_string(), None, None)
        };

        let prior = &self.history[..self.history.len() - 1];
        let reply = match self.pipeline.model().generate(SYSTEM_PROMPT, prior, &prompt).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "language model failed; using fallback reply");
                FALLBACK_REPLY.to_string()
            }
        };
        self.history.push(ConversationTurn::assistant(reply.clone()));

        if let (Some(record), Some(entity)) = (record.as_mut(), entity) {
            let tables = extract_chart_tables(&reply);
            if !tables.is_empty() {
                debug!(tables = tables.len(), "charted tables from reply");
                record.tables = Some(tables);
            }
            self.research_data.insert(entity, record.clone());
        }

        let result = TurnResult {
            text: reply,
            data: record,
        };
        self.last_turn = Some(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aura_adapters::{load_fixture_bundle, AdapterError};
    use aura_core::{metric_keys, MetricValue};
    use std::path::Path;
    use std::sync::Mutex;

    fn fixture_bundle() -> FixtureBundle {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/nvidia/sample/bundle.json");
        load_fixture_bundle(path).unwrap()
    }

    #[derive(Default)]
    struct RecordingSearch {
        calls: Mutex<Vec<ResearchQuery>>,
        fail_on: Option<&'static str>,
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl SearchProvider for RecordingSearch {
        fn provider_id(&self) -> &'static str {
            "recording"
        }

        async fn search(
            &self,
            query: &str,
            depth: SearchDepth,
            max_results: usize,
        ) -> Result<Vec<SearchHit>, AdapterError> {
            self.calls.lock().unwrap().push(ResearchQuery {
                query: query.to_string(),
                depth,
                max_results,
            });
            if self.fail_on.is_some_and(|f| query.contains(f)) {
                return Err(AdapterError::Message("boom".into()));
            }
            Ok(self.hits.iter().take(max_results).cloned().collect())
        }
    }

    struct NoPages;

    #[async_trait]
    impl PageFetcher for NoPages {
        async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
            Err(AdapterError::Message(format!("offline: {url}")))
        }
    }

    #[derive(Default)]
    struct ScriptedModel {
        seen: Mutex<Vec<(usize, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            history: &[ConversationTurn],
            user_turn: &str,
        ) -> Result<String, AdapterError> {
            self.seen
                .lock()
                .unwrap()
                .push((history.len(), user_turn.to_string()));
            if self.fail {
                return Err(AdapterError::EmptyReply);
            }
            Ok(format!("reply #{}", history.len() / 2 + 1))
        }
    }

    fn hit(title: &str, content: &str, url: &str) -> SearchHit {
        SearchHit {
            title: title.into(),
            content: content.into(),
            url: url.into(),
        }
    }

    fn pipeline(search: Arc<RecordingSearch>, model: Arc<ScriptedModel>) -> Arc<ResearchPipeline> {
        let collaborators = Collaborators {
            search,
            pages: Arc::new(NoPages),
            model,
        };
        Arc::new(ResearchPipeline::new(
            collaborators,
            CorpusExtractor::with_default_rules().unwrap(),
        ))
    }

    #[tokio::test]
    async fn small_talk_skips_research() {
        let search = Arc::new(RecordingSearch::default());
        let model = Arc::new(ScriptedModel::default());
        let mut agent = ResearchAgent::new(pipeline(search.clone(), model.clone()));

        let result = agent.process_message("hi").await;
        assert_eq!(result.text, "reply #1");
        assert!(result.data.is_none());
        assert!(search.calls.lock().unwrap().is_empty());
        assert_eq!(model.seen.lock().unwrap()[0], (0, "hi".to_string()));
        assert_eq!(agent.history().len(), 2);
        assert_eq!(agent.history()[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn model_sees_prior_history_only() {
        let search = Arc::new(RecordingSearch::default());
        let model = Arc::new(ScriptedModel::default());
        let mut agent = ResearchAgent::new(pipeline(search, model.clone()));

        agent.process_message("hi").await;
        let second = agent.process_message("ok").await;
        assert_eq!(second.text, "reply #2");

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[1], (2, "ok".to_string()));
        assert_eq!(agent.history().len(), 4);
    }

    #[tokio::test]
    async fn research_runs_queries_in_order() {
        let search = Arc::new(RecordingSearch {
            hits: vec![hit("Acme", "Acme revenue: $2 billion", "https://acme.example")],
            ..Default::default()
        });
        let model = Arc::new(ScriptedModel::default());
        let mut agent = ResearchAgent::new(pipeline(search.clone(), model.clone()));

        let result = agent.process_message("research about Acme").await;

        let calls = search.calls.lock().unwrap();
        let queries: Vec<_> = calls.iter().map(|c| c.query.as_str()).collect();
        assert_eq!(
            queries,
            vec![
                "Acme company overview news financials strategy market share competitors",
                "Acme latest news financial results 2024 2025",
                "Acme revenue earnings market cap stock price",
                "Acme official website",
            ]
        );
        assert_eq!(calls[0].depth, SearchDepth::Advanced);
        assert_eq!(calls[2].max_results, 2);
        assert_eq!(calls[3].depth, SearchDepth::Basic);
        assert_eq!(calls[3].max_results, 1);

        let record = result.data.unwrap();
        assert_eq!(record.company, "Acme");
        assert_eq!(record.metric(metric_keys::REVENUE), Some(2000.0));
        // site fetch fails offline, so no snapshot
        assert!(record.scraped_info.is_none());
        assert!(agent.record_for("Acme").is_some());

        let prompt = &model.seen.lock().unwrap()[0].1;
        assert!(prompt.starts_with("User asked: \"research about Acme\""));
        assert!(prompt.contains("**Acme**\nAcme revenue: $2 billion\nSource: https://acme.example"));
    }

    #[tokio::test]
    async fn failed_query_degrades_to_partial_corpus() {
        let search = Arc::new(RecordingSearch {
            hits: vec![hit("Acme", "Acme news", "https://acme.example")],
            fail_on: Some("latest news"),
            ..Default::default()
        });
        let model = Arc::new(ScriptedModel::default());
        let p = pipeline(search, model);

        let corpus = p.gather_corpus("Acme").await;
        assert_eq!(corpus.matches("Source: https://acme.example").count(), 2);
    }

    #[tokio::test]
    async fn every_collaborator_failing_still_replies() {
        let search = Arc::new(RecordingSearch {
            fail_on: Some("Acme"),
            ..Default::default()
        });
        let model = Arc::new(ScriptedModel {
            fail: true,
            ..Default::default()
        });
        let mut agent = ResearchAgent::new(pipeline(search, model));

        let result = agent.process_message("Tell me about Acme").await;
        assert_eq!(result.text, FALLBACK_REPLY);
        let record = result.data.unwrap();
        assert_eq!(record.confidence_score, 70);
        assert!(record.metrics.is_empty());
        assert_eq!(agent.history()[1].content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn scrape_can_be_disabled() {
        let search = Arc::new(RecordingSearch::default());
        let model = Arc::new(ScriptedModel::default());
        let collaborators = Collaborators {
            search: search.clone(),
            pages: Arc::new(NoPages),
            model,
        };
        let p = ResearchPipeline::new(collaborators, CorpusExtractor::with_default_rules().unwrap())
            .with_scrape_enabled(false);

        let outcome = p.research("Acme").await;
        assert_eq!(search.calls.lock().unwrap().len(), 3);
        assert!(outcome.record.unwrap().scraped_info.is_none());
    }

    #[tokio::test]
    async fn site_lookup_without_url_skips_scrape() {
        let search = Arc::new(RecordingSearch {
            hits: vec![hit("Acme", "no link", "")],
            ..Default::default()
        });
        let p = pipeline(search, Arc::new(ScriptedModel::default()));
        assert!(p.scrape_website("Acme").await.is_none());
    }

    #[tokio::test]
    async fn offline_fixture_turn_builds_full_record() {
        let bundle = fixture_bundle();
        let p = ResearchPipeline::offline(&bundle, &ResearchConfig::default()).unwrap();
        let mut agent = ResearchAgent::new(Arc::new(p));

        let result = agent.process_message("Tell me about Nvidia").await;
        assert!(result.text.starts_with("## Overview"));

        let record = result.data.unwrap();
        assert_eq!(record.company, "Nvidia");
        assert_eq!(record.metric(metric_keys::REVENUE), Some(35100.0));
        assert_eq!(record.metric(metric_keys::MARKET_CAP), Some(3_500_000.0));
        assert_eq!(record.metric(metric_keys::MARKET_SHARE), Some(88.0));
        assert_eq!(
            record.metric_value(metric_keys::EMPLOYEES),
            Some(MetricValue::Count(36000))
        );
        assert_eq!(record.metric(metric_keys::PROFIT), Some(19300.0));
        assert_eq!(record.metric(metric_keys::GROWTH_RATE), Some(94.0));

        let years: Vec<_> = record.trends.iter().map(|t| t.year.as_str()).collect();
        assert_eq!(years, vec!["2023", "2024", "2025"]);
        assert_eq!(record.competitors, vec!["AMD", "Intel", "Broadcom"]);

        assert_eq!(record.conflicts.len(), 1);
        assert_eq!(record.conflicts[0].metric, "Market Cap");
        assert_eq!(record.conflicts[0].variance, 34.6);

        assert_eq!(record.sources.len(), 3);
        assert_eq!(
            record.recent_news,
            vec![
                "Nvidia reports record third quarter revenue",
                "Nvidia announces Blackwell ramp"
            ]
        );
        assert_eq!(record.reliability_score, 90);
        assert!((70..=98).contains(&record.confidence_score));
        assert!(record.sentiment.is_some());

        let scraped = record.scraped_info.as_ref().unwrap();
        assert_eq!(scraped.url, "https://www.nvidia.com/");

        let tables = record.tables.as_ref().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].chart_data.labels, vec!["2023", "2024", "2025"]);
        assert_eq!(tables[0].chart_data.datasets[0].label, "Revenue");

        assert_eq!(agent.researched_entities().collect::<Vec<_>>(), vec!["Nvidia"]);
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = ResearchConfig::default();
        assert_eq!(defaults.model, "gemini-2.0-flash");
        assert_eq!(defaults.http_timeout_secs, 10);
        assert_eq!(defaults.web_port, 8000);
        assert_eq!(defaults.http_max_retries, 0);
        assert_eq!(defaults.session_ttl_secs, 3600);
        assert!(defaults.scrape_enabled);
        assert!(defaults.tavily_api_key.is_none());
        assert!(defaults.tavily_endpoint.is_none());

        let config = ResearchConfig::from_lookup(|key| match key {
            "TAVILY_API_KEY" => Some("tvly-test".into()),
            "GEMINI_API_KEY" => Some("   ".into()),
            "AURA_SCRAPE_ENABLED" => Some("false".into()),
            "AURA_WEB_PORT" => Some("9100".into()),
            "AURA_HTTP_TIMEOUT_SECS" => Some("not-a-number".into()),
            "AURA_HTTP_MAX_RETRIES" => Some("2".into()),
            "AURA_SESSION_TTL_SECS" => Some("60".into()),
            "AURA_TAVILY_URL" => Some("http://127.0.0.1:9001/search".into()),
            "AURA_GEMINI_API_BASE" => Some("http://127.0.0.1:9002/v1beta".into()),
            _ => None,
        });
        assert_eq!(config.tavily_api_key.as_deref(), Some("tvly-test"));
        assert!(config.gemini_api_key.is_none());
        assert!(!config.scrape_enabled);
        assert_eq!(config.web_port, 9100);
        assert_eq!(config.http_timeout_secs, 10);
        assert_eq!(config.http_max_retries, 2);
        assert_eq!(config.session_ttl_secs, 60);
        assert_eq!(
            config.tavily_endpoint.as_deref(),
            Some("http://127.0.0.1:9001/search")
        );
        assert_eq!(
            config.gemini_api_base.as_deref(),
            Some("http://127.0.0.1:9002/v1beta")
        );
    }

    #[test]
    fn retries_flow_into_http_client_config() {
        let config = ResearchConfig {
            http_max_retries: 3,
            http_timeout_secs: 4,
            ..ResearchConfig::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.backoff.max_retries, 3);
        assert_eq!(http.timeout, Duration::from_secs(4));
        assert_eq!(http.user_agent.as_deref(), Some(DEFAULT_USER_AGENT));
        assert!(Collaborators::live(&config).is_ok());
    }

    #[tokio::test]
    async fn report_summarizes_latest_turn() {
        let bundle = fixture_bundle();
        let p = ResearchPipeline::offline(&bundle, &ResearchConfig::default()).unwrap();
        let mut agent = ResearchAgent::new(Arc::new(p));
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(agent.report(date).is_none());

        agent.process_message("Tell me about Nvidia").await;
        let report = agent.report(date).unwrap();
        assert!(report.starts_with("# Research Report - 2026-03-01\n\n## Overview"));
        assert!(report.contains("## Data Summary"));
        assert!(report.contains("**Company:** Nvidia"));
        assert!(report.contains("- Employees: 36000\n"));
        assert!(report.contains("- Revenue (M): 35100\n"));
        assert!(report.contains("### Competitors\n- AMD\n- Intel\n- Broadcom\n"));
        assert!(report.contains("**Data Conflict Detected**: Market Cap"));

        agent.process_message("ok").await;
        let small_talk = agent.report(date).unwrap();
        assert!(!small_talk.contains("## Data Summary"));
    }

    #[test]
    fn report_without_record_is_reply_only() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(
            markdown_report("Hello there", None, date),
            "# Research Report - 2026-03-01\n\nHello there\n"
        );
    }

    struct PanicOnceModel {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl LanguageModel for PanicOnceModel {
        fn model_id(&self) -> &str {
            "panic-once"
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            history: &[ConversationTurn],
            _user_turn: &str,
        ) -> Result<String, AdapterError> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls == 1
            };
            if first {
                panic!("model crashed mid-turn");
            }
            Ok(format!("prior turns: {}", history.len()))
        }
    }

    #[tokio::test]
    async fn interrupted_turn_is_closed_before_the_next_one() {
        let collaborators = Collaborators {
            search: Arc::new(RecordingSearch::default()),
            pages: Arc::new(NoPages),
            model: Arc::new(PanicOnceModel {
                calls: Mutex::new(0),
            }),
        };
        let p = ResearchPipeline::new(collaborators, CorpusExtractor::with_default_rules().unwrap());
        let agent = Arc::new(tokio::sync::Mutex::new(ResearchAgent::new(Arc::new(p))));

        let turn_agent = Arc::clone(&agent);
        let aborted = tokio::spawn(async move {
            let mut agent = turn_agent.lock_owned().await;
            agent.process_message("hi").await
        })
        .await;
        assert!(aborted.is_err());

        let mut agent = agent.lock().await;
        assert_eq!(agent.history().len(), 1);
        agent.close_interrupted_turn("sorry");
        agent.close_interrupted_turn("sorry again");
        assert_eq!(agent.history().len(), 2);
        assert_eq!(agent.history()[1], ConversationTurn::assistant("sorry"));
        assert_eq!(agent.last_turn(), Some(&TurnResult::text_only("sorry")));

        let next = agent.process_message("hello").await;
        assert_eq!(next.text, "prior turns: 2");
    }

    #[test]
    fn missing_rules_file_is_an_error() {
        let config = ResearchConfig {
            rules_file: Some(PathBuf::from("does/not/exist.yaml")),
            ..ResearchConfig::default()
        };
        assert!(matches!(
            config.load_extractor(),
            Err(ResearchError::Rules(RulesError::Io { .. }))
        ));
    }

    #[test]
    fn corpus_blocks_follow_result_layout() {
        let block = corpus_block(&hit("Title", "Body", ""));
        assert_eq!(block, "**Title**\nBody\nSource: N/A");

        let snapshot = WebsiteSnapshot {
            url: "https://acme.example".into(),
            title: "Acme".into(),
            description: "Widgets".into(),
            key_points: "We make widgets.".into(),
        };
        assert_eq!(
            website_block(&snapshot),
            "\n\n**Website Information (https://acme.example):**\nTitle: Acme\nDescription: Widgets\nContent: We make widgets.\n"
        );
    }
}
