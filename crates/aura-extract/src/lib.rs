//! Heuristic extraction over research corpora: search gating, entity names,
//! headline metrics, trends, competitors, conflicts, sentiment, scores and
//! markdown table charts.

use std::fs;
use std::path::Path;

use aura_core::{
    metric_keys, ChartDataset, ChartSeries, ChartTable, ConflictFinding, MetricValue,
    ResearchRecord, Sentiment, TrendPoint,
};
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "aura-extract";

pub const MAX_COMPETITORS: usize = 5;
pub const MAX_SECTION_BULLETS: usize = 5;
pub const MAX_SOURCES: usize = 3;
pub const MAX_RECENT_NEWS: usize = 2;
pub const CONFLICT_VARIANCE_THRESHOLD: f64 = 20.0;

pub const SEARCH_KEYWORDS: &[&str] = &[
    "research",
    "find",
    "look up",
    "tell me about",
    "information about",
    "details on",
    "analyze",
    "account plan",
    "company",
    "insights",
    "performance",
    "financial",
    "market",
    "strategy",
    "competitors",
    "revenue",
    "growth",
    "about",
    "show me",
    "what",
    "how",
];

const PROPER_NOUN_STOPWORDS: &[&str] = &["i", "a", "the"];
const ENTITY_TRIGGERS: &[&str] = &["research", "about", "on", "for"];
const ENTITY_PUNCTUATION: &[char] = &['.', ',', '!', '?'];

fn looks_like_proper_noun(token: &str) -> bool {
    token.chars().next().is_some_and(char::is_uppercase)
        && token.chars().count() > 2
        && !PROPER_NOUN_STOPWORDS.contains(&token.to_lowercase().as_str())
}

/// Cheap high-recall check for whether a message warrants web research.
pub fn should_search(message: &str) -> bool {
    let tokens: Vec<&str> = message.split_whitespace().collect();
    let lower = message.to_lowercase();

    if tokens.len() >= 2 && SEARCH_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        return true;
    }

    tokens.iter().any(|token| looks_like_proper_noun(token))
}

fn is_entity_trigger(token: &str) -> bool {
    ENTITY_TRIGGERS.contains(&token.to_lowercase().as_str())
}

/// Best-guess entity name. Long messages without a trigger word come back
/// unchanged and should be treated as a low-confidence guess.
pub fn extract_entity_name(message: &str) -> String {
    let tokens: Vec<&str> = message.split_whitespace().collect();

    if let Some(pos) = tokens.iter().position(|token| is_entity_trigger(token)) {
        let rest: Vec<&str> = tokens[pos + 1..]
            .iter()
            .copied()
            .skip_while(|token| is_entity_trigger(token))
            .collect();
        let name = rest.join(" ");
        let name = name.trim_end_matches(ENTITY_PUNCTUATION);
        if !name.is_empty() {
            return name.to_string();
        }
    }

    if tokens.len() <= 3 {
        return message.trim().trim_matches(ENTITY_PUNCTUATION).to_string();
    }

    message.to_string()
}

fn parse_number(text: &str) -> Option<f64> {
    text.replace(',', "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Convert a number with a magnitude suffix into millions. Unknown units and
/// unparsable numbers yield `None`.
pub fn normalize_to_millions(number: &str, unit: &str) -> Option<f64> {
    let value = parse_number(number)?;
    let scale = match unit.trim().to_ascii_lowercase().as_str() {
        "m" | "mn" | "million" | "millions" => 1.0,
        "b" | "bn" | "billion" | "billions" => 1_000.0,
        "t" | "tn" | "trillion" | "trillions" => 1_000_000.0,
        _ => return None,
    };
    Some(value * scale)
}

const MONEY: &str = r"\$?([0-9][0-9,.]*)\s*(trillion|billion|million|tn|bn|mn|t|b|m)\b";
const PERCENT: &str = r"([0-9]+(?:\.[0-9]+)?)%";
const COUNT: &str = r"([0-9][0-9,]*)";

/// How a matched candidate becomes a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Canonical {
    /// Group 1 is the number, group 2 the magnitude unit; value in millions.
    Millions,
    /// Group 1 is a percentage.
    Percent,
    /// Group 1 is a whole count, commas allowed.
    Count,
}

impl Canonical {
    fn required_groups(self) -> usize {
        match self {
            Canonical::Millions => 2,
            Canonical::Percent | Canonical::Count => 1,
        }
    }

    fn apply(self, caps: &Captures<'_>) -> Option<MetricValue> {
        match self {
            Canonical::Millions => normalize_to_millions(group(caps, 1)?, group(caps, 2)?)
                .map(|v| MetricValue::Amount(round_to(v, 2))),
            Canonical::Percent => parse_number(group(caps, 1)?).map(MetricValue::Amount),
            Canonical::Count => group(caps, 1)?
                .replace(',', "")
                .parse::<u64>()
                .ok()
                .map(MetricValue::Count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePattern {
    pub pattern: String,
    pub canonical: Canonical,
}

impl CandidatePattern {
    fn new(pattern: impl Into<String>, canonical: Canonical) -> Self {
        Self {
            pattern: pattern.into(),
            canonical,
        }
    }
}

/// One headline metric: candidates are tried in order, first usable hit wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub key: String,
    pub candidates: Vec<CandidatePattern>,
}

/// Every match of `pattern` is an observation of `metric` (groups: number, unit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRule {
    pub metric: String,
    pub pattern: String,
    pub follow_up: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentLexicon {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
}

impl Default for SentimentLexicon {
    fn default() -> Self {
        let positive = [
            "growth",
            "increase",
            "profit",
            "success",
            "innovation",
            "leader",
            "strong",
            "positive",
            "gain",
            "rise",
            "surge",
            "boom",
            "expansion",
            "breakthrough",
            "dominant",
            "outperform",
            "record",
            "milestone",
        ];
        let negative = [
            "decline", "loss", "challenge", "risk", "decrease", "weak", "concern", "fall", "drop",
            "struggle", "threat", "downturn", "layoff", "cut", "reduce", "problem", "issue",
        ];
        Self {
            positive: positive.iter().map(ToString::to_string).collect(),
            negative: negative.iter().map(ToString::to_string).collect(),
        }
    }
}

impl SentimentLexicon {
    /// Keyword-frequency split. `None` when no keyword occurs at all.
    pub fn score(&self, corpus: &str) -> Option<Sentiment> {
        let lower = corpus.to_lowercase();
        let count = |words: &[String]| -> usize {
            words
                .iter()
                .filter(|w| !w.is_empty())
                .map(|w| lower.matches(w.to_lowercase().as_str()).count())
                .sum()
        };
        let positive = count(&self.positive);
        let negative = count(&self.negative);
        let total = positive + negative;
        if total == 0 {
            return None;
        }

        let positive_pct = round_to(positive as f64 / total as f64 * 100.0, 1);
        let negative_pct = round_to(negative as f64 / total as f64 * 100.0, 1);
        let neutral_pct = round_to(100.0 - positive_pct - negative_pct, 1);
        Some(Sentiment {
            positive: positive_pct.max(0.0),
            negative: negative_pct.max(0.0),
            neutral: neutral_pct.max(0.0),
        })
    }
}

/// Data-driven extraction rules. Any field left out of a YAML rules file
/// keeps its built-in value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub metrics: Vec<MetricRule>,
    pub trend_patterns: Vec<String>,
    pub competitor_patterns: Vec<String>,
    pub priorities_section: String,
    pub opportunities_section: String,
    pub conflicts: Vec<ConflictRule>,
    pub conflict_threshold_percent: f64,
    pub sentiment: SentimentLexicon,
    pub news_keywords: Vec<String>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        use Canonical::{Count, Millions, Percent};

        let metrics = vec![
            MetricRule {
                key: metric_keys::REVENUE.to_string(),
                candidates: vec![
                    CandidatePattern::new(format!(r"(?i)revenue[:\s]+{MONEY}"), Millions),
                    CandidatePattern::new(format!(r"(?i)sales[:\s]+{MONEY}"), Millions),
                    CandidatePattern::new(format!(r"(?i)total\s+revenue[:\s]+{MONEY}"), Millions),
                    CandidatePattern::new(
                        r"(?i)\$([0-9][0-9,.]*)\s*(trillion|billion|million|tn|bn|mn|t|b|m)\s+(?:in\s+)?revenue",
                        Millions,
                    ),
                    CandidatePattern::new(format!(r"(?i)revenue\s+of\s+{MONEY}"), Millions),
                ],
            },
            MetricRule {
                key: metric_keys::MARKET_CAP.to_string(),
                candidates: vec![
                    CandidatePattern::new(
                        format!(r"(?i)market\s+cap(?:italization)?(?:\s+of)?[:\s]+{MONEY}"),
                        Millions,
                    ),
                    CandidatePattern::new(format!(r"(?i)valued\s+at[:\s]+{MONEY}"), Millions),
                    CandidatePattern::new(format!(r"(?i)worth[:\s]+{MONEY}"), Millions),
                ],
            },
            MetricRule {
                key: metric_keys::GROWTH_RATE.to_string(),
                candidates: vec![
                    CandidatePattern::new(format!(r"(?i)growth[:\s]+{PERCENT}"), Percent),
                    CandidatePattern::new(format!(r"(?i)grew[:\s]+{PERCENT}"), Percent),
                    CandidatePattern::new(format!(r"(?i)increased[:\s]+{PERCENT}"), Percent),
                    CandidatePattern::new(format!(r"(?i){PERCENT}\s+growth"), Percent),
                ],
            },
            MetricRule {
                key: metric_keys::MARKET_SHARE.to_string(),
                candidates: vec![
                    CandidatePattern::new(format!(r"(?i)market\s+share[:\s]+{PERCENT}"), Percent),
                    CandidatePattern::new(
                        format!(r"(?i){PERCENT}\s+(?:of\s+the\s+)?market\s+share"),
                        Percent,
                    ),
                    CandidatePattern::new(format!(r"(?i)holds[:\s]+{PERCENT}"), Percent),
                ],
            },
            MetricRule {
                key: metric_keys::PROFIT.to_string(),
                candidates: vec![
                    CandidatePattern::new(format!(r"(?i)(?:net\s+)?profit[:\s]+{MONEY}"), Millions),
                    CandidatePattern::new(format!(r"(?i)earnings[:\s]+{MONEY}"), Millions),
                    CandidatePattern::new(format!(r"(?i)net\s+income[:\s]+{MONEY}"), Millions),
                ],
            },
            MetricRule {
                key: metric_keys::EMPLOYEES.to_string(),
                candidates: vec![
                    CandidatePattern::new(format!(r"(?i){COUNT}\s+employees"), Count),
                    CandidatePattern::new(format!(r"(?i)employs[:\s]+{COUNT}"), Count),
                    CandidatePattern::new(format!(r"(?i)workforce[:\s]+{COUNT}"), Count),
                ],
            },
        ];

        Self {
            metrics,
            trend_patterns: vec![
                r"(?i)(20\d{2})[:\s]+\$?([0-9][0-9,.]*)\s*(?:billion|million|b|m)?".to_string(),
                r"(?i)(?:in|for)\s+(20\d{2})[,:\s]+(?:revenue|sales|earnings)[:\s]+\$?([0-9][0-9,.]*)"
                    .to_string(),
                r"(?i)FY\s*(20\d{2})[:\s]+\$?([0-9][0-9,.]*)".to_string(),
            ],
            competitor_patterns: vec![
                r"(?:compet(?:es|ing)\s+(?:with|against))[:\s]+([A-Z][a-zA-Z\s,&]+?)(?:\.|,|\s+and\s+)"
                    .to_string(),
                r"(?:rivals?|competitors?)[:\s]+(?:include|such as|like)[:\s]+([A-Z][a-zA-Z\s,&]+?)(?:\.|;)"
                    .to_string(),
                r"(?:vs|versus|compared to)[:\s]+([A-Z][a-zA-Z]+)".to_string(),
                r"([A-Z][a-zA-Z]+)(?:\s+and\s+[A-Z][a-zA-Z]+)*\s+are\s+(?:main\s+)?competitors"
                    .to_string(),
            ],
            priorities_section: r"(?i)##\s*(?:Strategic\s+)?Priorities\s*\n((?:[-*].+\n?)+)"
                .to_string(),
            opportunities_section: r"(?i)##\s*Opportunities\s*\n((?:[-*].+\n?)+)".to_string(),
            conflicts: vec![
                ConflictRule {
                    metric: "Revenue".to_string(),
                    pattern: format!(r"(?i)(?:revenue|sales)[:\s]+{MONEY}"),
                    follow_up: "Would you like me to investigate further?".to_string(),
                },
                ConflictRule {
                    metric: "Market Cap".to_string(),
                    pattern: format!(r"(?i)market\s+cap[:\s]+{MONEY}"),
                    follow_up: "Would you like me to verify this data?".to_string(),
                },
            ],
            conflict_threshold_percent: CONFLICT_VARIANCE_THRESHOLD,
            sentiment: SentimentLexicon::default(),
            news_keywords: ["launch", "announce", "report", "release", "hit", "reach", "new"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("pattern `{pattern}` needs at least {needed} capture group(s)")]
    MissingGroups { pattern: String, needed: usize },
}

impl ExtractionRules {
    pub fn from_yaml_str(yaml: &str, origin: &str) -> Result<Self, RulesError> {
        serde_yaml::from_str(yaml).map_err(|source| RulesError::Yaml {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }
}

fn compile(pattern: &str, needed_groups: usize) -> Result<Regex, RulesError> {
    let regex = Regex::new(pattern).map_err(|source| RulesError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    // captures_len counts the implicit whole-match group.
    if regex.captures_len() < needed_groups + 1 {
        return Err(RulesError::MissingGroups {
            pattern: pattern.to_string(),
            needed: needed_groups,
        });
    }
    Ok(regex)
}

fn group<'t>(caps: &Captures<'t>, index: usize) -> Option<&'t str> {
    caps.get(index).map(|m| m.as_str())
}

/// Result of running one extraction stage over a corpus. A miss is a
/// `Success` carrying an empty value; `Failure` means candidates matched but
/// every one of them was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Success(T),
    Partial { value: T, rejected: usize },
    Failure { rejected: usize },
}

impl<T> StageOutcome<T> {
    fn conclude(value: T, found: bool, rejected: usize) -> Self {
        match (rejected, found) {
            (0, _) => StageOutcome::Success(value),
            (_, true) => StageOutcome::Partial { value, rejected },
            (_, false) => StageOutcome::Failure { rejected },
        }
    }

    pub fn rejected(&self) -> usize {
        match self {
            StageOutcome::Success(_) => 0,
            StageOutcome::Partial { rejected, .. } | StageOutcome::Failure { rejected } => *rejected,
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Success(_) => StageStatus::Success,
            StageOutcome::Partial { .. } => StageStatus::Partial,
            StageOutcome::Failure { .. } => StageStatus::Failure,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            StageOutcome::Success(value) | StageOutcome::Partial { value, .. } => Some(value),
            StageOutcome::Failure { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub rejected: usize,
}

fn settle<T>(reports: &mut Vec<StageReport>, stage: &str, outcome: StageOutcome<T>) -> Option<T> {
    reports.push(StageReport {
        stage: stage.to_string(),
        status: outcome.status(),
        rejected: outcome.rejected(),
    });
    outcome.into_value()
}

/// A record mined from a corpus plus how each stage went.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub record: ResearchRecord,
    pub stages: Vec<StageReport>,
}

impl Extraction {
    pub fn degraded_stages(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|s| s.status != StageStatus::Success)
    }
}

#[derive(Debug, Clone)]
struct CompiledCandidate {
    regex: Regex,
    canonical: Canonical,
}

#[derive(Debug, Clone)]
struct CompiledMetric {
    key: String,
    candidates: Vec<CompiledCandidate>,
}

#[derive(Debug, Clone)]
struct CompiledConflict {
    metric: String,
    regex: Regex,
    follow_up: String,
}

/// Compiled form of [`ExtractionRules`]; build once, share across turns.
#[derive(Debug, Clone)]
pub struct CorpusExtractor {
    metrics: Vec<CompiledMetric>,
    trends: Vec<Regex>,
    competitors: Vec<Regex>,
    competitor_split: Regex,
    priorities: Regex,
    opportunities: Regex,
    sources: Regex,
    bold_titles: Regex,
    conflicts: Vec<CompiledConflict>,
    conflict_threshold: f64,
    lexicon: SentimentLexicon,
    news_keywords: Vec<String>,
}

impl CorpusExtractor {
    pub fn new(rules: ExtractionRules) -> Result<Self, RulesError> {
        let metrics = rules
            .metrics
            .iter()
            .map(|rule| {
                let candidates = rule
                    .candidates
                    .iter()
                    .map(|c| {
                        Ok::<_, RulesError>(CompiledCandidate {
                            regex: compile(&c.pattern, c.canonical.required_groups())?,
                            canonical: c.canonical,
                        })
                    })
                    .collect::<Result<Vec<_>, RulesError>>()?;
                Ok::<_, RulesError>(CompiledMetric {
                    key: rule.key.clone(),
                    candidates,
                })
            })
            .collect::<Result<Vec<_>, RulesError>>()?;

        let conflicts = rules
            .conflicts
            .iter()
            .map(|rule| {
                Ok::<_, RulesError>(CompiledConflict {
                    metric: rule.metric.clone(),
                    regex: compile(&rule.pattern, 2)?,
                    follow_up: rule.follow_up.clone(),
                })
            })
            .collect::<Result<Vec<_>, RulesError>>()?;

        Ok(Self {
            metrics,
            trends: compile_all(&rules.trend_patterns, 2)?,
            competitors: compile_all(&rules.competitor_patterns, 1)?,
            competitor_split: compile(r",\s*|\s+and\s+", 0)?,
            priorities: compile(&rules.priorities_section, 1)?,
            opportunities: compile(&rules.opportunities_section, 1)?,
            sources: compile(r"Source: (https?://[^\s]+)", 1)?,
            bold_titles: compile(r"\*\*(.*?)\*\*", 1)?,
            conflicts,
            conflict_threshold: rules.conflict_threshold_percent,
            lexicon: rules.sentiment,
            news_keywords: rules
                .news_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        })
    }

    pub fn with_default_rules() -> Result<Self, RulesError> {
        Self::new(ExtractionRules::default())
    }

    /// Mine a corpus into a fresh record. Website snapshot and reply tables
    /// are attached later by the caller.
    pub fn extract(&self, company: &str, corpus: &str, timestamp: DateTime<Utc>) -> Extraction {
        let mut record = ResearchRecord::empty(company, timestamp);
        let mut stages = Vec::new();

        record.confidence_score = confidence_score(corpus);
        record.reliability_score = reliability_score(corpus);
        record.sources = self.extract_sources(corpus);
        record.recent_news = self.extract_recent_news(corpus);

        record.conflicts = settle(&mut stages, "conflicts", self.detect_conflicts(corpus))
            .unwrap_or_default();

        for metric in &self.metrics {
            if let Some(Some(value)) = settle(&mut stages, &metric.key, headline(metric, corpus)) {
                record.metrics.insert(metric.key.clone(), value);
            }
        }

        record.trends = settle(&mut stages, "trends", self.extract_trends(corpus)).unwrap_or_default();
        record.competitors = self.extract_competitors(corpus);
        record.priorities = section_bullets(&self.priorities, corpus);
        record.opportunities = section_bullets(&self.opportunities, corpus);
        record.sentiment = self.lexicon.score(corpus);

        Extraction { record, stages }
    }

    /// First usable hit per headline metric, keyed by metric name.
    pub fn headline_metric(
        &self,
        key: &str,
        corpus: &str,
    ) -> Option<StageOutcome<Option<MetricValue>>> {
        self.metrics
            .iter()
            .find(|m| m.key == key)
            .map(|metric| headline(metric, corpus))
    }

    /// Every year/value pair across all trend patterns; first value per year
    /// wins, output sorted by year.
    pub fn extract_trends(&self, corpus: &str) -> StageOutcome<Vec<TrendPoint>> {
        let mut trends: Vec<TrendPoint> = Vec::new();
        let mut rejected = 0;

        for regex in &self.trends {
            for caps in regex.captures_iter(corpus) {
                let Some(year) = group(&caps, 1) else {
                    rejected += 1;
                    continue;
                };
                if trends.iter().any(|t| t.year == year) {
                    continue;
                }
                match group(&caps, 2).and_then(parse_number) {
                    Some(value) => trends.push(TrendPoint {
                        year: year.to_string(),
                        value,
                    }),
                    None => rejected += 1,
                }
            }
        }

        trends.sort_by(|a, b| a.year.cmp(&b.year));
        let found = !trends.is_empty();
        StageOutcome::conclude(trends, found, rejected)
    }

    pub fn extract_competitors(&self, corpus: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();

        'patterns: for regex in &self.competitors {
            for caps in regex.captures_iter(corpus) {
                let Some(text) = group(&caps, 1) else {
                    continue;
                };
                for part in self.competitor_split.split(text) {
                    let name = part.trim();
                    if looks_like_company_name(name) && !out.iter().any(|c| c == name) {
                        out.push(name.to_string());
                        if out.len() >= MAX_COMPETITORS {
                            break 'patterns;
                        }
                    }
                }
            }
        }

        out
    }

    pub fn priorities(&self, text: &str) -> Vec<String> {
        section_bullets(&self.priorities, text)
    }

    pub fn opportunities(&self, text: &str) -> Vec<String> {
        section_bullets(&self.opportunities, text)
    }

    pub fn extract_sources(&self, corpus: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for caps in self.sources.captures_iter(corpus) {
            if let Some(url) = group(&caps, 1) {
                if !out.iter().any(|u| u == url) {
                    out.push(url.to_string());
                }
            }
            if out.len() >= MAX_SOURCES {
                break;
            }
        }
        out
    }

    pub fn extract_recent_news(&self, corpus: &str) -> Vec<String> {
        self.bold_titles
            .captures_iter(corpus)
            .filter_map(|caps| group(&caps, 1))
            .filter(|title| {
                let lower = title.to_lowercase();
                self.news_keywords.iter().any(|k| lower.contains(k.as_str()))
            })
            .take(MAX_RECENT_NEWS)
            .map(ToString::to_string)
            .collect()
    }

    /// Unlike headline metrics this collects every observation, so a corpus
    /// is scanned twice for the same metric under different policies.
    pub fn detect_conflicts(&self, corpus: &str) -> StageOutcome<Vec<ConflictFinding>> {
        let mut findings = Vec::new();
        let mut rejected = 0;
        let mut observed = false;

        for rule in &self.conflicts {
            let mut values = Vec::new();
            for caps in rule.regex.captures_iter(corpus) {
                match group(&caps, 1).zip(group(&caps, 2)) {
                    Some((number, unit)) => match normalize_to_millions(number, unit) {
                        Some(value) => values.push(value),
                        None => rejected += 1,
                    },
                    None => rejected += 1,
                }
            }
            observed |= !values.is_empty();
            if let Some(finding) =
                conflict_finding(&rule.metric, values, self.conflict_threshold, &rule.follow_up)
            {
                findings.push(finding);
            }
        }

        StageOutcome::conclude(findings, observed, rejected)
    }

    pub fn sentiment(&self, corpus: &str) -> Option<Sentiment> {
        self.lexicon.score(corpus)
    }
}

fn compile_all(patterns: &[String], needed_groups: usize) -> Result<Vec<Regex>, RulesError> {
    patterns
        .iter()
        .map(|p| compile(p, needed_groups))
        .collect()
}

fn headline(metric: &CompiledMetric, corpus: &str) -> StageOutcome<Option<MetricValue>> {
    let mut rejected = 0;
    for candidate in &metric.candidates {
        let Some(caps) = candidate.regex.captures(corpus) else {
            continue;
        };
        match candidate.canonical.apply(&caps) {
            Some(value) => return StageOutcome::conclude(Some(value), true, rejected),
            None => rejected += 1,
        }
    }
    StageOutcome::conclude(None, false, rejected)
}

fn looks_like_company_name(name: &str) -> bool {
    name.chars().count() > 2
        && name.chars().next().is_some_and(char::is_uppercase)
        && name.split_whitespace().count() <= 3
}

fn section_bullets(regex: &Regex, text: &str) -> Vec<String> {
    let Some(block) = regex.captures(text).and_then(|caps| caps.get(1)) else {
        return Vec::new();
    };
    block
        .as_str()
        .lines()
        .map(|line| {
            line.trim()
                .trim_matches(|c: char| matches!(c, '-' | '*' | ' '))
                .trim()
        })
        .filter(|line| !line.is_empty())
        .take(MAX_SECTION_BULLETS)
        .map(ToString::to_string)
        .collect()
}

/// Flag a metric whose observations spread more than `threshold` percent.
pub fn conflict_finding(
    metric: &str,
    values: Vec<f64>,
    threshold: f64,
    follow_up: &str,
) -> Option<ConflictFinding> {
    if values.len() < 2 {
        return None;
    }
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    // The threshold applies to the reported one-decimal figure.
    let variance = if min > 0.0 {
        round_to((max - min) / min * 100.0, 1)
    } else {
        0.0
    };
    if variance <= threshold {
        return None;
    }

    let message = format!(
        "**Data Conflict Detected**: {metric} figures vary by {variance:.1}% across sources ({min}M vs {max}M). {follow_up}"
    );
    Some(ConflictFinding {
        metric: metric.to_string(),
        values,
        variance,
        message,
    })
}

pub const MAX_CONFIDENCE: u32 = 98;
pub const MAX_RELIABILITY: u32 = 95;

/// Volume heuristic, not a calibrated probability.
pub fn confidence_score(corpus: &str) -> u32 {
    let score = 70 + corpus.chars().count() / 100;
    score.min(MAX_CONFIDENCE as usize) as u32
}

/// Financial-symbol density heuristic, not a calibrated probability.
pub fn reliability_score(corpus: &str) -> u32 {
    let score = 80 + 2 * corpus.matches('$').count();
    score.min(MAX_RELIABILITY as usize) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn split_table_row(line: &str) -> Vec<String> {
    let line = line.trim();
    let line = line.strip_prefix('|').unwrap_or(line);
    let line = line.strip_suffix('|').unwrap_or(line);
    line.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn is_separator_row(line: &str) -> bool {
    let line = line.trim();
    line.contains('|')
        && line.contains('-')
        && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' ' | '\t'))
}

fn is_table_row(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.contains('|')
}

/// Find header + separator + rows blocks in arbitrary text.
pub fn find_markdown_tables(text: &str) -> Vec<MarkdownTable> {
    let lines: Vec<&str> = text.lines().collect();
    let mut tables = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let starts_table = is_table_row(lines[i])
            && lines.get(i + 1).is_some_and(|next| is_separator_row(next));
        if !starts_table {
            i += 1;
            continue;
        }

        let headers = split_table_row(lines[i]);
        let mut rows = Vec::new();
        let mut j = i + 2;
        while j < lines.len() && is_table_row(lines[j]) {
            let cells = split_table_row(lines[j]);
            if cells.iter().any(|c| !c.is_empty()) {
                rows.push(cells);
            }
            j += 1;
        }

        if !rows.is_empty() {
            tables.push(MarkdownTable { headers, rows });
        }
        i = j;
    }

    tables
}

/// Parse a table cell as a number, scaling billion/trillion suffixes into
/// millions. Currency symbols, commas and percent signs are ignored.
pub fn parse_chart_cell(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',' | '%'))
        .collect();
    let cleaned = cleaned.trim();

    let end = cleaned
        .char_indices()
        .find(|&(idx, c)| !(c.is_ascii_digit() || c == '.' || (idx == 0 && matches!(c, '-' | '+'))))
        .map(|(idx, _)| idx)
        .unwrap_or(cleaned.len());
    let value = cleaned[..end].parse::<f64>().ok().filter(|v| v.is_finite())?;

    let suffix = cleaned[end..]
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let scale = match suffix.as_str() {
        "b" | "bn" | "billion" => 1_000.0,
        "t" | "tn" | "trillion" => 1_000_000.0,
        _ => 1.0,
    };
    Some(value * scale)
}

/// Column 0 labels the rows; every other column with at least one numeric
/// cell becomes a dataset. Unparsable or missing cells chart as 0.
pub fn table_to_chart(table: &MarkdownTable) -> Option<ChartSeries> {
    if table.headers.len() < 2 || table.rows.is_empty() {
        return None;
    }

    let labels = table
        .rows
        .iter()
        .map(|row| row.first().cloned().unwrap_or_default())
        .collect();

    let mut datasets = Vec::new();
    for (col, header) in table.headers.iter().enumerate().skip(1) {
        let mut parsed_any = false;
        let data = table
            .rows
            .iter()
            .map(|row| match row.get(col).and_then(|cell| parse_chart_cell(cell)) {
                Some(value) => {
                    parsed_any = true;
                    value
                }
                None => 0.0,
            })
            .collect();
        if parsed_any {
            datasets.push(ChartDataset {
                label: header.clone(),
                data,
            });
        }
    }

    if datasets.is_empty() {
        return None;
    }
    Some(ChartSeries { labels, datasets })
}

/// Every chartable markdown table in `text`, in order of appearance.
pub fn extract_chart_tables(text: &str) -> Vec<ChartTable> {
    find_markdown_tables(text)
        .into_iter()
        .filter_map(|table| {
            let chart_data = table_to_chart(&table)?;
            Some(ChartTable {
                headers: table.headers,
                rows: table.rows,
                chart_data,
            })
        })
        .collect()
}
