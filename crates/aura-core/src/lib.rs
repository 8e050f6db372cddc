//! Core domain model for Aura research turns.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "aura-core";

/// Metric keys written by the headline extractors. The unit is part of the key.
pub mod metric_keys {
    pub const REVENUE: &str = "Revenue (M)";
    pub const MARKET_CAP: &str = "Market Cap (M)";
    pub const GROWTH_RATE: &str = "Growth Rate (%)";
    pub const MARKET_SHARE: &str = "Market Share (%)";
    pub const PROFIT: &str = "Profit (M)";
    pub const EMPLOYEES: &str = "Employees";
}

/// A headline figure. Headcounts stay integral on the wire; money and
/// percentages are decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u64),
    Amount(f64),
}

impl MetricValue {
    pub fn as_f64(self) -> f64 {
        match self {
            MetricValue::Count(count) => count as f64,
            MetricValue::Amount(amount) => amount,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Count(count) => write!(f, "{count}"),
            MetricValue::Amount(amount) => write!(f, "{amount}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub year: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
}

/// Disagreement between repeated mentions of one metric, values in millions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictFinding {
    pub metric: String,
    pub values: Vec<f64>,
    pub variance: f64,
    pub message: String,
}

/// What was scraped from the entity's own website.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteSnapshot {
    pub url: String,
    pub title: String,
    pub description: String,
    /// Body excerpt, at most [`WebsiteSnapshot::MAX_KEY_POINTS_CHARS`] characters.
    pub key_points: String,
}

impl WebsiteSnapshot {
    pub const MAX_KEY_POINTS_CHARS: usize = 1000;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDataset {
    pub label: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
}

/// A markdown table lifted from a reply, plus its chart-ready form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub chart_data: ChartSeries,
}

/// Structured data mined from one research turn for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRecord {
    pub company: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricValue>,
    pub trends: Vec<TrendPoint>,
    pub competitors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    pub priorities: Vec<String>,
    pub opportunities: Vec<String>,
    pub confidence_score: u32,
    pub reliability_score: u32,
    pub sources: Vec<String>,
    pub recent_news: Vec<String>,
    pub conflicts: Vec<ConflictFinding>,
    pub scraped_info: Option<WebsiteSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<ChartTable>>,
}

impl ResearchRecord {
    pub fn empty(company: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            company: company.into(),
            timestamp,
            metrics: BTreeMap::new(),
            trends: Vec::new(),
            competitors: Vec::new(),
            sentiment: None,
            priorities: Vec::new(),
            opportunities: Vec::new(),
            confidence_score: 0,
            reliability_score: 0,
            sources: Vec::new(),
            recent_news: Vec::new(),
            conflicts: Vec::new(),
            scraped_info: None,
            tables: None,
        }
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metric_value(key).map(MetricValue::as_f64)
    }

    pub fn metric_value(&self, key: &str) -> Option<MetricValue> {
        self.metrics.get(key).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// What a processed turn hands back to its caller. `data` is `None` when no
/// research ran this turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub text: String,
    pub data: Option<ResearchRecord>,
}

impl TurnResult {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
        }
    }
}
