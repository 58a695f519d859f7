//! Core domain model for lido: scraped companies, scraping jobs,
//! duplicate candidates and webhook subscriptions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lido-core";

/// Lifecycle of a scraping job. Transitions are one-directional:
/// `Pending -> Running -> {Completed, Failed}` and `Pending -> Cancelled`.
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal state-machine edge.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => matches!(next, Self::Completed | Self::Failed),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Smart-scraper operating mode. Closed set: callers match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmartScraperMode {
    #[default]
    Disabled,
    Enrichment,
    Fallback,
}

impl SmartScraperMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enrichment => "enrichment",
            Self::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for SmartScraperMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "enrichment" => Ok(Self::Enrichment),
            "fallback" => Ok(Self::Fallback),
            other => Err(DomainError::UnknownMode(other.to_string())),
        }
    }
}

/// Per-job feature flags, persisted alongside the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub use_tor: bool,
    pub use_ai: bool,
    pub smart_scraper_mode: SmartScraperMode,
    pub smart_scraper_max_sites: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            use_tor: true,
            use_ai: true,
            smart_scraper_mode: SmartScraperMode::Disabled,
            smart_scraper_max_sites: 10,
        }
    }
}

/// A scraping run: target parameters, lifecycle state and result counters.
///
/// `stats` is an open key-value map; readers must tolerate unknown or
/// missing keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: i64,
    pub source: String,
    pub city: String,
    pub industry: String,
    pub max_pages: u32,
    pub status: JobStatus,
    /// Percentage in [0, 100]; monotonic non-decreasing; 100 iff completed.
    pub progress: f64,
    pub results_count: u32,
    pub new_companies: u32,
    pub updated_companies: u32,
    pub errors_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub config: JobConfig,
    pub stats: BTreeMap<String, JsonValue>,
}

/// Final counters a worker hands back when closing out a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub results_count: u32,
    pub new_companies: u32,
    pub updated_companies: u32,
    pub errors_count: u32,
    pub auto_merged: u32,
    pub candidates_created: u32,
}

/// A scraped business record. `(name, city)` is the natural key used to
/// resolve new-vs-update on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub city: Option<String>,
    pub legal_form: Option<String>,
    pub industry: Option<String>,
    pub description: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub directors: Vec<String>,
    pub services: Vec<String>,
    pub technologies: Vec<String>,
    /// Provenance tags, e.g. `"11880"`, `"search_discovery"`.
    pub sources: Vec<String>,
    /// 0-100 quality score; merges keep the max of the pair.
    pub lead_score: f64,
    pub is_active: bool,
    pub is_duplicate: bool,
    /// Weak back-reference to the surviving record after a merge.
    pub duplicate_of: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Company {
    /// A fresh active record carrying only the natural key; callers fill
    /// the rest before insert.
    pub fn new(name: impl Into<String>, city: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            city,
            legal_form: None,
            industry: None,
            description: None,
            email: None,
            phone: None,
            website: None,
            address: None,
            postal_code: None,
            country: None,
            directors: Vec::new(),
            services: Vec::new(),
            technologies: Vec::new(),
            sources: Vec::new(),
            lead_score: 0.0,
            is_active: true,
            is_duplicate: false,
            duplicate_of: None,
            first_seen_at: now,
            last_updated_at: now,
        }
    }
}

/// Review state of a duplicate candidate. Resolved states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl CandidateStatus {
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for CandidateStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A pair of records suspected to be the same real-world entity, waiting
/// for review. At most one candidate may exist per unordered pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub id: i64,
    pub company_a_id: i64,
    pub company_b_id: i64,
    pub name_similarity: f64,
    pub address_similarity: f64,
    pub phone_similarity: f64,
    pub website_similarity: f64,
    pub overall_similarity: f64,
    pub status: CandidateStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DuplicateCandidate {
    /// Canonical unordered-pair key; `(a, b)` and `(b, a)` collapse to the
    /// same value.
    pub fn pair_key(a: i64, b: i64) -> (i64, i64) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

/// External consumer of pipeline events. The core only reads these to
/// decide delivery targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: i64,
    pub url: String,
    pub secret: Option<String>,
    /// Event names the subscriber wants, e.g. `"job.completed"`.
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn wants(&self, event: &str) -> bool {
        self.active && self.events.iter().any(|e| e == event)
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown status: {0}")]
    UnknownStatus(String),
    #[error("unknown smart-scraper mode: {0}")]
    UnknownMode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn running_job_cannot_be_cancelled() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn pair_key_is_order_insensitive() {
        assert_eq!(DuplicateCandidate::pair_key(7, 3), (3, 7));
        assert_eq!(DuplicateCandidate::pair_key(3, 7), (3, 7));
        assert_eq!(DuplicateCandidate::pair_key(5, 5), (5, 5));
    }

    #[test]
    fn subscription_filter_checks_active_and_event() {
        let sub = WebhookSubscription {
            id: 1,
            url: "https://example.invalid/hook".into(),
            secret: None,
            events: vec!["job.completed".into()],
            active: true,
            created_at: Utc::now(),
        };
        assert!(sub.wants("job.completed"));
        assert!(!sub.wants("job.failed"));

        let inactive = WebhookSubscription { active: false, ..sub };
        assert!(!inactive.wants("job.completed"));
    }

    #[test]
    fn mode_round_trips_through_serde() {
        let json = serde_json::to_string(&SmartScraperMode::Fallback).unwrap();
        assert_eq!(json, "\"fallback\"");
        let back: SmartScraperMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SmartScraperMode::Fallback);
    }
}
