//! Durable store behind the pipeline plus outbound-HTTP plumbing
//! (retry classification, per-domain rate limiting, egress rotation).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lido_core::{
    CandidateStatus, Company, DuplicateCandidate, JobConfig, JobOutcome, JobStatus, ScrapeJob,
    WebhookSubscription,
};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "lido-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("illegal transition for job {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: &'static str, to: &'static str },
    #[error("candidate {id} is already resolved")]
    AlreadyResolved { id: i64 },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}

/// Parameters for a freshly requested job; the store assigns id and
/// timestamps and starts it in `pending`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source: String,
    pub city: String,
    pub industry: String,
    pub max_pages: u32,
    pub config: JobConfig,
}

/// Candidate bookkeeping committed together with a merge.
#[derive(Debug, Clone)]
pub struct CandidateResolution {
    pub candidate_id: i64,
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Repository seam between the pipeline and the relational store. The
/// Postgres implementation is the single source of truth in production;
/// the in-memory one backs tests and local runs.
#[async_trait]
pub trait Store: Send + Sync {
    // Jobs. Status transitions are enforced here: terminal states are
    // absorbing and progress never decreases.
    async fn create_job(&self, new: NewJob) -> Result<ScrapeJob, StoreError>;
    async fn job(&self, id: i64) -> Result<Option<ScrapeJob>, StoreError>;
    async fn mark_job_started(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn set_job_progress(&self, id: i64, progress: f64) -> Result<(), StoreError>;
    async fn complete_job(
        &self,
        id: i64,
        outcome: JobOutcome,
        at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError>;
    async fn fail_job(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError>;
    /// Pending -> cancelled; anything else is a no-op returning `false`.
    async fn cancel_job(&self, id: i64) -> Result<bool, StoreError>;

    // Companies.
    async fn insert_company(&self, company: Company) -> Result<Company, StoreError>;
    async fn update_company(&self, company: &Company) -> Result<(), StoreError>;
    async fn company(&self, id: i64) -> Result<Option<Company>, StoreError>;
    async fn find_company_by_key(
        &self,
        name: &str,
        city: Option<&str>,
    ) -> Result<Option<Company>, StoreError>;
    /// Active records in id order, for batch scans.
    async fn active_companies_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Company>, StoreError>;
    async fn active_companies_in_city(
        &self,
        city: Option<&str>,
        exclude_id: i64,
    ) -> Result<Vec<Company>, StoreError>;
    async fn count_active_companies(&self) -> Result<u64, StoreError>;

    // Duplicate candidates.
    /// Returns `None` when the unordered pair already has a candidate:
    /// concurrent racers rely on the pair uniqueness constraint, so the
    /// losing insert is a silent no-op.
    async fn insert_candidate(
        &self,
        candidate: DuplicateCandidate,
    ) -> Result<Option<DuplicateCandidate>, StoreError>;
    async fn candidate(&self, id: i64) -> Result<Option<DuplicateCandidate>, StoreError>;
    async fn candidates(
        &self,
        status: Option<CandidateStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError>;
    /// Persist a merge as one transaction: the merged primary, the retired
    /// duplicate and (when review triggered it) the candidate moving to
    /// `confirmed`. Either all three land or none do.
    async fn commit_merge(
        &self,
        primary: &Company,
        duplicate: &Company,
        resolution: Option<&CandidateResolution>,
    ) -> Result<(), StoreError>;
    async fn reject_candidate(
        &self,
        id: i64,
        reviewed_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Hard-delete resolved candidates created before `cutoff`. Terminal
    /// statuses only; pending rows are never purged.
    async fn purge_resolved_candidates(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[CandidateStatus],
    ) -> Result<u64, StoreError>;

    // Webhook subscriptions.
    async fn create_subscription(
        &self,
        sub: WebhookSubscription,
    ) -> Result<WebhookSubscription, StoreError>;
    async fn subscriptions(&self) -> Result<Vec<WebhookSubscription>, StoreError>;
    async fn subscription(&self, id: i64) -> Result<Option<WebhookSubscription>, StoreError>;
    async fn update_subscription(&self, sub: &WebhookSubscription) -> Result<(), StoreError>;
    async fn delete_subscription(&self, id: i64) -> Result<bool, StoreError>;
}

fn clamp_progress(progress: f64) -> f64 {
    progress.clamp(0.0, 100.0)
}

fn stamp_outcome(job: &mut ScrapeJob, outcome: JobOutcome, at: DateTime<Utc>) {
    job.results_count = outcome.results_count;
    job.new_companies = outcome.new_companies;
    job.updated_companies = outcome.updated_companies;
    job.errors_count = outcome.errors_count;
    job.completed_at = Some(at);
    if let Some(started) = job.started_at {
        job.duration_seconds = Some((at - started).num_milliseconds() as f64 / 1000.0);
    }
    job.stats.insert(
        "auto_merged_duplicates".to_string(),
        JsonValue::from(outcome.auto_merged),
    );
    job.stats.insert(
        "duplicate_candidates_created".to_string(),
        JsonValue::from(outcome.candidates_created),
    );
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    jobs: BTreeMap<i64, ScrapeJob>,
    companies: BTreeMap<i64, Company>,
    candidates: BTreeMap<i64, DuplicateCandidate>,
    subscriptions: BTreeMap<i64, WebhookSubscription>,
    next_job_id: i64,
    next_company_id: i64,
    next_candidate_id: i64,
    next_subscription_id: i64,
}

/// Fully in-process [`Store`]. One mutex guards everything, which makes
/// `commit_merge` trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<ScrapeJob, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_job_id += 1;
        let job = ScrapeJob {
            id: inner.next_job_id,
            source: new.source,
            city: new.city,
            industry: new.industry,
            max_pages: new.max_pages,
            status: JobStatus::Pending,
            progress: 0.0,
            results_count: 0,
            new_companies: 0,
            updated_companies: 0,
            errors_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            config: new.config,
            stats: BTreeMap::new(),
        };
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: i64) -> Result<Option<ScrapeJob>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn mark_job_started(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if !job.status.can_transition_to(JobStatus::Running) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status.as_str(),
                to: "running",
            });
        }
        job.status = JobStatus::Running;
        job.started_at = Some(at);
        job.progress = 0.0;
        Ok(())
    }

    async fn set_job_progress(&self, id: i64, progress: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if !job.status.is_terminal() {
            job.progress = job.progress.max(clamp_progress(progress));
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        id: i64,
        outcome: JobOutcome,
        at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if !job.status.can_transition_to(JobStatus::Completed) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status.as_str(),
                to: "completed",
            });
        }
        job.status = JobStatus::Completed;
        job.progress = 100.0;
        job.error_message = None;
        stamp_outcome(job, outcome, at);
        Ok(job.clone())
    }

    async fn fail_job(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if !job.status.can_transition_to(JobStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status.as_str(),
                to: "failed",
            });
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(at);
        if let Some(started) = job.started_at {
            job.duration_seconds = Some((at - started).num_milliseconds() as f64 / 1000.0);
        }
        Ok(job.clone())
    }

    async fn cancel_job(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if job.status.can_transition_to(JobStatus::Cancelled) {
            job.status = JobStatus::Cancelled;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn insert_company(&self, mut company: Company) -> Result<Company, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_company_id += 1;
        company.id = inner.next_company_id;
        inner.companies.insert(company.id, company.clone());
        Ok(company)
    }

    async fn update_company(&self, company: &Company) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.companies.get_mut(&company.id) {
            Some(slot) => {
                *slot = company.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound { entity: "company", id: company.id }),
        }
    }

    async fn company(&self, id: i64) -> Result<Option<Company>, StoreError> {
        Ok(self.inner.lock().await.companies.get(&id).cloned())
    }

    async fn find_company_by_key(
        &self,
        name: &str,
        city: Option<&str>,
    ) -> Result<Option<Company>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .companies
            .values()
            .find(|c| c.is_active && c.name == name && c.city.as_deref() == city)
            .cloned())
    }

    async fn active_companies_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Company>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .companies
            .values()
            .filter(|c| c.is_active)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn active_companies_in_city(
        &self,
        city: Option<&str>,
        exclude_id: i64,
    ) -> Result<Vec<Company>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .companies
            .values()
            .filter(|c| c.is_active && c.id != exclude_id && c.city.as_deref() == city)
            .cloned()
            .collect())
    }

    async fn count_active_companies(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.companies.values().filter(|c| c.is_active).count() as u64)
    }

    async fn insert_candidate(
        &self,
        mut candidate: DuplicateCandidate,
    ) -> Result<Option<DuplicateCandidate>, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = DuplicateCandidate::pair_key(candidate.company_a_id, candidate.company_b_id);
        let exists = inner
            .candidates
            .values()
            .any(|c| DuplicateCandidate::pair_key(c.company_a_id, c.company_b_id) == key);
        if exists {
            return Ok(None);
        }
        inner.next_candidate_id += 1;
        candidate.id = inner.next_candidate_id;
        (candidate.company_a_id, candidate.company_b_id) = key;
        inner.candidates.insert(candidate.id, candidate.clone());
        Ok(Some(candidate))
    }

    async fn candidate(&self, id: i64) -> Result<Option<DuplicateCandidate>, StoreError> {
        Ok(self.inner.lock().await.candidates.get(&id).cloned())
    }

    async fn candidates(
        &self,
        status: Option<CandidateStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .candidates
            .values()
            .filter(|c| status.map(|s| c.status == s).unwrap_or(true))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn commit_merge(
        &self,
        primary: &Company,
        duplicate: &Company,
        resolution: Option<&CandidateResolution>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.companies.contains_key(&primary.id) {
            return Err(StoreError::NotFound { entity: "company", id: primary.id });
        }
        if !inner.companies.contains_key(&duplicate.id) {
            return Err(StoreError::NotFound { entity: "company", id: duplicate.id });
        }
        if let Some(res) = resolution {
            // Validate before touching anything so a bad candidate id rolls
            // the whole merge back.
            let candidate = inner
                .candidates
                .get(&res.candidate_id)
                .ok_or(StoreError::NotFound { entity: "candidate", id: res.candidate_id })?;
            if candidate.status.is_resolved() {
                return Err(StoreError::AlreadyResolved { id: res.candidate_id });
            }
        }
        inner.companies.insert(primary.id, primary.clone());
        inner.companies.insert(duplicate.id, duplicate.clone());
        if let Some(res) = resolution {
            if let Some(candidate) = inner.candidates.get_mut(&res.candidate_id) {
                candidate.status = CandidateStatus::Confirmed;
                candidate.reviewed_by = Some(res.reviewed_by.clone());
                candidate.reviewed_at = Some(res.reviewed_at);
                candidate.notes = res.notes.clone();
            }
        }
        Ok(())
    }

    async fn reject_candidate(
        &self,
        id: i64,
        reviewed_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .candidates
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "candidate", id })?;
        if candidate.status.is_resolved() {
            return Err(StoreError::AlreadyResolved { id });
        }
        candidate.status = CandidateStatus::Rejected;
        candidate.reviewed_by = Some(reviewed_by.to_string());
        candidate.reviewed_at = Some(at);
        candidate.notes = Some(reason.to_string());
        Ok(())
    }

    async fn purge_resolved_candidates(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[CandidateStatus],
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<i64> = inner
            .candidates
            .values()
            .filter(|c| {
                c.status.is_resolved() && statuses.contains(&c.status) && c.created_at < cutoff
            })
            .map(|c| c.id)
            .collect();
        for id in &doomed {
            inner.candidates.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn create_subscription(
        &self,
        mut sub: WebhookSubscription,
    ) -> Result<WebhookSubscription, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_subscription_id += 1;
        sub.id = inner.next_subscription_id;
        inner.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn subscriptions(&self) -> Result<Vec<WebhookSubscription>, StoreError> {
        Ok(self.inner.lock().await.subscriptions.values().cloned().collect())
    }

    async fn subscription(&self, id: i64) -> Result<Option<WebhookSubscription>, StoreError> {
        Ok(self.inner.lock().await.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(&self, sub: &WebhookSubscription) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.subscriptions.get_mut(&sub.id) {
            Some(slot) => {
                *slot = sub.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound { entity: "subscription", id: sub.id }),
        }
    }

    async fn delete_subscription(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.subscriptions.remove(&id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

/// [`Store`] backed by Postgres through sqlx. Merges run inside a single
/// transaction; candidate pair uniqueness is a database constraint.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode_list(row: &PgRow, column: &str) -> Result<Vec<String>, StoreError> {
    let json: Json<Vec<String>> = row
        .try_get(column)
        .map_err(|e| StoreError::Decode(format!("{column}: {e}")))?;
    Ok(json.0)
}

fn job_from_row(row: &PgRow) -> Result<ScrapeJob, StoreError> {
    let status: String = row.try_get("status")?;
    let config: Json<JobConfig> = row.try_get("config")?;
    let stats: Json<BTreeMap<String, JsonValue>> = row.try_get("stats")?;
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        city: row.try_get("city")?,
        industry: row.try_get("industry")?,
        max_pages: row.try_get::<i32, _>("max_pages")?.max(0) as u32,
        status: status
            .parse()
            .map_err(|e| StoreError::Decode(format!("status: {e}")))?,
        progress: row.try_get("progress")?,
        results_count: row.try_get::<i32, _>("results_count")?.max(0) as u32,
        new_companies: row.try_get::<i32, _>("new_companies")?.max(0) as u32,
        updated_companies: row.try_get::<i32, _>("updated_companies")?.max(0) as u32,
        errors_count: row.try_get::<i32, _>("errors_count")?.max(0) as u32,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        error_message: row.try_get("error_message")?,
        config: config.0,
        stats: stats.0,
    })
}

fn company_from_row(row: &PgRow) -> Result<Company, StoreError> {
    Ok(Company {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        city: row.try_get("city")?,
        legal_form: row.try_get("legal_form")?,
        industry: row.try_get("industry")?,
        description: row.try_get("description")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        website: row.try_get("website")?,
        address: row.try_get("address")?,
        postal_code: row.try_get("postal_code")?,
        country: row.try_get("country")?,
        directors: decode_list(row, "directors")?,
        services: decode_list(row, "services")?,
        technologies: decode_list(row, "technologies")?,
        sources: decode_list(row, "sources")?,
        lead_score: row.try_get("lead_score")?,
        is_active: row.try_get("is_active")?,
        is_duplicate: row.try_get("is_duplicate")?,
        duplicate_of: row.try_get("duplicate_of")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<DuplicateCandidate, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(DuplicateCandidate {
        id: row.try_get("id")?,
        company_a_id: row.try_get("company_a_id")?,
        company_b_id: row.try_get("company_b_id")?,
        name_similarity: row.try_get("name_similarity")?,
        address_similarity: row.try_get("address_similarity")?,
        phone_similarity: row.try_get("phone_similarity")?,
        website_similarity: row.try_get("website_similarity")?,
        overall_similarity: row.try_get("overall_similarity")?,
        status: status
            .parse()
            .map_err(|e| StoreError::Decode(format!("status: {e}")))?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<WebhookSubscription, StoreError> {
    Ok(WebhookSubscription {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        secret: row.try_get("secret")?,
        events: decode_list(row, "events")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

const COMPANY_COLUMNS: &str = "id, name, city, legal_form, industry, description, email, phone, \
     website, address, postal_code, country, directors, services, technologies, sources, \
     lead_score, is_active, is_duplicate, duplicate_of, first_seen_at, last_updated_at";

async fn update_company_tx<'e, E>(company: &Company, executor: E) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE companies
           SET name = $2, city = $3, legal_form = $4, industry = $5, description = $6,
               email = $7, phone = $8, website = $9, address = $10, postal_code = $11,
               country = $12, directors = $13, services = $14, technologies = $15,
               sources = $16, lead_score = $17, is_active = $18, is_duplicate = $19,
               duplicate_of = $20, last_updated_at = $21
         WHERE id = $1
        "#,
    )
    .bind(company.id)
    .bind(&company.name)
    .bind(&company.city)
    .bind(&company.legal_form)
    .bind(&company.industry)
    .bind(&company.description)
    .bind(&company.email)
    .bind(&company.phone)
    .bind(&company.website)
    .bind(&company.address)
    .bind(&company.postal_code)
    .bind(&company.country)
    .bind(Json(&company.directors))
    .bind(Json(&company.services))
    .bind(Json(&company.technologies))
    .bind(Json(&company.sources))
    .bind(company.lead_score)
    .bind(company.is_active)
    .bind(company.is_duplicate)
    .bind(company.duplicate_of)
    .bind(company.last_updated_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl Store for PgStore {
    async fn create_job(&self, new: NewJob) -> Result<ScrapeJob, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scrape_jobs (source, city, industry, max_pages, status, created_at, config)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING *
            "#,
        )
        .bind(&new.source)
        .bind(&new.city)
        .bind(&new.industry)
        .bind(new.max_pages as i32)
        .bind(Utc::now())
        .bind(Json(&new.config))
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    async fn job(&self, id: i64) -> Result<Option<ScrapeJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM scrape_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_job_started(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET status = 'running', started_at = $2, progress = 0
             WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.job(id).await? {
            Some(job) => Err(StoreError::InvalidTransition {
                id,
                from: job.status.as_str(),
                to: "running",
            }),
            None => Err(StoreError::NotFound { entity: "job", id }),
        }
    }

    async fn set_job_progress(&self, id: i64, progress: f64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET progress = GREATEST(progress, $2)
             WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(clamp_progress(progress))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        id: i64,
        outcome: JobOutcome,
        at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError> {
        let mut job = self
            .job(id)
            .await?
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if !job.status.can_transition_to(JobStatus::Completed) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status.as_str(),
                to: "completed",
            });
        }
        job.status = JobStatus::Completed;
        job.progress = 100.0;
        job.error_message = None;
        stamp_outcome(&mut job, outcome, at);
        sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET status = 'completed', progress = 100, results_count = $2,
                   new_companies = $3, updated_companies = $4, errors_count = $5,
                   completed_at = $6, duration_seconds = $7, error_message = NULL,
                   stats = $8
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(job.results_count as i32)
        .bind(job.new_companies as i32)
        .bind(job.updated_companies as i32)
        .bind(job.errors_count as i32)
        .bind(job.completed_at)
        .bind(job.duration_seconds)
        .bind(Json(&job.stats))
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn fail_job(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<ScrapeJob, StoreError> {
        let mut job = self
            .job(id)
            .await?
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        if !job.status.can_transition_to(JobStatus::Failed) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status.as_str(),
                to: "failed",
            });
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(at);
        if let Some(started) = job.started_at {
            job.duration_seconds = Some((at - started).num_milliseconds() as f64 / 1000.0);
        }
        sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET status = 'failed', error_message = $2, completed_at = $3,
                   duration_seconds = $4
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(job.completed_at)
        .bind(job.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn cancel_job(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scrape_jobs SET status = 'cancelled' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.job(id).await?.is_none() {
            return Err(StoreError::NotFound { entity: "job", id });
        }
        Ok(false)
    }

    async fn insert_company(&self, company: Company) -> Result<Company, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO companies (name, city, legal_form, industry, description, email, phone,
                                   website, address, postal_code, country, directors, services,
                                   technologies, sources, lead_score, is_active, is_duplicate,
                                   duplicate_of, first_seen_at, last_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21)
            RETURNING {COMPANY_COLUMNS}
            "#
        ))
        .bind(&company.name)
        .bind(&company.city)
        .bind(&company.legal_form)
        .bind(&company.industry)
        .bind(&company.description)
        .bind(&company.email)
        .bind(&company.phone)
        .bind(&company.website)
        .bind(&company.address)
        .bind(&company.postal_code)
        .bind(&company.country)
        .bind(Json(&company.directors))
        .bind(Json(&company.services))
        .bind(Json(&company.technologies))
        .bind(Json(&company.sources))
        .bind(company.lead_score)
        .bind(company.is_active)
        .bind(company.is_duplicate)
        .bind(company.duplicate_of)
        .bind(company.first_seen_at)
        .bind(company.last_updated_at)
        .fetch_one(&self.pool)
        .await?;
        company_from_row(&row)
    }

    async fn update_company(&self, company: &Company) -> Result<(), StoreError> {
        let affected = update_company_tx(company, &self.pool).await?;
        if affected == 0 {
            return Err(StoreError::NotFound { entity: "company", id: company.id });
        }
        Ok(())
    }

    async fn company(&self, id: i64) -> Result<Option<Company>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn find_company_by_key(
        &self,
        name: &str,
        city: Option<&str>,
    ) -> Result<Option<Company>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COMPANY_COLUMNS} FROM companies
             WHERE is_active AND name = $1 AND city IS NOT DISTINCT FROM $2
             ORDER BY id
             LIMIT 1
            "#
        ))
        .bind(name)
        .bind(city)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn active_companies_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Company>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COMPANY_COLUMNS} FROM companies
             WHERE is_active
             ORDER BY id
             LIMIT $1 OFFSET $2
            "#
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn active_companies_in_city(
        &self,
        city: Option<&str>,
        exclude_id: i64,
    ) -> Result<Vec<Company>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COMPANY_COLUMNS} FROM companies
             WHERE is_active AND id <> $1 AND city IS NOT DISTINCT FROM $2
             ORDER BY id
            "#
        ))
        .bind(exclude_id)
        .bind(city)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(company_from_row).collect()
    }

    async fn count_active_companies(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM companies WHERE is_active")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn insert_candidate(
        &self,
        candidate: DuplicateCandidate,
    ) -> Result<Option<DuplicateCandidate>, StoreError> {
        let (a, b) =
            DuplicateCandidate::pair_key(candidate.company_a_id, candidate.company_b_id);
        let row = sqlx::query(
            r#"
            INSERT INTO duplicate_candidates
                (company_a_id, company_b_id, name_similarity, address_similarity,
                 phone_similarity, website_similarity, overall_similarity, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            ON CONFLICT (LEAST(company_a_id, company_b_id),
                         GREATEST(company_a_id, company_b_id)) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(candidate.name_similarity)
        .bind(candidate.address_similarity)
        .bind(candidate.phone_similarity)
        .bind(candidate.website_similarity)
        .bind(candidate.overall_similarity)
        .bind(candidate.created_at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }

    async fn candidate(&self, id: i64) -> Result<Option<DuplicateCandidate>, StoreError> {
        let row = sqlx::query("SELECT * FROM duplicate_candidates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }

    async fn candidates(
        &self,
        status: Option<CandidateStatus>,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM duplicate_candidates
             WHERE $1::text IS NULL OR status = $1
             ORDER BY overall_similarity DESC, id
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn commit_merge(
        &self,
        primary: &Company,
        duplicate: &Company,
        resolution: Option<&CandidateResolution>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if update_company_tx(primary, &mut *tx).await? == 0 {
            return Err(StoreError::NotFound { entity: "company", id: primary.id });
        }
        if update_company_tx(duplicate, &mut *tx).await? == 0 {
            return Err(StoreError::NotFound { entity: "company", id: duplicate.id });
        }
        if let Some(res) = resolution {
            let affected = sqlx::query(
                r#"
                UPDATE duplicate_candidates
                   SET status = 'confirmed', reviewed_by = $2, reviewed_at = $3, notes = $4
                 WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(res.candidate_id)
            .bind(&res.reviewed_by)
            .bind(res.reviewed_at)
            .bind(&res.notes)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if affected == 0 {
                // Dropping the transaction rolls the company updates back.
                return Err(StoreError::AlreadyResolved { id: res.candidate_id });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reject_candidate(
        &self,
        id: i64,
        reviewed_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE duplicate_candidates
               SET status = 'rejected', reviewed_by = $2, reviewed_at = $3, notes = $4
             WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(reviewed_by)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 1 {
            return Ok(());
        }
        match self.candidate(id).await? {
            Some(_) => Err(StoreError::AlreadyResolved { id }),
            None => Err(StoreError::NotFound { entity: "candidate", id }),
        }
    }

    async fn purge_resolved_candidates(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[CandidateStatus],
    ) -> Result<u64, StoreError> {
        let names: Vec<String> = statuses
            .iter()
            .filter(|s| s.is_resolved())
            .map(|s| s.as_str().to_string())
            .collect();
        let result = sqlx::query(
            "DELETE FROM duplicate_candidates WHERE status = ANY($1) AND created_at < $2",
        )
        .bind(&names)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_subscription(
        &self,
        sub: WebhookSubscription,
    ) -> Result<WebhookSubscription, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (url, secret, events, active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&sub.url)
        .bind(&sub.secret)
        .bind(Json(&sub.events))
        .bind(sub.active)
        .bind(sub.created_at)
        .fetch_one(&self.pool)
        .await?;
        subscription_from_row(&row)
    }

    async fn subscriptions(&self) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query("SELECT * FROM webhook_subscriptions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn subscription(&self, id: i64) -> Result<Option<WebhookSubscription>, StoreError> {
        let row = sqlx::query("SELECT * FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn update_subscription(&self, sub: &WebhookSubscription) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
               SET url = $2, secret = $3, events = $4, active = $5
             WHERE id = $1
            "#,
        )
        .bind(sub.id)
        .bind(&sub.url)
        .bind(&sub.secret)
        .bind(Json(&sub.events))
        .bind(sub.active)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound { entity: "subscription", id: sub.id });
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ---------------------------------------------------------------------------
// Outbound HTTP: retry classification, backoff, rate limiting, egress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Per-domain sliding-window rate limiter. `acquire` blocks only the
/// calling worker until a slot inside the window frees up.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, domain: &str) {
        loop {
            let now = Instant::now();
            let mut state = self.state.lock().await;
            let hits = state.entry(domain.to_string()).or_default();
            while hits
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                hits.pop_front();
            }
            if hits.len() < self.max_requests {
                hits.push_back(now);
                return;
            }
            let wait = match hits.front() {
                Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                None => continue,
            };
            drop(state);
            debug!(domain, wait_ms = wait.as_millis() as u64, "rate limit window full");
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}

/// The identity outbound traffic leaves under. Rotation happens on
/// transport failures; the Tor controller behind it is an external
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressIdentity {
    pub label: String,
    pub proxy_url: Option<String>,
}

pub trait EgressRotator: Send + Sync {
    fn current(&self) -> EgressIdentity;
    fn rotate(&self);
}

/// No proxy; requests leave directly.
#[derive(Debug, Default)]
pub struct DirectEgress;

impl EgressRotator for DirectEgress {
    fn current(&self) -> EgressIdentity {
        EgressIdentity {
            label: "direct".to_string(),
            proxy_url: None,
        }
    }

    fn rotate(&self) {}
}

/// Cycles through a fixed proxy list on every rotation.
pub struct RoundRobinEgress {
    proxies: Vec<String>,
    cursor: AtomicUsize,
}

impl RoundRobinEgress {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl EgressRotator for RoundRobinEgress {
    fn current(&self) -> EgressIdentity {
        if self.proxies.is_empty() {
            return DirectEgress.current();
        }
        let idx = self.cursor.load(Ordering::Relaxed) % self.proxies.len();
        EgressIdentity {
            label: format!("proxy-{idx}"),
            proxy_url: Some(self.proxies[idx].clone()),
        }
    }

    fn rotate(&self) {
        self.cursor.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "lido-bot/0.1".to_string(),
            backoff: BackoffPolicy::default(),
            rate_limit_requests: 10,
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

/// All scraper/discovery/enrichment traffic funnels through here: every
/// request first takes a rate-limiter slot for its domain and an egress
/// identity, then runs under the retry/backoff policy.
pub struct HttpGateway {
    limiter: SlidingWindowLimiter,
    rotator: Arc<dyn EgressRotator>,
    backoff: BackoffPolicy,
    timeout: Duration,
    user_agent: String,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig, rotator: Arc<dyn EgressRotator>) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(
                config.rate_limit_requests,
                config.rate_limit_window,
            ),
            rotator,
            backoff: config.backoff,
            timeout: config.timeout,
            user_agent: config.user_agent,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, identity: &EgressIdentity) -> Result<reqwest::Client, FetchError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&identity.label) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone());
        if let Some(proxy_url) = &identity.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        let client = builder.build()?;
        clients.insert(identity.label.clone(), client.clone());
        Ok(client)
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            self.limiter.acquire(&domain).await;
            let identity = self.rotator.current();
            let client = self.client_for(&identity).await?;

            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        self.rotator.rotate();
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        self.rotator.rotate();
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::InvalidUrl(url.to_string())),
        }
    }
}
