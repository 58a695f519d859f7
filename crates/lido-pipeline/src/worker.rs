//! Worker pool and the per-job state machine: scrape, optional
//! discovery fallback, optional enrichment, persistence, webhooks.

use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use lido_core::{Company, JobOutcome, JobStatus};
use lido_sources::{
    collapse_whitespace, DiscoverySearcher, Enricher, ProgressSink, ScrapeQuery, ScrapedListing,
    ScraperRegistry,
};
use lido_storage::{Store, StoreError};
use serde_json::{json, Value as JsonValue};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dedup::Deduplicator;
use crate::queue::{TaskKind, TaskQueue, TaskRecord};
use crate::selector::{select_plan, ScrapePlan};
use crate::webhook::WebhookDispatcher;

/// Scraping owns 0-80, enrichment 80-90; completion sets 100.
const SCRAPE_BAND_END: f64 = 80.0;
const ENRICH_BAND_END: f64 = 90.0;

/// Provenance tag for records synthesized by the discovery fallback.
pub const DISCOVERY_SOURCE_TAG: &str = "search_discovery";

/// Maps a scraper's (page, total) callbacks into a progress band on the
/// job row. Store failures are logged, never propagated into the scrape.
struct BandedProgress {
    store: Arc<dyn Store>,
    job_id: i64,
    lo: f64,
    hi: f64,
}

#[async_trait]
impl ProgressSink for BandedProgress {
    async fn report(&self, current: u32, total: u32) {
        let fraction = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64).min(1.0)
        };
        let progress = self.lo + fraction * (self.hi - self.lo);
        if let Err(err) = self.store.set_job_progress(self.job_id, progress).await {
            warn!(job_id = self.job_id, error = %err, "progress update failed");
        }
    }
}

/// Fill-if-empty application of scraped fields onto a record, plus a
/// union of provenance tags. Populated fields are never overwritten.
fn apply_listing(company: &mut Company, listing: &ScrapedListing) {
    fn fill(target: &mut Option<String>, source: &Option<String>) {
        if target.is_none() {
            *target = source.clone();
        }
    }
    fill(&mut company.email, &listing.email);
    fill(&mut company.phone, &listing.phone);
    fill(&mut company.website, &listing.website);
    fill(&mut company.address, &listing.address);
    fill(&mut company.postal_code, &listing.postal_code);
    fill(&mut company.description, &listing.description);
    for source in &listing.sources {
        if !company.sources.iter().any(|s| s == source) {
            company.sources.push(source.clone());
        }
    }
}

enum PersistOutcome {
    Inserted { candidates_created: u32 },
    Updated,
    MergedAway { candidates_created: u32 },
}

/// Executes one job end to end. Shared by every worker in the pool.
pub struct JobRunner {
    store: Arc<dyn Store>,
    scrapers: ScraperRegistry,
    discovery: Arc<dyn DiscoverySearcher>,
    enricher: Arc<dyn Enricher>,
    dedup: Arc<Deduplicator>,
    webhooks: Arc<WebhookDispatcher>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn Store>,
        scrapers: ScraperRegistry,
        discovery: Arc<dyn DiscoverySearcher>,
        enricher: Arc<dyn Enricher>,
        dedup: Arc<Deduplicator>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            store,
            scrapers,
            discovery,
            enricher,
            dedup,
            webhooks,
        }
    }

    /// Drive one scraping job through its lifecycle. `Ok` carries the
    /// task result payload; `Err` means the job was marked failed.
    pub async fn run_scrape_job(&self, job_id: i64) -> anyhow::Result<JsonValue> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        match job.status {
            JobStatus::Pending => {}
            // Cancelled while queued; nothing ran, nothing to persist.
            JobStatus::Cancelled => return Ok(json!({ "status": "cancelled" })),
            other => bail!("job {job_id} is {}, expected pending", other.as_str()),
        }

        self.store.mark_job_started(job_id, Utc::now()).await?;
        info!(job_id, source = %job.source, city = %job.city, "scraping job started");

        let Some(scraper) = self.scrapers.get(&job.source) else {
            // Configuration error: fatal, no retry.
            return self
                .fail(job_id, &job.source, format!("unknown source: {}", job.source))
                .await;
        };

        let query = ScrapeQuery {
            city: job.city.clone(),
            industry: job.industry.clone(),
            max_pages: job.max_pages,
        };
        let sink = BandedProgress {
            store: self.store.clone(),
            job_id,
            lo: 0.0,
            hi: SCRAPE_BAND_END,
        };
        let mut results = match scraper.scrape(&query, &sink).await {
            Ok(results) => results,
            // The scraper already retried transient errors internally.
            Err(err) => {
                return self
                    .fail(job_id, &job.source, format!("scrape failed: {err}"))
                    .await;
            }
        };
        self.store.set_job_progress(job_id, SCRAPE_BAND_END).await?;

        let max_sites = job.config.smart_scraper_max_sites.max(1) as usize;
        match select_plan(job.config.smart_scraper_mode, results.len()) {
            ScrapePlan::Skip => {}
            ScrapePlan::EnrichExisting => {
                self.enrich_results(job_id, &mut results, max_sites).await;
            }
            ScrapePlan::DiscoverThenEnrich => {
                let fallback = self
                    .discover_candidates(job_id, &job.industry, &job.city, max_sites.max(5))
                    .await;
                if !fallback.is_empty() {
                    results = fallback;
                }
                self.enrich_results(job_id, &mut results, max_sites).await;
            }
        }

        let mut outcome = JobOutcome::default();
        for listing in &results {
            let name = collapse_whitespace(&listing.name);
            if name.is_empty() {
                outcome.errors_count += 1;
                warn!(job_id, "skipping result without a usable name");
                continue;
            }
            match self.persist_listing(&name, listing, &job.industry).await {
                Ok(PersistOutcome::Inserted { candidates_created }) => {
                    outcome.results_count += 1;
                    outcome.new_companies += 1;
                    outcome.candidates_created += candidates_created;
                }
                Ok(PersistOutcome::Updated) => {
                    outcome.results_count += 1;
                    outcome.updated_companies += 1;
                }
                // The fresh insert merged into an established record, so
                // the scraped data updated that record.
                Ok(PersistOutcome::MergedAway { candidates_created }) => {
                    outcome.results_count += 1;
                    outcome.updated_companies += 1;
                    outcome.auto_merged += 1;
                    outcome.candidates_created += candidates_created;
                }
                Err(err) => {
                    outcome.errors_count += 1;
                    warn!(job_id, name = %name, error = %err, "persisting result failed");
                }
            }
        }

        let job = self.store.complete_job(job_id, outcome, Utc::now()).await?;
        info!(
            job_id,
            results = job.results_count,
            new = job.new_companies,
            updated = job.updated_companies,
            "scraping job completed"
        );
        self.webhooks
            .dispatch(
                "job.completed",
                json!({
                    "job_id": job.id,
                    "source": job.source,
                    "city": job.city,
                    "industry": job.industry,
                    "results_count": job.results_count,
                    "new_companies": job.new_companies,
                    "updated_companies": job.updated_companies,
                }),
            )
            .await;

        Ok(json!({
            "status": "completed",
            "results_count": job.results_count,
            "new_companies": job.new_companies,
            "updated_companies": job.updated_companies,
            "errors_count": job.errors_count,
            "auto_merged_duplicates": outcome.auto_merged,
            "duplicate_candidates_created": outcome.candidates_created,
        }))
    }

    async fn fail(
        &self,
        job_id: i64,
        source: &str,
        message: String,
    ) -> anyhow::Result<JsonValue> {
        warn!(job_id, source, error = %message, "scraping job failed");
        self.store.fail_job(job_id, &message, Utc::now()).await?;
        self.webhooks
            .dispatch("job.failed", json!({ "job_id": job_id, "error": message }))
            .await;
        Err(anyhow!(message))
    }

    /// Discovery fallback: synthesize candidate listings from an external
    /// search. Failures degrade to an empty set, they never fail the job.
    async fn discover_candidates(
        &self,
        job_id: i64,
        industry: &str,
        city: &str,
        max_results: usize,
    ) -> Vec<ScrapedListing> {
        let discovered = match self.discovery.discover(industry, city, max_results).await {
            Ok(results) => results,
            Err(err) => {
                warn!(job_id, error = %err, "candidate discovery failed");
                Vec::new()
            }
        };
        let mut listings = Vec::new();
        for (title, url) in discovered {
            let name = collapse_whitespace(&title);
            if name.is_empty() {
                continue;
            }
            let mut listing = ScrapedListing::new(name, DISCOVERY_SOURCE_TAG);
            listing.website = Some(url);
            listing.city = Some(city.to_string());
            listings.push(listing);
        }
        info!(job_id, candidates = listings.len(), "discovery fallback finished");
        listings
    }

    /// Enrichment is bounded by `max_sites` and advances progress inside
    /// the 80-90 band. Individual failures are logged and skipped.
    async fn enrich_results(
        &self,
        job_id: i64,
        results: &mut [ScrapedListing],
        max_sites: usize,
    ) {
        let total = results.len().min(max_sites).max(1);
        for (index, listing) in results.iter_mut().take(max_sites).enumerate() {
            if let Err(err) = self.enricher.enrich(listing).await {
                warn!(job_id, name = %listing.name, error = %err, "enrichment failed");
            }
            let progress = SCRAPE_BAND_END
                + ((index + 1) as f64 / total as f64) * (ENRICH_BAND_END - SCRAPE_BAND_END);
            if let Err(err) = self
                .store
                .set_job_progress(job_id, progress.min(ENRICH_BAND_END))
                .await
            {
                warn!(job_id, error = %err, "progress update failed");
            }
        }
    }

    /// Natural-key resolve: existing records take a fill-if-empty merge
    /// of the scraped fields, new records insert and go through inline
    /// dedup.
    async fn persist_listing(
        &self,
        name: &str,
        listing: &ScrapedListing,
        industry: &str,
    ) -> Result<PersistOutcome, StoreError> {
        let now = Utc::now();
        if let Some(mut existing) = self
            .store
            .find_company_by_key(name, listing.city.as_deref())
            .await?
        {
            apply_listing(&mut existing, listing);
            existing.last_updated_at = now;
            self.store.update_company(&existing).await?;
            return Ok(PersistOutcome::Updated);
        }

        let mut company = Company::new(name, listing.city.clone(), now);
        apply_listing(&mut company, listing);
        if company.industry.is_none() {
            company.industry = Some(industry.to_string());
        }
        let company = self.store.insert_company(company).await?;

        match self.dedup.process_new_company(&company).await {
            Ok(outcome) if outcome.auto_merged => Ok(PersistOutcome::MergedAway {
                candidates_created: outcome.candidates_created,
            }),
            Ok(outcome) => Ok(PersistOutcome::Inserted {
                candidates_created: outcome.candidates_created,
            }),
            // Duplicate handling is recoverable; the insert stands.
            Err(err) => {
                warn!(company_id = company.id, error = %err, "inline dedup failed");
                Ok(PersistOutcome::Inserted { candidates_created: 0 })
            }
        }
    }

    pub async fn run_duplicate_scan(&self) -> anyhow::Result<JsonValue> {
        let summary = self.dedup.scan_all().await?;
        Ok(json!({
            "candidates_created": summary.candidates_created,
            "scanned_companies": summary.scanned_companies,
        }))
    }

    pub async fn run_candidate_cleanup(&self) -> anyhow::Result<JsonValue> {
        let deleted = self.dedup.cleanup_candidates().await?;
        Ok(json!({ "deleted_count": deleted }))
    }
}

/// Fixed pool of workers draining the named queues in priority order.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(queue: Arc<TaskQueue>, runner: Arc<JobRunner>, workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let queue = queue.clone();
                let runner = runner.clone();
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break,
                            task = queue.next_task() => {
                                execute_task(&queue, &runner, task).await;
                            }
                        }
                    }
                    info!(worker_id, "worker stopped");
                })
            })
            .collect();
        Self { shutdown, handles }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn execute_task(queue: &TaskQueue, runner: &JobRunner, task: TaskRecord) {
    let outcome = match task.kind {
        TaskKind::Scrape { job_id } => runner.run_scrape_job(job_id).await,
        TaskKind::DuplicateScan => runner.run_duplicate_scan().await,
        TaskKind::CandidateCleanup => runner.run_candidate_cleanup().await,
    };
    match outcome {
        Ok(result) => {
            if result.get("status").and_then(|s| s.as_str()) == Some("cancelled") {
                queue.mark_cancelled(&task.handle).await;
            } else {
                queue.finish(&task.handle, result).await;
            }
        }
        Err(err) => queue.fail(&task.handle, err.to_string()).await,
    }
}
