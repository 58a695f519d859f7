//! Deduplication engine: similarity scoring, decision policy, inline and
//! batch modes, and the field-preserving merge.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use lido_core::{CandidateStatus, Company, DuplicateCandidate};
use lido_storage::{CandidateResolution, Store, StoreError};
use serde::Serialize;
use serde_json::json;
use strsim::jaro_winkler;
use tracing::{info, warn};

use crate::webhook::WebhookDispatcher;

/// Thresholds and scan tuning. All similarity values are fractions in
/// [0, 1]; there is no percent scale anywhere in the engine.
#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub name_threshold: f64,
    pub address_threshold: f64,
    pub phone_threshold: f64,
    pub website_threshold: f64,
    /// Overall score at which a pair becomes a reviewable candidate.
    pub candidate_threshold: f64,
    /// Overall score at which a pair merges without review.
    pub auto_merge_threshold: f64,
    pub scan_batch_size: u64,
    /// Top-N matches considered per record.
    pub max_matches_per_record: usize,
    pub candidate_retention_days: i64,
    /// Whether cleanup also deletes confirmed candidates.
    pub cleanup_delete_confirmed: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            name_threshold: 0.85,
            address_threshold: 0.80,
            phone_threshold: 0.90,
            website_threshold: 0.95,
            candidate_threshold: 0.80,
            auto_merge_threshold: 0.95,
            scan_batch_size: 100,
            max_matches_per_record: 5,
            candidate_retention_days: 90,
            cleanup_delete_confirmed: false,
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parse_f64 = |key: &str, fallback: f64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        Self {
            name_threshold: parse_f64("LIDO_DEDUP_NAME_THRESHOLD", defaults.name_threshold),
            address_threshold: parse_f64(
                "LIDO_DEDUP_ADDRESS_THRESHOLD",
                defaults.address_threshold,
            ),
            phone_threshold: parse_f64("LIDO_DEDUP_PHONE_THRESHOLD", defaults.phone_threshold),
            website_threshold: parse_f64(
                "LIDO_DEDUP_WEBSITE_THRESHOLD",
                defaults.website_threshold,
            ),
            candidate_threshold: parse_f64(
                "LIDO_DEDUP_CANDIDATE_THRESHOLD",
                defaults.candidate_threshold,
            ),
            auto_merge_threshold: parse_f64(
                "LIDO_DEDUP_AUTO_MERGE_THRESHOLD",
                defaults.auto_merge_threshold,
            ),
            scan_batch_size: std::env::var("LIDO_DEDUP_SCAN_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scan_batch_size),
            max_matches_per_record: std::env::var("LIDO_DEDUP_MAX_MATCHES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_matches_per_record),
            candidate_retention_days: std::env::var("LIDO_DEDUP_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.candidate_retention_days),
            cleanup_delete_confirmed: std::env::var("LIDO_DEDUP_CLEANUP_DELETE_CONFIRMED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.cleanup_delete_confirmed),
        }
    }
}

/// Per-field scores plus the weighted overall. Missing fields score 0.0,
/// never NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarityScores {
    pub name: f64,
    pub address: f64,
    pub phone: f64,
    pub website: f64,
    pub overall: f64,
}

const NAME_WEIGHT: f64 = 0.4;
const ADDRESS_WEIGHT: f64 = 0.2;
const PHONE_WEIGHT: f64 = 0.2;
const WEBSITE_WEIGHT: f64 = 0.2;

/// Lowercase, strip non-alphanumerics, collapse runs of whitespace.
fn normalize_match_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token-sorted form so word order does not matter.
fn token_sort(input: &str) -> String {
    let mut tokens: Vec<&str> = input.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn text_similarity(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    let na = token_sort(&normalize_match_text(a));
    let nb = token_sort(&normalize_match_text(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    jaro_winkler(&na, &nb)
}

/// Digits only, with the German country prefix folded into the national
/// `0` form so `+49 711 ...` and `0711 ...` compare equal.
fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix("0049") {
        return format!("0{rest}");
    }
    if phone.trim_start().starts_with("+49") {
        if let Some(rest) = digits.strip_prefix("49") {
            return format!("0{rest}");
        }
    }
    digits
}

fn phone_similarity(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    let da = normalize_phone(a);
    let db = normalize_phone(b);
    if da.is_empty() || db.is_empty() {
        return 0.0;
    }
    if da == db {
        1.0
    } else {
        0.0
    }
}

/// Scheme, `www.` prefix, path and trailing slash are irrelevant; only
/// the remaining domain is compared.
fn normalize_domain(website: &str) -> String {
    let url = website.trim().to_lowercase();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(&url);
    let url = url.strip_prefix("www.").unwrap_or(url);
    url.split('/').next().unwrap_or("").to_string()
}

fn website_similarity(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    let da = normalize_domain(a);
    let db = normalize_domain(b);
    if da.is_empty() || db.is_empty() {
        return 0.0;
    }
    if da == db {
        1.0
    } else {
        0.0
    }
}

/// Score one unordered pair of records.
pub fn score_pair(a: &Company, b: &Company) -> SimilarityScores {
    let name = text_similarity(Some(&a.name), Some(&b.name));
    let address = text_similarity(a.address.as_deref(), b.address.as_deref());
    let phone = phone_similarity(a.phone.as_deref(), b.phone.as_deref());
    let website = website_similarity(a.website.as_deref(), b.website.as_deref());
    let overall = NAME_WEIGHT * name
        + ADDRESS_WEIGHT * address
        + PHONE_WEIGHT * phone
        + WEBSITE_WEIGHT * website;
    SimilarityScores {
        name,
        address,
        phone,
        website,
        overall,
    }
}

/// Outcome of the decision policy for one scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// Confident enough to merge without review.
    AutoMerge,
    /// Worth a human look: record a candidate.
    Review,
    /// Not similar enough to act on.
    Ignore,
}

impl DedupConfig {
    pub fn decide(&self, scores: &SimilarityScores) -> DedupDecision {
        if scores.overall >= self.auto_merge_threshold {
            return DedupDecision::AutoMerge;
        }
        if scores.overall >= self.candidate_threshold
            && scores.name >= self.name_threshold
            && (scores.address >= self.address_threshold
                || scores.phone >= self.phone_threshold
                || scores.website >= self.website_threshold
                || scores.overall >= self.candidate_threshold)
        {
            return DedupDecision::Review;
        }
        DedupDecision::Ignore
    }
}

/// Field-preserving merge: the duplicate only contributes where the
/// primary is empty, lists concatenate, the quality score keeps the max.
pub fn merge_company_fields(primary: &mut Company, duplicate: &Company) {
    fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
        if target.is_none() {
            *target = source.clone();
        }
    }
    fn extend_unique(target: &mut Vec<String>, source: &[String]) {
        for item in source {
            if !target.iter().any(|t| t.eq_ignore_ascii_case(item)) {
                target.push(item.clone());
            }
        }
    }

    fill(&mut primary.email, &duplicate.email);
    fill(&mut primary.phone, &duplicate.phone);
    fill(&mut primary.website, &duplicate.website);
    fill(&mut primary.address, &duplicate.address);
    fill(&mut primary.postal_code, &duplicate.postal_code);
    fill(&mut primary.country, &duplicate.country);
    fill(&mut primary.legal_form, &duplicate.legal_form);
    fill(&mut primary.industry, &duplicate.industry);
    fill(&mut primary.description, &duplicate.description);

    extend_unique(&mut primary.directors, &duplicate.directors);
    extend_unique(&mut primary.services, &duplicate.services);
    extend_unique(&mut primary.technologies, &duplicate.technologies);
    extend_unique(&mut primary.sources, &duplicate.sources);

    primary.lead_score = primary.lead_score.max(duplicate.lead_score);
}

/// What inline dedup did with one freshly inserted record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineDedupOutcome {
    /// The new record was merged away into an existing one.
    pub auto_merged: bool,
    pub candidates_created: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScanSummary {
    pub scanned_companies: u64,
    pub candidates_created: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("company {0} not found")]
    CompanyNotFound(i64),
    #[error("cannot merge a company with itself")]
    SelfMerge,
    #[error("primary company {0} is not active")]
    PrimaryInactive(i64),
    #[error("company {0} is already merged away")]
    AlreadyMerged(i64),
}

/// Inline + batch deduplication over the store.
pub struct Deduplicator {
    store: Arc<dyn Store>,
    config: DedupConfig,
    webhooks: Arc<WebhookDispatcher>,
}

impl Deduplicator {
    pub fn new(
        store: Arc<dyn Store>,
        config: DedupConfig,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            store,
            config,
            webhooks,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Top-N active same-city records scoring at or above the candidate
    /// threshold, best first.
    pub async fn find_matches(
        &self,
        company: &Company,
    ) -> Result<Vec<(Company, SimilarityScores)>, StoreError> {
        let others = self
            .store
            .active_companies_in_city(company.city.as_deref(), company.id)
            .await?;
        let mut matches: Vec<(Company, SimilarityScores)> = others
            .into_iter()
            .map(|other| {
                let scores = score_pair(company, &other);
                (other, scores)
            })
            .filter(|(_, scores)| scores.overall >= self.config.candidate_threshold)
            .collect();
        matches.sort_by(|a, b| {
            b.1.overall
                .partial_cmp(&a.1.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(self.config.max_matches_per_record);
        Ok(matches)
    }

    /// Inline mode: run right after `company` was inserted. Auto-merges
    /// into the best high-confidence match, otherwise records reviewable
    /// candidates.
    pub async fn process_new_company(
        &self,
        company: &Company,
    ) -> Result<InlineDedupOutcome, StoreError> {
        let mut outcome = InlineDedupOutcome::default();
        for (other, scores) in self.find_matches(company).await? {
            match self.config.decide(&scores) {
                DedupDecision::AutoMerge => {
                    // The established record wins; the fresh insert retires.
                    match self.merge(other.id, company.id, None, "auto").await {
                        Ok(_) => {
                            outcome.auto_merged = true;
                            return Ok(outcome);
                        }
                        Err(err) => {
                            warn!(
                                company_id = company.id,
                                duplicate_of = other.id,
                                error = %err,
                                "inline auto-merge failed"
                            );
                        }
                    }
                }
                DedupDecision::Review => {
                    if self.record_candidate(company, &other, &scores).await? {
                        outcome.candidates_created += 1;
                    }
                }
                DedupDecision::Ignore => {}
            }
        }
        Ok(outcome)
    }

    /// Idempotent candidate creation; returns whether a new row landed.
    async fn record_candidate(
        &self,
        a: &Company,
        b: &Company,
        scores: &SimilarityScores,
    ) -> Result<bool, StoreError> {
        let candidate = DuplicateCandidate {
            id: 0,
            company_a_id: a.id,
            company_b_id: b.id,
            name_similarity: scores.name,
            address_similarity: scores.address,
            phone_similarity: scores.phone,
            website_similarity: scores.website,
            overall_similarity: scores.overall,
            status: CandidateStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            notes: None,
            created_at: Utc::now(),
        };
        let Some(created) = self.store.insert_candidate(candidate).await? else {
            return Ok(false);
        };
        info!(
            candidate_id = created.id,
            company_a = a.id,
            company_b = b.id,
            overall = scores.overall,
            "duplicate candidate created"
        );
        self.webhooks
            .dispatch(
                "duplicate.detected",
                json!({
                    "company_a_id": a.id,
                    "company_b_id": b.id,
                    "overall": scores.overall,
                }),
            )
            .await;
        Ok(true)
    }

    /// Merge `duplicate_id` into `primary_id`. The field merge, the
    /// duplicate's retirement and the optional candidate resolution are
    /// one store transaction; `mode` is `"auto"` or `"manual"`.
    pub async fn merge(
        &self,
        primary_id: i64,
        duplicate_id: i64,
        resolution: Option<CandidateResolution>,
        mode: &str,
    ) -> Result<Company, MergeError> {
        if primary_id == duplicate_id {
            return Err(MergeError::SelfMerge);
        }
        let mut primary = self
            .store
            .company(primary_id)
            .await?
            .ok_or(MergeError::CompanyNotFound(primary_id))?;
        let mut duplicate = self
            .store
            .company(duplicate_id)
            .await?
            .ok_or(MergeError::CompanyNotFound(duplicate_id))?;
        if !primary.is_active {
            return Err(MergeError::PrimaryInactive(primary_id));
        }
        if duplicate.is_duplicate {
            return Err(MergeError::AlreadyMerged(duplicate_id));
        }

        let now = Utc::now();
        merge_company_fields(&mut primary, &duplicate);
        primary.last_updated_at = now;
        duplicate.is_active = false;
        duplicate.is_duplicate = true;
        duplicate.duplicate_of = Some(primary.id);
        duplicate.last_updated_at = now;

        self.store
            .commit_merge(&primary, &duplicate, resolution.as_ref())
            .await?;

        info!(primary_id, duplicate_id, mode, "companies merged");
        self.webhooks
            .dispatch(
                "duplicate.merged",
                json!({
                    "primary_id": primary_id,
                    "duplicate_id": duplicate_id,
                    "mode": mode,
                }),
            )
            .await;
        Ok(primary)
    }

    /// Batch mode: page the active set in id order and record reviewable
    /// candidates. Processed ids are skipped on the partner side so each
    /// unordered pair is visited once; re-running over unchanged data
    /// creates nothing new.
    pub async fn scan_all(&self) -> Result<ScanSummary, StoreError> {
        let total = self.store.count_active_companies().await?;
        let mut summary = ScanSummary {
            scanned_companies: total,
            candidates_created: 0,
        };
        let mut processed: HashSet<i64> = HashSet::new();
        let mut offset = 0u64;

        info!(total, batch_size = self.config.scan_batch_size, "duplicate scan started");
        loop {
            let batch = self
                .store
                .active_companies_page(offset, self.config.scan_batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            for company in &batch {
                let matches = self.find_matches(company).await?;
                for (other, scores) in matches {
                    if processed.contains(&other.id) {
                        continue;
                    }
                    if self.config.decide(&scores) != DedupDecision::Ignore
                        && self.record_candidate(company, &other, &scores).await?
                    {
                        summary.candidates_created += 1;
                    }
                }
                processed.insert(company.id);
            }
            offset += self.config.scan_batch_size;
        }

        info!(
            scanned = summary.scanned_companies,
            created = summary.candidates_created,
            "duplicate scan finished"
        );
        self.webhooks
            .dispatch(
                "duplicate.scan_completed",
                json!({
                    "candidates_created": summary.candidates_created,
                    "scanned_companies": summary.scanned_companies,
                }),
            )
            .await;
        Ok(summary)
    }

    /// Hard-delete resolved candidates past the retention window.
    pub async fn cleanup_candidates(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.candidate_retention_days);
        let mut statuses = vec![CandidateStatus::Rejected];
        if self.config.cleanup_delete_confirmed {
            statuses.push(CandidateStatus::Confirmed);
        }
        let deleted = self
            .store
            .purge_resolved_candidates(cutoff, &statuses)
            .await?;
        info!(deleted, %cutoff, "candidate cleanup finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lido_storage::MemoryStore;

    fn company(name: &str, city: &str) -> Company {
        Company::new(name, Some(city.to_string()), Utc::now())
    }

    fn dedup_over(store: Arc<MemoryStore>) -> Deduplicator {
        let webhooks = Arc::new(
            WebhookDispatcher::new(store.clone(), std::time::Duration::from_secs(1), 1)
                .expect("dispatcher"),
        );
        Deduplicator::new(store, DedupConfig::default(), webhooks)
    }

    #[test]
    fn same_digits_phone_scores_full_match() {
        let mut a = company("Musterfirma", "Stuttgart");
        let mut b = company("Andere Firma", "Stuttgart");
        a.phone = Some("+49 711 8829810".into());
        b.phone = Some("0711 8829810".into());
        assert_eq!(score_pair(&a, &b).phone, 1.0);

        b.phone = Some("0711/88 298-10".into());
        assert_eq!(score_pair(&a, &b).phone, 1.0);

        b.phone = Some("0711 999".into());
        assert_eq!(score_pair(&a, &b).phone, 0.0);
    }

    #[test]
    fn name_similarity_ignores_word_order() {
        let a = company("Schmidt & Müller GmbH", "Berlin");
        let b = company("Müller & Schmidt GmbH", "Berlin");
        let scores = score_pair(&a, &b);
        assert_eq!(scores.name, 1.0);
    }

    #[test]
    fn website_match_strips_scheme_and_www() {
        let mut a = company("Foo", "Berlin");
        let mut b = company("Bar", "Berlin");
        a.website = Some("https://www.foo-it.example/kontakt".into());
        b.website = Some("http://foo-it.example".into());
        assert_eq!(score_pair(&a, &b).website, 1.0);

        b.website = Some("https://other.example".into());
        assert_eq!(score_pair(&a, &b).website, 0.0);
    }

    #[test]
    fn missing_fields_score_zero_not_nan() {
        let a = company("Foo", "Berlin");
        let b = company("Foo", "Berlin");
        let scores = score_pair(&a, &b);
        assert_eq!(scores.address, 0.0);
        assert_eq!(scores.phone, 0.0);
        assert_eq!(scores.website, 0.0);
        assert_eq!(scores.overall, 0.4);
    }

    #[test]
    fn decision_policy_bands() {
        let config = DedupConfig::default();
        let auto = SimilarityScores {
            name: 1.0,
            address: 1.0,
            phone: 1.0,
            website: 1.0,
            overall: 1.0,
        };
        assert_eq!(config.decide(&auto), DedupDecision::AutoMerge);

        let review = SimilarityScores {
            name: 1.0,
            address: 1.0,
            phone: 1.0,
            website: 0.0,
            overall: 0.80,
        };
        assert_eq!(config.decide(&review), DedupDecision::Review);

        // High component scores cannot rescue a weak name.
        let weak_name = SimilarityScores {
            name: 0.60,
            address: 1.0,
            phone: 1.0,
            website: 1.0,
            overall: 0.84,
        };
        assert_eq!(config.decide(&weak_name), DedupDecision::Ignore);

        // A strong name alone is not enough below the overall bound.
        let name_only = SimilarityScores {
            name: 1.0,
            address: 0.0,
            phone: 1.0,
            website: 0.0,
            overall: 0.60,
        };
        assert_eq!(config.decide(&name_only), DedupDecision::Ignore);
    }

    #[test]
    fn merge_never_overwrites_populated_primary_fields() {
        let mut primary = company("Alpha GmbH", "Stuttgart");
        primary.email = Some("kept@alpha.example".into());
        primary.lead_score = 40.0;
        primary.services = vec!["Hosting".into()];

        let mut duplicate = company("Alpha GmbH", "Stuttgart");
        duplicate.email = Some("lost@alpha.example".into());
        duplicate.phone = Some("0711 123".into());
        duplicate.lead_score = 65.0;
        duplicate.services = vec!["hosting".into(), "Beratung".into()];
        duplicate.sources = vec!["gelbe_seiten".into()];

        merge_company_fields(&mut primary, &duplicate);
        assert_eq!(primary.email.as_deref(), Some("kept@alpha.example"));
        assert_eq!(primary.phone.as_deref(), Some("0711 123"));
        assert_eq!(primary.lead_score, 65.0);
        // Case-insensitive list union keeps order, drops the dupe.
        assert_eq!(primary.services, vec!["Hosting".to_string(), "Beratung".to_string()]);
        assert_eq!(primary.sources, vec!["gelbe_seiten".to_string()]);
    }

    #[tokio::test]
    async fn inline_dedup_auto_merges_identical_records() {
        let store = Arc::new(MemoryStore::new());
        let dedup = dedup_over(store.clone());

        let mut existing = company("Musterfirma IT-Service GmbH", "Stuttgart");
        existing.phone = Some("+49 711 8829810".into());
        existing.website = Some("https://www.musterfirma.example".into());
        existing.address = Some("Königstraße 1".into());
        let existing = store.insert_company(existing).await.unwrap();

        // All four components match: name/address identical, phone same
        // digits, website same domain. Overall lands at 1.0.
        let mut incoming = company("Musterfirma IT-Service GmbH", "Stuttgart");
        incoming.phone = Some("0711/88 29 810".into());
        incoming.website = Some("http://musterfirma.example".into());
        incoming.address = Some("Königstraße 1".into());
        incoming.email = Some("info@musterfirma.example".into());
        let incoming = store.insert_company(incoming).await.unwrap();

        let outcome = dedup.process_new_company(&incoming).await.unwrap();
        assert!(outcome.auto_merged);
        assert_eq!(outcome.candidates_created, 0);

        // Exactly one record of the pair stays active, the loser carries
        // the back-reference, and its email was pulled over.
        let survivor = store.company(existing.id).await.unwrap().unwrap();
        let retired = store.company(incoming.id).await.unwrap().unwrap();
        assert!(survivor.is_active);
        assert_eq!(survivor.email.as_deref(), Some("info@musterfirma.example"));
        assert!(!retired.is_active);
        assert!(retired.is_duplicate);
        assert_eq!(retired.duplicate_of, Some(existing.id));
    }

    #[tokio::test]
    async fn inline_dedup_records_reviewable_candidate_once() {
        let store = Arc::new(MemoryStore::new());
        let dedup = dedup_over(store.clone());

        // Name, address and phone line up; websites disagree, which keeps
        // the overall at 0.8: inside the review band, below auto-merge.
        let mut existing = company("Musterfirma IT-Service", "Stuttgart");
        existing.phone = Some("0711 8829810".into());
        existing.address = Some("Königstraße 1".into());
        existing.website = Some("https://musterfirma-alt.example".into());
        let existing = store.insert_company(existing).await.unwrap();

        let mut incoming = company("Musterfirma IT-Service", "Stuttgart");
        incoming.phone = Some("+49 711 8829810".into());
        incoming.address = Some("Königstraße 1".into());
        incoming.website = Some("https://musterfirma.example".into());
        let incoming = store.insert_company(incoming).await.unwrap();

        let scores = score_pair(&existing, &incoming);
        assert!(scores.overall < DedupConfig::default().auto_merge_threshold);
        assert!(scores.overall >= DedupConfig::default().candidate_threshold);

        let first = dedup.process_new_company(&incoming).await.unwrap();
        assert!(!first.auto_merged);
        assert_eq!(first.candidates_created, 1);

        // Same pair again: idempotent.
        let second = dedup.process_new_company(&incoming).await.unwrap();
        assert_eq!(second.candidates_created, 0);
        assert_eq!(store.candidates(None, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_scan_is_idempotent_and_symmetric() {
        let store = Arc::new(MemoryStore::new());
        let dedup = dedup_over(store.clone());

        // a/b agree on name, address and phone digits but not website:
        // review band. c is unrelated.
        let mut a = company("Beispiel Consulting", "Berlin");
        a.phone = Some("030 1234567".into());
        a.address = Some("Hauptstraße 5".into());
        a.website = Some("https://beispiel-consulting.example".into());
        let mut b = company("Beispiel Consulting", "Berlin");
        b.phone = Some("030/123 45 67".into());
        b.address = Some("Hauptstraße 5".into());
        let mut c = company("Völlig Andere Firma", "Berlin");
        c.phone = Some("030 999".into());
        store.insert_company(a).await.unwrap();
        store.insert_company(b).await.unwrap();
        store.insert_company(c).await.unwrap();

        let first = dedup.scan_all().await.unwrap();
        assert_eq!(first.scanned_companies, 3);
        assert_eq!(first.candidates_created, 1);

        let second = dedup.scan_all().await.unwrap();
        assert_eq!(second.candidates_created, 0);
        assert_eq!(store.candidates(None, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_merge_resolves_candidate_and_rejects_self_merge() {
        let store = Arc::new(MemoryStore::new());
        let dedup = dedup_over(store.clone());

        let mut a = company("Delta Software", "Hamburg");
        a.email = Some("mail@delta.example".into());
        let a = store.insert_company(a).await.unwrap();
        let mut b = company("Delta Software GmbH", "Hamburg");
        b.phone = Some("040 555".into());
        let b = store.insert_company(b).await.unwrap();

        let candidate = store
            .insert_candidate(DuplicateCandidate {
                id: 0,
                company_a_id: a.id,
                company_b_id: b.id,
                name_similarity: 0.93,
                address_similarity: 0.0,
                phone_similarity: 0.0,
                website_similarity: 0.0,
                overall_similarity: 0.81,
                status: CandidateStatus::Pending,
                reviewed_by: None,
                reviewed_at: None,
                notes: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            dedup.merge(a.id, a.id, None, "manual").await,
            Err(MergeError::SelfMerge)
        ));

        let merged = dedup
            .merge(
                a.id,
                b.id,
                Some(CandidateResolution {
                    candidate_id: candidate.id,
                    reviewed_by: "reviewer".into(),
                    reviewed_at: Utc::now(),
                    notes: Some("same entity".into()),
                }),
                "manual",
            )
            .await
            .unwrap();
        assert_eq!(merged.phone.as_deref(), Some("040 555"));
        assert_eq!(
            store.candidate(candidate.id).await.unwrap().unwrap().status,
            CandidateStatus::Confirmed
        );

        // A retired duplicate cannot be merged again.
        assert!(matches!(
            dedup.merge(a.id, b.id, None, "manual").await,
            Err(MergeError::AlreadyMerged(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_honors_retention_and_status_policy() {
        let store = Arc::new(MemoryStore::new());
        let dedup = dedup_over(store.clone());

        let a = store.insert_company(company("Eins", "Essen")).await.unwrap();
        let b = store.insert_company(company("Einz", "Essen")).await.unwrap();
        let stale = store
            .insert_candidate(DuplicateCandidate {
                id: 0,
                company_a_id: a.id,
                company_b_id: b.id,
                name_similarity: 0.9,
                address_similarity: 0.0,
                phone_similarity: 0.0,
                website_similarity: 0.0,
                overall_similarity: 0.8,
                status: CandidateStatus::Pending,
                reviewed_by: None,
                reviewed_at: None,
                notes: None,
                created_at: Utc::now() - ChronoDuration::days(200),
            })
            .await
            .unwrap()
            .unwrap();
        store
            .reject_candidate(stale.id, "reviewer", "different entities", Utc::now())
            .await
            .unwrap();

        let deleted = dedup.cleanup_candidates().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.candidate(stale.id).await.unwrap().is_none());
    }
}
