//! Axum JSON API: job lifecycle, queue observability, duplicate review
//! and webhook subscription management.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use lido_core::{CandidateStatus, Company, JobConfig, JobStatus, SmartScraperMode, WebhookSubscription};
use lido_pipeline::dedup::MergeError;
use lido_pipeline::{Deduplicator, Priority, TaskKind, TaskQueue, TaskStatus};
use lido_storage::{CandidateResolution, NewJob, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "lido-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<TaskQueue>,
    pub dedup: Arc<Deduplicator>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, queue: Arc<TaskQueue>, dedup: Arc<Deduplicator>) -> Self {
        Self { store, queue, dedup }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(create_job_handler))
        .route("/api/jobs/{id}", get(job_status_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/api/queue/stats", get(queue_stats_handler))
        .route("/api/duplicates/candidates", get(list_candidates_handler))
        .route("/api/duplicates/candidates/{id}", get(candidate_detail_handler))
        .route(
            "/api/duplicates/candidates/{id}/merge",
            post(merge_candidate_handler),
        )
        .route(
            "/api/duplicates/candidates/{id}/reject",
            post(reject_candidate_handler),
        )
        .route("/api/duplicates/scan", post(trigger_scan_handler))
        .route("/api/webhooks", get(list_webhooks_handler).post(create_webhook_handler))
        .route("/api/webhooks/{id}", delete(delete_webhook_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// JSON error body with a proper status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyResolved { .. } | StoreError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<MergeError> for ApiError {
    fn from(err: MergeError) -> Self {
        let status = match &err {
            MergeError::Store(inner) => return ApiError::from_store_ref(inner, err.to_string()),
            MergeError::CompanyNotFound(_) => StatusCode::NOT_FOUND,
            MergeError::SelfMerge => StatusCode::BAD_REQUEST,
            MergeError::PrimaryInactive(_) | MergeError::AlreadyMerged(_) => StatusCode::CONFLICT,
        };
        Self::new(status, err.to_string())
    }
}

impl ApiError {
    fn from_store_ref(err: &StoreError, message: String) -> Self {
        let status = match err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyResolved { .. } | StoreError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, message)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

fn default_max_pages() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    source_name: String,
    city: String,
    industry: String,
    #[serde(default = "default_max_pages")]
    max_pages: u32,
    #[serde(default = "default_true")]
    use_tor: bool,
    #[serde(default = "default_true")]
    use_ai: bool,
    #[serde(default)]
    enable_smart_scraper: bool,
    #[serde(default)]
    smart_scraper_mode: Option<SmartScraperMode>,
    #[serde(default)]
    smart_scraper_max_sites: Option<u32>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    job: lido_core::ScrapeJob,
    task_id: String,
}

async fn create_job_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.source_name.trim().is_empty() {
        return Err(ApiError::bad_request("source_name must not be empty"));
    }
    if request.max_pages == 0 {
        return Err(ApiError::bad_request("max_pages must be at least 1"));
    }
    let priority: Priority = request
        .priority
        .as_deref()
        .unwrap_or("normal")
        .parse()
        .map_err(|_| ApiError::bad_request("priority must be high, normal or low"))?;

    // A null mode with the flag on falls back to plain enrichment.
    let smart_scraper_mode = if request.enable_smart_scraper {
        request.smart_scraper_mode.unwrap_or(SmartScraperMode::Enrichment)
    } else {
        SmartScraperMode::Disabled
    };

    let config = JobConfig {
        use_tor: request.use_tor,
        use_ai: request.use_ai,
        smart_scraper_mode,
        smart_scraper_max_sites: request.smart_scraper_max_sites.unwrap_or(10).max(1),
    };
    let job = state
        .store
        .create_job(NewJob {
            source: request.source_name,
            city: request.city,
            industry: request.industry,
            max_pages: request.max_pages,
            config,
        })
        .await?;
    let task_id = state
        .queue
        .enqueue_scrape(job.id, priority)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let job = state.store.job(job.id).await?.unwrap_or(job);
    Ok((StatusCode::CREATED, Json(CreateJobResponse { job, task_id })))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job: lido_core::ScrapeJob,
    queue: Option<TaskStatus>,
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .store
        .job(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;
    let queue = match state.queue.task_for_job(id).await {
        Some(handle) => Some(state.queue.status(&handle).await),
        None => None,
    };
    Ok(Json(JobStatusResponse { job, queue }))
}

async fn cancel_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .store
        .job(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))?;
    match job.status {
        JobStatus::Pending => {
            if let Some(handle) = state.queue.task_for_job(id).await {
                state.queue.cancel(&handle).await;
            }
            let cancelled = state.store.cancel_job(id).await?;
            Ok(Json(json!({ "cancelled": cancelled, "status": "cancelled" })))
        }
        // A running job always runs to completion.
        JobStatus::Running => Ok(Json(json!({
            "cancelled": false,
            "status": "running",
            "message": "job already started; it will run to completion",
        }))),
        // Re-cancelling is an idempotent no-op.
        JobStatus::Cancelled => Ok(Json(json!({ "cancelled": false, "status": "cancelled" }))),
        JobStatus::Completed | JobStatus::Failed => Err(ApiError::conflict(format!(
            "job {id} is {}, terminal jobs cannot be cancelled",
            job.status.as_str()
        ))),
    }
}

async fn queue_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.queue.stats().await)
}

// ---------------------------------------------------------------------------
// Duplicate review
// ---------------------------------------------------------------------------

fn default_limit() -> u64 {
    50
}

#[derive(Debug, Deserialize)]
struct CandidateListQuery {
    /// `pending` (default), `confirmed`, `rejected` or `all`.
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    offset: u64,
    #[serde(default = "default_limit")]
    limit: u64,
}

#[derive(Debug, Serialize)]
struct CompanyBrief {
    id: i64,
    name: String,
    city: Option<String>,
    address: Option<String>,
    phone: Option<String>,
    website: Option<String>,
    is_active: bool,
}

impl From<Company> for CompanyBrief {
    fn from(company: Company) -> Self {
        Self {
            id: company.id,
            name: company.name,
            city: company.city,
            address: company.address,
            phone: company.phone,
            website: company.website,
            is_active: company.is_active,
        }
    }
}

async fn list_candidates_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandidateListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => Some(CandidateStatus::Pending),
        Some("all") => None,
        Some(other) => Some(
            other
                .parse()
                .map_err(|_| ApiError::bad_request(format!("unknown status: {other}")))?,
        ),
    };
    let limit = query.limit.clamp(1, 100);
    let items = state.store.candidates(status, query.offset, limit).await?;
    Ok(Json(json!({
        "items": items,
        "offset": query.offset,
        "limit": limit,
    })))
}

async fn candidate_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let candidate = state
        .store
        .candidate(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("candidate {id} not found")))?;
    let company_a = state.store.company(candidate.company_a_id).await?.map(CompanyBrief::from);
    let company_b = state.store.company(candidate.company_b_id).await?.map(CompanyBrief::from);
    Ok(Json(json!({
        "candidate": candidate,
        "company_a": company_a,
        "company_b": company_b,
    })))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    primary_id: i64,
    duplicate_id: i64,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    reviewed_by: Option<String>,
}

async fn merge_candidate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let candidate = state
        .store
        .candidate(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("candidate {id} not found")))?;
    if candidate.status.is_resolved() {
        return Err(ApiError::conflict(format!("candidate {id} is already resolved")));
    }
    let pair = lido_core::DuplicateCandidate::pair_key(request.primary_id, request.duplicate_id);
    if pair
        != lido_core::DuplicateCandidate::pair_key(candidate.company_a_id, candidate.company_b_id)
    {
        return Err(ApiError::bad_request(
            "primary_id/duplicate_id do not match this candidate",
        ));
    }

    let resolution = CandidateResolution {
        candidate_id: id,
        reviewed_by: request.reviewed_by.unwrap_or_else(|| "api".to_string()),
        reviewed_at: Utc::now(),
        notes: request.reason,
    };
    let primary = state
        .dedup
        .merge(request.primary_id, request.duplicate_id, Some(resolution), "manual")
        .await?;
    Ok(Json(json!({
        "id": primary.id,
        "name": primary.name,
        "message": "companies merged",
    })))
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
    #[serde(default)]
    reviewed_by: Option<String>,
}

async fn reject_candidate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .reject_candidate(
            id,
            request.reviewed_by.as_deref().unwrap_or("api"),
            &request.reason,
            Utc::now(),
        )
        .await?;
    Ok(Json(json!({ "id": id, "status": "rejected" })))
}

async fn trigger_scan_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let task_id = state.queue.enqueue_maintenance(TaskKind::DuplicateScan).await;
    (
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "queued" })),
    )
}

// ---------------------------------------------------------------------------
// Webhook subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateWebhookRequest {
    url: String,
    #[serde(default)]
    secret: Option<String>,
    events: Vec<String>,
    #[serde(default = "default_true")]
    active: bool,
}

async fn list_webhooks_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WebhookSubscription>>, ApiError> {
    Ok(Json(state.store.subscriptions().await?))
}

async fn create_webhook_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.url.trim().is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }
    if request.events.is_empty() {
        return Err(ApiError::bad_request("events must not be empty"));
    }
    let sub = state
        .store
        .create_subscription(WebhookSubscription {
            id: 0,
            url: request.url,
            secret: request.secret,
            events: request.events,
            active: request.active,
            created_at: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

async fn delete_webhook_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_subscription(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("subscription {id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use lido_core::JobOutcome;
    use lido_pipeline::{DedupConfig, WebhookDispatcher};
    use lido_storage::MemoryStore;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(TaskQueue::new(store.clone()));
        let webhooks = Arc::new(
            WebhookDispatcher::new(store.clone(), Duration::from_secs(1), 1).expect("dispatcher"),
        );
        let dedup = Arc::new(Deduplicator::new(
            store.clone(),
            DedupConfig::default(),
            webhooks,
        ));
        let state = AppState::new(store.clone(), queue, dedup);
        (store, state)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn create_job_returns_job_and_task_handle() {
        let (_store, state) = test_state();
        let app = app(state);
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/jobs",
                json!({
                    "source_name": "11880",
                    "city": "Stuttgart",
                    "industry": "IT-Service",
                    "max_pages": 1,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["job"]["status"], "pending");
        assert_eq!(body["job"]["source"], "11880");
        assert!(body["task_id"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn job_status_exposes_nested_queue_state() {
        let (_store, state) = test_state();
        let app = app(state);
        let created = body_json(
            app.clone()
                .oneshot(json_request(
                    "POST",
                    "/api/jobs",
                    json!({
                        "source_name": "11880",
                        "city": "Stuttgart",
                        "industry": "IT-Service",
                    }),
                ))
                .await
                .unwrap(),
        )
        .await;
        let job_id = created["job"]["id"].as_i64().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["queue"]["queue_state"], "queued");
    }

    #[tokio::test]
    async fn unknown_job_id_is_a_404() {
        let (_store, state) = test_state();
        let app = app(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/jobs/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_is_allowed_pending_and_rejected_when_terminal() {
        let (store, state) = test_state();
        let app = app(state);
        let created = body_json(
            app.clone()
                .oneshot(json_request(
                    "POST",
                    "/api/jobs",
                    json!({
                        "source_name": "11880",
                        "city": "Stuttgart",
                        "industry": "IT-Service",
                    }),
                ))
                .await
                .unwrap(),
        )
        .await;
        let job_id = created["job"]["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(json_request("POST", &format!("/api/jobs/{job_id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], true);

        // Second cancel: idempotent no-op.
        let response = app
            .clone()
            .oneshot(json_request("POST", &format!("/api/jobs/{job_id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], false);

        // A completed job rejects cancellation with no state change.
        let done = store
            .create_job(NewJob {
                source: "11880".into(),
                city: "Stuttgart".into(),
                industry: "IT-Service".into(),
                max_pages: 1,
                config: JobConfig::default(),
            })
            .await
            .unwrap();
        store.mark_job_started(done.id, Utc::now()).await.unwrap();
        store
            .complete_job(done.id, JobOutcome::default(), Utc::now())
            .await
            .unwrap();

        let response = app
            .oneshot(json_request("POST", &format!("/api/jobs/{}/cancel", done.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let job = store.job(done.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn queue_stats_lists_all_queues() {
        let (_store, state) = test_state();
        let app = app(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/queue/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        for queue in ["scraping", "scraping-high", "scraping-low", "maintenance"] {
            assert!(body.get(queue).is_some(), "missing {queue}");
        }
    }

    async fn seed_candidate(store: &Arc<MemoryStore>) -> (i64, i64, i64) {
        let mut a = Company::new("Delta Software", Some("Hamburg".into()), Utc::now());
        a.email = Some("mail@delta.example".into());
        let a = store.insert_company(a).await.unwrap();
        let mut b = Company::new("Delta Software GmbH", Some("Hamburg".into()), Utc::now());
        b.phone = Some("040 555".into());
        let b = store.insert_company(b).await.unwrap();
        let candidate = store
            .insert_candidate(lido_core::DuplicateCandidate {
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
        (candidate.id, a.id, b.id)
    }

    #[tokio::test]
    async fn review_merge_resolves_candidate_and_retires_duplicate() {
        let (store, state) = test_state();
        let app = app(state);
        let (candidate_id, primary_id, duplicate_id) = seed_candidate(&store).await;

        // Pair mismatch is a client error.
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/duplicates/candidates/{candidate_id}/merge"),
                json!({ "primary_id": primary_id, "duplicate_id": 999 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/duplicates/candidates/{candidate_id}/merge"),
                json!({
                    "primary_id": primary_id,
                    "duplicate_id": duplicate_id,
                    "reason": "same entity",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let candidate = store.candidate(candidate_id).await.unwrap().unwrap();
        assert_eq!(candidate.status, CandidateStatus::Confirmed);
        let duplicate = store.company(duplicate_id).await.unwrap().unwrap();
        assert!(!duplicate.is_active);
        assert_eq!(duplicate.duplicate_of, Some(primary_id));
        // Fill-if-empty pulled the phone across.
        let primary = store.company(primary_id).await.unwrap().unwrap();
        assert_eq!(primary.phone.as_deref(), Some("040 555"));

        // Resolving again conflicts.
        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/duplicates/candidates/{candidate_id}/reject"),
                json!({ "reason": "changed my mind" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn candidate_listing_defaults_to_pending() {
        let (store, state) = test_state();
        let app = app(state);
        let (candidate_id, _, _) = seed_candidate(&store).await;
        store
            .reject_candidate(candidate_id, "reviewer", "nope", Utc::now())
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/duplicates/candidates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 0);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/duplicates/candidates?status=rejected")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_scan_trigger_returns_task_handle() {
        let (_store, state) = test_state();
        let app = app(state);
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/duplicates/scan", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/queue/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["maintenance"]["queued"], 1);
        assert!(!task_id.is_empty());
    }

    #[tokio::test]
    async fn webhook_subscription_crud() {
        let (_store, state) = test_state();
        let app = app(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/webhooks",
                json!({
                    "url": "https://example.invalid/hook",
                    "secret": "s3cret",
                    "events": ["job.completed", "duplicate.merged"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/webhooks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/webhooks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/webhooks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
