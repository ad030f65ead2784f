// Bazaar Ledger - API Server
// REST API over the ledger engines with Axum

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use bazaar_ledger::{
    AccountStore, Actor, AllocationEngine, CollectionTracker, LedgerError, LedgerStore,
    ReconciliationReporter, Role, RollupScope, RuleTable, SubmissionPool, VerificationToken,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    accounts: AccountStore,
    allocation: AllocationEngine,
    tracker: CollectionTracker,
    pool: SubmissionPool,
    reporter: ReconciliationReporter,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    fn fail(err: &LedgerError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(err.code()),
        }
    }
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
        LedgerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::AlreadyClaimed { .. }
        | LedgerError::AlreadySubmitted { .. }
        | LedgerError::StorageConflict(_) => StatusCode::CONFLICT,
        LedgerError::LimitExceeded { .. }
        | LedgerError::InsufficientBalance { .. }
        | LedgerError::AmountExceedsPending { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Storage(_) | LedgerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &LedgerError) -> Response {
    (status_for(err), Json(ApiResponse::<()>::fail(err))).into_response()
}

/// Caller identity as sent by the gateway that authenticated the request.
/// Turned into an Actor so capabilities get derived exactly once.
#[derive(Deserialize)]
struct ActorPayload {
    user_id: String,
    roles: Vec<Role>,
    #[serde(default)]
    department_scope: Vec<String>,
}

impl ActorPayload {
    fn into_actor(self) -> Actor {
        Actor::new(self.user_id, self.roles, self.department_scope)
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct CreateAccountRequest {
    user_id: String,
    role: Role,
    department: String,
    #[serde(default)]
    opening_points: i64,
}

#[derive(Deserialize)]
struct AllocateRequest {
    actor: ActorPayload,
    from_account_id: String,
    to_account_id: String,
    amount: i64,
    note: Option<String>,
    /// Reference of a completed second-factor check, when one was required.
    verification_reference: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
struct RecallRequest {
    actor: ActorPayload,
    from_account_id: String,
    to_account_id: String,
    amount: i64,
    note: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
struct SaleRequest {
    actor: ActorPayload,
    seller_account_id: String,
    amount: i64,
    note: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
struct CollectRequest {
    actor: ActorPayload,
    collector_account_id: String,
    seller_account_id: String,
    amount: i64,
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
struct SubmitRequest {
    actor: ActorPayload,
    submitter_account_id: String,
    amount: i64,
    collection_ids: Vec<String>,
    idempotency_key: Option<String>,
}

#[derive(Deserialize)]
struct ClaimRequest {
    actor: ActorPayload,
}

#[derive(Deserialize)]
struct ConfirmRequest {
    actor: ActorPayload,
    note: Option<String>,
}

#[derive(Deserialize)]
struct ResolutionRequest {
    actor: ActorPayload,
    reason: String,
}

#[derive(Deserialize)]
struct RequeueRequest {
    actor: ActorPayload,
    note: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/accounts - Register a participant account
async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> Response {
    match state.accounts.create_account(
        &req.user_id,
        req.role,
        &req.department,
        req.opening_points,
    ) {
        Ok(account) => (StatusCode::CREATED, Json(ApiResponse::ok(account))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/accounts - All accounts
async fn list_accounts(State(state): State<AppState>) -> Response {
    match state.accounts.list() {
        Ok(accounts) => (StatusCode::OK, Json(ApiResponse::ok(accounts))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/accounts/:id - One account with live balances
async fn get_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.accounts.get(&id) {
        Ok(account) => (StatusCode::OK, Json(ApiResponse::ok(account))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/accounts/:id/history - Ledger entries touching the account
async fn account_history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.accounts.history(&id) {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::ok(entries))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/departments/:dept/accounts - Accounts of one department
async fn department_accounts(
    State(state): State<AppState>,
    Path(dept): Path<String>,
) -> Response {
    match state.accounts.list_department(&dept) {
        Ok(accounts) => (StatusCode::OK, Json(ApiResponse::ok(accounts))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/allocations - Push points down the chain
async fn allocate(State(state): State<AppState>, Json(req): Json<AllocateRequest>) -> Response {
    let actor = req.actor.into_actor();
    let verification = req.verification_reference.map(VerificationToken::verified);

    match state.allocation.allocate(
        &actor,
        &req.from_account_id,
        &req.to_account_id,
        req.amount,
        req.note,
        verification.as_ref(),
        req.idempotency_key.as_deref(),
    ) {
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::ok(outcome))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/recalls - Pull unspent points back up
async fn recall(State(state): State<AppState>, Json(req): Json<RecallRequest>) -> Response {
    let actor = req.actor.into_actor();

    match state.allocation.recall(
        &actor,
        &req.from_account_id,
        &req.to_account_id,
        req.amount,
        req.note,
        req.idempotency_key.as_deref(),
    ) {
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::ok(outcome))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/sales - A seller booking a sale
async fn record_sale(State(state): State<AppState>, Json(req): Json<SaleRequest>) -> Response {
    let actor = req.actor.into_actor();

    match state.accounts.record_sale(
        &actor,
        &req.seller_account_id,
        req.amount,
        req.note,
        req.idempotency_key.as_deref(),
    ) {
        Ok(account) => (StatusCode::OK, Json(ApiResponse::ok(account))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/collections - Cash pickup from a seller
async fn record_collection(
    State(state): State<AppState>,
    Json(req): Json<CollectRequest>,
) -> Response {
    let actor = req.actor.into_actor();

    match state.tracker.record_collection(
        &actor,
        &req.collector_account_id,
        &req.seller_account_id,
        req.amount,
        req.idempotency_key.as_deref(),
    ) {
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::ok(outcome))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/collections/unsubmitted/:account_id - Pickups not yet parceled
async fn unsubmitted_collections(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    match state.tracker.unsubmitted_for(&account_id) {
        Ok(collections) => (StatusCode::OK, Json(ApiResponse::ok(collections))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/submissions - Parcel cash into the finance pool
async fn submit_cash(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Response {
    let actor = req.actor.into_actor();

    match state.pool.submit(
        &actor,
        &req.submitter_account_id,
        req.amount,
        &req.collection_ids,
        req.idempotency_key.as_deref(),
    ) {
        Ok(submission) => (StatusCode::CREATED, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/submissions/pool - Open parcels, oldest first
async fn open_pool(State(state): State<AppState>) -> Response {
    match state.pool.open_pool() {
        Ok(submissions) => (StatusCode::OK, Json(ApiResponse::ok(submissions))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/submissions/:id - One parcel with its backing collections
async fn get_submission(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.pool.get(&id) {
        Ok(submission) => (StatusCode::OK, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/submissions/:id/claim - Take a parcel for counting
async fn claim_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> Response {
    let actor = req.actor.into_actor();

    match state.pool.claim(&actor, &id) {
        Ok(submission) => (StatusCode::OK, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/submissions/:id/confirm - Settle a counted parcel
async fn confirm_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Response {
    let actor = req.actor.into_actor();

    match state.pool.confirm(&actor, &id, req.note) {
        Ok(submission) => (StatusCode::OK, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/submissions/:id/dispute - Freeze a miscounted parcel
async fn dispute_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolutionRequest>,
) -> Response {
    let actor = req.actor.into_actor();

    match state.pool.dispute(&actor, &id, &req.reason) {
        Ok(submission) => (StatusCode::OK, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/submissions/:id/reject - Send a parcel back to its collector
async fn reject_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolutionRequest>,
) -> Response {
    let actor = req.actor.into_actor();

    match state.pool.reject(&actor, &id, &req.reason) {
        Ok(submission) => (StatusCode::OK, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/submissions/:id/requeue - Put a disputed parcel back in the pool
async fn requeue_submission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RequeueRequest>,
) -> Response {
    let actor = req.actor.into_actor();

    match state.pool.requeue(&actor, &id, &req.note) {
        Ok(submission) => (StatusCode::OK, Json(ApiResponse::ok(submission))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/reports/rollup - Event-wide position
async fn event_rollup(State(state): State<AppState>) -> Response {
    match state.reporter.event_rollup() {
        Ok(rollup) => (StatusCode::OK, Json(ApiResponse::ok(rollup))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/reports/rollup/department/:dept - One department's position
async fn department_rollup(
    State(state): State<AppState>,
    Path(dept): Path<String>,
) -> Response {
    match state.reporter.rollup(RollupScope::Department(dept)) {
        Ok(rollup) => (StatusCode::OK, Json(ApiResponse::ok(rollup))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/reports/departments - Every department's position
async fn all_department_rollups(State(state): State<AppState>) -> Response {
    match state.reporter.department_rollups() {
        Ok(rollups) => (StatusCode::OK, Json(ApiResponse::ok(rollups))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/reports/audit - Full ledger replay and identity check
async fn run_audit(State(state): State<AppState>) -> Response {
    match state.reporter.audit() {
        Ok(report) => (StatusCode::OK, Json(ApiResponse::ok(report))).into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("🎪 Bazaar Ledger - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let args: Vec<String> = std::env::args().collect();
    let db_path = args.get(1).cloned().unwrap_or_else(|| "bazaar.db".to_string());

    let rules = match args.get(2) {
        Some(rules_path) => RuleTable::from_file(rules_path).expect("Failed to load rules file"),
        None => RuleTable::defaults(),
    };

    let store = Arc::new(LedgerStore::open(&db_path).expect("Failed to open database"));
    println!("✓ Database ready: {}", db_path);
    println!("✓ Allocation rules loaded for {} roles", rules.rule_count());

    let state = AppState {
        accounts: AccountStore::new(store.clone()),
        allocation: AllocationEngine::new(store.clone(), rules),
        tracker: CollectionTracker::new(store.clone()),
        pool: SubmissionPool::new(store.clone()),
        reporter: ReconciliationReporter::new(store),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/accounts", post(create_account).get(list_accounts))
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/history", get(account_history))
        .route("/departments/:dept/accounts", get(department_accounts))
        .route("/allocations", post(allocate))
        .route("/recalls", post(recall))
        .route("/sales", post(record_sale))
        .route("/collections", post(record_collection))
        .route("/collections/unsubmitted/:account_id", get(unsubmitted_collections))
        .route("/submissions", post(submit_cash))
        .route("/submissions/pool", get(open_pool))
        .route("/submissions/:id", get(get_submission))
        .route("/submissions/:id/claim", post(claim_submission))
        .route("/submissions/:id/confirm", post(confirm_submission))
        .route("/submissions/:id/dispute", post(dispute_submission))
        .route("/submissions/:id/reject", post(reject_submission))
        .route("/submissions/:id/requeue", post(requeue_submission))
        .route("/reports/rollup", get(event_rollup))
        .route("/reports/rollup/department/:dept", get(department_rollup))
        .route("/reports/departments", get(all_department_rollups))
        .route("/reports/audit", get(run_audit))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    println!("\n🚀 Server running on http://localhost:3000");
    println!("   Health: http://localhost:3000/api/health");
    println!("   Pool:   http://localhost:3000/api/submissions/pool");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
