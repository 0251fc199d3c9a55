//! Admin HTTP API for the control plane
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET|POST /hosts, GET|PATCH|DELETE /hosts/{id}
//! - POST /hosts/{id}/revert-advanced-config
//! - POST /access-policies, PUT|DELETE /access-policies/{id}
//! - POST /access-policies/{id}/test - Evaluate a policy for one address
//! - POST /access-policies/rebind - Bulk rebind hosts to a policy
//! - POST /certificates, DELETE /certificates/{id}
//! - POST /auth-policies
//! - POST /security-rule-sets, DELETE /security-rule-sets/{id}
//! - GET /applied - Apply audit log, newest first
//! - GET /drift - Desired vs. applied hash
//! - POST /reconcile - Re-apply declared state

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::access::AccessDecision;
use crate::addr::{cidr_contains, parse_cidr};
use crate::applier::{ApplyOutcome, DriftStatus};
use crate::audit_logger::AuditLogger;
use crate::config::AdminConfig;
use crate::error::ControlError;
use crate::model::{
    AccessPolicy, AccessPolicyId, AppliedConfigRecord, AuthPolicy, Certificate, CertificateId,
    Host, HostId, HostPatch, HostSpec, SecurityRuleSet, SecurityRuleSetId,
};
use crate::orchestrator::{BulkRebindReport, ControlPlane, DeleteHostOptions};

/// Admin API state
pub struct AdminState {
    pub plane: Arc<ControlPlane>,
    pub start_time: Instant,
}

/// Admin API server
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
    audit: Arc<AuditLogger>,
}

impl AdminServer {
    pub fn new(config: AdminConfig, plane: Arc<ControlPlane>, audit: Arc<AuditLogger>) -> Self {
        let state = Arc::new(AdminState {
            plane,
            start_time: Instant::now(),
        });
        Self {
            config,
            state,
            audit,
        }
    }

    /// Run the admin HTTP server until `shutdown` resolves
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Admin API disabled");
            return Ok(());
        }

        let addr = self.config.socket_addr()?;
        let auth_state = auth_state(&self.config, self.audit);

        // Drop failure entries idle for two full windows so the map cannot grow
        // without bound under a rotating source-IP scan.
        let eviction = {
            let map = Arc::clone(&auth_state.failed_attempts);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ADMIN_AUTH_WINDOW);
                loop {
                    interval.tick().await;
                    evict_stale_failures(&map, Instant::now());
                }
            })
        };

        let app = build_router(self.state, auth_state);

        info!("Admin API listening on {}", addr);
        let listener = TcpListener::bind(addr).await?;

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;
        eviction.abort();
        served.map_err(|e| anyhow::anyhow!("Admin server error: {e}"))
    }
}

/// Build the admin router. Requires `ConnectInfo<SocketAddr>` on requests.
pub fn router(state: Arc<AdminState>, config: &AdminConfig, audit: Arc<AuditLogger>) -> Router {
    build_router(state, auth_state(config, audit))
}

fn auth_state(config: &AdminConfig, audit: Arc<AuditLogger>) -> Arc<AdminAuthState> {
    let allowed_nets = config
        .allowed_ips
        .iter()
        .filter_map(|entry| match parse_cidr(entry) {
            Ok(net) => Some(net),
            Err(e) => {
                warn!("Ignoring admin.allowed_ips entry: {}", e);
                None
            }
        })
        .collect();

    Arc::new(AdminAuthState {
        allowed_nets,
        auth_token: config.auth_token.clone(),
        failed_attempts: Arc::new(DashMap::new()),
        audit,
    })
}

fn build_router(state: Arc<AdminState>, auth_state: Arc<AdminAuthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/hosts", get(list_hosts_handler).post(create_host_handler))
        .route(
            "/hosts/{id}",
            get(get_host_handler)
                .patch(update_host_handler)
                .delete(delete_host_handler),
        )
        .route(
            "/hosts/{id}/revert-advanced-config",
            post(revert_advanced_config_handler),
        )
        .route("/access-policies", post(create_access_policy_handler))
        .route("/access-policies/rebind", post(rebind_handler))
        .route(
            "/access-policies/{id}",
            axum::routing::put(update_access_policy_handler).delete(delete_access_policy_handler),
        )
        .route("/access-policies/{id}/test", post(test_access_policy_handler))
        .route("/certificates", post(create_certificate_handler))
        .route(
            "/certificates/{id}",
            axum::routing::delete(delete_certificate_handler),
        )
        .route("/auth-policies", post(create_auth_policy_handler))
        .route("/security-rule-sets", post(create_rule_set_handler))
        .route(
            "/security-rule-sets/{id}",
            axum::routing::delete(delete_rule_set_handler),
        )
        .route("/applied", get(applied_handler))
        .route("/drift", get(drift_handler))
        .route("/reconcile", post(reconcile_handler))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth_middleware,
        ))
        .with_state(state)
}

/// Shared state for the admin authentication middleware
struct AdminAuthState {
    allowed_nets: Vec<IpNet>,
    auth_token: Option<String>,
    /// Client IP -> (failure_count, window_start)
    failed_attempts: Arc<DashMap<IpAddr, (u32, Instant)>>,
    audit: Arc<AuditLogger>,
}

/// Maximum failed authentication attempts per IP per window before lockout.
const ADMIN_AUTH_MAX_FAILURES: u32 = 10;
const ADMIN_AUTH_WINDOW: Duration = Duration::from_secs(60);

/// Remove entries whose window started more than two windows before `now`
fn evict_stale_failures(map: &DashMap<IpAddr, (u32, Instant)>, now: Instant) {
    let Some(cutoff) = now.checked_sub(ADMIN_AUTH_WINDOW * 2) else {
        return;
    };
    map.retain(|_, (_, window_start)| *window_start > cutoff);
}

impl AdminAuthState {
    fn locked_out(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.failed_attempts.entry(ip).or_insert((0, now));
        let (ref mut count, ref mut window_start) = *entry;
        if now.duration_since(*window_start) >= ADMIN_AUTH_WINDOW {
            *count = 0;
            *window_start = now;
        }
        *count >= ADMIN_AUTH_MAX_FAILURES
    }

    fn record_failure(&self, ip: IpAddr) -> u32 {
        let now = Instant::now();
        let mut entry = self.failed_attempts.entry(ip).or_insert((0, now));
        entry.0 += 1;
        entry.0
    }
}

/// Authentication middleware for admin API. Mutating requests are audited.
async fn auth_middleware(
    State(auth): State<Arc<AdminAuthState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let client_ip = remote_addr.ip();

    if !auth.allowed_nets.is_empty()
        && !auth.allowed_nets.iter().any(|net| cidr_contains(net, client_ip))
    {
        warn!("Admin API access denied for IP: {}", client_ip);
        auth.audit.log_auth_failure(client_ip, "address not in allowed_ips");
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(ref expected_token) = auth.auth_token {
        if auth.locked_out(client_ip) {
            warn!("Admin API: too many failed attempts from {}", client_ip);
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }

        let provided_token = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

        let provided_bytes = provided_token.unwrap_or("").as_bytes();
        let authorized: bool = provided_bytes.ct_eq(expected_token.as_bytes()).into();

        if !authorized {
            let count = auth.record_failure(client_ip);
            warn!(
                "Admin API unauthorized access attempt from {} ({}/{})",
                client_ip, count, ADMIN_AUTH_MAX_FAILURES
            );
            auth.audit.log_auth_failure(client_ip, "invalid or missing token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        auth.failed_attempts.remove(&client_ip);
    }

    let action = format!("{} {}", request.method(), request.uri().path());
    let mutating = request.method() != Method::GET;
    let response = next.run(request).await;

    if mutating {
        let status = response.status();
        auth.audit.log_admin_action(
            client_ip,
            action,
            status.is_success(),
            (!status.is_success()).then(|| status.to_string()),
        );
    }
    response
}

/// JSON error body
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    referenced_by: Option<Vec<String>>,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::Conflict { .. } => StatusCode::CONFLICT,
            ControlError::Apply(_) => StatusCode::BAD_GATEWAY,
            ControlError::Rollback { .. } | ControlError::Backup(_) | ControlError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("Admin request failed: {}", self);
        }
        let referenced_by = match self {
            ControlError::Conflict {
                ref referenced_by, ..
            } => Some(referenced_by.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            referenced_by,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ControlError>;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    hosts: usize,
    applied_hash: Option<String>,
}

async fn health_handler(State(state): State<Arc<AdminState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        hosts: state.plane.list_hosts().len(),
        applied_hash: state.plane.applier().last_applied_hash(),
    })
}

async fn list_hosts_handler(State(state): State<Arc<AdminState>>) -> Json<Vec<Host>> {
    Json(state.plane.list_hosts())
}

async fn get_host_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<HostId>,
) -> ApiResult<Json<Host>> {
    Ok(Json(state.plane.get_host(id)?))
}

async fn create_host_handler(
    State(state): State<Arc<AdminState>>,
    Json(spec): Json<HostSpec>,
) -> ApiResult<(StatusCode, Json<Host>)> {
    let host = state.plane.create_host(spec).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

async fn update_host_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<HostId>,
    Json(patch): Json<HostPatch>,
) -> ApiResult<Json<Host>> {
    Ok(Json(state.plane.update_host(id, patch).await?))
}

async fn delete_host_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<HostId>,
    Query(options): Query<DeleteHostOptions>,
) -> ApiResult<StatusCode> {
    state.plane.delete_host(id, options).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revert_advanced_config_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<HostId>,
) -> ApiResult<Json<Host>> {
    Ok(Json(state.plane.revert_advanced_config(id).await?))
}

async fn create_access_policy_handler(
    State(state): State<Arc<AdminState>>,
    Json(policy): Json<AccessPolicy>,
) -> ApiResult<(StatusCode, Json<AccessPolicy>)> {
    let policy = state.plane.create_access_policy(policy).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn update_access_policy_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<AccessPolicyId>,
    Json(policy): Json<AccessPolicy>,
) -> ApiResult<Json<AccessPolicy>> {
    Ok(Json(state.plane.update_access_policy(id, policy).await?))
}

async fn delete_access_policy_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<AccessPolicyId>,
) -> ApiResult<StatusCode> {
    state.plane.delete_access_policy(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct TestPolicyRequest {
    address: String,
}

async fn test_access_policy_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<AccessPolicyId>,
    Json(req): Json<TestPolicyRequest>,
) -> ApiResult<Json<AccessDecision>> {
    Ok(Json(state.plane.test_access_policy(id, &req.address)?))
}

#[derive(Deserialize)]
struct RebindRequest {
    host_ids: Vec<HostId>,
    #[serde(default)]
    policy_id: Option<AccessPolicyId>,
}

async fn rebind_handler(
    State(state): State<Arc<AdminState>>,
    Json(req): Json<RebindRequest>,
) -> ApiResult<Json<BulkRebindReport>> {
    Ok(Json(
        state
            .plane
            .bulk_rebind_access_policy(&req.host_ids, req.policy_id)
            .await?,
    ))
}

/// Certificate view without private key material
#[derive(Serialize)]
struct CertificateSummary {
    id: CertificateId,
    name: String,
    domains: Vec<String>,
}

impl From<Certificate> for CertificateSummary {
    fn from(cert: Certificate) -> Self {
        Self {
            id: cert.id,
            name: cert.name,
            domains: cert.domains,
        }
    }
}

async fn create_certificate_handler(
    State(state): State<Arc<AdminState>>,
    Json(certificate): Json<Certificate>,
) -> ApiResult<(StatusCode, Json<CertificateSummary>)> {
    let certificate = state.plane.create_certificate(certificate).await?;
    Ok((StatusCode::CREATED, Json(certificate.into())))
}

async fn delete_certificate_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<CertificateId>,
) -> ApiResult<StatusCode> {
    state.plane.delete_certificate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_auth_policy_handler(
    State(state): State<Arc<AdminState>>,
    Json(policy): Json<AuthPolicy>,
) -> ApiResult<(StatusCode, Json<AuthPolicy>)> {
    let policy = state.plane.create_auth_policy(policy).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn create_rule_set_handler(
    State(state): State<Arc<AdminState>>,
    Json(rule_set): Json<SecurityRuleSet>,
) -> ApiResult<(StatusCode, Json<SecurityRuleSet>)> {
    let rule_set = state.plane.create_security_rule_set(rule_set).await?;
    Ok((StatusCode::CREATED, Json(rule_set)))
}

async fn delete_rule_set_handler(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<SecurityRuleSetId>,
) -> ApiResult<StatusCode> {
    state.plane.delete_security_rule_set(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AppliedQuery {
    #[serde(default = "default_applied_limit")]
    limit: usize,
}

fn default_applied_limit() -> usize {
    20
}

async fn applied_handler(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<AppliedQuery>,
) -> Json<Vec<AppliedConfigRecord>> {
    Json(state.plane.applied_records(query.limit.min(1000)))
}

async fn drift_handler(State(state): State<Arc<AdminState>>) -> ApiResult<Json<DriftStatus>> {
    Ok(Json(state.plane.drift_status()?))
}

#[derive(Serialize)]
struct ReconcileResponse {
    applied: bool,
    hash: String,
}

async fn reconcile_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<ReconcileResponse>> {
    let outcome = state.plane.reconcile().await?;
    Ok(Json(ReconcileResponse {
        applied: matches!(outcome, ApplyOutcome::Applied { .. }),
        hash: outcome.hash().to_string(),
    }))
}
