//! HTTP surface of the broker: `/v2` behind basic auth, `/healthz` open.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use base64::Engine;
use kibosh_broker::{
    BindDetails, BrokerError, DeprovisionDetails, PollDetails, ProvisionDetails, ServiceBroker, UnbindDetails,
    UpdateDetails,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Basic-auth pair guarding `/v2`.
#[derive(Clone)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
}

#[derive(Clone)]
struct AppState {
    broker: Arc<dyn ServiceBroker>,
}

pub struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::AsyncRequired => StatusCode::UNPROCESSABLE_ENTITY,
            BrokerError::Validation(_) | BrokerError::NotFound(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.kind(), "description": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

pub fn build_router(broker: Arc<dyn ServiceBroker>, admin: AdminCredentials) -> Router {
    let v2 = Router::new()
        .route("/v2/catalog", get(catalog))
        .route("/v2/service_instances/:instance_id", put(provision).patch(update).delete(deprovision))
        .route("/v2/service_instances/:instance_id/last_operation", get(last_operation))
        .route("/v2/service_instances/:instance_id/service_bindings/:binding_id", put(bind).delete(unbind))
        .route_layer(middleware::from_fn_with_state(Arc::new(admin), basic_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(v2)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { broker })
}

async fn basic_auth(State(admin): State<Arc<AdminCredentials>>, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|pair| pair.split_once(':').map(|(u, p)| u == admin.user && p == admin.password))
        .unwrap_or(false);
    if !authorized {
        warn!(path = %req.uri().path(), "rejected unauthenticated request");
        return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, "Basic realm=\"kibosh\"")]).into_response();
    }
    next.run(req).await
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct AsyncQuery {
    #[serde(default)]
    accepts_incomplete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DeprovisionQuery {
    #[serde(default)]
    accepts_incomplete: bool,
    service_id: Option<String>,
    plan_id: Option<String>,
}

async fn catalog(State(st): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let services = st.broker.services().await?;
    Ok(Json(json!({ "services": services })))
}

async fn provision(
    State(st): State<AppState>,
    Path(instance_id): Path<String>,
    Query(q): Query<AsyncQuery>,
    Json(details): Json<ProvisionDetails>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = st.broker.provision(&instance_id, details, q.accepts_incomplete).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "operation": spec.operation_data }))))
}

async fn update(
    State(st): State<AppState>,
    Path(instance_id): Path<String>,
    Query(q): Query<AsyncQuery>,
    Json(details): Json<UpdateDetails>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = st.broker.update(&instance_id, details, q.accepts_incomplete).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "operation": spec.operation_data }))))
}

async fn deprovision(
    State(st): State<AppState>,
    Path(instance_id): Path<String>,
    Query(q): Query<DeprovisionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let details = DeprovisionDetails { service_id: q.service_id, plan_id: q.plan_id };
    let spec = st.broker.deprovision(&instance_id, details, q.accepts_incomplete).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "operation": spec.operation_data }))))
}

async fn last_operation(
    State(st): State<AppState>,
    Path(instance_id): Path<String>,
    Query(details): Query<PollDetails>,
) -> Result<Json<kibosh_broker::LastOperation>, ApiError> {
    Ok(Json(st.broker.last_operation(&instance_id, details).await?))
}

async fn bind(
    State(st): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    body: Option<Json<BindDetails>>,
) -> Result<impl IntoResponse, ApiError> {
    let details = body.map(|Json(d)| d).unwrap_or_default();
    let binding = st.broker.bind(&instance_id, &binding_id, details).await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn unbind(
    State(st): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(details): Query<UnbindDetails>,
) -> Result<Json<serde_json::Value>, ApiError> {
    st.broker.unbind(&instance_id, &binding_id, details).await?;
    Ok(Json(json!({})))
}
