// HTTP surface of a registry node

use crate::node::{NodeStatus, RegistryNode};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use regis::{
    Application, ApplyOutcome, DeltaBatch, DeltaRecord, Error, Instance, InstanceKey, InstanceStatus,
    PeerNode, RegistrySnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

pub type ApiState = Arc<RegistryNode>;

pub fn router(node: ApiState) -> Router {
    Router::new()
        .route(
            "/instances/:service/:id",
            put(register_or_renew).delete(cancel).get(get_instance),
        )
        .route("/instances/:service/:id/status", put(set_status))
        .route("/registry", get(full_registry))
        .route("/registry/delta", get(delta))
        .route("/registry/:service", get(application))
        .route("/peer/replicate", post(replicate))
        .route("/status", get(status))
        .route("/peers", get(peers))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

/// Maps engine errors onto status codes with a `{"error": ...}` body
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::StaleCursor { .. } => StatusCode::GONE,
            Error::Validation(_) | Error::ClockDrift { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Registration payload. Identity comes from the path; body copies must agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub lease_duration_secs: Option<u64>,
}

impl RegisterRequest {
    fn into_instance(self, service: &str, id: &str) -> regis::Result<Instance> {
        if self.service_name.as_deref().is_some_and(|s| s != service) {
            return Err(Error::validation("service name in body does not match path"));
        }
        if self.instance_id.as_deref().is_some_and(|i| i != id) {
            return Err(Error::validation("instance id in body does not match path"));
        }

        let mut instance = Instance::new(service, id, self.host, self.port);
        if let Some(status) = self.status {
            instance.status = status.parse()?;
        }
        if let Some(secs) = self.lease_duration_secs {
            if secs == 0 {
                return Err(Error::validation("lease duration must be positive"));
            }
            instance = instance.with_lease_duration(Duration::from_secs(secs));
        }
        instance.metadata = self.metadata;
        Ok(instance)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct DeltaQuery {
    pub since: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub outcome: ApplyOutcome,
}

fn path_key(service: String, id: String) -> ApiResult<InstanceKey> {
    let key = InstanceKey::new(service, id);
    key.validate()?;
    Ok(key)
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError(Error::validation(format!("malformed body: {e}"))))
}

/// A JSON body registers; an empty body renews
async fn register_or_renew(
    State(node): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let key = path_key(service, id)?;

    if body.iter().all(u8::is_ascii_whitespace) {
        node.renew(&key)?;
        return Ok(StatusCode::NO_CONTENT);
    }

    let request: RegisterRequest = parse_json(&body)?;
    let instance = request.into_instance(&key.service, &key.instance_id)?;
    node.register(instance)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel(
    State(node): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = path_key(service, id)?;
    if node.cancel(&key).is_none() {
        debug!(instance = %key, "Cancel of absent instance");
    }
    Ok(StatusCode::OK)
}

async fn get_instance(
    State(node): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
) -> ApiResult<Json<Instance>> {
    let key = path_key(service, id)?;
    node.registry()
        .instance(&key)
        .map(Json)
        .ok_or_else(|| ApiError(Error::not_found(&key.service, &key.instance_id)))
}

async fn set_status(
    State(node): State<ApiState>,
    Path((service, id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let key = path_key(service, id)?;
    let update: StatusUpdate = parse_json(&body)?;
    let status: InstanceStatus = update.status.parse()?;
    node.set_status(&key, status)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn full_registry(State(node): State<ApiState>) -> Json<RegistrySnapshot> {
    Json(node.registry().full_registry())
}

async fn delta(State(node): State<ApiState>, Query(query): Query<DeltaQuery>) -> ApiResult<Json<DeltaBatch>> {
    Ok(Json(node.registry().delta(query.since)?))
}

async fn application(
    State(node): State<ApiState>,
    Path(service): Path<String>,
) -> ApiResult<Json<Application>> {
    node.registry()
        .application(&service)
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound {
            service,
            instance_id: "*".into(),
        }))
}

async fn replicate(State(node): State<ApiState>, body: Bytes) -> ApiResult<Json<ReplicateResponse>> {
    let record: DeltaRecord = parse_json(&body)?;
    let outcome = node.apply_peer(&record)?;
    Ok(Json(ReplicateResponse { outcome }))
}

async fn status(State(node): State<ApiState>) -> Json<NodeStatus> {
    Json(node.status())
}

async fn peers(State(node): State<ApiState>) -> Json<Vec<PeerNode>> {
    Json(node.peers().list())
}
