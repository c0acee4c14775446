//! HTTP surface
//!
//! Thin JSON glue over the core services. Domain errors map to status codes
//! by category; no handler holds state of its own.

use crate::devices::DeviceEngine;
use crate::host::HostInspector;
use crate::machines::Machines;
use crate::networks::Networks;
use crate::snapshots::Snapshots;
use crate::storage::Storage;
use crate::synth::Synthesizer;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use kvmdeck_common::validate::check_port_forward;
use kvmdeck_common::{
    AttachDiskRequest, AttachMediaRequest, AttachNicRequest, BatchRequest, CloneVmRequest,
    CreateNetworkRequest, CreateSnapshotRequest, CreateStoragePoolRequest, CreateVmRequest,
    CreateVolumeRequest, Error, ErrorKind, ImportVmRequest, PortForwardRule, RenameVmRequest,
    RevertToNewRequest, UpdateVmRequest,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub struct AppState {
    pub machines: Machines,
    pub synth: Synthesizer,
    pub devices: DeviceEngine,
    pub snapshots: Snapshots,
    pub host: HostInspector,
    pub networks: Networks,
    pub storage: Storage,
}

type Shared = State<Arc<AppState>>;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Precondition => StatusCode::CONFLICT,
        ErrorKind::Connectivity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Hypervisor => StatusCode::BAD_GATEWAY,
        ErrorKind::PartialFailure | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response carrying a domain error
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (
            status,
            Json(json!({
                "error": self.0.to_string(),
                "kind": format!("{:?}", kind).to_lowercase(),
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn ok() -> ApiResult<Value> {
    Ok(Json(json!({"ok": true})))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": kvmdeck_common::VERSION}))
}

async fn host_handler(State(state): Shared) -> ApiResult<kvmdeck_common::HostInfo> {
    Ok(Json(state.host.host_info().await?))
}

async fn list_vms_handler(State(state): Shared) -> ApiResult<Vec<kvmdeck_common::VmSummary>> {
    Ok(Json(state.machines.list().await?))
}

async fn create_vm_handler(State(state): Shared, Json(req): Json<CreateVmRequest>) -> Result<impl IntoResponse, ApiError> {
    let plan = state.synth.create(&req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"name": plan.name, "disk": plan.disk_path})),
    ))
}

async fn import_vm_handler(State(state): Shared, Json(req): Json<ImportVmRequest>) -> Result<impl IntoResponse, ApiError> {
    let plan = state.synth.import(&req).await?;
    Ok((StatusCode::CREATED, Json(json!({"name": plan.name}))))
}

async fn get_vm_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<kvmdeck_common::VmDetail> {
    Ok(Json(state.machines.detail(&name).await?))
}

async fn update_vm_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<UpdateVmRequest>,
) -> ApiResult<Value> {
    let outcome = state.machines.update(&name, &req).await?;
    Ok(Json(json!({"result": outcome})))
}

async fn delete_vm_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.machines.delete(&name).await?;
    ok()
}

async fn power_handler(State(state): Shared, Path((name, action)): Path<(String, String)>) -> ApiResult<Value> {
    let m = &state.machines;
    match action.as_str() {
        "start" => m.start(&name).await?,
        "shutdown" => m.shutdown(&name).await?,
        "destroy" => m.destroy(&name).await?,
        "reboot" => m.reboot(&name).await?,
        "suspend" => m.suspend(&name).await?,
        "resume" => m.resume(&name).await?,
        "finish-install" => m.finish_install(&name).await?,
        other => return Err(Error::Validation(format!("unknown action: {}", other)).into()),
    }
    ok()
}

#[derive(Deserialize)]
struct AutostartBody {
    enabled: bool,
}

async fn get_autostart_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    let enabled = state.machines.autostart(&name).await?;
    Ok(Json(json!({"enabled": enabled})))
}

async fn set_autostart_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(body): Json<AutostartBody>,
) -> ApiResult<Value> {
    state.machines.set_autostart(&name, body.enabled).await?;
    ok()
}

async fn rename_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<RenameVmRequest>,
) -> ApiResult<Value> {
    state.machines.rename(&name, &req.new_name).await?;
    ok()
}

async fn clone_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<CloneVmRequest>,
) -> ApiResult<Value> {
    state.machines.clone_vm(&name, &req.new_name).await?;
    ok()
}

async fn batch_handler(State(state): Shared, Json(req): Json<BatchRequest>) -> Json<kvmdeck_common::BatchReport> {
    Json(state.machines.batch(&req).await)
}

async fn attach_disk_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<AttachDiskRequest>,
) -> ApiResult<Value> {
    let target = state.devices.attach_disk(&name, &req).await?;
    Ok(Json(json!({"target": target})))
}

async fn detach_disk_handler(State(state): Shared, Path((name, target)): Path<(String, String)>) -> ApiResult<Value> {
    state.devices.detach_disk(&name, &target).await?;
    ok()
}

async fn attach_nic_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<AttachNicRequest>,
) -> ApiResult<Value> {
    state.devices.attach_nic(&name, &req).await?;
    ok()
}

async fn detach_nic_handler(State(state): Shared, Path((name, mac)): Path<(String, String)>) -> ApiResult<Value> {
    state.devices.detach_nic(&name, &mac).await?;
    ok()
}

async fn attach_media_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<AttachMediaRequest>,
) -> ApiResult<Value> {
    state.devices.attach_media(&name, &req.path).await?;
    ok()
}

async fn eject_media_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.devices.eject_media(&name).await?;
    ok()
}

async fn list_snapshots_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Vec<kvmdeck_common::Snapshot>> {
    Ok(Json(state.snapshots.list(&name).await?))
}

async fn create_snapshot_handler(
    State(state): Shared,
    Path(name): Path<String>,
    Json(req): Json<CreateSnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.snapshots.create(&name, &req).await?;
    Ok((StatusCode::CREATED, Json(json!({"name": req.name}))))
}

async fn delete_snapshot_handler(State(state): Shared, Path((name, snapshot)): Path<(String, String)>) -> ApiResult<Value> {
    state.snapshots.delete(&name, &snapshot).await?;
    ok()
}

async fn revert_snapshot_handler(State(state): Shared, Path((name, snapshot)): Path<(String, String)>) -> ApiResult<Value> {
    state.snapshots.revert(&name, &snapshot).await?;
    ok()
}

async fn revert_to_new_handler(
    State(state): Shared,
    Path((name, snapshot)): Path<(String, String)>,
    Json(req): Json<RevertToNewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .snapshots
        .revert_to_new_instance(&name, &snapshot, &req.new_name)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"name": req.new_name}))))
}

async fn list_networks_handler(State(state): Shared) -> ApiResult<Vec<kvmdeck_common::Network>> {
    Ok(Json(state.networks.list().await?))
}

async fn create_network_handler(
    State(state): Shared,
    Json(req): Json<CreateNetworkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.networks.create(&req).await?;
    Ok((StatusCode::CREATED, Json(json!({"name": req.name}))))
}

async fn delete_network_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.networks.delete(&name).await?;
    ok()
}

async fn start_network_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.networks.start(&name).await?;
    ok()
}

async fn stop_network_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.networks.stop(&name).await?;
    ok()
}

async fn leases_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Vec<kvmdeck_common::DhcpLease>> {
    Ok(Json(state.networks.leases(&name).await?))
}

async fn list_pools_handler(State(state): Shared) -> ApiResult<Vec<kvmdeck_common::StoragePool>> {
    Ok(Json(state.storage.list_pools().await?))
}

async fn create_pool_handler(
    State(state): Shared,
    Json(req): Json<CreateStoragePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.storage.create_pool(&req).await?;
    Ok((StatusCode::CREATED, Json(json!({"name": req.name}))))
}

async fn delete_pool_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.storage.delete_pool(&name).await?;
    ok()
}

async fn start_pool_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.storage.start_pool(&name).await?;
    ok()
}

async fn stop_pool_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.storage.stop_pool(&name).await?;
    ok()
}

async fn list_volumes_handler(State(state): Shared, Path(pool): Path<String>) -> ApiResult<Vec<kvmdeck_common::StorageVolume>> {
    Ok(Json(state.storage.list_volumes(&pool).await?))
}

async fn create_volume_handler(
    State(state): Shared,
    Path(pool): Path<String>,
    Json(mut req): Json<CreateVolumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.pool = pool;
    state.storage.create_volume(&req).await?;
    Ok((StatusCode::CREATED, Json(json!({"name": req.name}))))
}

async fn delete_volume_handler(State(state): Shared, Path((pool, name)): Path<(String, String)>) -> ApiResult<Value> {
    state.storage.delete_volume(&pool, &name).await?;
    ok()
}

async fn list_isos_handler(State(state): Shared) -> ApiResult<Vec<kvmdeck_common::IsoFile>> {
    Ok(Json(state.storage.list_isos().await?))
}

async fn delete_iso_handler(State(state): Shared, Path(name): Path<String>) -> ApiResult<Value> {
    state.storage.delete_iso(&name).await?;
    ok()
}

#[derive(Deserialize)]
struct PortForwardCheck {
    rule: PortForwardRule,
    #[serde(default)]
    existing: Vec<PortForwardRule>,
}

async fn validate_port_forward_handler(Json(body): Json<PortForwardCheck>) -> ApiResult<Value> {
    check_port_forward(&body.rule, &body.existing)?;
    Ok(Json(json!({"ok": true, "id": body.rule.id()})))
}

/// Resolve and dial the console before upgrading, so failures stay JSON
async fn console_handler(State(state): Shared, Path(name): Path<String>, ws: Option<WebSocketUpgrade>) -> Response {
    let port = match state.machines.console_port(&name).await {
        Ok(port) => port,
        Err(e) => return ApiError(e).into_response(),
    };
    let Some(ws) = ws else {
        return ApiError(Error::Validation("websocket upgrade required".to_string())).into_response();
    };
    let console = match TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port))).await {
        Ok(stream) => stream,
        Err(e) => {
            let err = Error::Hypervisor(format!("console of {} unreachable on port {}: {}", name, port, e));
            return ApiError(err).into_response();
        }
    };
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = kvmdeck_web::ws::serve_console(socket, console, &name).await {
            error!("Console session for {} failed: {}", name, e);
        }
    })
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "no such route"})))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/host", get(host_handler))
        .route("/api/vms", get(list_vms_handler).post(create_vm_handler))
        .route("/api/vms/import", post(import_vm_handler))
        .route("/api/vms/batch", post(batch_handler))
        .route(
            "/api/vms/:name",
            get(get_vm_handler).put(update_vm_handler).delete(delete_vm_handler),
        )
        .route("/api/vms/:name/power/:action", post(power_handler))
        .route("/api/vms/:name/autostart", get(get_autostart_handler).put(set_autostart_handler))
        .route("/api/vms/:name/rename", post(rename_handler))
        .route("/api/vms/:name/clone", post(clone_handler))
        .route("/api/vms/:name/disks", post(attach_disk_handler))
        .route("/api/vms/:name/disks/:target", delete(detach_disk_handler))
        .route("/api/vms/:name/nics", post(attach_nic_handler))
        .route("/api/vms/:name/nics/:mac", delete(detach_nic_handler))
        .route("/api/vms/:name/media", post(attach_media_handler).delete(eject_media_handler))
        .route(
            "/api/vms/:name/snapshots",
            get(list_snapshots_handler).post(create_snapshot_handler),
        )
        .route("/api/vms/:name/snapshots/:snapshot", delete(delete_snapshot_handler))
        .route("/api/vms/:name/snapshots/:snapshot/revert", post(revert_snapshot_handler))
        .route("/api/vms/:name/snapshots/:snapshot/clone", post(revert_to_new_handler))
        .route("/api/networks", get(list_networks_handler).post(create_network_handler))
        .route("/api/networks/:name", delete(delete_network_handler))
        .route("/api/networks/:name/start", post(start_network_handler))
        .route("/api/networks/:name/stop", post(stop_network_handler))
        .route("/api/networks/:name/leases", get(leases_handler))
        .route("/api/pools", get(list_pools_handler).post(create_pool_handler))
        .route("/api/pools/:name", delete(delete_pool_handler))
        .route("/api/pools/:name/start", post(start_pool_handler))
        .route("/api/pools/:name/stop", post(stop_pool_handler))
        .route(
            "/api/pools/:name/volumes",
            get(list_volumes_handler).post(create_volume_handler),
        )
        .route("/api/pools/:name/volumes/:volume", delete(delete_volume_handler))
        .route("/api/isos", get(list_isos_handler))
        .route("/api/isos/:name", delete(delete_iso_handler))
        .route("/api/port-forwards/validate", post(validate_port_forward_handler))
        .route("/ws/vnc/:name", get(console_handler))
        .fallback(not_found_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    info!("HTTP API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
