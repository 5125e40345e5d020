use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppState;
use crate::error::{AppError, Result};
use crate::virtualization::reconcile;

use super::model::{Host, NewHost};

#[derive(Debug, Serialize, ToSchema)]
pub struct HostResponse {
    #[serde(flatten)]
    pub host: Host,
    pub vm_count: i64,
    pub vms_running: i64,
}

fn augment(conn: &mut diesel::SqliteConnection, host: Host) -> Result<HostResponse> {
    let (vm_count, vms_running) = Host::vm_counts(conn, &host.address)?;
    Ok(HostResponse {
        host,
        vm_count,
        vms_running,
    })
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EnrollHostRequest {
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: i32,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub probe_only: bool,
}

fn default_port() -> i32 {
    443
}

fn default_username() -> String {
    "root".to_string()
}

async fn probe(
    address: &str,
    username: &str,
    password: &str,
    port: i32,
) -> std::result::Result<esxi_client::HostFacts, esxi_client::HypervisorError> {
    let mut client = esxi_client::VsphereClient::connect(address, username, password, port as u16).await?;
    let topology = client.topology().await;
    let facts = match topology {
        Ok(topology) => client.host_facts(&topology).await,
        Err(err) => Err(err),
    };
    client.disconnect().await;
    facts
}

/// Enroll a hypervisor by address and credentials
///
/// Probes the host before persisting it; `probe_only=true` performs the
/// probe without touching the store.
#[utoipa::path(
    post,
    path = "",
    request_body = EnrollHostRequest,
    responses(
        (status = 201, description = "Host enrolled", body = HostResponse),
        (status = 400, description = "Missing credentials"),
        (status = 502, description = "Probe failed"),
    )
)]
async fn enroll_host(
    State(state): State<AppState>,
    Json(req): Json<EnrollHostRequest>,
) -> Result<(StatusCode, Json<HostResponse>)> {
    let password = req
        .password
        .clone()
        .or_else(|| state.config.default_credentials().map(|(_, p)| p))
        .ok_or_else(|| AppError::Validation("password is required".to_string()))?;

    let address = req.ip.clone();
    let port = req.port;
    let username = req.username.clone();

    // Probe first; a failed probe never touches the store. Any probe
    // failure, including a rejected credential, surfaces as 502, not the
    // 400/502-by-stage split `HypervisorError` normally maps to (spec.md
    // §6: "400 for missing secret; 502 for probe failure").
    let facts = probe(&address, &username, &password, port)
        .await
        .map_err(|err| AppError::Hypervisor(err.to_string()))?;

    if req.probe_only {
        let mut host = placeholder_host(&req, &password);
        host.id = 0;
        host.hostname = Some(facts.hostname.clone());
        host.version = Some(facts.version.clone());
        host.model = Some(facts.model.clone());
        host.status = "online".to_string();
        return Ok((
            StatusCode::CREATED,
            Json(HostResponse {
                host,
                vm_count: 0,
                vms_running: 0,
            }),
        ));
    }

    let sealed_secret = state.secrets.seal(&password);
    let mut conn = state.conn()?;
    let host_id = tokio::task::spawn_blocking(move || {
        let new = NewHost {
            address: &address,
            port,
            username: &username,
            secret: &sealed_secret,
            description: req.description.as_deref(),
        };
        let host = Host::upsert(&mut conn, &new)?;
        Host::update_rollup(
            &mut conn,
            host.id,
            Some(&facts.hostname),
            Some(&facts.version),
            Some(&facts.model),
            0.0,
            0.0,
            facts.cpu_cores as i32,
            facts.memory_total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            0.0,
            0.0,
        )?;
        Host::mark_online(&mut conn, host.id)?;
        Ok::<_, AppError>(host.id)
    })
    .await??;

    // Full inventory fill-in happens through the same primitive every other
    // mutating entry point uses (spec.md §9's "one Reconcile(host)" note).
    if let Err(err) = reconcile::reconcile_host(&state, host_id).await {
        tracing::warn!(host_id, error = %err, "post-enrollment reconcile failed");
    }

    let mut conn = state.conn()?;
    let response = tokio::task::spawn_blocking(move || {
        let host = Host::get(&mut conn, host_id)?;
        augment(&mut conn, host)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(response)))
}

fn placeholder_host(req: &EnrollHostRequest, password: &str) -> Host {
    Host {
        id: 0,
        address: req.ip.clone(),
        port: req.port,
        username: req.username.clone(),
        secret: password.to_string(),
        description: req.description.clone(),
        sort_order: 0,
        hostname: None,
        version: None,
        model: None,
        last_sync: None,
        status: "offline".to_string(),
        cpu_percent: 0.0,
        memory_percent: 0.0,
        core_count: 0,
        total_memory_gb: 0.0,
        storage_total_gb: 0.0,
        storage_free_gb: 0.0,
    }
}

/// List enrolled hosts, ordered for display
#[utoipa::path(
    get,
    path = "",
    responses((status = 200, description = "Hosts", body = Vec<HostResponse>))
)]
async fn list_hosts(State(state): State<AppState>) -> Result<Json<Vec<HostResponse>>> {
    let mut conn = state.conn()?;
    let response = tokio::task::spawn_blocking(move || {
        let hosts = Host::list(&mut conn)?;
        hosts
            .into_iter()
            .map(|h| augment(&mut conn, h))
            .collect::<Result<Vec<_>>>()
    })
    .await??;
    Ok(Json(response))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReorderRequest {
    pub host_ids: Vec<i32>,
}

/// Reorder the display position of a subset of hosts
#[utoipa::path(
    post,
    path = "/reorder",
    request_body = ReorderRequest,
    responses(
        (status = 200, description = "Reordered"),
        (status = 400, description = "Empty or duplicate ids"),
        (status = 404, description = "Unknown id"),
    )
)]
async fn reorder_hosts(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> Result<StatusCode> {
    if req.host_ids.is_empty() {
        return Err(AppError::Validation("host_ids must not be empty".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    if !req.host_ids.iter().all(|id| seen.insert(*id)) {
        return Err(AppError::Validation("host_ids must not contain duplicates".to_string()));
    }

    let mut conn = state.conn()?;
    tokio::task::spawn_blocking(move || {
        let existing = Host::list(&mut conn)?;
        let existing_ids: std::collections::HashSet<i32> =
            existing.iter().map(|h| h.id).collect();
        for id in &req.host_ids {
            if !existing_ids.contains(id) {
                return Err(AppError::NotFound(format!("host {id} not found")));
            }
        }
        Host::reorder(&mut conn, &req.host_ids)
    })
    .await??;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateHostRequest {
    pub address: Option<String>,
    pub port: Option<i32>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub description: Option<Option<String>>,
}

/// Partially update a host's connection details
#[utoipa::path(
    put,
    path = "/{id}",
    params(("id" = i32, Path, description = "Host id")),
    request_body = UpdateHostRequest,
    responses(
        (status = 200, description = "Updated", body = HostResponse),
        (status = 404, description = "Host not found"),
    )
)]
async fn update_host(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(req): Json<UpdateHostRequest>,
) -> Result<Json<HostResponse>> {
    let sealed_secret = req.password.as_deref().map(|p| state.secrets.seal(p));
    let mut conn = state.conn()?;
    let response = tokio::task::spawn_blocking(move || {
        let host = Host::update_fields(
            &mut conn,
            id,
            req.address.as_deref(),
            req.port,
            req.username.as_deref(),
            sealed_secret.as_deref(),
            req.description
                .as_ref()
                .map(|d| d.as_deref()),
        )?;
        augment(&mut conn, host)
    })
    .await??;
    Ok(Json(response))
}

/// Delete a host and cascade its VM rows
#[utoipa::path(
    delete,
    path = "/{id}",
    params(("id" = i32, Path, description = "Host id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Host not found"),
    )
)]
async fn delete_host(State(state): State<AppState>, Path(id): Path<i32>) -> Result<StatusCode> {
    let mut conn = state.conn()?;
    tokio::task::spawn_blocking(move || Host::delete(&mut conn, id)).await??;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SyncRequest {
    pub host_id: Option<i32>,
}

/// Trigger a sync of one host or all hosts
///
/// Mounted at `/virtualization/sync` (spec.md §6), not under
/// `/virtualization/hosts` — see `sync_router`.
#[utoipa::path(
    post,
    path = "/sync",
    request_body = SyncRequest,
    responses((status = 200, description = "Sync triggered"))
)]
async fn sync_hosts(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<StatusCode> {
    reconcile::sync_hosts(&state, req.host_id).await?;
    Ok(StatusCode::OK)
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(enroll_host))
        .routes(routes!(list_hosts))
        .routes(routes!(reorder_hosts))
        .routes(routes!(update_host))
        .routes(routes!(delete_host))
}

/// Separate router so `serve::router` can nest it at `/virtualization`
/// rather than `/virtualization/hosts` (spec.md §6's `POST
/// /virtualization/sync`, not a hosts sub-route).
pub fn sync_router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(sync_hosts))
}
