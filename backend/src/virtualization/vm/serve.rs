use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppState;
use crate::credential::model::Credential;
use crate::error::{AppError, Result};
use crate::host::model::Host;
use crate::task::model::{TaskRow, TaskStatus, TaskUpdate};
use crate::virtualization::{clone, power, reconcile, ssh_bootstrap};

use super::model::VirtualMachine;

const RENAME_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize, IntoParams)]
pub struct VmListQuery {
    pub host_id: Option<i32>,
    pub keyword: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    #[serde(default)]
    pub refresh: bool,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VmListResponse {
    pub items: Vec<VirtualMachine>,
    pub total: i64,
}

/// List VMs, optionally forcing a host sync first
///
/// `refresh=true` without `host_id` does nothing silently (spec.md §8
/// boundary case) — there is no host to resync against.
#[utoipa::path(
    get,
    path = "",
    params(VmListQuery),
    responses((status = 200, description = "VMs", body = VmListResponse))
)]
async fn list_vms(
    State(state): State<AppState>,
    Query(query): Query<VmListQuery>,
) -> Result<Json<VmListResponse>> {
    let host_address = match query.host_id {
        Some(host_id) => {
            let mut conn = state.conn()?;
            let host = tokio::task::spawn_blocking(move || Host::get(&mut conn, host_id).ok()).await??;
            host.map(|h| h.address)
        }
        None => None,
    };

    if query.refresh {
        if let Some(host_id) = query.host_id {
            if host_address.is_some() {
                if let Err(err) = reconcile::reconcile_host(&state, host_id).await {
                    tracing::warn!(host_id, error = %err, "pre-list refresh failed");
                }
            }
        }
    }

    let mut conn = state.conn()?;
    let (items, total) = tokio::task::spawn_blocking(move || {
        VirtualMachine::list(
            &mut conn,
            host_address.as_deref(),
            query.keyword.as_deref(),
            query.status.as_deref(),
            query.page,
            query.page_size,
        )
    })
    .await??;
    Ok(Json(VmListResponse { items, total }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateVmRequest {
    pub name: Option<String>,
    pub annotation: Option<String>,
}

/// Rename and/or re-annotate a VM; both are applied hypervisor-side first
/// and only committed locally on success (spec.md §6).
#[utoipa::path(
    patch,
    path = "/{id}",
    params(("id" = String, Path, description = "VM composite id")),
    request_body = UpdateVmRequest,
    responses(
        (status = 200, description = "Updated", body = VirtualMachine),
        (status = 400, description = "Empty name"),
        (status = 404, description = "VM not found"),
        (status = 504, description = "Hypervisor timeout"),
    )
)]
async fn update_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateVmRequest>,
) -> Result<Json<VirtualMachine>> {
    if let Some(name) = &req.name {
        if name.trim().is_empty() {
            return Err(AppError::Validation("name must not be empty".to_string()));
        }
    }

    let mut conn = state.conn()?;
    let id_owned = id.clone();
    let vm = tokio::task::spawn_blocking(move || VirtualMachine::get(&mut conn, &id_owned)).await??;

    let mut conn = state.conn()?;
    let host_address = vm.host_address.clone();
    let host = tokio::task::spawn_blocking(move || Host::get_by_address(&mut conn, &host_address)).await??;

    let (username, password) = reconcile::resolve_credentials(
        &state.config,
        None,
        Some((host.username.clone(), state.secrets.reveal(&host.secret))),
    )?;

    {
        let client =
            esxi_client::VsphereClient::connect(&host.address, &username, &password, host.port as u16).await?;
        let descriptor = esxi_client::VmDescriptor::by_instance_uuid(vm.instance_uuid.clone());
        let vm_moref = client.find_vm(&descriptor).await;
        let vm_moref = match vm_moref {
            Ok(moref) => moref,
            Err(err) => {
                let mut client = client;
                client.disconnect().await;
                return Err(err.into());
            }
        };

        let result = async {
            if let Some(name) = &req.name {
                client.rename_vm(&vm_moref, name.trim(), RENAME_DEADLINE).await?;
            }
            if let Some(annotation) = &req.annotation {
                client.set_annotation(&vm_moref, annotation, RENAME_DEADLINE).await?;
            }
            Ok::<_, esxi_client::HypervisorError>(())
        }
        .await;

        let mut client = client;
        client.disconnect().await;
        result?;
    }

    let mut conn = state.conn()?;
    let updated = tokio::task::spawn_blocking(move || {
        VirtualMachine::update_basic_info(
            &mut conn,
            &id,
            req.name.as_deref().map(str::trim),
            req.annotation.as_deref(),
        )
    })
    .await??;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PowerActionRequest {
    pub action: String,
}

/// Drive a power action synchronously (spec.md §4.6)
#[utoipa::path(
    post,
    path = "/{id}/power",
    params(("id" = String, Path, description = "VM composite id")),
    request_body = PowerActionRequest,
    responses(
        (status = 200, description = "Power action result", body = power::PowerResult),
        (status = 400, description = "Unsupported action or guest tools issue"),
        (status = 404, description = "VM not found"),
        (status = 502, description = "Hypervisor fault"),
    )
)]
async fn power_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PowerActionRequest>,
) -> Result<Json<power::PowerResult>> {
    let result = power::execute(&state, &id, &req.action).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VmCloneRequest {
    pub new_name: String,
    pub target_datastore: Option<String>,
    #[serde(default)]
    pub power_on: bool,
    pub source_ip: Option<String>,
    #[serde(default)]
    pub auto_config_ip: bool,
    pub guest_username: Option<String>,
    pub guest_password: Option<String>,
    pub new_ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default = "default_nic")]
    pub nic_name: String,
    #[serde(default = "default_true")]
    pub disconnect_nic_first: bool,
}

fn default_nic() -> String {
    "eth0".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AsyncTaskResponse {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

/// Kick off the offline clone workflow in the background and return its
/// task id immediately (spec.md §4.4/§6).
#[utoipa::path(
    post,
    path = "/{id}/clone",
    params(("id" = String, Path, description = "VM composite id")),
    request_body = VmCloneRequest,
    responses(
        (status = 200, description = "Clone task accepted", body = AsyncTaskResponse),
        (status = 400, description = "Missing auto-IP fields"),
        (status = 404, description = "VM not found"),
    )
)]
async fn clone_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut req): Json<VmCloneRequest>,
) -> Result<Json<AsyncTaskResponse>> {
    if req.auto_config_ip {
        if req.guest_username.as_deref().unwrap_or("").is_empty()
            || req.guest_password.as_deref().unwrap_or("").is_empty()
        {
            return Err(AppError::Validation(
                "auto_config_ip requires guest_username and guest_password".to_string(),
            ));
        }
        if req.new_ip.as_deref().unwrap_or("").is_empty() || req.netmask.as_deref().unwrap_or("").is_empty() {
            return Err(AppError::Validation(
                "auto_config_ip requires new_ip and netmask".to_string(),
            ));
        }
        req.power_on = true;
    }

    let mut conn = state.conn()?;
    let id_owned = id.clone();
    let vm = tokio::task::spawn_blocking(move || VirtualMachine::get(&mut conn, &id_owned)).await??;

    let mut conn = state.conn()?;
    let host_address = vm.host_address.clone();
    let host = tokio::task::spawn_blocking(move || Host::get_by_address(&mut conn, &host_address)).await??;

    let mut conn = state.conn()?;
    let task = tokio::task::spawn_blocking(move || {
        TaskRow::create(&mut conn, "clone_vm", Some(id.clone()), "waiting to start")
    })
    .await??;

    let state_bg = state.clone();
    let task_id = task.id.clone();
    let input = clone::CloneInput {
        new_name: req.new_name,
        target_datastore: req.target_datastore,
        power_on: req.power_on,
        source_ip: req.source_ip,
        auto_config_ip: req.auto_config_ip,
        guest_username: req.guest_username,
        guest_password: req.guest_password,
        new_ip: req.new_ip,
        netmask: req.netmask,
        gateway: req.gateway,
        dns: req.dns,
        nic_name: req.nic_name,
        disconnect_nic_first: req.disconnect_nic_first,
    };
    tokio::spawn(async move {
        clone::run(&state_bg, &task_id, host, vm, input).await;
    });

    Ok(Json(AsyncTaskResponse {
        task_id: task.id,
        status: task.status().as_str().to_string(),
        message: "clone task submitted".to_string(),
    }))
}

/// Fixed placeholder — preserved deliberately, see DESIGN.md's resolution
/// of the matching open question.
#[utoipa::path(
    get,
    path = "/{id}/console",
    params(("id" = String, Path, description = "VM composite id")),
    responses((status = 200, description = "Console placeholder"))
)]
async fn console_vm(Path(_id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({
        "type": "webmks",
        "url": "wss://mock-proxy/ticket/123",
        "ticket": "mock-ticket",
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InstallToolsRequest {
    pub ip: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub credential_id: Option<i32>,
}

/// Install the in-guest agent over SSH in the background (spec.md §4.7/§6)
#[utoipa::path(
    post,
    path = "/{id}/install-tools",
    params(("id" = String, Path, description = "VM composite id")),
    request_body = InstallToolsRequest,
    responses(
        (status = 200, description = "Install task accepted", body = AsyncTaskResponse),
        (status = 400, description = "Missing credentials"),
        (status = 404, description = "VM or credential not found"),
    )
)]
async fn install_tools(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InstallToolsRequest>,
) -> Result<Json<AsyncTaskResponse>> {
    let (username, password) = match (req.username, req.password, req.credential_id) {
        (Some(u), Some(p), None) if !u.is_empty() && !p.is_empty() => (u, p),
        (_, _, Some(credential_id)) => {
            let mut conn = state.conn()?;
            let credential =
                tokio::task::spawn_blocking(move || Credential::get(&mut conn, credential_id)).await??;
            let password = state.secrets.reveal(&credential.secret);
            (credential.username, password)
        }
        _ => {
            return Err(AppError::Validation(
                "username and password, or credential_id, are required".to_string(),
            ))
        }
    };

    let mut conn = state.conn()?;
    let id_owned = id.clone();
    tokio::task::spawn_blocking(move || VirtualMachine::get(&mut conn, &id_owned)).await??;

    let mut conn = state.conn()?;
    let task = tokio::task::spawn_blocking(move || {
        TaskRow::create(&mut conn, "install_tools", Some(id.clone()), "preparing to install tools")
    })
    .await??;

    let state_bg = state.clone();
    let task_id = task.id.clone();
    let ip = req.ip.clone();
    tokio::spawn(async move {
        let mut conn = match state_bg.conn() {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, "install-tools: failed to acquire connection");
                return;
            }
        };
        let task_id_for_update = task_id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            TaskRow::update(
                &mut conn,
                &task_id_for_update,
                TaskUpdate {
                    status: Some(TaskStatus::Running),
                    progress: Some(10),
                    message: Some(format!("connecting via SSH: {ip}")),
                    result: None,
                },
            )
        })
        .await;

        let outcome = ssh_bootstrap::install_guest_tools(req.ip.clone(), username, password).await;

        let mut conn = match state_bg.conn() {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, "install-tools: failed to acquire connection");
                return;
            }
        };
        let patch = match outcome {
            Ok(result) => TaskUpdate {
                status: Some(TaskStatus::Success),
                progress: Some(100),
                message: Some("tools install command executed successfully".to_string()),
                result: Some(json!({ "log": result.log })),
            },
            Err(err) => TaskUpdate {
                status: Some(TaskStatus::Failed),
                progress: Some(100),
                message: Some(err.to_string()),
                result: None,
            },
        };
        let _ = tokio::task::spawn_blocking(move || TaskRow::update(&mut conn, &task_id, patch)).await;
    });

    Ok(Json(AsyncTaskResponse {
        task_id: task.id,
        status: task.status().as_str().to_string(),
        message: "install-tools task submitted".to_string(),
    }))
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(list_vms))
        .routes(routes!(update_vm))
        .routes(routes!(power_vm))
        .routes(routes!(clone_vm))
        .routes(routes!(console_vm))
        .routes(routes!(install_tools))
}
