//! The offline clone workflow (spec.md §4.4): copy a powered-off VM's files
//! to a new name/datastore, register the copy, reset its identity so the
//! hypervisor never raises the moved-or-copied prompt, optionally power it
//! on and configure its guest IP, then reconnect NICs and resync. Runs
//! entirely in the background task spawned by
//! `virtualization::vm::serve::clone_vm`; every step writes its own
//! progress/message update to the owning `Task` row.

use std::time::Duration;

use esxi_client::{EthernetDevice, SessionGuard, VmDescriptor, VsphereClient};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::config::AppState;
use crate::error::{AppError, Result};
use crate::host::model::Host;
use crate::task::model::{TaskRow, TaskStatus, TaskUpdate};
use crate::virtualization::guest_ip::{self, IpConfigRequest};
use crate::virtualization::reconcile;
use crate::virtualization::vm::model::VirtualMachine;

const CONNECT_DEADLINE: Duration = Duration::from_secs(60);
const DELETE_DEADLINE: Duration = Duration::from_secs(60);
const DISK_DEADLINE: Duration = Duration::from_secs(3600);
const CONFIG_DEADLINE: Duration = Duration::from_secs(600);
const REGISTER_DEADLINE: Duration = Duration::from_secs(600);
const IDENTITY_DEADLINE: Duration = Duration::from_secs(300);
const POWER_ON_DEADLINE: Duration = Duration::from_secs(60);
const TOOLS_AFTER_POWER_ON_DEADLINE: Duration = Duration::from_secs(300);
const TOOLS_BEFORE_IP_DEADLINE: Duration = Duration::from_secs(180);

/// Everything the orchestrator needs beyond the source VM/host rows,
/// gathered synchronously by the HTTP handler before a task row is created.
pub struct CloneInput {
    pub new_name: String,
    pub target_datastore: Option<String>,
    pub power_on: bool,
    pub source_ip: Option<String>,
    pub auto_config_ip: bool,
    pub guest_username: Option<String>,
    pub guest_password: Option<String>,
    pub new_ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Vec<String>,
    pub nic_name: String,
    pub disconnect_nic_first: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CloneResult {
    pub success: bool,
    pub message: String,
    pub new_vm_moref: Option<String>,
    pub new_vmx_path: Option<String>,
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_configured: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_message: Option<String>,
}

/// Entry point spawned by the HTTP handler. Never returns an error —
/// failures are written into the task row instead (spec.md §7's background
/// propagation policy).
pub async fn run(state: &AppState, task_id: &str, host: Host, vm: VirtualMachine, input: CloneInput) {
    let prefix = format!("[{}->{}]", vm.name, input.new_name);
    match execute(state, task_id, &prefix, &host, &vm, &input).await {
        Ok(result) => {
            update_task(
                state,
                task_id,
                TaskStatus::Success,
                100,
                &result.message,
                Some(serde_json::to_value(&result).unwrap_or(Value::Null)),
            )
            .await;
        }
        Err(err) => {
            let message = prefixed(&prefix, &err.to_string());
            tracing::error!(task_id, error = %err, "clone task failed");
            update_task(state, task_id, TaskStatus::Failed, 100, &message, None).await;
        }
    }
}

async fn execute(
    state: &AppState,
    task_id: &str,
    prefix: &str,
    host: &Host,
    vm: &VirtualMachine,
    input: &CloneInput,
) -> Result<CloneResult> {
    let (username, password) = reconcile::resolve_credentials(
        &state.config,
        None,
        Some((host.username.clone(), state.secrets.reveal(&host.secret))),
    )?;

    // --- Connect (5%) ---
    progress(state, task_id, 5, &prefixed(prefix, "connecting to hypervisor")).await;
    let client = VsphereClient::connect(&host.address, &username, &password, host.port as u16).await?;
    let mut guard = SessionGuard::new(client);
    let result = run_phases(state, task_id, prefix, &guard, host, vm, input).await;
    guard.release().await;
    result
}

async fn run_phases(
    state: &AppState,
    task_id: &str,
    prefix: &str,
    guard: &SessionGuard,
    host: &Host,
    vm: &VirtualMachine,
    input: &CloneInput,
) -> Result<CloneResult> {
    let client = guard.get();
    let descriptor = VmDescriptor::by_instance_uuid(vm.instance_uuid.clone());
    let source_moref = client.find_vm(&descriptor).await?;

    let current_state = client.power_state(&source_moref).await?;
    if current_state == esxi_client::PowerState::PoweredOn {
        return Err(AppError::Validation(
            "source VM must be powered off before cloning".to_string(),
        ));
    }

    // --- Prepare Target (10%) ---
    progress(state, task_id, 10, &prefixed(prefix, "preparing target directory")).await;
    let (source_ds, source_rel) = parse_datastore_path(&vm.config_path)?;
    let source_dir = parent_dir(&source_rel);
    let target_ds = input.target_datastore.clone().unwrap_or_else(|| source_ds.clone());
    let target_dir = format!("{} {}", bracket(&target_ds), input.new_name);
    let topology = client.topology().await?;

    client
        .delete_path(&topology.datacenter_moref, &target_dir, DELETE_DEADLINE)
        .await?;

    // --- Create Dir (15%) ---
    progress(state, task_id, 15, &prefixed(prefix, "creating target directory")).await;
    client.make_directory(&topology.datacenter_moref, &target_dir).await?;

    // --- Copy Disks (30%) ---
    progress(state, task_id, 30, &prefixed(prefix, "copying virtual disks")).await;
    let disks = client.virtual_disks(&source_moref).await?;
    for disk in &disks {
        let dest = format!("{target_dir}/{}", basename(&disk.backing_file));
        client
            .copy_virtual_disk(&topology.datacenter_moref, &disk.backing_file, &dest, DISK_DEADLINE)
            .await?;
    }

    // --- Copy Configs (50%) ---
    progress(state, task_id, 50, &prefixed(prefix, "copying configuration files")).await;
    let source_base = basename(&source_rel);
    let source_stem = strip_extension(&source_base);
    let new_vmx_path = format!("{target_dir}/{}.vmx", input.new_name);
    client
        .copy_file(
            &topology.datacenter_moref,
            &vm.config_path,
            &new_vmx_path,
            true,
            CONFIG_DEADLINE,
        )
        .await?;

    let source_nvram = format!("{} {source_dir}/{source_stem}.nvram", bracket(&source_ds));
    let dest_nvram = format!("{target_dir}/{}.nvram", input.new_name);
    if let Err(err) = client
        .copy_file(&topology.datacenter_moref, &source_nvram, &dest_nvram, true, CONFIG_DEADLINE)
        .await
    {
        tracing::debug!(error = %err, "no nvram file to copy, continuing");
    }

    let source_vmxf = format!("{} {source_dir}/{source_stem}.vmxf", bracket(&source_ds));
    let dest_vmxf = format!("{target_dir}/{}.vmxf", input.new_name);
    if let Err(err) = client
        .copy_file(&topology.datacenter_moref, &source_vmxf, &dest_vmxf, true, CONFIG_DEADLINE)
        .await
    {
        tracing::debug!(error = %err, "no vmxf file to copy, continuing");
    }

    // --- Register (65%) ---
    progress(state, task_id, 65, &prefixed(prefix, "registering new VM")).await;
    let new_moref = client
        .register_vm(
            &new_vmx_path,
            &input.new_name,
            &topology.vm_folder_moref,
            &topology.resource_pool_moref,
            &topology.host_moref,
            REGISTER_DEADLINE,
        )
        .await?;

    // --- Reset Identity (70%), log + continue on failure ---
    progress(state, task_id, 70, &prefixed(prefix, "resetting VM identity")).await;
    let ethernet_devices = client.ethernet_devices(&new_moref).await.unwrap_or_default();
    if let Err(err) = client
        .reset_identity(&new_moref, &ethernet_devices, input.disconnect_nic_first, IDENTITY_DEADLINE)
        .await
    {
        tracing::warn!(vm = new_moref, error = %err, "identity reset failed, continuing");
    }

    let mut message = prefixed(prefix, "clone completed");
    let mut ip_configured = None;
    let mut ip_message = None;

    // --- Power On (82-85%) ---
    if input.power_on {
        progress(state, task_id, 82, &prefixed(prefix, "powering on new VM")).await;
        let task_moref = client.power_on_task(&new_moref).await?;
        client
            .wait_for_power_task_with_questions(&new_moref, &task_moref, "power-on", POWER_ON_DEADLINE)
            .await?;

        progress(state, task_id, 85, &prefixed(prefix, "powered on, resyncing host")).await;
        if let Err(err) = reconcile::reconcile_host(state, host.id).await {
            tracing::warn!(host_id = host.id, error = %err, "intermediate reconcile after power-on failed");
        }

        if let Err(err) = client
            .wait_for_tools_running(&new_moref, TOOLS_AFTER_POWER_ON_DEADLINE)
            .await
        {
            tracing::warn!(vm = new_moref, error = %err, "guest tools not ready in time");
            message = prefixed(prefix, "clone completed, tools not ready");
        }

        // --- Configure Guest IP (85->90%) ---
        if input.auto_config_ip {
            progress(state, task_id, 88, &prefixed(prefix, "configuring guest IP")).await;
            match configure_guest_ip(client, &new_moref, input).await {
                Ok(outcome) => {
                    ip_configured = Some(outcome.success);
                    ip_message = Some(outcome.message.clone());
                    if !outcome.success {
                        message = format!("{message} [IP config failed: {}]", outcome.message);
                    }
                }
                Err(err) => {
                    ip_configured = Some(false);
                    ip_message = Some(err.to_string());
                    message = format!("{message} [IP config failed: {err}]");
                }
            }
            progress(state, task_id, 90, &prefixed(prefix, "guest IP step complete")).await;
        }
    }

    // --- Reconnect NIC, always, log + continue ---
    if let Err(err) = client
        .reconnect_nics(&new_moref, &ethernet_devices, IDENTITY_DEADLINE)
        .await
    {
        tracing::warn!(vm = new_moref, error = %err, "NIC reconnect failed, continuing");
    }

    // --- Final Reconcile, best-effort ---
    if let Err(err) = reconcile::reconcile_host(state, host.id).await {
        tracing::warn!(host_id = host.id, error = %err, "final reconcile after clone failed");
    }

    Ok(CloneResult {
        success: true,
        message,
        new_vm_moref: Some(new_moref),
        new_vmx_path: Some(new_vmx_path),
        source_ip: input.source_ip.clone(),
        ip_configured,
        ip_message,
    })
}

async fn configure_guest_ip(
    client: &VsphereClient,
    vm_moref: &str,
    input: &CloneInput,
) -> Result<guest_ip::IpConfigOutcome> {
    if client.wait_for_tools_running(vm_moref, TOOLS_BEFORE_IP_DEADLINE).await.is_err() {
        return Ok(guest_ip::IpConfigOutcome {
            success: false,
            message: "guest tools not ready before IP configuration".to_string(),
        });
    }
    let guest_username = input
        .guest_username
        .as_deref()
        .ok_or_else(|| AppError::Validation("guest_username required for auto_config_ip".to_string()))?;
    let guest_password = input
        .guest_password
        .as_deref()
        .ok_or_else(|| AppError::Validation("guest_password required for auto_config_ip".to_string()))?;
    let new_ip = input
        .new_ip
        .as_deref()
        .ok_or_else(|| AppError::Validation("new_ip required for auto_config_ip".to_string()))?;
    let netmask = input
        .netmask
        .as_deref()
        .ok_or_else(|| AppError::Validation("netmask required for auto_config_ip".to_string()))?;

    let req = IpConfigRequest {
        nic: &input.nic_name,
        ip: new_ip,
        netmask,
        gateway: input.gateway.as_deref(),
        dns: &input.dns,
    };
    guest_ip::configure(client, vm_moref, guest_username, guest_password, &req).await
}

async fn progress(state: &AppState, task_id: &str, percent: i32, message: &str) {
    update_task(state, task_id, TaskStatus::Running, percent, message, None).await;
}

async fn update_task(state: &AppState, task_id: &str, status: TaskStatus, percent: i32, message: &str, result: Option<Value>) {
    let Ok(mut conn) = state.conn() else {
        tracing::error!(task_id, "clone: failed to acquire DB connection for progress update");
        return;
    };
    let task_id = task_id.to_string();
    let message = message.to_string();
    let _ = tokio::task::spawn_blocking(move || {
        TaskRow::update(
            &mut conn,
            &task_id,
            TaskUpdate {
                status: Some(status),
                progress: Some(percent),
                message: Some(message),
                result,
            },
        )
    })
    .await;
}

fn prefixed(prefix: &str, message: &str) -> String {
    if message.starts_with(prefix) {
        message.to_string()
    } else {
        format!("{prefix} {message}")
    }
}

fn bracket(datastore: &str) -> String {
    format!("[{datastore}]")
}

/// Parse `[datastore] relative/path.ext` into `(datastore, relative/path.ext)`.
fn parse_datastore_path(full: &str) -> Result<(String, String)> {
    let full = full.trim();
    if !full.starts_with('[') {
        return Err(AppError::Internal(format!("malformed datastore path: {full}")));
    }
    let close = full
        .find(']')
        .ok_or_else(|| AppError::Internal(format!("malformed datastore path: {full}")))?;
    let datastore = full[1..close].to_string();
    let rel = full[close + 1..].trim().to_string();
    Ok((datastore, rel))
}

fn parent_dir(rel_path: &str) -> String {
    match rel_path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn strip_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_datastore_path() {
        let (ds, rel) = parse_datastore_path("[datastore1] web-01/web-01.vmx").unwrap();
        assert_eq!(ds, "datastore1");
        assert_eq!(rel, "web-01/web-01.vmx");
    }

    #[test]
    fn rejects_path_without_brackets() {
        assert!(parse_datastore_path("web-01/web-01.vmx").is_err());
    }

    #[test]
    fn parent_dir_of_nested_path() {
        assert_eq!(parent_dir("web-01/web-01.vmx"), "web-01");
        assert_eq!(parent_dir("web-01.vmx"), "");
    }

    #[test]
    fn basename_strips_directory() {
        assert_eq!(basename("[datastore1] web-01/web-01-flat.vmdk"), "web-01-flat.vmdk");
    }

    #[test]
    fn strip_extension_keeps_stem() {
        assert_eq!(strip_extension("web-01.vmx"), "web-01");
        assert_eq!(strip_extension("no-extension"), "no-extension");
    }

    #[test]
    fn prefixed_message_is_idempotent() {
        let prefix = "[a->b]";
        let once = prefixed(prefix, "hello");
        let twice = prefixed(prefix, &once);
        assert_eq!(once, twice);
    }
}
