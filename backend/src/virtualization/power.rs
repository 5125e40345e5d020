//! Maps the abstract power actions of spec.md §4.6 onto the hypervisor
//! client, answering question prompts during power-on the same way the
//! clone orchestrator does. Runs synchronously inside the request handler
//! (no task row) — the worst case is a 600s hard power-off/reset wait, the
//! same tradeoff the system this was distilled from makes.

use std::time::Duration;

use esxi_client::{SessionGuard, VmDescriptor, VsphereClient};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::AppState;
use crate::error::{AppError, Result};
use crate::host::model::Host;
use crate::virtualization::reconcile;
use crate::virtualization::vm::model::VirtualMachine;

const POWER_ON_DEADLINE: Duration = Duration::from_secs(60);
const HARD_OP_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize, ToSchema)]
pub struct PowerResult {
    pub status: String,
    pub message: String,
}

/// Execute one power action against the VM identified by its composite id.
pub async fn execute(state: &AppState, vm_id: &str, action: &str) -> Result<PowerResult> {
    let mut conn = state.conn()?;
    let vm_id_owned = vm_id.to_string();
    let vm = tokio::task::spawn_blocking(move || VirtualMachine::get(&mut conn, &vm_id_owned)).await??;

    let mut conn = state.conn()?;
    let host_address = vm.host_address.clone();
    let host = tokio::task::spawn_blocking(move || Host::get_by_address(&mut conn, &host_address)).await??;

    let (username, password) = reconcile::resolve_credentials(
        &state.config,
        None,
        Some((host.username.clone(), state.secrets.reveal(&host.secret))),
    )?;

    let client = VsphereClient::connect(&host.address, &username, &password, host.port as u16).await?;
    let guard = SessionGuard::new(client);

    let result = run_action(&guard, &vm, action).await;

    let mut guard = guard;
    guard.release().await;

    // Best-effort resync regardless of outcome (spec.md §4.6's "after any
    // action, best-effort reconcile").
    if let Err(err) = reconcile::reconcile_host(state, host.id).await {
        tracing::warn!(host_id = host.id, error = %err, "post-power-action reconcile failed");
    }

    result
}

async fn run_action(guard: &SessionGuard, vm: &VirtualMachine, action: &str) -> Result<PowerResult> {
    let client = guard.get();
    let descriptor = VmDescriptor::by_instance_uuid(vm.instance_uuid.clone());
    let vm_moref = client.find_vm(&descriptor).await?;
    let current_state = client.power_state(&vm_moref).await?;

    match action.to_lowercase().as_str() {
        "poweron" | "on" | "start" => {
            if current_state == esxi_client::PowerState::PoweredOn {
                return Ok(success("virtual machine already on"));
            }
            let task_moref = client.power_on_task(&vm_moref).await?;
            client
                .wait_for_power_task_with_questions(&vm_moref, &task_moref, "power-on", POWER_ON_DEADLINE)
                .await?;
            Ok(success("powered on"))
        }
        "shutdown" | "shutdownguest" | "guestshutdown" => {
            if current_state == esxi_client::PowerState::PoweredOff {
                return Ok(success("virtual machine already off"));
            }
            client
                .shutdown_guest(&vm_moref)
                .await
                .map_err(|err| AppError::Validation(format!("check guest tools: {err}")))?;
            Ok(success("soft shutdown requested (depends on guest tools)"))
        }
        "poweroff" | "off" | "halt" => {
            if current_state == esxi_client::PowerState::PoweredOff {
                return Ok(success("virtual machine already off"));
            }
            client.power_off_task(&vm_moref, HARD_OP_DEADLINE).await?;
            Ok(success("hard power-off executed"))
        }
        "reboot" | "rebootguest" => match client.reboot_guest(&vm_moref).await {
            Ok(()) => Ok(success("soft reboot requested (depends on guest tools)")),
            Err(err) => {
                tracing::warn!(vm = vm.id, error = %err, "soft reboot failed, falling back to hard reset");
                client.reset_task(&vm_moref, HARD_OP_DEADLINE).await?;
                Ok(success("soft reboot failed, hard reset executed"))
            }
        },
        "reset" | "hardreset" => {
            client.reset_task(&vm_moref, HARD_OP_DEADLINE).await?;
            Ok(success("hard reset executed"))
        }
        other => Err(AppError::Validation(format!("unsupported power action: {other}"))),
    }
}

fn success(message: &str) -> PowerResult {
    PowerResult {
        status: "success".to_string(),
        message: message.to_string(),
    }
}
