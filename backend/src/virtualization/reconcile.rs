//! Full-sync reconciliation: one host at a time, per spec.md §4.2's eight
//! step algorithm. This is the system's single `Reconcile(host)` primitive
//! (spec.md §9) — the sync endpoint, enrollment, and every mutating
//! workflow's post-op refresh all call into `reconcile_host` rather than
//! re-deriving rollup fields themselves.

use std::collections::HashSet;

use diesel::connection::Connection;
use esxi_client::VsphereClient;

use crate::config::{AppState, Config};
use crate::error::{AppError, Result};
use crate::host::model::Host;
use crate::virtualization::datastore::Datastore;
use crate::virtualization::vm::model::VirtualMachine;

/// Credential resolution order shared by every entry point that talks to a
/// hypervisor: an explicit per-call override always wins, then a stored
/// credential, then the process-wide environment default. Missing
/// credentials after all three steps is an `AuthKind` error, never a panic
/// (spec.md §4.1 [ADD]).
pub fn resolve_credentials(
    config: &Config,
    override_cred: Option<(String, String)>,
    stored: Option<(String, String)>,
) -> Result<(String, String)> {
    override_cred
        .or(stored)
        .or_else(|| config.default_credentials())
        .ok_or_else(|| AppError::Auth("missing hypervisor credentials".to_string()))
}

/// Sync one host, or every enrolled host when `host_id` is `None`
/// (spec.md §6 `POST /virtualization/sync`).
pub async fn sync_hosts(state: &AppState, host_id: Option<i32>) -> Result<()> {
    let ids = match host_id {
        Some(id) => vec![id],
        None => {
            let mut conn = state.conn()?;
            tokio::task::spawn_blocking(move || -> Result<Vec<i32>> {
                Ok(Host::list(&mut conn)?.into_iter().map(|h| h.id).collect())
            })
            .await??
        }
    };
    for id in ids {
        if let Err(err) = reconcile_host(state, id).await {
            tracing::warn!(host_id = id, error = %err, "host sync failed");
        }
    }
    Ok(())
}

/// `reconcile(host) -> summary` (spec.md §4.2). A failed connection marks
/// the host offline and returns `Ok(())` rather than propagating an error —
/// only a missing host row or a DB failure is surfaced to the caller.
#[tracing::instrument(skip(state), fields(host_id))]
pub async fn reconcile_host(state: &AppState, host_id: i32) -> Result<()> {
    let mut conn = state.conn()?;
    let host = tokio::task::spawn_blocking(move || Host::get(&mut conn, host_id)).await??;

    let (username, password) = resolve_credentials(
        &state.config,
        None,
        Some((host.username.clone(), state.secrets.reveal(&host.secret))),
    )?;

    let client = match VsphereClient::connect(&host.address, &username, &password, host.port as u16).await {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(host = %host.address, error = %err, "reconcile: connect failed, marking offline");
            let mut conn = state.conn()?;
            tokio::task::spawn_blocking(move || Host::mark_status(&mut conn, host_id, "offline")).await??;
            return Ok(());
        }
    };
    let mut guard = esxi_client::SessionGuard::new(client);

    let mut conn = state.conn()?;
    tokio::task::spawn_blocking(move || Host::mark_online(&mut conn, host_id)).await??;

    let mut cpu_percent = 0.0;
    let mut memory_percent = 0.0;
    let mut core_count = 0i32;
    let mut total_memory_gb = 0.0;
    let mut storage_total_gb = 0.0;
    let mut storage_free_gb = 0.0;
    let mut datastore_facts = Vec::new();
    let mut vm_facts = Vec::new();

    match guard.get().topology().await {
        Ok(topology) => {
            match guard.get().host_facts(&topology).await {
                Ok(facts) => {
                    let cpu_denom = facts.cpu_mhz_per_core * facts.cpu_cores as f64;
                    cpu_percent = percent(facts.cpu_used_mhz, cpu_denom);
                    memory_percent = percent(facts.memory_used_bytes as f64, facts.memory_total_bytes as f64);
                    core_count = facts.cpu_cores as i32;
                    total_memory_gb = facts.memory_total_bytes as f64 / GIB;
                }
                Err(err) => tracing::warn!(host = %host.address, error = %err, "reconcile: host facts read failed"),
            }

            match guard.get().datastores(&topology.host_moref).await {
                Ok(datastores) => {
                    storage_total_gb = datastores.iter().map(|d| d.capacity_gb).sum();
                    storage_free_gb = datastores.iter().map(|d| d.free_gb).sum();
                    datastore_facts = datastores;
                }
                Err(err) => tracing::warn!(host = %host.address, error = %err, "reconcile: datastore read failed"),
            }

            match guard.get().virtual_machines(&topology.vm_folder_moref).await {
                Ok(vms) => vm_facts = vms,
                Err(err) => tracing::warn!(host = %host.address, error = %err, "reconcile: VM enumeration failed"),
            }
        }
        Err(err) => tracing::warn!(host = %host.address, error = %err, "reconcile: topology walk failed"),
    }

    guard.release().await;

    let host_address = host.address.clone();
    let mut pooled = state.conn()?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn: &mut diesel::SqliteConnection = &mut pooled;
        conn.transaction(|conn| -> Result<()> {
            for facts in &datastore_facts {
                Datastore::upsert(conn, facts)?;
            }
            let mut observed: HashSet<String> = HashSet::new();
            for facts in &vm_facts {
                observed.insert(VirtualMachine::composite_id(&host_address, &facts.instance_uuid));
                VirtualMachine::upsert(conn, &host_address, facts)?;
            }
            VirtualMachine::prune(conn, &host_address, &observed)?;
            Host::update_rollup(
                conn,
                host_id,
                host.hostname.as_deref(),
                host.version.as_deref(),
                host.model.as_deref(),
                cpu_percent,
                memory_percent,
                core_count,
                total_memory_gb,
                storage_total_gb,
                storage_free_gb,
            )?;
            Ok(())
        })
    })
    .await??;

    Ok(())
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// `round(used / total * 100, 2)`, 0 on divide-by-zero (spec.md §4.2 [ADD]).
fn percent(used: f64, total: f64) -> f64 {
    if total == 0.0 {
        return 0.0;
    }
    let pct = used / total * 100.0;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_divides_and_rounds() {
        assert_eq!(percent(333.0, 1000.0), 33.3);
    }

    #[test]
    fn percent_handles_divide_by_zero() {
        assert_eq!(percent(10.0, 0.0), 0.0);
    }

    #[test]
    fn resolve_credentials_prefers_override() {
        let config = test_config();
        let resolved = resolve_credentials(
            &config,
            Some(("a".to_string(), "b".to_string())),
            Some(("c".to_string(), "d".to_string())),
        )
        .unwrap();
        assert_eq!(resolved, ("a".to_string(), "b".to_string()));
    }

    #[test]
    fn resolve_credentials_falls_back_to_stored() {
        let config = test_config();
        let resolved = resolve_credentials(&config, None, Some(("c".to_string(), "d".to_string()))).unwrap();
        assert_eq!(resolved, ("c".to_string(), "d".to_string()));
    }

    #[test]
    fn resolve_credentials_fails_when_all_missing() {
        let config = test_config();
        assert!(resolve_credentials(&config, None, None).is_err());
    }

    fn test_config() -> Config {
        Config {
            database_url: ":memory:".to_string(),
            debug: false,
            db_pool_size: 1,
            app_host: "127.0.0.1".to_string(),
            app_port: 8000,
            cors_origins: Vec::new(),
            esxi_user: None,
            esxi_password: None,
            secret_key: "0123456789abcdef".to_string(),
        }
    }
}
