use std::collections::HashSet;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::schema::virtual_machines;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = virtual_machines)]
pub struct VirtualMachine {
    pub id: String,
    pub instance_uuid: String,
    pub name: String,
    pub host_address: String,
    pub power_state: String,
    pub primary_ip: Option<String>,
    pub guest_os: String,
    pub annotation: String,
    pub num_cpu: i32,
    pub memory_mb: i32,
    pub overall_cpu_mhz: i32,
    pub guest_memory_mb: i32,
    pub uptime_seconds: i64,
    pub committed_disk_gb: f64,
    pub provisioned_disk_gb: f64,
    pub tools_status: String,
    pub datastore_name: String,
    pub config_path: String,
    pub last_sync: NaiveDateTime,
}

impl VirtualMachine {
    /// Composite id, literal hyphen separator (spec.md §3/§8).
    pub fn composite_id(host_address: &str, instance_uuid: &str) -> String {
        format!("{host_address}-{instance_uuid}")
    }

    /// Upsert by composite id from freshly observed facts (spec.md §4.2
    /// step 6). Never touched except by the reconciler.
    pub fn upsert(conn: &mut SqliteConnection, host_address: &str, facts: &esxi_client::VmFacts) -> Result<()> {
        let id = Self::composite_id(host_address, &facts.instance_uuid);
        let now = Utc::now().naive_utc();
        diesel::insert_into(virtual_machines::table)
            .values((
                virtual_machines::id.eq(&id),
                virtual_machines::instance_uuid.eq(&facts.instance_uuid),
                virtual_machines::name.eq(&facts.name),
                virtual_machines::host_address.eq(host_address),
                virtual_machines::power_state.eq(power_state_str(facts.power_state)),
                virtual_machines::primary_ip.eq(&facts.primary_ip),
                virtual_machines::guest_os.eq(&facts.guest_os),
                virtual_machines::annotation.eq(&facts.annotation),
                virtual_machines::num_cpu.eq(facts.num_cpu as i32),
                virtual_machines::memory_mb.eq(facts.memory_mb as i32),
                virtual_machines::overall_cpu_mhz.eq(facts.overall_cpu_mhz as i32),
                virtual_machines::guest_memory_mb.eq(facts.guest_memory_mb as i32),
                virtual_machines::uptime_seconds.eq(facts.uptime_seconds as i64),
                virtual_machines::committed_disk_gb.eq(facts.committed_disk_gb),
                virtual_machines::provisioned_disk_gb.eq(facts.committed_disk_gb + facts.uncommitted_disk_gb),
                virtual_machines::tools_status.eq(&facts.tools_status),
                virtual_machines::datastore_name.eq(&facts.datastore_name),
                virtual_machines::config_path.eq(&facts.config_path),
                virtual_machines::last_sync.eq(now),
            ))
            .on_conflict(virtual_machines::id)
            .do_update()
            .set((
                virtual_machines::name.eq(&facts.name),
                virtual_machines::power_state.eq(power_state_str(facts.power_state)),
                virtual_machines::primary_ip.eq(&facts.primary_ip),
                virtual_machines::guest_os.eq(&facts.guest_os),
                virtual_machines::annotation.eq(&facts.annotation),
                virtual_machines::num_cpu.eq(facts.num_cpu as i32),
                virtual_machines::memory_mb.eq(facts.memory_mb as i32),
                virtual_machines::overall_cpu_mhz.eq(facts.overall_cpu_mhz as i32),
                virtual_machines::guest_memory_mb.eq(facts.guest_memory_mb as i32),
                virtual_machines::uptime_seconds.eq(facts.uptime_seconds as i64),
                virtual_machines::committed_disk_gb.eq(facts.committed_disk_gb),
                virtual_machines::provisioned_disk_gb.eq(facts.committed_disk_gb + facts.uncommitted_disk_gb),
                virtual_machines::tools_status.eq(&facts.tools_status),
                virtual_machines::datastore_name.eq(&facts.datastore_name),
                virtual_machines::config_path.eq(&facts.config_path),
                virtual_machines::last_sync.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// Delete every VM row for `host_address` whose id was not in this
    /// sync's observed set (spec.md §4.2 step 7, including the
    /// all-deleted-when-empty case).
    pub fn prune(conn: &mut SqliteConnection, host_address: &str, observed_ids: &HashSet<String>) -> Result<usize> {
        let existing: Vec<String> = virtual_machines::table
            .filter(virtual_machines::host_address.eq(host_address))
            .select(virtual_machines::id)
            .load(conn)?;
        let stale: Vec<String> = existing
            .into_iter()
            .filter(|id| !observed_ids.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let count = diesel::delete(virtual_machines::table.filter(virtual_machines::id.eq_any(&stale)))
            .execute(conn)?;
        Ok(count)
    }

    pub fn get(conn: &mut SqliteConnection, id: &str) -> Result<VirtualMachine> {
        virtual_machines::table
            .filter(virtual_machines::id.eq(id))
            .select(VirtualMachine::as_select())
            .first(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => AppError::NotFound(format!("vm {id} not found")),
                other => other.into(),
            })
    }

    pub fn list(
        conn: &mut SqliteConnection,
        host_address: Option<&str>,
        keyword: Option<&str>,
        status: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<VirtualMachine>, i64)> {
        let mut query = virtual_machines::table.into_boxed();
        let mut count_query = virtual_machines::table.into_boxed();
        if let Some(host_address) = host_address {
            query = query.filter(virtual_machines::host_address.eq(host_address.to_string()));
            count_query = count_query.filter(virtual_machines::host_address.eq(host_address.to_string()));
        }
        if let Some(keyword) = keyword {
            let pattern = format!("%{keyword}%");
            query = query.filter(
                virtual_machines::name
                    .like(pattern.clone())
                    .or(virtual_machines::primary_ip.like(pattern.clone())),
            );
            count_query = count_query.filter(
                virtual_machines::name
                    .like(pattern.clone())
                    .or(virtual_machines::primary_ip.like(pattern)),
            );
        }
        if let Some(status) = status {
            query = query.filter(virtual_machines::power_state.eq(status.to_string()));
            count_query = count_query.filter(virtual_machines::power_state.eq(status.to_string()));
        }
        let total: i64 = count_query.count().get_result(conn)?;
        let offset = (page.max(1) - 1) * page_size.max(1);
        let rows = query
            .order(virtual_machines::name.asc())
            .limit(page_size.max(1))
            .offset(offset)
            .select(VirtualMachine::as_select())
            .load(conn)?;
        Ok((rows, total))
    }

    /// Inline rename/annotate after hypervisor-side success (spec.md §3).
    pub fn update_basic_info(
        conn: &mut SqliteConnection,
        id: &str,
        name: Option<&str>,
        annotation: Option<&str>,
    ) -> Result<VirtualMachine> {
        let now = Utc::now().naive_utc();
        conn.transaction(|conn| {
            if let Some(name) = name {
                diesel::update(virtual_machines::table.filter(virtual_machines::id.eq(id)))
                    .set((virtual_machines::name.eq(name), virtual_machines::last_sync.eq(now)))
                    .execute(conn)?;
            }
            if let Some(annotation) = annotation {
                diesel::update(virtual_machines::table.filter(virtual_machines::id.eq(id)))
                    .set((
                        virtual_machines::annotation.eq(annotation),
                        virtual_machines::last_sync.eq(now),
                    ))
                    .execute(conn)?;
            }
            Ok::<_, diesel::result::Error>(())
        })?;
        VirtualMachine::get(conn, id)
    }

    pub fn set_power_state(conn: &mut SqliteConnection, id: &str, power_state: &str) -> Result<()> {
        diesel::update(virtual_machines::table.filter(virtual_machines::id.eq(id)))
            .set(virtual_machines::power_state.eq(power_state))
            .execute(conn)?;
        Ok(())
    }
}

/// Maps the hypervisor's power state through a fixed table (spec.md §4.2
/// step 6); unrecognized values already collapse to `Unknown` inside
/// `esxi_client::PowerState::from_raw`.
fn power_state_str(state: esxi_client::PowerState) -> &'static str {
    match state {
        esxi_client::PowerState::PoweredOn => "poweredOn",
        esxi_client::PowerState::PoweredOff => "poweredOff",
        esxi_client::PowerState::Suspended => "suspended",
        esxi_client::PowerState::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id_uses_literal_hyphen() {
        assert_eq!(
            VirtualMachine::composite_id("10.0.0.5", "abc-123"),
            "10.0.0.5-abc-123"
        );
    }
}
