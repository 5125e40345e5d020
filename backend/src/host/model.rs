use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::Result;
use crate::schema::{hosts, virtual_machines};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = hosts)]
pub struct Host {
    pub id: i32,
    pub address: String,
    pub port: i32,
    pub username: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub description: Option<String>,
    pub sort_order: i32,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub model: Option<String>,
    pub last_sync: Option<NaiveDateTime>,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub core_count: i32,
    pub total_memory_gb: f64,
    pub storage_total_gb: f64,
    pub storage_free_gb: f64,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = hosts)]
pub struct NewHost<'a> {
    pub address: &'a str,
    pub port: i32,
    pub username: &'a str,
    pub secret: &'a str,
    pub description: Option<&'a str>,
}

impl Host {
    /// Enrolls (or re-enrolls) a host by address. Enrolling the same
    /// address twice updates the existing row rather than duplicating it
    /// (spec.md §8).
    pub fn upsert(conn: &mut SqliteConnection, new: &NewHost) -> Result<Host> {
        let existing: Option<Host> = hosts::table
            .filter(hosts::address.eq(new.address))
            .select(Host::as_select())
            .first(conn)
            .optional()?;

        if let Some(existing) = existing {
            diesel::update(hosts::table.filter(hosts::id.eq(existing.id)))
                .set((
                    hosts::port.eq(new.port),
                    hosts::username.eq(new.username),
                    hosts::secret.eq(new.secret),
                    hosts::description.eq(new.description),
                ))
                .execute(conn)?;
            Host::get(conn, existing.id)
        } else {
            let next_sort_order: i32 = hosts::table
                .select(diesel::dsl::max(hosts::sort_order))
                .first::<Option<i32>>(conn)?
                .map(|m| m + 1)
                .unwrap_or(0);
            diesel::insert_into(hosts::table)
                .values((
                    hosts::address.eq(new.address),
                    hosts::port.eq(new.port),
                    hosts::username.eq(new.username),
                    hosts::secret.eq(new.secret),
                    hosts::description.eq(new.description),
                    hosts::sort_order.eq(next_sort_order),
                    hosts::status.eq("offline"),
                ))
                .execute(conn)?;
            let id: i32 = hosts::table
                .filter(hosts::address.eq(new.address))
                .select(hosts::id)
                .first(conn)?;
            Host::get(conn, id)
        }
    }

    pub fn get(conn: &mut SqliteConnection, id: i32) -> Result<Host> {
        hosts::table
            .filter(hosts::id.eq(id))
            .select(Host::as_select())
            .first(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    crate::error::AppError::NotFound(format!("host {id} not found"))
                }
                other => other.into(),
            })
    }

    pub fn get_by_address(conn: &mut SqliteConnection, address: &str) -> Result<Host> {
        hosts::table
            .filter(hosts::address.eq(address))
            .select(Host::as_select())
            .first(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    crate::error::AppError::NotFound(format!("host {address} not found"))
                }
                other => other.into(),
            })
    }

    pub fn list(conn: &mut SqliteConnection) -> Result<Vec<Host>> {
        let rows = hosts::table
            .order((hosts::sort_order.asc(), hosts::id.asc()))
            .select(Host::as_select())
            .load(conn)?;
        Ok(rows)
    }

    pub fn mark_online(conn: &mut SqliteConnection, id: i32) -> Result<()> {
        diesel::update(hosts::table.filter(hosts::id.eq(id)))
            .set((
                hosts::status.eq("online"),
                hosts::last_sync.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn mark_status(conn: &mut SqliteConnection, id: i32, status: &str) -> Result<()> {
        diesel::update(hosts::table.filter(hosts::id.eq(id)))
            .set(hosts::status.eq(status))
            .execute(conn)?;
        Ok(())
    }

    pub fn update_rollup(
        conn: &mut SqliteConnection,
        id: i32,
        hostname: Option<&str>,
        version: Option<&str>,
        model: Option<&str>,
        cpu_percent: f64,
        memory_percent: f64,
        core_count: i32,
        total_memory_gb: f64,
        storage_total_gb: f64,
        storage_free_gb: f64,
    ) -> Result<()> {
        diesel::update(hosts::table.filter(hosts::id.eq(id)))
            .set((
                hosts::hostname.eq(hostname),
                hosts::version.eq(version),
                hosts::model.eq(model),
                hosts::cpu_percent.eq(cpu_percent),
                hosts::memory_percent.eq(memory_percent),
                hosts::core_count.eq(core_count),
                hosts::total_memory_gb.eq(total_memory_gb),
                hosts::storage_total_gb.eq(storage_total_gb),
                hosts::storage_free_gb.eq(storage_free_gb),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn update_fields(
        conn: &mut SqliteConnection,
        id: i32,
        address: Option<&str>,
        port: Option<i32>,
        username: Option<&str>,
        secret: Option<&str>,
        description: Option<Option<&str>>,
    ) -> Result<Host> {
        conn.transaction(|conn| {
            if let Some(address) = address {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::address.eq(address))
                    .execute(conn)?;
            }
            if let Some(port) = port {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::port.eq(port))
                    .execute(conn)?;
            }
            if let Some(username) = username {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::username.eq(username))
                    .execute(conn)?;
            }
            if let Some(secret) = secret {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::secret.eq(secret))
                    .execute(conn)?;
            }
            if let Some(description) = description {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::description.eq(description))
                    .execute(conn)?;
            }
            Ok::<_, crate::error::AppError>(())
        })?;
        Host::get(conn, id)
    }

    pub fn delete(conn: &mut SqliteConnection, id: i32) -> Result<()> {
        let host = Host::get(conn, id)?;
        conn.transaction(|conn| {
            diesel::delete(
                virtual_machines::table.filter(virtual_machines::host_address.eq(&host.address)),
            )
            .execute(conn)?;
            diesel::delete(hosts::table.filter(hosts::id.eq(id))).execute(conn)?;
            Ok::<_, diesel::result::Error>(())
        })?;
        Ok(())
    }

    /// Reorders a subset of hosts. Hosts named in `host_ids` take sort
    /// weights equal to their index in the list; hosts not named keep
    /// their prior relative order and are appended after (spec.md §6/§8).
    pub fn reorder(conn: &mut SqliteConnection, host_ids: &[i32]) -> Result<()> {
        conn.transaction(|conn| {
            let all = Host::list(conn)?;
            let remaining: Vec<i32> = all
                .iter()
                .map(|h| h.id)
                .filter(|id| !host_ids.contains(id))
                .collect();

            let mut next = 0i32;
            for id in host_ids {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::sort_order.eq(next))
                    .execute(conn)?;
                next += 1;
            }
            for id in remaining {
                diesel::update(hosts::table.filter(hosts::id.eq(id)))
                    .set(hosts::sort_order.eq(next))
                    .execute(conn)?;
                next += 1;
            }
            Ok::<_, diesel::result::Error>(())
        })?;
        Ok(())
    }

    pub fn vm_counts(conn: &mut SqliteConnection, address: &str) -> Result<(i64, i64)> {
        let total: i64 = virtual_machines::table
            .filter(virtual_machines::host_address.eq(address))
            .count()
            .get_result(conn)?;
        let running: i64 = virtual_machines::table
            .filter(virtual_machines::host_address.eq(address))
            .filter(virtual_machines::power_state.eq("poweredOn"))
            .count()
            .get_result(conn)?;
        Ok((total, running))
    }
}
