use axum::Json;
use axum::extract::State;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppState;
use crate::error::Result;
use crate::schema::datastores;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = datastores)]
pub struct Datastore {
    pub url: String,
    pub name: String,
    pub kind: String,
    pub capacity_gb: f64,
    pub free_gb: f64,
    pub last_sync: NaiveDateTime,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Stats {
    pub total_count: i64,
    pub total_capacity_gb: f64,
    pub total_free_gb: f64,
}

impl Datastore {
    /// Upserted on every host sync that touches it (spec.md §3).
    pub fn upsert(conn: &mut SqliteConnection, facts: &esxi_client::DatastoreFacts) -> Result<()> {
        let now = Utc::now().naive_utc();
        diesel::insert_into(datastores::table)
            .values((
                datastores::url.eq(&facts.url),
                datastores::name.eq(&facts.name),
                datastores::kind.eq(&facts.kind),
                datastores::capacity_gb.eq(facts.capacity_gb),
                datastores::free_gb.eq(facts.free_gb),
                datastores::last_sync.eq(now),
            ))
            .on_conflict(datastores::url)
            .do_update()
            .set((
                datastores::name.eq(&facts.name),
                datastores::kind.eq(&facts.kind),
                datastores::capacity_gb.eq(facts.capacity_gb),
                datastores::free_gb.eq(facts.free_gb),
                datastores::last_sync.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn stats(conn: &mut SqliteConnection) -> Result<Stats> {
        let total_count: i64 = datastores::table.count().get_result(conn)?;
        let total_capacity_gb: Option<f64> = datastores::table
            .select(diesel::dsl::sum(datastores::capacity_gb))
            .first(conn)?;
        let total_free_gb: Option<f64> = datastores::table
            .select(diesel::dsl::sum(datastores::free_gb))
            .first(conn)?;
        Ok(Stats {
            total_count,
            total_capacity_gb: total_capacity_gb.unwrap_or(0.0),
            total_free_gb: total_free_gb.unwrap_or(0.0),
        })
    }
}

/// Fleet-wide datastore rollup (spec.md §6 `GET
/// /virtualization/datastores/stats`).
#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Datastore rollup", body = Stats))
)]
async fn datastore_stats(State(state): State<AppState>) -> Result<Json<Stats>> {
    let mut conn = state.conn()?;
    let stats = tokio::task::spawn_blocking(move || Datastore::stats(&mut conn)).await??;
    Ok(Json(stats))
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(datastore_stats))
}
