use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::schema::credentials;

/// A named guest-credential preset (spec.md §3). Never auto-applied — a
/// caller always references one explicitly by id.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = credentials)]
pub struct Credential {
    pub id: i32,
    pub alias: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = credentials)]
struct NewCredential<'a> {
    alias: &'a str,
    username: &'a str,
    secret: &'a str,
    description: Option<&'a str>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl Credential {
    pub fn create(
        conn: &mut SqliteConnection,
        alias: &str,
        username: &str,
        sealed_secret: &str,
        description: Option<&str>,
    ) -> Result<Credential> {
        let now = Utc::now().naive_utc();
        let new = NewCredential {
            alias,
            username,
            secret: sealed_secret,
            description,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(credentials::table)
            .values(&new)
            .execute(conn)?;
        let id: i32 = credentials::table
            .order(credentials::id.desc())
            .select(credentials::id)
            .first(conn)?;
        Credential::get(conn, id)
    }

    pub fn get(conn: &mut SqliteConnection, id: i32) -> Result<Credential> {
        credentials::table
            .filter(credentials::id.eq(id))
            .select(Credential::as_select())
            .first(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    AppError::NotFound(format!("credential {id} not found"))
                }
                other => other.into(),
            })
    }

    pub fn list(conn: &mut SqliteConnection) -> Result<Vec<Credential>> {
        let rows = credentials::table
            .order(credentials::id.asc())
            .select(Credential::as_select())
            .load(conn)?;
        Ok(rows)
    }

    pub fn delete(conn: &mut SqliteConnection, id: i32) -> Result<()> {
        Credential::get(conn, id)?;
        diesel::delete(credentials::table.filter(credentials::id.eq(id))).execute(conn)?;
        Ok(())
    }
}
