use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{AppError, Result};
use crate::schema::tasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = tasks)]
pub struct TaskRow {
    pub id: String,
    pub kind: String,
    pub target_id: Option<String>,
    #[diesel(column_name = status)]
    status_raw: String,
    pub progress: i32,
    pub message: String,
    result_raw: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TaskRow {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status_raw)
    }

    pub fn result(&self) -> Option<Value> {
        self.result_raw
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
struct NewTask {
    id: String,
    kind: String,
    target_id: Option<String>,
    status: String,
    progress: i32,
    message: String,
    result: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

/// 128-bit random hex string, per spec.md §3's "opaque random string" task id.
pub fn generate_task_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub result: Option<Value>,
}

impl TaskRow {
    pub fn create(
        conn: &mut SqliteConnection,
        kind: &str,
        target_id: Option<String>,
        message: &str,
    ) -> Result<TaskRow> {
        let now = Utc::now().naive_utc();
        let new = NewTask {
            id: generate_task_id(),
            kind: kind.to_string(),
            target_id,
            status: TaskStatus::Pending.as_str().to_string(),
            progress: 0,
            message: message.to_string(),
            result: None,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(tasks::table)
            .values(&new)
            .execute(conn)?;
        TaskRow::get(conn, &new.id)
    }

    pub fn get(conn: &mut SqliteConnection, id: &str) -> Result<TaskRow> {
        tasks::table
            .filter(tasks::id.eq(id))
            .select(TaskRow::as_select())
            .first(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    AppError::NotFound(format!("task {id} not found"))
                }
                other => other.into(),
            })
    }

    /// Partial patch. Progress is only ever raised here by callers that
    /// already hold the monotone-non-decreasing contract (single writer
    /// per task, see spec.md §5).
    pub fn update(conn: &mut SqliteConnection, id: &str, patch: TaskUpdate) -> Result<TaskRow> {
        let now = Utc::now().naive_utc();
        conn.transaction(|conn| {
            let mut row = TaskRow::get(conn, id)?;
            if let Some(status) = patch.status {
                row.status_raw = status.as_str().to_string();
            }
            if let Some(progress) = patch.progress {
                row.progress = progress;
            }
            if let Some(message) = patch.message {
                row.message = message;
            }
            if let Some(result) = patch.result {
                row.result_raw = Some(result.to_string());
            }
            diesel::update(tasks::table.filter(tasks::id.eq(id)))
                .set((
                    tasks::status.eq(&row.status_raw),
                    tasks::progress.eq(row.progress),
                    tasks::message.eq(&row.message),
                    tasks::result.eq(&row.result_raw),
                    tasks::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok(())
        })?;
        TaskRow::get(conn, id)
    }

    pub fn list(
        conn: &mut SqliteConnection,
        status: Option<&str>,
        kind: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<TaskRow>> {
        let mut query = tasks::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(tasks::status.eq(status.to_string()));
        }
        if let Some(kind) = kind {
            query = query.filter(tasks::kind.eq(kind.to_string()));
        }
        let offset = (page.max(1) - 1) * page_size.max(1);
        let rows = query
            .order(tasks::created_at.desc())
            .limit(page_size.max(1))
            .offset(offset)
            .select(TaskRow::as_select())
            .load(conn)?;
        Ok(rows)
    }
}
