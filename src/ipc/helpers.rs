use crate::calc::CalcError;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scope::{dedup_by_key, ScopedRecord, Viewer};
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn query_failed(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerErr>;

/// Runs a handler body that needs an open workspace and wraps the outcome in
/// the response envelope.
pub fn with_conn<F>(state: &mut AppState, req: &Request, body: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> HandlerResult,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match body(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => {
            tracing::debug!(method = %req.method, code = %e.code, "request rejected: {}", e.message);
            e.response(&req.id)
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_optional_quarter(params: &serde_json::Value) -> Result<Option<i64>, HandlerErr> {
    match params.get("quarter") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let q = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params("quarter must be an integer"))?;
            if !(1..=4).contains(&q) {
                return Err(HandlerErr::bad_params("quarter must be between 1 and 4")
                    .with_details(json!({ "quarter": q })));
            }
            Ok(Some(q))
        }
    }
}

pub fn get_required_quarter(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    get_optional_quarter(params)?.ok_or_else(|| HandlerErr::bad_params("missing quarter"))
}

/// Resolves `params.userId` into the request's authorization context.
pub fn resolve_viewer(conn: &Connection, params: &serde_json::Value) -> Result<Viewer, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    db::load_viewer(conn, &user_id)
        .map_err(HandlerErr::query_failed)?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "user not found").with_details(json!({ "userId": user_id }))
        })
}

pub fn require_admin(viewer: &Viewer) -> Result<(), HandlerErr> {
    if viewer.is_admin() {
        return Ok(());
    }
    Err(HandlerErr::new("forbidden", "administrator role required")
        .with_details(json!({ "userId": viewer.user_id })))
}

pub fn require_access<R: ScopedRecord + ?Sized>(viewer: &Viewer, record: &R) -> Result<(), HandlerErr> {
    if viewer.can_access(record) {
        return Ok(());
    }
    Err(HandlerErr::new("forbidden", "record is outside your assignments").with_details(json!({
        "yearLevel": record.year_level(),
        "section": record.section(),
        "strand": record.strand(),
    })))
}

pub fn load_student_required(conn: &Connection, student_id: &str) -> Result<db::StudentRow, HandlerErr> {
    db::load_student(conn, student_id)
        .map_err(HandlerErr::query_failed)?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id }))
        })
}

/// Candidate students for a viewer before scope filtering. Advisors are
/// served by one section query per assignment; overlapping sections are
/// merged by student id.
pub fn scoped_student_candidates(conn: &Connection, viewer: &Viewer) -> Result<Vec<db::StudentRow>, HandlerErr> {
    if viewer.is_admin() {
        return db::load_students(conn).map_err(HandlerErr::query_failed);
    }
    let mut merged: Vec<db::StudentRow> = Vec::new();
    for a in &viewer.assignments {
        let rows = db::load_students_in_section(conn, &a.year_level, &a.section)
            .map_err(HandlerErr::query_failed)?;
        merged.extend(rows);
    }
    Ok(dedup_by_key(merged, |s| s.id.clone()))
}
