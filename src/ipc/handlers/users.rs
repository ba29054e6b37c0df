use crate::db;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, resolve_viewer, require_admin, with_conn, HandlerErr,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{is_junior_high, is_known_year_level, Assignment, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn user_count(conn: &Connection) -> Result<i64, HandlerErr> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(HandlerErr::query_failed)
}

fn users_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;

    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.display_name, u.role,
                    (SELECT COUNT(*) FROM assignments a WHERE a.user_id = u.id)
             FROM users u
             ORDER BY u.display_name",
        )
        .map_err(HandlerErr::query_failed)?;
    let users: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
                "assignmentCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;
    Ok(json!({ "users": users }))
}

/// The first user may be created without an acting admin; every later change
/// needs one.
fn users_upsert(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let bootstrap = user_count(conn)? == 0;
    if !bootstrap {
        let viewer = resolve_viewer(conn, params)?;
        require_admin(&viewer)?;
    }

    let display_name = get_required_str(params, "displayName")?;
    let role_raw = get_required_str(params, "role")?;
    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerErr::bad_params("role must be one of: admin, advisor")
            .with_details(json!({ "role": role_raw })));
    };
    if bootstrap && role != Role::Admin {
        return Err(HandlerErr::bad_params("the first user must be an admin"));
    }

    let target_id = get_optional_str(params, "targetUserId")?
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO users(id, display_name, role) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           display_name = excluded.display_name,
           role = excluded.role",
        (&target_id, &display_name, role.as_str()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "users" }))
    })?;
    if role == Role::Admin {
        // Admins are unscoped; stale assignment rows would only confuse listings.
        conn.execute("DELETE FROM assignments WHERE user_id = ?", [&target_id])
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    }
    tracing::info!(target_user = %target_id, role = role.as_str(), "user saved");
    Ok(json!({ "userId": target_id }))
}

fn users_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;
    let target_id = get_required_str(params, "targetUserId")?;
    if target_id == viewer.user_id {
        return Err(HandlerErr::bad_params("cannot delete the acting user"));
    }
    let n = conn
        .execute("DELETE FROM users WHERE id = ?", [&target_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    Ok(json!({ "ok": true }))
}

fn assignments_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let target_id = get_optional_str(params, "targetUserId")?.unwrap_or_else(|| viewer.user_id.clone());
    if target_id != viewer.user_id {
        require_admin(&viewer)?;
    }
    let exists = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&target_id], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(HandlerErr::query_failed)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    let assignments = db::load_assignments(conn, &target_id).map_err(HandlerErr::query_failed)?;
    Ok(json!({ "userId": target_id, "assignments": assignments }))
}

fn parse_assignment(raw: &serde_json::Value, idx: usize) -> Result<Assignment, HandlerErr> {
    let bad = |msg: &str| HandlerErr::bad_params(msg.to_string()).with_details(json!({ "index": idx }));

    let mut a: Assignment =
        serde_json::from_value(raw.clone()).map_err(|e| bad(&format!("invalid assignment: {}", e)))?;
    a.year_level = a.year_level.trim().to_string();
    a.section = a.section.trim().to_string();
    a.strand = a
        .strand
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty());
    if !is_known_year_level(&a.year_level) {
        return Err(bad("yearLevel must be one of 7..12"));
    }
    if a.section.is_empty() {
        return Err(bad("section must not be empty"));
    }
    if is_junior_high(&a.year_level) && a.strand.is_some() {
        return Err(bad("junior high assignments cannot carry a strand"));
    }
    if let Some(subjects) = a.subjects.as_mut() {
        subjects.iter_mut().for_each(|s| *s = s.trim().to_string());
        subjects.retain(|s| !s.is_empty());
    }
    Ok(a)
}

fn assignments_set(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;
    let target_id = get_required_str(params, "targetUserId")?;
    let Some(target) = db::load_viewer(conn, &target_id).map_err(HandlerErr::query_failed)? else {
        return Err(HandlerErr::new("not_found", "user not found"));
    };
    if target.is_admin() {
        return Err(HandlerErr::bad_params("admins are not scoped by assignments"));
    }
    let Some(raw) = params.get("assignments").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("assignments must be an array"));
    };
    let parsed = raw
        .iter()
        .enumerate()
        .map(|(i, v)| parse_assignment(v, i))
        .collect::<Result<Vec<_>, _>>()?;

    db::replace_assignments(conn, &target_id, &parsed)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(target_user = %target_id, count = parsed.len(), "assignments replaced");
    Ok(json!({ "ok": true, "count": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(with_conn(state, req, users_list)),
        "users.upsert" => Some(with_conn(state, req, users_upsert)),
        "users.delete" => Some(with_conn(state, req, users_delete)),
        "assignments.list" => Some(with_conn(state, req, assignments_list)),
        "assignments.set" => Some(with_conn(state, req, assignments_set)),
        _ => None,
    }
}
