use crate::db::{self, StudentRow};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, load_student_required, resolve_viewer,
    require_admin, scoped_student_candidates, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{is_junior_high, is_known_year_level, is_senior_high};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

/// Year level / strand pairing rules applied on every write.
fn validate_placement(year_level: &str, section: &str, strand: Option<&str>) -> Result<(), HandlerErr> {
    if !is_known_year_level(year_level) {
        return Err(HandlerErr::bad_params("yearLevel must be one of 7..12")
            .with_details(json!({ "yearLevel": year_level })));
    }
    if section.is_empty() {
        return Err(HandlerErr::bad_params("section must not be empty"));
    }
    if is_junior_high(year_level) && strand.is_some() {
        return Err(HandlerErr::bad_params("junior high students cannot carry a strand"));
    }
    if is_senior_high(year_level) && strand.is_none() {
        return Err(HandlerErr::bad_params("senior high students require a strand"));
    }
    Ok(())
}

fn normalize_strand(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_ascii_uppercase()).filter(|s| !s.is_empty())
}

fn map_write_err(e: rusqlite::Error, code: &str, lrn: Option<&str>) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return HandlerErr::new("conflict", "a student with this LRN already exists")
                .with_details(json!({ "lrn": lrn }));
        }
    }
    HandlerErr::new(code, e.to_string()).with_details(json!({ "table": "students" }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let year_level = get_optional_str(params, "yearLevel")?;
    let section = get_optional_str(params, "section")?;
    let include_inactive = get_optional_bool(params, "includeInactive")?.unwrap_or(false);

    let all = scoped_student_candidates(conn, &viewer)?;
    let narrowed: Vec<StudentRow> = all
        .into_iter()
        .filter(|s| include_inactive || s.active)
        .filter(|s| year_level.as_deref().map(|y| s.year_level == y).unwrap_or(true))
        .filter(|s| section.as_deref().map(|x| s.section == x).unwrap_or(true))
        .collect();
    let visible = viewer.visible(&narrowed);
    Ok(json!({ "students": visible }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;

    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let year_level = get_required_str(params, "yearLevel")?;
    let section = get_required_str(params, "section")?;
    let strand = normalize_strand(get_optional_str(params, "strand")?);
    let lrn = get_optional_str(params, "lrn")?;
    let active = get_optional_bool(params, "active")?.unwrap_or(true);
    validate_placement(&year_level, &section, strand.as_deref())?;

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE year_level = ? AND section = ?",
            (&year_level, &section),
            |r| r.get(0),
        )
        .map_err(HandlerErr::query_failed)?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, lrn, last_name, first_name, year_level, section, strand, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &lrn,
            &last_name,
            &first_name,
            &year_level,
            &section,
            &strand,
            active as i64,
            next_sort,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| map_write_err(e, "db_insert_failed", lrn.as_deref()))?;
    tracing::info!(student = %student_id, year_level = %year_level, section = %section, "student created");
    Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut s = load_student_required(conn, &student_id)?;
    for key in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match key.as_str() {
            "lastName" => s.last_name = get_required_str(patch, key)?,
            "firstName" => s.first_name = get_required_str(patch, key)?,
            "yearLevel" => s.year_level = get_required_str(patch, key)?,
            "section" => s.section = get_required_str(patch, key)?,
            "strand" => s.strand = normalize_strand(get_optional_str(patch, key)?),
            "lrn" => s.lrn = get_optional_str(patch, key)?,
            "active" => {
                s.active = get_optional_bool(patch, key)?
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown student field: {}", other)))
            }
        }
    }
    validate_placement(&s.year_level, &s.section, s.strand.as_deref())?;

    conn.execute(
        "UPDATE students SET
           lrn = ?, last_name = ?, first_name = ?, year_level = ?, section = ?, strand = ?,
           active = ?, updated_at = ?
         WHERE id = ?",
        (
            &s.lrn,
            &s.last_name,
            &s.first_name,
            &s.year_level,
            &s.section,
            &s.strand,
            s.active as i64,
            db::now_timestamp(),
            &student_id,
        ),
    )
    .map_err(|e| map_write_err(e, "db_update_failed", s.lrn.as_deref()))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;
    let student_id = get_required_str(params, "studentId")?;
    let n = conn
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    tracing::info!(student = %student_id, "student deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
