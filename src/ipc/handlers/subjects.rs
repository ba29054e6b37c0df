use crate::db;
use crate::ipc::helpers::{
    get_optional_str, resolve_viewer, require_admin, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;

fn subjects_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let year_level = get_optional_str(params, "yearLevel")?;
    let all = db::load_subjects(conn).map_err(HandlerErr::query_failed)?;

    let subjects = match year_level.as_deref() {
        Some(yl) => viewer.visible_subjects(&all, yl),
        None if viewer.is_admin() => all,
        None => return Err(HandlerErr::bad_params("missing yearLevel")),
    };
    Ok(json!({ "yearLevel": year_level, "subjects": subjects }))
}

fn subjects_set(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;
    let Some(raw) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };

    let mut names: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for v in raw {
        let Some(name) = v.as_str() else {
            return Err(HandlerErr::bad_params("subjects must contain only strings"));
        };
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            names.push(trimmed.to_string());
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM subjects", [])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    for (i, name) in names.iter().enumerate() {
        tx.execute(
            "INSERT INTO subjects(name, sort_order) VALUES(?, ?)",
            (name, i as i64),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "subjects" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "count": names.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "subjects.set" => Some(with_conn(state, req, subjects_set)),
        _ => None,
    }
}
