use crate::calc::{self, ComponentScores, GradeWeights, RemarkBand};
use crate::db::{self, GradeRow, StudentRow};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::load_grade_weights;
use crate::ipc::helpers::{
    get_optional_quarter, get_optional_str, get_required_quarter, get_required_str,
    load_student_required, require_access, resolve_viewer, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::Viewer;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

const GRADES_BULK_MAX_ENTRIES: usize = 2000;

fn grade_json(final_grade: f64) -> serde_json::Value {
    let band = calc::remark_for(final_grade);
    json!({
        "finalGrade": final_grade,
        "remark": band.as_str(),
        "remarkLabel": band.label(),
        "passed": band.passed(),
    })
}

/// Pure calculation. Uses explicit `weights` when given, otherwise the
/// workspace configuration, otherwise the built-in formula.
fn handle_grades_compute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let scores = match calc::parse_component_scores(req.params.get("scores")) {
        Ok(s) => s,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let weights = match req.params.get("weights").filter(|v| !v.is_null()) {
        Some(raw) => match calc::parse_grade_weights(raw) {
            Ok(w) => w,
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        },
        None => match state.db.as_ref() {
            Some(conn) => match load_grade_weights(conn) {
                Ok(w) => w,
                Err(e) => return e.response(&req.id),
            },
            None => GradeWeights::default(),
        },
    };
    let final_grade = calc::compute_final_grade(&scores, &weights);
    let mut result = grade_json(final_grade);
    result["weights"] = json!(weights);
    ok(&req.id, result)
}

fn canonical_subject(conn: &Connection, subject: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT name FROM subjects WHERE name = ?", [subject], |r| {
        r.get::<_, String>(0)
    })
    .optional()
    .map_err(HandlerErr::query_failed)?
    .ok_or_else(|| {
        HandlerErr::new("not_found", "subject not found").with_details(json!({ "subject": subject }))
    })
}

fn require_grade_access(viewer: &Viewer, student: &StudentRow, subject: &str) -> Result<(), HandlerErr> {
    require_access(viewer, student)?;
    if viewer.can_grade(student, subject) {
        return Ok(());
    }
    Err(HandlerErr::new("forbidden", "subject is not in your assignments")
        .with_details(json!({ "subject": subject })))
}

fn upsert_grade(
    conn: &Connection,
    student_id: &str,
    subject: &str,
    quarter: i64,
    scores: &ComponentScores,
    final_grade: f64,
    band: RemarkBand,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO grades(id, student_id, subject, quarter, written_work, performance_task,
                            quarterly_assessment, final_grade, remark, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject, quarter) DO UPDATE SET
           written_work = excluded.written_work,
           performance_task = excluded.performance_task,
           quarterly_assessment = excluded.quarterly_assessment,
           final_grade = excluded.final_grade,
           remark = excluded.remark,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            subject,
            quarter,
            scores.written_work,
            scores.performance_task,
            scores.quarterly_assessment,
            final_grade,
            band.as_str(),
            db::now_timestamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "grades" }))
    })?;
    Ok(())
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let quarter = get_optional_quarter(params)?;
    let subject = get_optional_str(params, "subject")?;
    let year_level = get_optional_str(params, "yearLevel")?;
    let section = get_optional_str(params, "section")?;
    let student_id = get_optional_str(params, "studentId")?;

    let all = db::load_grades(conn, student_id.as_deref()).map_err(HandlerErr::query_failed)?;
    let narrowed: Vec<GradeRow> = all
        .into_iter()
        .filter(|g| quarter.map(|q| g.quarter == q).unwrap_or(true))
        .filter(|g| {
            subject
                .as_deref()
                .map(|s| g.subject.eq_ignore_ascii_case(s))
                .unwrap_or(true)
        })
        .filter(|g| year_level.as_deref().map(|y| g.year_level == y).unwrap_or(true))
        .filter(|g| section.as_deref().map(|x| g.section == x).unwrap_or(true))
        .collect();
    let visible = viewer.visible(&narrowed);
    Ok(json!({ "grades": visible }))
}

fn grades_upsert(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let subject = canonical_subject(conn, &get_required_str(params, "subject")?)?;
    let quarter = get_required_quarter(params)?;
    let scores = calc::parse_component_scores(params.get("scores"))?;

    let student = load_student_required(conn, &student_id)?;
    require_grade_access(&viewer, &student, &subject)?;

    let weights = load_grade_weights(conn)?;
    let final_grade = calc::compute_final_grade(&scores, &weights);
    let band = calc::remark_for(final_grade);
    upsert_grade(conn, &student_id, &subject, quarter, &scores, final_grade, band)?;
    tracing::debug!(student = %student_id, subject = %subject, quarter, final_grade, "grade saved");

    let mut result = grade_json(final_grade);
    result["studentId"] = json!(student_id);
    result["subject"] = json!(subject);
    result["quarter"] = json!(quarter);
    Ok(result)
}

/// One subject + quarter for many students in a single transaction. Rows the
/// viewer cannot touch are reported back instead of failing the batch.
fn grades_bulk_upsert(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let subject = canonical_subject(conn, &get_required_str(params, "subject")?)?;
    let quarter = get_required_quarter(params)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("entries must be an array"));
    };
    if entries.len() > GRADES_BULK_MAX_ENTRIES {
        return Err(HandlerErr::bad_params("too many entries").with_details(json!({
            "count": entries.len(),
            "max": GRADES_BULK_MAX_ENTRIES
        })));
    }
    let weights = load_grade_weights(conn)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut updated: Vec<serde_json::Value> = Vec::new();
    let mut rejected: Vec<serde_json::Value> = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let outcome = (|| -> Result<(String, f64), HandlerErr> {
            let student_id = get_required_str(entry, "studentId")?;
            let scores = calc::parse_component_scores(entry.get("scores"))?;
            let student = load_student_required(&tx, &student_id)?;
            require_grade_access(&viewer, &student, &subject)?;
            let final_grade = calc::compute_final_grade(&scores, &weights);
            upsert_grade(
                &tx,
                &student_id,
                &subject,
                quarter,
                &scores,
                final_grade,
                calc::remark_for(final_grade),
            )?;
            Ok((student_id, final_grade))
        })();
        match outcome {
            Ok((student_id, final_grade)) => {
                let mut row = grade_json(final_grade);
                row["studentId"] = json!(student_id);
                updated.push(row);
            }
            Err(e) => rejected.push(json!({
                "index": idx,
                "studentId": entry.get("studentId"),
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(
        subject = %subject,
        quarter,
        updated = updated.len(),
        rejected = rejected.len(),
        "bulk grade upsert"
    );
    Ok(json!({
        "subject": subject,
        "quarter": quarter,
        "updated": updated,
        "rejected": rejected
    }))
}

/// Report card view: quarter grades per subject, subject finals, and the
/// general average.
fn grades_student_report(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let student = load_student_required(conn, &student_id)?;
    require_access(&viewer, &student)?;

    let grades = db::load_grades(conn, Some(&student_id)).map_err(HandlerErr::query_failed)?;
    let mut by_subject: BTreeMap<String, [Option<f64>; 4]> = BTreeMap::new();
    for g in &grades {
        let slot = by_subject.entry(g.subject.clone()).or_insert([None; 4]);
        if let Some(q) = usize::try_from(g.quarter - 1).ok().filter(|i| *i < 4) {
            slot[q] = Some(g.final_grade);
        }
    }

    let mut finals: Vec<f64> = Vec::new();
    let subjects: Vec<serde_json::Value> = by_subject
        .iter()
        .map(|(name, quarters)| {
            let final_grade = calc::quarter_average(quarters);
            if let Some(f) = final_grade {
                finals.push(f);
            }
            json!({
                "subject": name,
                "quarters": quarters,
                "finalGrade": final_grade,
                "remark": final_grade.map(|f| calc::remark_for(f).as_str()),
            })
        })
        .collect();
    let general = calc::general_average(&finals);

    Ok(json!({
        "student": student,
        "subjects": subjects,
        "generalAverage": general,
        "remark": general.map(|g| calc::remark_for(g).as_str()),
        "remarkLabel": general.map(|g| calc::remark_for(g).label()),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.compute" => Some(handle_grades_compute(state, req)),
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "grades.upsert" => Some(with_conn(state, req, grades_upsert)),
        "grades.bulkUpsert" => Some(with_conn(state, req, grades_bulk_upsert)),
        "grades.studentReport" => Some(with_conn(state, req, grades_student_report)),
        _ => None,
    }
}
