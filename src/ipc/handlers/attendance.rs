use crate::calc;
use crate::db::{self, StudentRow};
use crate::ipc::handlers::setup::{load_attendance_codes, AttendanceCodes};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, load_student_required, require_access, resolve_viewer,
    scoped_student_candidates, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::Viewer;
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

/// `YYYY-MM`; defaults to the current month when absent.
fn parse_month_key(raw: Option<String>) -> Result<(String, usize), HandlerErr> {
    let key = raw.unwrap_or_else(|| chrono::Local::now().format("%Y-%m").to_string());
    let first_day = NaiveDate::parse_from_str(&format!("{}-01", key), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("month must be YYYY-MM").with_details(json!({ "month": key })))?;
    Ok((first_day.format("%Y-%m").to_string(), days_in_month(first_day)))
}

fn days_in_month(first_day: NaiveDate) -> usize {
    let (y, m) = if first_day.month() == 12 {
        (first_day.year() + 1, 1)
    } else {
        (first_day.year(), first_day.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .map(|next| next.signed_duration_since(first_day).num_days() as usize)
        .unwrap_or(31)
}

fn normalize_day_codes(raw: &str, days: usize) -> String {
    let mut chars: Vec<char> = raw.chars().collect();
    if chars.len() < days {
        chars.extend(std::iter::repeat(' ').take(days - chars.len()));
    } else if chars.len() > days {
        chars.truncate(days);
    }
    chars.into_iter().collect()
}

fn patch_day_code(existing: &str, days: usize, day: usize, code: Option<char>) -> String {
    let mut chars: Vec<char> = normalize_day_codes(existing, days).chars().collect();
    let idx = day.saturating_sub(1);
    if idx < chars.len() {
        chars[idx] = code.unwrap_or(' ');
    }
    chars.into_iter().collect()
}

fn parse_day(params: &serde_json::Value, days: usize) -> Result<usize, HandlerErr> {
    let day = params
        .get("day")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing day"))? as usize;
    if day == 0 || day > days {
        return Err(HandlerErr::bad_params("day out of range for month")
            .with_details(json!({ "day": day, "daysInMonth": days })));
    }
    Ok(day)
}

fn parse_code(params: &serde_json::Value, codes: &AttendanceCodes) -> Result<Option<char>, HandlerErr> {
    let Some(s) = get_optional_str(params, "code")? else {
        return Ok(None);
    };
    let mut chars = s.chars();
    let c = chars.next().map(|c| c.to_ascii_uppercase());
    match (c, chars.next()) {
        (Some(c), None) if codes.contains(c) => Ok(Some(c)),
        _ => Err(HandlerErr::bad_params("unknown attendance code").with_details(json!({
            "code": s,
            "allowed": [
                codes.present.to_string(),
                codes.absent.to_string(),
                codes.late.to_string(),
                codes.excused.to_string()
            ]
        }))),
    }
}

fn load_month_codes(conn: &Connection, month_key: &str, days: usize) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT student_id, day_codes FROM attendance_student_months WHERE month = ?")
        .map_err(HandlerErr::query_failed)?;
    let rows = stmt
        .query_map([month_key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query_failed)?;
    Ok(rows
        .into_iter()
        .map(|(id, codes)| (id, normalize_day_codes(&codes, days)))
        .collect())
}

fn write_day_code(
    conn: &Connection,
    student_id: &str,
    month_key: &str,
    days: usize,
    day: usize,
    code: Option<char>,
) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT day_codes FROM attendance_student_months WHERE student_id = ? AND month = ?",
            (student_id, month_key),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query_failed)?;
    let patched = patch_day_code(existing.as_deref().unwrap_or(""), days, day, code);
    conn.execute(
        "INSERT INTO attendance_student_months(student_id, month, day_codes)
         VALUES(?, ?, ?)
         ON CONFLICT(student_id, month) DO UPDATE SET
           day_codes = excluded.day_codes",
        (student_id, month_key, &patched),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "attendance_student_months" }))
    })?;
    Ok(())
}

/// Active students the viewer may see, optionally narrowed to a section.
fn scoped_students(
    conn: &Connection,
    viewer: &Viewer,
    year_level: Option<&str>,
    section: Option<&str>,
) -> Result<Vec<StudentRow>, HandlerErr> {
    let all = scoped_student_candidates(conn, viewer)?;
    let narrowed: Vec<StudentRow> = all
        .into_iter()
        .filter(|s| s.active)
        .filter(|s| year_level.map(|y| s.year_level == y).unwrap_or(true))
        .filter(|s| section.map(|x| s.section == x).unwrap_or(true))
        .collect();
    Ok(viewer.visible(&narrowed))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
}

impl AttendanceTally {
    pub fn from_day_codes(day_codes: &str, codes: &AttendanceCodes) -> Self {
        let mut t = Self::default();
        for c in day_codes.chars() {
            if c == codes.present {
                t.present += 1;
            } else if c == codes.absent {
                t.absent += 1;
            } else if c == codes.late {
                t.late += 1;
            } else if c == codes.excused {
                t.excused += 1;
            }
        }
        t
    }

    pub fn merge(&mut self, other: &AttendanceTally) {
        self.present += other.present;
        self.absent += other.absent;
        self.late += other.late;
        self.excused += other.excused;
    }

    /// Percent of counted days attended; excused days are left out of the
    /// denominator.
    pub fn rate(&self, count_late_as_present: bool) -> Option<f64> {
        let attended = if count_late_as_present {
            self.present + self.late
        } else {
            self.present
        };
        let counted = self.present + self.absent + self.late;
        if counted == 0 {
            return None;
        }
        Some(calc::round_off_2_decimals(
            100.0 * (attended as f64) / (counted as f64),
        ))
    }
}

/// Per-student tallies for a month over the viewer's visible students.
pub fn month_tallies(
    conn: &Connection,
    viewer: &Viewer,
    year_level: Option<&str>,
    section: Option<&str>,
    month: Option<String>,
) -> Result<(String, Vec<(StudentRow, AttendanceTally)>), HandlerErr> {
    let (month_key, days) = parse_month_key(month)?;
    let codes = load_attendance_codes(conn)?;
    let students = scoped_students(conn, viewer, year_level, section)?;
    let by_student = load_month_codes(conn, &month_key, days)?;
    let rows = students
        .into_iter()
        .map(|s| {
            let tally = by_student
                .get(&s.id)
                .map(|dc| AttendanceTally::from_day_codes(dc, &codes))
                .unwrap_or_default();
            (s, tally)
        })
        .collect();
    Ok((month_key, rows))
}

fn attendance_month_open(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let year_level = get_required_str(params, "yearLevel")?;
    let section = get_required_str(params, "section")?;
    let (month_key, days) = parse_month_key(get_optional_str(params, "month")?)?;

    let students = scoped_students(conn, &viewer, Some(&year_level), Some(&section))?;
    let by_student = load_month_codes(conn, &month_key, days)?;
    let rows_json: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let day_codes = by_student
                .get(&s.id)
                .cloned()
                .unwrap_or_else(|| normalize_day_codes("", days));
            json!({
                "studentId": s.id,
                "displayName": s.display_name,
                "dayCodes": day_codes
            })
        })
        .collect();

    Ok(json!({
        "yearLevel": year_level,
        "section": section,
        "month": month_key,
        "daysInMonth": days,
        "rows": rows_json
    }))
}

fn attendance_set_student_day(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let (month_key, days) = parse_month_key(get_optional_str(params, "month")?)?;
    let day = parse_day(params, days)?;
    let codes = load_attendance_codes(conn)?;
    let code = parse_code(params, &codes)?;

    let student = load_student_required(conn, &student_id)?;
    require_access(&viewer, &student)?;
    write_day_code(conn, &student_id, &month_key, days, day, code)?;
    Ok(json!({ "ok": true, "month": month_key }))
}

fn attendance_bulk_stamp_day(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let (month_key, days) = parse_month_key(get_optional_str(params, "month")?)?;
    let day = parse_day(params, days)?;
    let codes = load_attendance_codes(conn)?;
    let code = parse_code(params, &codes)?;
    let Some(student_ids_json) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing studentIds"));
    };
    let student_ids: Vec<String> = student_ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut stamped = 0_usize;
    let mut skipped: Vec<String> = Vec::new();
    for student_id in student_ids {
        let student = db::load_student(&tx, &student_id).map_err(HandlerErr::query_failed)?;
        match student {
            Some(s) if viewer.can_access(&s) => {
                write_day_code(&tx, &student_id, &month_key, days, day, code)?;
                stamped += 1;
            }
            _ => skipped.push(student_id),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "stamped": stamped, "skipped": skipped }))
}

fn attendance_summary(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let year_level = get_optional_str(params, "yearLevel")?;
    let section = get_optional_str(params, "section")?;
    let codes = load_attendance_codes(conn)?;
    let (month_key, rows) = month_tallies(
        conn,
        &viewer,
        year_level.as_deref(),
        section.as_deref(),
        get_optional_str(params, "month")?,
    )?;

    let mut total = AttendanceTally::default();
    let rows_json: Vec<serde_json::Value> = rows
        .iter()
        .map(|(s, t)| {
            total.merge(t);
            json!({
                "studentId": s.id,
                "displayName": s.display_name,
                "yearLevel": s.year_level,
                "section": s.section,
                "tally": t,
                "rate": t.rate(codes.count_late_as_present)
            })
        })
        .collect();
    Ok(json!({
        "month": month_key,
        "rows": rows_json,
        "total": total,
        "rate": total.rate(codes.count_late_as_present)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.monthOpen" => Some(with_conn(state, req, attendance_month_open)),
        "attendance.setStudentDay" => Some(with_conn(state, req, attendance_set_student_day)),
        "attendance.bulkStampDay" => Some(with_conn(state, req, attendance_bulk_stamp_day)),
        "attendance.summary" => Some(with_conn(state, req, attendance_summary)),
        _ => None,
    }
}
