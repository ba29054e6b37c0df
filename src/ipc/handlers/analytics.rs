use crate::calc::{self, RemarkDistribution};
use crate::db::{self, GradeRow, StudentRow};
use crate::ipc::handlers::attendance::{month_tallies, AttendanceTally};
use crate::ipc::handlers::setup::{load_analytics_settings, load_attendance_codes};
use crate::ipc::helpers::{
    get_optional_quarter, get_optional_str, resolve_viewer, scoped_student_candidates, with_conn,
    HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

fn year_level_sort_key(year_level: &str) -> (i64, String) {
    (
        year_level.trim().parse::<i64>().unwrap_or(i64::MAX),
        year_level.to_string(),
    )
}

fn enrollment_json(students: &[StudentRow]) -> serde_json::Value {
    let mut by_level: BTreeMap<(i64, String), BTreeMap<String, usize>> = BTreeMap::new();
    for s in students {
        *by_level
            .entry(year_level_sort_key(&s.year_level))
            .or_default()
            .entry(s.section.clone())
            .or_insert(0) += 1;
    }
    let levels: Vec<serde_json::Value> = by_level
        .into_iter()
        .map(|((_, year_level), sections)| {
            let count: usize = sections.values().sum();
            let sections_json: Vec<serde_json::Value> = sections
                .into_iter()
                .map(|(section, n)| json!({ "section": section, "count": n }))
                .collect();
            json!({
                "yearLevel": year_level,
                "count": count,
                "sections": sections_json
            })
        })
        .collect();
    json!({
        "totalStudents": students.len(),
        "byYearLevel": levels
    })
}

/// Ranks students by the mean of their visible grades; ties keep roster order.
fn top_students(grades: &[GradeRow], limit: usize) -> Vec<serde_json::Value> {
    let mut order: Vec<&str> = Vec::new();
    let mut sums: HashMap<&str, (String, f64, usize)> = HashMap::new();
    for g in grades {
        let entry = sums.entry(g.student_id.as_str()).or_insert_with(|| {
            order.push(g.student_id.as_str());
            (g.display_name.clone(), 0.0, 0)
        });
        entry.1 += g.final_grade;
        entry.2 += 1;
    }
    let mut ranked: Vec<(&str, String, f64)> = order
        .into_iter()
        .filter_map(|id| {
            sums.get(id).map(|(name, sum, n)| {
                (id, name.clone(), calc::round_off_2_decimals(*sum / (*n as f64)))
            })
        })
        .collect();
    ranked.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
    ranked
        .into_iter()
        .take(limit)
        .map(|(id, name, avg)| {
            json!({
                "studentId": id,
                "displayName": name,
                "average": avg,
                "remark": calc::remark_for(avg).as_str()
            })
        })
        .collect()
}

fn analytics_dashboard(conn: &rusqlite::Connection, params: &serde_json::Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    let quarter = get_optional_quarter(params)?;
    let subject = get_optional_str(params, "subject")?;
    let month = get_optional_str(params, "month")?;
    let settings = load_analytics_settings(conn)?;

    let all_students = scoped_student_candidates(conn, &viewer)?;
    let roster: Vec<StudentRow> = all_students
        .into_iter()
        .filter(|s| settings.include_inactive_students || s.active)
        .collect();
    let students = viewer.visible(&roster);

    let all_grades = db::load_grades(conn, None).map_err(HandlerErr::query_failed)?;
    let narrowed: Vec<GradeRow> = all_grades
        .into_iter()
        .filter(|g| quarter.map(|q| g.quarter == q).unwrap_or(true))
        .filter(|g| {
            subject
                .as_deref()
                .map(|s| g.subject.eq_ignore_ascii_case(s))
                .unwrap_or(true)
        })
        .collect();
    let grades = viewer.visible(&narrowed);

    let finals: Vec<f64> = grades.iter().map(|g| g.final_grade).collect();
    let distribution = RemarkDistribution::from_grades(finals.iter().copied());
    let average = calc::general_average(&finals);
    let pass_rate = if finals.is_empty() {
        None
    } else {
        let passed = finals
            .iter()
            .filter(|g| calc::remark_for(**g).passed())
            .count();
        Some(calc::round_off_2_decimals(
            100.0 * (passed as f64) / (finals.len() as f64),
        ))
    };

    let codes = load_attendance_codes(conn)?;
    let (month_key, tallies) = month_tallies(conn, &viewer, None, None, month)?;
    let mut attendance_total = AttendanceTally::default();
    for (_, t) in &tallies {
        attendance_total.merge(t);
    }

    tracing::debug!(
        user = %viewer.user_id,
        students = students.len(),
        grades = grades.len(),
        "dashboard computed"
    );

    Ok(json!({
        "filters": { "quarter": quarter, "subject": subject },
        "enrollment": enrollment_json(&students),
        "grades": {
            "count": distribution.total(),
            "average": average,
            "passRate": pass_rate,
            "remarkDistribution": distribution,
            "topStudents": top_students(&grades, settings.top_student_count)
        },
        "attendance": {
            "month": month_key,
            "total": attendance_total,
            "rate": attendance_total.rate(codes.count_late_as_present)
        }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.dashboard" => Some(with_conn(state, req, analytics_dashboard)),
        _ => None,
    }
}
