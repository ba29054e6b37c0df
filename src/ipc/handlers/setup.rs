use crate::calc::{self, GradeWeights};
use crate::db;
use crate::ipc::helpers::{resolve_viewer, require_admin, with_conn, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Attendance,
    Analytics,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "attendance" => Some(Self::Attendance),
            "analytics" => Some(Self::Analytics),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Attendance => "setup.attendance",
            Self::Analytics => "setup.analytics",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => {
            let w = GradeWeights::default();
            json!({
                "writtenWork": w.written_work,
                "performanceTask": w.performance_task,
                "quarterlyAssessment": w.quarterly_assessment
            })
        }
        SetupSection::Attendance => json!({
            "presentCode": "P",
            "absentCode": "A",
            "lateCode": "L",
            "excusedCode": "E",
            "countLateAsPresent": true
        }),
        SetupSection::Analytics => json!({
            "topStudentCount": 10,
            "includeInactiveStudents": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_fraction(v: &Value, key: &str) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(0.0..=1.0).contains(&n) {
        return Err(format!("{} must be between 0 and 1", key));
    }
    Ok(n)
}

fn parse_code(v: &Value, key: &str) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let mut chars = s.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(c.to_ascii_uppercase().to_string()),
        _ => Err(format!("{} must be a single letter", key)),
    }
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "writtenWork" | "performanceTask" | "quarterlyAssessment" => {
                    obj.insert(k.clone(), Value::from(parse_fraction(v, k)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "presentCode" | "absentCode" | "lateCode" | "excusedCode" => {
                    obj.insert(k.clone(), Value::String(parse_code(v, k)?));
                }
                "countLateAsPresent" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Analytics => match k.as_str() {
                "topStudentCount" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
                }
                "includeInactiveStudents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown analytics field: {}", k)),
            },
        }
    }

    // Cross-field checks run on the merged result.
    match section {
        SetupSection::Grading => {
            calc::parse_grade_weights(current).map_err(|e| e.message)?;
        }
        SetupSection::Attendance => {
            let mut codes: Vec<&str> = ["presentCode", "absentCode", "lateCode", "excusedCode"]
                .iter()
                .filter_map(|k| current.get(*k).and_then(|v| v.as_str()))
                .collect();
            codes.sort_unstable();
            let before = codes.len();
            codes.dedup();
            if codes.len() != before {
                return Err("attendance codes must be distinct".into());
            }
        }
        SetupSection::Analytics => {}
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a stale saved value falls back to defaults.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            } else {
                tracing::warn!(key = section.key(), "ignoring invalid saved settings");
            }
        }
    }
    Ok(current)
}

/// Weights configured for the workspace, or the built-in 25/50/25.
pub fn load_grade_weights(conn: &Connection) -> Result<GradeWeights, HandlerErr> {
    let section = load_section(conn, SetupSection::Grading).map_err(HandlerErr::query_failed)?;
    Ok(calc::parse_grade_weights(&section)?)
}

#[derive(Debug, Clone)]
pub struct AttendanceCodes {
    pub present: char,
    pub absent: char,
    pub late: char,
    pub excused: char,
    pub count_late_as_present: bool,
}

impl AttendanceCodes {
    pub fn contains(&self, c: char) -> bool {
        c == self.present || c == self.absent || c == self.late || c == self.excused
    }
}

fn first_char(section: &Value, key: &str, fallback: char) -> char {
    section
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.chars().next())
        .unwrap_or(fallback)
}

pub fn load_attendance_codes(conn: &Connection) -> Result<AttendanceCodes, HandlerErr> {
    let section = load_section(conn, SetupSection::Attendance).map_err(HandlerErr::query_failed)?;
    Ok(AttendanceCodes {
        present: first_char(&section, "presentCode", 'P'),
        absent: first_char(&section, "absentCode", 'A'),
        late: first_char(&section, "lateCode", 'L'),
        excused: first_char(&section, "excusedCode", 'E'),
        count_late_as_present: section
            .get("countLateAsPresent")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
    })
}

pub struct AnalyticsSettings {
    pub top_student_count: usize,
    pub include_inactive_students: bool,
}

pub fn load_analytics_settings(conn: &Connection) -> Result<AnalyticsSettings, HandlerErr> {
    let section = load_section(conn, SetupSection::Analytics).map_err(HandlerErr::query_failed)?;
    Ok(AnalyticsSettings {
        top_student_count: section
            .get("topStudentCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(10) as usize,
        include_inactive_students: section
            .get("includeInactiveStudents")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

fn setup_get(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut out = Map::new();
    for (name, section) in [
        ("grading", SetupSection::Grading),
        ("attendance", SetupSection::Attendance),
        ("analytics", SetupSection::Analytics),
    ] {
        let v = load_section(conn, section).map_err(HandlerErr::query_failed)?;
        out.insert(name.to_string(), v);
    }
    Ok(Value::Object(out))
}

fn setup_update(conn: &Connection, params: &Value) -> HandlerResult {
    let viewer = resolve_viewer(conn, params)?;
    require_admin(&viewer)?;
    let Some(section_raw) = params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_section(conn, section).map_err(HandlerErr::query_failed)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(section = section.key(), user = %viewer.user_id, "settings updated");
    Ok(json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_conn(state, req, setup_get)),
        "setup.update" => Some(with_conn(state, req, setup_update)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_defaults_are_national_formula() {
        let conn = db::open_in_memory().expect("open");
        let w = load_grade_weights(&conn).ok().expect("weights");
        assert_eq!(w, GradeWeights::default());
    }

    #[test]
    fn grading_patch_must_keep_sum_at_one() {
        let mut current = default_section(SetupSection::Grading);
        let patch = json!({ "writtenWork": 0.30 });
        let e = merge_section_patch(
            SetupSection::Grading,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect_err("sum 1.05");
        assert!(e.contains("sum to 1.0"), "{}", e);

        let mut current = default_section(SetupSection::Grading);
        let patch = json!({ "writtenWork": 0.30, "quarterlyAssessment": 0.20 });
        merge_section_patch(
            SetupSection::Grading,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("valid patch");
        assert_eq!(current["writtenWork"].as_f64(), Some(0.30));
    }

    #[test]
    fn attendance_codes_are_single_distinct_letters() {
        let mut current = default_section(SetupSection::Attendance);
        let patch = json!({ "lateCode": "t" });
        merge_section_patch(
            SetupSection::Attendance,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("lowercase accepted");
        assert_eq!(current["lateCode"].as_str(), Some("T"));

        let clash = json!({ "absentCode": "P" });
        assert!(merge_section_patch(
            SetupSection::Attendance,
            &mut default_section(SetupSection::Attendance),
            clash.as_object().expect("object"),
        )
        .is_err());
        let long = json!({ "absentCode": "AB" });
        assert!(merge_section_patch(
            SetupSection::Attendance,
            &mut default_section(SetupSection::Attendance),
            long.as_object().expect("object"),
        )
        .is_err());
    }
}
