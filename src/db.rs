use crate::scope::{Assignment, Role, ScopedRecord, Viewer};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            year_level TEXT NOT NULL,
            section TEXT NOT NULL,
            strand TEXT,
            subjects_json TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_user ON assignments(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            lrn TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            year_level TEXT NOT NULL,
            section TEXT NOT NULL,
            strand TEXT,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_students_lrn ON students(lrn) WHERE lrn IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_scope ON students(year_level, section, sort_order)",
        [],
    )?;
    // Older workspaces predate updated_at.
    ensure_students_updated_at(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            name TEXT PRIMARY KEY COLLATE NOCASE,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            quarter INTEGER NOT NULL,
            written_work REAL,
            performance_task REAL,
            quarterly_assessment REAL,
            final_grade REAL NOT NULL,
            remark TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            UNIQUE(student_id, subject, quarter)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_student_months(
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            day_codes TEXT NOT NULL,
            PRIMARY KEY(student_id, month),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_month ON attendance_student_months(month)",
        [],
    )?;

    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub lrn: Option<String>,
    pub last_name: String,
    pub first_name: String,
    pub display_name: String,
    pub year_level: String,
    pub section: String,
    pub strand: Option<String>,
    pub active: bool,
    pub sort_order: i64,
    pub updated_at: Option<String>,
}

impl ScopedRecord for StudentRow {
    fn year_level(&self) -> &str {
        &self.year_level
    }
    fn section(&self) -> &str {
        &self.section
    }
    fn strand(&self) -> Option<&str> {
        self.strand.as_deref()
    }
}

const STUDENT_COLUMNS: &str =
    "id, lrn, last_name, first_name, year_level, section, strand, active, sort_order, updated_at";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(StudentRow {
        id: r.get(0)?,
        lrn: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        last_name: last,
        first_name: first,
        year_level: r.get(4)?,
        section: r.get(5)?,
        strand: r.get(6)?,
        active: r.get::<_, i64>(7)? != 0,
        sort_order: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

/// Students ordered by year level, section, then roster order.
pub fn load_students(conn: &Connection) -> anyhow::Result<Vec<StudentRow>> {
    let sql = format!(
        "SELECT {} FROM students
         ORDER BY CAST(year_level AS INTEGER), section, sort_order",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_students_in_section(
    conn: &Connection,
    year_level: &str,
    section: &str,
) -> anyhow::Result<Vec<StudentRow>> {
    let sql = format!(
        "SELECT {} FROM students
         WHERE year_level = ? AND section = ?
         ORDER BY sort_order",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((year_level, section), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<StudentRow>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    Ok(conn.query_row(&sql, [student_id], student_from_row).optional()?)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub id: String,
    pub student_id: String,
    pub display_name: String,
    pub year_level: String,
    pub section: String,
    pub strand: Option<String>,
    pub subject: String,
    pub quarter: i64,
    pub written_work: Option<f64>,
    pub performance_task: Option<f64>,
    pub quarterly_assessment: Option<f64>,
    pub final_grade: f64,
    pub remark: String,
    pub updated_at: Option<String>,
}

impl ScopedRecord for GradeRow {
    fn year_level(&self) -> &str {
        &self.year_level
    }
    fn section(&self) -> &str {
        &self.section
    }
    fn strand(&self) -> Option<&str> {
        self.strand.as_deref()
    }
}

fn grade_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GradeRow> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(GradeRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        display_name: format!("{}, {}", last, first),
        year_level: r.get(4)?,
        section: r.get(5)?,
        strand: r.get(6)?,
        subject: r.get(7)?,
        quarter: r.get(8)?,
        written_work: r.get(9)?,
        performance_task: r.get(10)?,
        quarterly_assessment: r.get(11)?,
        final_grade: r.get(12)?,
        remark: r.get(13)?,
        updated_at: r.get(14)?,
    })
}

/// Grade rows joined with their student's scope columns.
pub fn load_grades(conn: &Connection, student_id: Option<&str>) -> anyhow::Result<Vec<GradeRow>> {
    let base = "SELECT g.id, g.student_id, s.last_name, s.first_name, s.year_level, s.section,
                s.strand, g.subject, g.quarter, g.written_work, g.performance_task,
                g.quarterly_assessment, g.final_grade, g.remark, g.updated_at
         FROM grades g
         JOIN students s ON s.id = g.student_id";
    let order = "ORDER BY CAST(s.year_level AS INTEGER), s.section, s.sort_order, g.subject, g.quarter";
    let rows = match student_id {
        Some(id) => {
            let sql = format!("{} WHERE g.student_id = ? {}", base, order);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([id], grade_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!("{} {}", base, order);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], grade_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn load_subjects(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM subjects ORDER BY sort_order, name")?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_assignments(conn: &Connection, user_id: &str) -> anyhow::Result<Vec<Assignment>> {
    let mut stmt = conn.prepare(
        "SELECT year_level, section, strand, subjects_json
         FROM assignments
         WHERE user_id = ?
         ORDER BY sort_order",
    )?;
    let raw = stmt
        .query_map([user_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(raw.len());
    for (year_level, section, strand, subjects_json) in raw {
        let subjects = match subjects_json {
            Some(text) => Some(serde_json::from_str::<Vec<String>>(&text)?),
            None => None,
        };
        out.push(Assignment {
            year_level,
            section,
            strand,
            subjects,
        });
    }
    Ok(out)
}

pub fn replace_assignments(
    conn: &Connection,
    user_id: &str,
    assignments: &[Assignment],
) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM assignments WHERE user_id = ?", [user_id])?;
    for (i, a) in assignments.iter().enumerate() {
        let subjects_json = match &a.subjects {
            Some(subs) => Some(serde_json::to_string(subs)?),
            None => None,
        };
        tx.execute(
            "INSERT INTO assignments(id, user_id, year_level, section, strand, subjects_json, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                uuid::Uuid::new_v4().to_string(),
                user_id,
                &a.year_level,
                &a.section,
                &a.strand,
                &subjects_json,
                i as i64,
            ),
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Resolves the authorization context for a user, or None if the user is
/// unknown.
pub fn load_viewer(conn: &Connection, user_id: &str) -> anyhow::Result<Option<Viewer>> {
    let role_raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?;
    let Some(role_raw) = role_raw else {
        return Ok(None);
    };
    let role = Role::parse(&role_raw)
        .ok_or_else(|| anyhow::anyhow!("user {} has unknown role {}", user_id, role_raw))?;
    let assignments = match role {
        Role::Admin => Vec::new(),
        Role::Advisor => load_assignments(conn, user_id)?,
    };
    Ok(Some(Viewer {
        user_id: user_id.to_string(),
        role,
        assignments,
    }))
}
