use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

const JUNIOR_HIGH_LEVELS: [&str; 4] = ["7", "8", "9", "10"];
const SENIOR_HIGH_LEVELS: [&str; 2] = ["11", "12"];

pub fn is_junior_high(year_level: &str) -> bool {
    JUNIOR_HIGH_LEVELS.contains(&year_level.trim())
}

pub fn is_senior_high(year_level: &str) -> bool {
    SENIOR_HIGH_LEVELS.contains(&year_level.trim())
}

pub fn is_known_year_level(year_level: &str) -> bool {
    is_junior_high(year_level) || is_senior_high(year_level)
}

/// Anything that lives in a year level + section (+ strand for senior high).
pub trait ScopedRecord {
    fn year_level(&self) -> &str;
    fn section(&self) -> &str;
    fn strand(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub year_level: String,
    pub section: String,
    #[serde(default)]
    pub strand: Option<String>,
    #[serde(default)]
    pub subjects: Option<Vec<String>>,
}

impl Assignment {
    /// Exact year level + section; a null strand on the assignment accepts any
    /// record strand, otherwise strands must be equal. A strand-less record
    /// (junior high) therefore only matches strand-less assignments.
    pub fn matches<R: ScopedRecord + ?Sized>(&self, record: &R) -> bool {
        if self.year_level != record.year_level() || self.section != record.section() {
            return false;
        }
        match self.strand.as_deref() {
            None => true,
            Some(strand) => record.strand() == Some(strand),
        }
    }
}

/// Union across assignments, input order kept. No assignments means nothing
/// is visible.
pub fn filter_by_assignments<T>(records: &[T], assignments: &[Assignment]) -> Vec<T>
where
    T: ScopedRecord + Clone,
{
    if assignments.is_empty() {
        return Vec::new();
    }
    records
        .iter()
        .filter(|r| assignments.iter().any(|a| a.matches(*r)))
        .cloned()
        .collect()
}

/// Merges overlapping query results. A key keeps the slot of its first
/// occurrence and the value of its last.
pub fn dedup_by_key<T, K, F>(records: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut slot_by_key: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    for r in records {
        let k = key(&r);
        match slot_by_key.get(&k) {
            Some(&idx) => out[idx] = r,
            None => {
                slot_by_key.insert(k, out.len());
                out.push(r);
            }
        }
    }
    out
}

pub fn filter_subjects_by_assignments(
    all_subjects: &[String],
    year_level: &str,
    assignments: &[Assignment],
) -> Vec<String> {
    let allowed: BTreeSet<&str> = assignments
        .iter()
        .filter(|a| a.year_level == year_level)
        .filter_map(|a| a.subjects.as_ref())
        .flatten()
        .map(|s| s.as_str())
        .collect();
    if allowed.is_empty() {
        return Vec::new();
    }
    let picked: BTreeSet<&String> = all_subjects
        .iter()
        .filter(|s| allowed.contains(s.as_str()))
        .collect();
    picked.into_iter().cloned().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Advisor,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "advisor" => Some(Role::Advisor),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Advisor => "advisor",
        }
    }
}

/// Authorization context for one request.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub user_id: String,
    pub role: Role,
    pub assignments: Vec<Assignment>,
}

impl Viewer {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn visible<T>(&self, records: &[T]) -> Vec<T>
    where
        T: ScopedRecord + Clone,
    {
        if self.is_admin() {
            return records.to_vec();
        }
        filter_by_assignments(records, &self.assignments)
    }

    pub fn can_access<R: ScopedRecord + ?Sized>(&self, record: &R) -> bool {
        self.is_admin() || self.assignments.iter().any(|a| a.matches(record))
    }

    pub fn visible_subjects(&self, all_subjects: &[String], year_level: &str) -> Vec<String> {
        if self.is_admin() {
            let mut all = all_subjects.to_vec();
            all.sort();
            all.dedup();
            return all;
        }
        filter_subjects_by_assignments(all_subjects, year_level, &self.assignments)
    }

    /// Advisors may only write grades for subjects listed on a matching
    /// assignment.
    pub fn can_grade<R: ScopedRecord + ?Sized>(&self, record: &R, subject: &str) -> bool {
        if self.is_admin() {
            return true;
        }
        self.assignments.iter().any(|a| {
            a.matches(record)
                && a
                    .subjects
                    .as_ref()
                    .map(|subs| subs.iter().any(|s| s == subject))
                    .unwrap_or(false)
        })
    }
}
