//! Cached entities and store errors.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First academic year (ROC) with course data.
pub const COURSE_LAUNCH_YEAR: i32 = 90;

/// First academic year (ROC) with student data.
pub const STUDENT_LAUNCH_YEAR: i32 = 94;

/// Student records stopped being published from this year (ROC) on.
pub const STUDENT_DATA_CUTOFF_YEAR: i32 = 114;

static STUDENT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{8,9}$").expect("valid regex"));

static COURSE_NO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[UMNP]\d{4}$").expect("valid regex"));

static COURSE_UID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2,3})([12])([UMNP]\d{4})$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unknown search field '{field}' for {kind}")]
    UnknownField { kind: &'static str, field: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Entity classes with independent freshness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Student,
    Contact,
    Course,
    HistoricalCourse,
    Program,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Student => "student",
            EntityKind::Contact => "contact",
            EntityKind::Course => "course",
            EntityKind::HistoricalCourse => "historical_course",
            EntityKind::Program => "program",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            EntityKind::Student => "students",
            EntityKind::Contact => "contacts",
            EntityKind::Course => "courses",
            EntityKind::HistoricalCourse => "historical_courses",
            EntityKind::Program => "programs",
        }
    }
}

/// How a needle is matched against the named fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Substring containment on any named field.
    Exact,
    /// Character-multiset containment on the concatenated fields.
    Fuzzy,
}

/// Course namespace: active semesters or on-demand historical years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CourseNamespace {
    Active,
    Historical,
}

impl CourseNamespace {
    pub fn kind(&self) -> EntityKind {
        match self {
            CourseNamespace::Active => EntityKind::Course,
            CourseNamespace::Historical => EntityKind::HistoricalCourse,
        }
    }
}

/// A student record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    /// 8 or 9 decimal digits.
    pub id: String,
    pub name: String,
    /// Admission year (ROC).
    pub year: i32,
    pub department: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Student {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        department: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let id = id.into();
        if !is_student_id(&id) {
            return Err(StoreError::InvalidRecord(format!("student id '{}'", id)));
        }
        let year = year_from_student_id(&id)
            .ok_or_else(|| StoreError::InvalidRecord(format!("student id '{}'", id)))?;
        Ok(Self {
            id,
            name: name.into(),
            year,
            department: department.into(),
            cached_at: None,
        })
    }
}

/// True for 8-9 decimal digits.
pub fn is_student_id(s: &str) -> bool {
    STUDENT_ID.is_match(s)
}

/// Admission year encoded in a student id: one degree digit followed by a
/// two (8-digit ids) or three (9-digit ids) digit ROC year.
pub fn year_from_student_id(id: &str) -> Option<i32> {
    let digits = match id.len() {
        8 => id.get(1..3)?,
        9 => id.get(1..4)?,
        _ => return None,
    };
    digits.parse().ok()
}

/// Department code encoded in a student id (two digits after the year).
pub fn department_code_from_student_id(id: &str) -> Option<&str> {
    match id.len() {
        8 => id.get(3..5),
        9 => id.get(4..6),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Person,
    Organization,
}

impl ContactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactKind::Person => "person",
            ContactKind::Organization => "organization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(ContactKind::Person),
            "organization" => Some(ContactKind::Organization),
            _ => None,
        }
    }
}

/// A directory entry: a person or an organisational unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub kind: ContactKind,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub superior: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn person(name: impl Into<String>, organization: Option<String>) -> Self {
        Self::bare(ContactKind::Person, name.into(), organization)
    }

    pub fn organization(name: impl Into<String>, superior: Option<String>) -> Self {
        let mut c = Self::bare(ContactKind::Organization, name.into(), None);
        c.superior = superior;
        c
    }

    fn bare(kind: ContactKind, name: String, organization: Option<String>) -> Self {
        let id = surrogate_contact_id(kind, &name, organization.as_deref());
        Self {
            id,
            kind,
            name,
            title: None,
            organization,
            superior: None,
            phone: None,
            extension: None,
            email: None,
            location: None,
            website: None,
            cached_at: None,
        }
    }

    /// Full dialable number including the extension, if any.
    pub fn dial_string(&self) -> Option<String> {
        let phone = self.phone.as_deref()?;
        Some(match self.extension.as_deref() {
            Some(ext) if !ext.is_empty() => format!("{},{}", phone, ext),
            _ => phone.to_string(),
        })
    }
}

/// Stable surrogate key for a contact.
pub fn surrogate_contact_id(kind: ContactKind, name: &str, organization: Option<&str>) -> String {
    format!(
        "{}:{}/{}",
        kind.as_str(),
        organization.unwrap_or(""),
        name
    )
}

/// A course offering in one semester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// `year || term || no`.
    pub uid: String,
    pub year: i32,
    pub term: u8,
    pub no: String,
    pub title: String,
    #[serde(default)]
    pub teachers: Vec<String>,
    /// Parallel to `teachers`, or empty.
    #[serde(default)]
    pub teacher_urls: Vec<String>,
    #[serde(default)]
    pub times: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Course {
    /// Build a course, enforcing the semester and course-number invariants.
    /// Teacher URLs that do not line up with teachers are dropped.
    pub fn new(
        year: i32,
        term: u8,
        no: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let no = no.into().to_ascii_uppercase();
        if !(1..=2).contains(&term) {
            return Err(StoreError::InvalidRecord(format!("term {}", term)));
        }
        if year < COURSE_LAUNCH_YEAR {
            return Err(StoreError::InvalidRecord(format!("year {}", year)));
        }
        if !COURSE_NO.is_match(&no) {
            return Err(StoreError::InvalidRecord(format!("course no '{}'", no)));
        }
        Ok(Self {
            uid: course_uid(year, term, &no),
            year,
            term,
            no,
            title: title.into(),
            teachers: Vec::new(),
            teacher_urls: Vec::new(),
            times: Vec::new(),
            locations: Vec::new(),
            detail_url: None,
            note: None,
            cached_at: None,
        })
    }

    pub fn with_teachers(mut self, teachers: Vec<String>, teacher_urls: Vec<String>) -> Self {
        self.teacher_urls = if teacher_urls.len() == teachers.len() {
            teacher_urls
        } else {
            Vec::new()
        };
        self.teachers = teachers;
        self
    }

    pub fn semester(&self) -> Semester {
        Semester {
            year: self.year,
            term: self.term,
        }
    }
}

/// Concatenate the course primary key.
pub fn course_uid(year: i32, term: u8, no: &str) -> String {
    format!("{}{}{}", year, term, no)
}

/// Split a course UID into (year, term, no). Lowercase letters are accepted.
pub fn parse_course_uid(s: &str) -> Option<(i32, u8, String)> {
    let upper = s.to_ascii_uppercase();
    let caps = COURSE_UID.captures(&upper)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let term = caps.get(2)?.as_str().parse().ok()?;
    Some((year, term, caps.get(3)?.as_str().to_string()))
}

/// True for a bare course number such as `U0001`.
pub fn is_course_no(s: &str) -> bool {
    COURSE_NO.is_match(&s.to_ascii_uppercase())
}

/// One academic semester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Semester {
    pub year: i32,
    pub term: u8,
}

impl Semester {
    pub fn new(year: i32, term: u8) -> Self {
        Self { year, term }
    }

    /// The semester before this one.
    pub fn previous(&self) -> Semester {
        if self.term == 2 {
            Semester::new(self.year, 1)
        } else {
            Semester::new(self.year - 1, 2)
        }
    }
}

impl std::fmt::Display for Semester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.year, self.term)
    }
}

/// An academic program from the static catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub detail_url: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub students: u64,
    pub contacts: u64,
    pub courses: u64,
    pub historical_courses: u64,
    pub programs: u64,
}

/// Rows removed by a stale sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub students: usize,
    pub contacts: usize,
    pub courses: usize,
    pub historical_courses: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.students + self.contacts + self.courses + self.historical_courses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_student_id_lengths() {
        assert!(is_student_id("41247001"));
        assert!(is_student_id("412470011"));
        assert!(!is_student_id("4124700"));
        assert!(!is_student_id("4124700111"));
        assert!(!is_student_id("41247a01"));
    }

    #[test]
    fn test_year_and_department_from_id() {
        assert_eq!(year_from_student_id("41271001"), Some(12));
        assert_eq!(year_from_student_id("411271001"), Some(112));
        assert_eq!(department_code_from_student_id("411285001"), Some("85"));
        assert_eq!(department_code_from_student_id("49885001"), Some("85"));
    }

    #[test]
    fn test_course_uid_accepts_two_and_three_digit_years() {
        assert_eq!(
            parse_course_uid("1131U0001"),
            Some((113, 1, "U0001".to_string()))
        );
        assert_eq!(
            parse_course_uid("991U0001"),
            Some((99, 1, "U0001".to_string()))
        );
        assert_eq!(
            parse_course_uid("1132m0123"),
            Some((113, 2, "M0123".to_string()))
        );
    }

    #[test]
    fn test_course_uid_rejects_bad_letters_and_terms() {
        assert!(parse_course_uid("1131X0001").is_none());
        assert!(parse_course_uid("1133U0001").is_none());
        assert!(parse_course_uid("1131U001").is_none());
    }

    #[test]
    fn test_course_new_validates() {
        assert!(Course::new(113, 1, "U0001", "微積分").is_ok());
        assert!(Course::new(113, 3, "U0001", "x").is_err());
        assert!(Course::new(80, 1, "U0001", "x").is_err());
        assert!(Course::new(113, 1, "A0001", "x").is_err());
        assert_eq!(Course::new(113, 1, "u0001", "x").unwrap().uid, "1131U0001");
    }

    #[test]
    fn test_course_teacher_urls_must_line_up() {
        let course = Course::new(113, 1, "U0001", "x").unwrap().with_teachers(
            vec!["A".to_string(), "B".to_string()],
            vec!["http://a".to_string()],
        );
        assert_eq!(course.teachers.len(), 2);
        assert!(course.teacher_urls.is_empty());
    }

    #[test]
    fn test_semester_previous() {
        assert_eq!(Semester::new(113, 2).previous(), Semester::new(113, 1));
        assert_eq!(Semester::new(113, 1).previous(), Semester::new(112, 2));
    }

    #[test]
    fn test_contact_dial_string() {
        let mut c = Contact::person("王小明", Some("資訊中心".to_string()));
        assert!(c.dial_string().is_none());
        c.phone = Some("0286741111".to_string());
        c.extension = Some("66666".to_string());
        assert_eq!(c.dial_string().unwrap(), "0286741111,66666");
    }
}
