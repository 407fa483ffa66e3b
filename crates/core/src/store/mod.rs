//! Local TTL'd store - the source of truth for queries.
//!
//! Scrapes and warm-up jobs write here; handlers read here first and fall
//! back to the upstream site only on a miss.

mod matching;
mod sqlite;
mod types;

pub use matching::{exact_contains, fuzzy_contains};
pub use sqlite::{SqliteStore, TtlPolicy};
pub use types::*;

/// Searchable student columns.
pub const STUDENT_FIELDS: &[&str] = &["id", "name", "department"];

/// Searchable contact columns.
pub const CONTACT_FIELDS: &[&str] = &["name", "title", "organization", "superior"];

/// Searchable course columns (`teachers` is matched against the joined list).
pub const COURSE_FIELDS: &[&str] = &["no", "title", "teachers", "note"];

/// Searchable program columns.
pub const PROGRAM_FIELDS: &[&str] = &["name", "category"];

/// Trait for entity storage.
///
/// Every read only sees rows that are fresh for their entity class; a stale
/// row is indistinguishable from a missing one. Batch writes are atomic.
pub trait Store: Send + Sync {
    /// Check that the backing database answers.
    fn ping(&self) -> Result<(), StoreError>;

    /// Row counts per table (stale rows included).
    fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Delete every stale row.
    fn sweep(&self) -> Result<SweepStats, StoreError>;

    /// Administrative purge of one entity class. Returns rows deleted.
    fn purge(&self, kind: EntityKind) -> Result<usize, StoreError>;

    /// Upsert students (all or none). Returns rows written.
    fn save_students(&self, students: &[Student]) -> Result<usize, StoreError>;

    fn get_student(&self, id: &str) -> Result<Option<Student>, StoreError>;

    fn students_by_year_department(
        &self,
        year: i32,
        department: &str,
    ) -> Result<Vec<Student>, StoreError>;

    fn search_students(
        &self,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Student>, StoreError>;

    /// Upsert contacts (all or none). Returns rows written.
    fn save_contacts(&self, contacts: &[Contact]) -> Result<usize, StoreError>;

    fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError>;

    /// Members of an organisational unit.
    fn contacts_by_organization(&self, organization: &str) -> Result<Vec<Contact>, StoreError>;

    fn search_contacts(
        &self,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Contact>, StoreError>;

    /// Upsert courses into a namespace (all or none). Returns rows written.
    fn save_courses(&self, ns: CourseNamespace, courses: &[Course]) -> Result<usize, StoreError>;

    fn get_course(&self, ns: CourseNamespace, uid: &str) -> Result<Option<Course>, StoreError>;

    fn search_courses(
        &self,
        ns: CourseNamespace,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Course>, StoreError>;

    /// Fresh courses of one semester.
    fn course_count(&self, ns: CourseNamespace, semester: Semester) -> Result<u64, StoreError>;

    /// Every fresh course in a namespace.
    fn all_courses(&self, ns: CourseNamespace) -> Result<Vec<Course>, StoreError>;

    /// Replace the program catalogue (all or none).
    fn save_programs(&self, programs: &[Program]) -> Result<usize, StoreError>;

    fn search_programs(
        &self,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Program>, StoreError>;

    fn all_programs(&self) -> Result<Vec<Program>, StoreError>;
}
