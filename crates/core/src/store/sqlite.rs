//! SQLite-backed entity store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Params, Row};

use super::matching::{exact_contains, fuzzy_contains};
use super::{
    Contact, ContactKind, Course, CourseNamespace, EntityKind, MatchMode, Program, Semester,
    Store, StoreError, StoreStats, Student, SweepStats, CONTACT_FIELDS, COURSE_FIELDS,
    PROGRAM_FIELDS, STUDENT_FIELDS,
};
use crate::clock::Clock;
use crate::config::CacheConfig;

/// Freshness window per entity class. Programs never expire.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub student: Duration,
    pub contact: Duration,
    pub course: Duration,
    pub historical_course: Duration,
}

impl TtlPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        // Capped at a century.
        let hours = |h: u64| Duration::hours(h.min(876_000) as i64);
        Self {
            student: hours(config.student_ttl_hours),
            contact: hours(config.contact_ttl_hours),
            course: hours(config.course_ttl_hours),
            historical_course: hours(config.historical_course_ttl_hours),
        }
    }

    pub fn ttl(&self, kind: EntityKind) -> Option<Duration> {
        match kind {
            EntityKind::Student => Some(self.student),
            EntityKind::Contact => Some(self.contact),
            EntityKind::Course => Some(self.course),
            EntityKind::HistoricalCourse => Some(self.historical_course),
            EntityKind::Program => None,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Row mapping shared by the generic query helpers.
trait Record: Sized {
    const KIND: &'static str;
    const FIELDS: &'static [&'static str];
    const COLUMNS: &'static str;
    const ORDER: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Text of a searchable field, as matched by the fuzzy tier.
    fn field(&self, name: &str) -> String;
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn to_json_list(list: &[String]) -> Result<String, StoreError> {
    serde_json::to_string(list).map_err(|e| StoreError::InvalidRecord(e.to_string()))
}

impl Record for Student {
    const KIND: &'static str = "student";
    const FIELDS: &'static [&'static str] = STUDENT_FIELDS;
    const COLUMNS: &'static str = "id, name, year, department, cached_at";
    const ORDER: &'static str = "id";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Student {
            id: row.get(0)?,
            name: row.get(1)?,
            year: row.get(2)?,
            department: row.get(3)?,
            cached_at: millis_to_datetime(row.get(4)?),
        })
    }

    fn field(&self, name: &str) -> String {
        match name {
            "id" => self.id.clone(),
            "name" => self.name.clone(),
            "department" => self.department.clone(),
            _ => String::new(),
        }
    }
}

impl Record for Contact {
    const KIND: &'static str = "contact";
    const FIELDS: &'static [&'static str] = CONTACT_FIELDS;
    const COLUMNS: &'static str = "id, kind, name, title, organization, superior, phone, \
                                   extension, email, location, website, cached_at";
    const ORDER: &'static str = "kind DESC, organization, name";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(1)?;
        Ok(Contact {
            id: row.get(0)?,
            kind: ContactKind::parse(&kind).unwrap_or(ContactKind::Person),
            name: row.get(2)?,
            title: row.get(3)?,
            organization: row.get(4)?,
            superior: row.get(5)?,
            phone: row.get(6)?,
            extension: row.get(7)?,
            email: row.get(8)?,
            location: row.get(9)?,
            website: row.get(10)?,
            cached_at: millis_to_datetime(row.get(11)?),
        })
    }

    fn field(&self, name: &str) -> String {
        let value = match name {
            "name" => Some(self.name.as_str()),
            "title" => self.title.as_deref(),
            "organization" => self.organization.as_deref(),
            "superior" => self.superior.as_deref(),
            _ => None,
        };
        value.unwrap_or_default().to_string()
    }
}

impl Record for Course {
    const KIND: &'static str = "course";
    const FIELDS: &'static [&'static str] = COURSE_FIELDS;
    const COLUMNS: &'static str = "uid, year, term, no, title, teachers, teacher_urls, times, \
                                   locations, detail_url, note, cached_at";
    const ORDER: &'static str = "year DESC, term DESC, no";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Course {
            uid: row.get(0)?,
            year: row.get(1)?,
            term: row.get(2)?,
            no: row.get(3)?,
            title: row.get(4)?,
            teachers: json_list(row.get(5)?),
            teacher_urls: json_list(row.get(6)?),
            times: json_list(row.get(7)?),
            locations: json_list(row.get(8)?),
            detail_url: row.get(9)?,
            note: row.get(10)?,
            cached_at: millis_to_datetime(row.get(11)?),
        })
    }

    fn field(&self, name: &str) -> String {
        match name {
            "no" => self.no.clone(),
            "title" => self.title.clone(),
            "teachers" => self.teachers.join(" "),
            "note" => self.note.clone().unwrap_or_default(),
            _ => String::new(),
        }
    }
}

impl Record for Program {
    const KIND: &'static str = "program";
    const FIELDS: &'static [&'static str] = PROGRAM_FIELDS;
    const COLUMNS: &'static str = "name, detail_url, category";
    const ORDER: &'static str = "category, name";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Program {
            name: row.get(0)?,
            detail_url: row.get(1)?,
            category: row.get(2)?,
        })
    }

    fn field(&self, name: &str) -> String {
        match name {
            "name" => self.name.clone(),
            "category" => self.category.clone().unwrap_or_default(),
            _ => String::new(),
        }
    }
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    ttl: TtlPolicy,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path, ttl: TtlPolicy, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
            clock,
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory(ttl: TtlPolicy, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
            clock,
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        let course_table = |name: &str| {
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {name} (
                    uid TEXT PRIMARY KEY,
                    year INTEGER NOT NULL,
                    term INTEGER NOT NULL,
                    no TEXT NOT NULL,
                    title TEXT NOT NULL,
                    teachers TEXT NOT NULL DEFAULT '[]',
                    teacher_urls TEXT NOT NULL DEFAULT '[]',
                    times TEXT NOT NULL DEFAULT '[]',
                    locations TEXT NOT NULL DEFAULT '[]',
                    detail_url TEXT,
                    note TEXT,
                    cached_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{name}_semester ON {name}(year, term);
                CREATE INDEX IF NOT EXISTS idx_{name}_no ON {name}(no);
                CREATE INDEX IF NOT EXISTS idx_{name}_cached ON {name}(cached_at);
                "#
            )
        };

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                year INTEGER NOT NULL,
                department TEXT NOT NULL,
                cached_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_students_name ON students(name);
            CREATE INDEX IF NOT EXISTS idx_students_year_dept ON students(year, department);
            CREATE INDEX IF NOT EXISTS idx_students_cached ON students(cached_at);

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                title TEXT,
                organization TEXT,
                superior TEXT,
                phone TEXT,
                extension TEXT,
                email TEXT,
                location TEXT,
                website TEXT,
                cached_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_contacts_name ON contacts(name);
            CREATE INDEX IF NOT EXISTS idx_contacts_org ON contacts(organization);
            CREATE INDEX IF NOT EXISTS idx_contacts_cached ON contacts(cached_at);

            -- Programs are a static catalogue without expiry
            CREATE TABLE IF NOT EXISTS programs (
                name TEXT PRIMARY KEY,
                detail_url TEXT NOT NULL,
                category TEXT,
                cached_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        conn.execute_batch(&course_table("courses"))?;
        conn.execute_batch(&course_table("historical_courses"))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Rows with `cached_at` above this are fresh.
    fn cutoff(&self, kind: EntityKind) -> i64 {
        match self.ttl.ttl(kind) {
            Some(ttl) => (self.clock.now() - ttl).timestamp_millis(),
            None => i64::MIN,
        }
    }

    fn query<T: Record, P: Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<T>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, T::from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn validate_fields<'a, T: Record>(fields: &[&'a str]) -> Result<Vec<&'a str>, StoreError> {
        if fields.is_empty() {
            return Ok(T::FIELDS.to_vec());
        }
        for field in fields {
            if !T::FIELDS.contains(field) {
                return Err(StoreError::UnknownField {
                    kind: T::KIND,
                    field: field.to_string(),
                });
            }
        }
        Ok(fields.to_vec())
    }

    /// Two-tier search over fresh rows of one table.
    fn search<T: Record>(
        &self,
        table: &str,
        kind: EntityKind,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<T>, StoreError> {
        let fields = Self::validate_fields::<T>(fields)?;
        let needle = needle.trim();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = self.cutoff(kind);
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE cached_at > ?1 ORDER BY {}",
            T::COLUMNS,
            table,
            T::ORDER
        );
        let rows: Vec<T> = Self::query(&conn, &sql, params![cutoff])?;

        // List columns are stored as JSON, so both tiers match decoded values.
        Ok(rows
            .into_iter()
            .filter(|row| match mode {
                MatchMode::Exact => fields.iter().any(|f| exact_contains(&row.field(f), needle)),
                MatchMode::Fuzzy => {
                    let haystack = fields
                        .iter()
                        .map(|f| row.field(f))
                        .collect::<Vec<_>>()
                        .join(" ");
                    fuzzy_contains(&haystack, needle)
                }
            })
            .collect())
    }

    fn count(conn: &Connection, table: &str) -> Result<u64, StoreError> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
            r.get(0)
        })?;
        Ok(n.max(0) as u64)
    }
}

impl Store for SqliteStore {
    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn()?;
        Ok(StoreStats {
            students: Self::count(&conn, "students")?,
            contacts: Self::count(&conn, "contacts")?,
            courses: Self::count(&conn, "courses")?,
            historical_courses: Self::count(&conn, "historical_courses")?,
            programs: Self::count(&conn, "programs")?,
        })
    }

    fn sweep(&self) -> Result<SweepStats, StoreError> {
        let cutoffs = [
            EntityKind::Student,
            EntityKind::Contact,
            EntityKind::Course,
            EntityKind::HistoricalCourse,
        ]
        .map(|kind| (kind.table(), self.cutoff(kind)));

        let conn = self.conn()?;
        let mut removed = [0usize; 4];
        for (i, (table, cutoff)) in cutoffs.iter().enumerate() {
            removed[i] = conn.execute(
                &format!("DELETE FROM {} WHERE cached_at <= ?1", table),
                params![cutoff],
            )?;
        }

        Ok(SweepStats {
            students: removed[0],
            contacts: removed[1],
            courses: removed[2],
            historical_courses: removed[3],
        })
    }

    fn purge(&self, kind: EntityKind) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute(&format!("DELETE FROM {}", kind.table()), [])?)
    }

    fn save_students(&self, students: &[Student]) -> Result<usize, StoreError> {
        let now = self.now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO students (id, name, year, department, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    year = excluded.year,
                    department = excluded.department,
                    cached_at = excluded.cached_at",
            )?;
            for s in students {
                stmt.execute(params![s.id, s.name, s.year, s.department, now])?;
            }
        }
        tx.commit()?;
        Ok(students.len())
    }

    fn get_student(&self, id: &str) -> Result<Option<Student>, StoreError> {
        let cutoff = self.cutoff(EntityKind::Student);
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM students WHERE id = ?1 AND cached_at > ?2",
            Student::COLUMNS
        );
        Ok(Self::query(&conn, &sql, params![id, cutoff])?.into_iter().next())
    }

    fn students_by_year_department(
        &self,
        year: i32,
        department: &str,
    ) -> Result<Vec<Student>, StoreError> {
        let cutoff = self.cutoff(EntityKind::Student);
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM students
             WHERE year = ?1 AND department = ?2 AND cached_at > ?3 ORDER BY {}",
            Student::COLUMNS,
            Student::ORDER
        );
        Self::query(&conn, &sql, params![year, department, cutoff])
    }

    fn search_students(
        &self,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Student>, StoreError> {
        self.search("students", EntityKind::Student, mode, fields, needle)
    }

    fn save_contacts(&self, contacts: &[Contact]) -> Result<usize, StoreError> {
        let now = self.now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contacts (id, kind, name, title, organization, superior, phone,
                                       extension, email, location, website, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    name = excluded.name,
                    title = excluded.title,
                    organization = excluded.organization,
                    superior = excluded.superior,
                    phone = excluded.phone,
                    extension = excluded.extension,
                    email = excluded.email,
                    location = excluded.location,
                    website = excluded.website,
                    cached_at = excluded.cached_at",
            )?;
            for c in contacts {
                stmt.execute(params![
                    c.id,
                    c.kind.as_str(),
                    c.name,
                    c.title,
                    c.organization,
                    c.superior,
                    c.phone,
                    c.extension,
                    c.email,
                    c.location,
                    c.website,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(contacts.len())
    }

    fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let cutoff = self.cutoff(EntityKind::Contact);
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM contacts WHERE id = ?1 AND cached_at > ?2",
            Contact::COLUMNS
        );
        Ok(Self::query(&conn, &sql, params![id, cutoff])?.into_iter().next())
    }

    fn contacts_by_organization(&self, organization: &str) -> Result<Vec<Contact>, StoreError> {
        let cutoff = self.cutoff(EntityKind::Contact);
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM contacts WHERE organization = ?1 AND cached_at > ?2 ORDER BY {}",
            Contact::COLUMNS,
            Contact::ORDER
        );
        Self::query(&conn, &sql, params![organization, cutoff])
    }

    fn search_contacts(
        &self,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Contact>, StoreError> {
        self.search("contacts", EntityKind::Contact, mode, fields, needle)
    }

    fn save_courses(&self, ns: CourseNamespace, courses: &[Course]) -> Result<usize, StoreError> {
        let now = self.now_millis();
        let table = ns.kind().table();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {table} (uid, year, term, no, title, teachers, teacher_urls, times,
                                      locations, detail_url, note, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(uid) DO UPDATE SET
                    year = excluded.year,
                    term = excluded.term,
                    no = excluded.no,
                    title = excluded.title,
                    teachers = excluded.teachers,
                    teacher_urls = excluded.teacher_urls,
                    times = excluded.times,
                    locations = excluded.locations,
                    detail_url = excluded.detail_url,
                    note = excluded.note,
                    cached_at = excluded.cached_at"
            ))?;
            for c in courses {
                stmt.execute(params![
                    c.uid,
                    c.year,
                    c.term,
                    c.no,
                    c.title,
                    to_json_list(&c.teachers)?,
                    to_json_list(&c.teacher_urls)?,
                    to_json_list(&c.times)?,
                    to_json_list(&c.locations)?,
                    c.detail_url,
                    c.note,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(courses.len())
    }

    fn get_course(&self, ns: CourseNamespace, uid: &str) -> Result<Option<Course>, StoreError> {
        let cutoff = self.cutoff(ns.kind());
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE uid = ?1 AND cached_at > ?2",
            Course::COLUMNS,
            ns.kind().table()
        );
        let uid = uid.to_ascii_uppercase();
        Ok(Self::query(&conn, &sql, params![uid, cutoff])?.into_iter().next())
    }

    fn search_courses(
        &self,
        ns: CourseNamespace,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Course>, StoreError> {
        self.search(ns.kind().table(), ns.kind(), mode, fields, needle)
    }

    fn course_count(&self, ns: CourseNamespace, semester: Semester) -> Result<u64, StoreError> {
        let cutoff = self.cutoff(ns.kind());
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE year = ?1 AND term = ?2 AND cached_at > ?3",
                ns.kind().table()
            ),
            params![semester.year, semester.term, cutoff],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn all_courses(&self, ns: CourseNamespace) -> Result<Vec<Course>, StoreError> {
        let cutoff = self.cutoff(ns.kind());
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE cached_at > ?1 ORDER BY {}",
            Course::COLUMNS,
            ns.kind().table(),
            Course::ORDER
        );
        Self::query(&conn, &sql, params![cutoff])
    }

    fn save_programs(&self, programs: &[Program]) -> Result<usize, StoreError> {
        let now = self.now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM programs", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO programs (name, detail_url, category, cached_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for p in programs {
                stmt.execute(params![p.name, p.detail_url, p.category, now])?;
            }
        }
        tx.commit()?;
        Ok(programs.len())
    }

    fn search_programs(
        &self,
        mode: MatchMode,
        fields: &[&str],
        needle: &str,
    ) -> Result<Vec<Program>, StoreError> {
        self.search("programs", EntityKind::Program, mode, fields, needle)
    }

    fn all_programs(&self) -> Result<Vec<Program>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM programs ORDER BY {}",
            Program::COLUMNS,
            Program::ORDER
        );
        Self::query(&conn, &sql, [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn setup() -> (SqliteStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at("2024-10-01T12:00:00Z"));
        let store = SqliteStore::in_memory(TtlPolicy::default(), clock.clone()).unwrap();
        (store, clock)
    }

    fn student(id: &str, name: &str) -> Student {
        Student::new(id, name, "資工").unwrap()
    }

    fn course(no: &str, title: &str, teachers: &[&str]) -> Course {
        Course::new(113, 1, no, title)
            .unwrap()
            .with_teachers(teachers.iter().map(|t| t.to_string()).collect(), vec![])
    }

    #[test]
    fn test_save_then_get() {
        let (store, _) = setup();
        store.save_students(&[student("411285001", "王小明")]).unwrap();

        let got = store.get_student("411285001").unwrap().unwrap();
        assert_eq!(got.name, "王小明");
        assert_eq!(got.year, 112);
        assert!(got.cached_at.is_some());
        assert!(store.get_student("411285002").unwrap().is_none());
    }

    #[test]
    fn test_save_is_idempotent() {
        let (store, _) = setup();
        let batch = [student("411285001", "王小明"), student("411285002", "李大華")];
        store.save_students(&batch).unwrap();
        store.save_students(&batch).unwrap();

        assert_eq!(store.stats().unwrap().students, 2);
    }

    #[test]
    fn test_stale_rows_are_misses() {
        let (store, clock) = setup();
        store.save_students(&[student("411285001", "王小明")]).unwrap();

        clock.advance(Duration::hours(167));
        assert!(store.get_student("411285001").unwrap().is_some());

        clock.advance(Duration::hours(2));
        assert!(store.get_student("411285001").unwrap().is_none());
        assert!(store
            .search_students(MatchMode::Exact, &["name"], "王")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_resave_refreshes_timestamp() {
        let (store, clock) = setup();
        store.save_students(&[student("411285001", "王小明")]).unwrap();
        clock.advance(Duration::hours(100));
        store.save_students(&[student("411285001", "王小明")]).unwrap();
        clock.advance(Duration::hours(100));

        assert!(store.get_student("411285001").unwrap().is_some());
    }

    #[test]
    fn test_sweep_removes_only_stale_rows() {
        let (store, clock) = setup();
        store.save_students(&[student("411285001", "王小明")]).unwrap();
        store
            .save_courses(CourseNamespace::Historical, &[course("U0001", "微積分", &[])])
            .unwrap();

        clock.advance(Duration::hours(25));
        store.save_students(&[student("411285002", "李大華")]).unwrap();

        let swept = store.sweep().unwrap();
        assert_eq!(swept.historical_courses, 1);
        assert_eq!(swept.students, 0);
        assert_eq!(swept.total(), 1);
        assert_eq!(store.stats().unwrap().students, 2);
    }

    #[test]
    fn test_exact_and_fuzzy_tiers() {
        let (store, _) = setup();
        store
            .save_courses(
                CourseNamespace::Active,
                &[
                    course("U0001", "線性代數", &["張三"]),
                    course("U0002", "微積分", &["李四"]),
                ],
            )
            .unwrap();

        let exact = store
            .search_courses(CourseNamespace::Active, MatchMode::Exact, &["title"], "線代")
            .unwrap();
        assert!(exact.is_empty());

        let fuzzy = store
            .search_courses(CourseNamespace::Active, MatchMode::Fuzzy, &["title"], "線代")
            .unwrap();
        assert_eq!(fuzzy.len(), 1);
        assert_eq!(fuzzy[0].uid, "1131U0001");

        let by_teacher = store
            .search_courses(CourseNamespace::Active, MatchMode::Exact, &["teachers"], "李四")
            .unwrap();
        assert_eq!(by_teacher.len(), 1);
        assert_eq!(by_teacher[0].teachers, vec!["李四".to_string()]);
    }

    #[test]
    fn test_exact_teacher_match_ignores_storage_encoding() {
        let (store, _) = setup();
        store
            .save_courses(
                CourseNamespace::Active,
                &[course("U0001", "統計學", &["張三", "李四"])],
            )
            .unwrap();

        let search = |needle: &str| {
            store
                .search_courses(CourseNamespace::Active, MatchMode::Exact, &["teachers"], needle)
                .unwrap()
        };
        assert!(search("\"").is_empty());
        assert!(search("[").is_empty());
        assert!(search("三\",\"李").is_empty());
        assert_eq!(search("張三 李四").len(), 1);
    }

    #[test]
    fn test_exact_wildcards_are_literal() {
        let (store, _) = setup();
        store.save_students(&[student("411285001", "王小明")]).unwrap();

        assert!(store
            .search_students(MatchMode::Exact, &["name"], "%")
            .unwrap()
            .is_empty());
        assert!(store
            .search_students(MatchMode::Exact, &["name"], "_")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let (store, _) = setup();
        let err = store
            .search_students(MatchMode::Exact, &["name; DROP TABLE students"], "x")
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { kind: "student", .. }));
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let (store, _) = setup();
        store
            .save_courses(CourseNamespace::Historical, &[course("U0001", "微積分", &[])])
            .unwrap();

        assert!(store
            .get_course(CourseNamespace::Active, "1131U0001")
            .unwrap()
            .is_none());
        assert!(store
            .get_course(CourseNamespace::Historical, "1131u0001")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_course_count_by_semester() {
        let (store, _) = setup();
        store
            .save_courses(
                CourseNamespace::Active,
                &[course("U0001", "a", &[]), course("U0002", "b", &[])],
            )
            .unwrap();

        assert_eq!(
            store
                .course_count(CourseNamespace::Active, Semester::new(113, 1))
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .course_count(CourseNamespace::Active, Semester::new(113, 2))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_contacts_by_organization() {
        let (store, _) = setup();
        let mut a = Contact::person("王小明", Some("資訊中心".to_string()));
        a.title = Some("組長".to_string());
        let b = Contact::person("李大華", Some("圖書館".to_string()));
        let org = Contact::organization("資訊中心", Some("行政單位".to_string()));
        store.save_contacts(&[a, b, org]).unwrap();

        let members = store.contacts_by_organization("資訊中心").unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].title.as_deref(), Some("組長"));

        let found = store
            .search_contacts(MatchMode::Exact, &["name", "title"], "資訊")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ContactKind::Organization);
    }

    #[test]
    fn test_programs_never_expire_and_replace() {
        let (store, clock) = setup();
        let program = |name: &str| Program {
            name: name.to_string(),
            detail_url: format!("https://example.edu.tw/{}", name),
            category: None,
        };
        store.save_programs(&[program("人工智慧學程"), program("金融科技學程")]).unwrap();
        clock.advance(Duration::days(3650));
        assert_eq!(store.all_programs().unwrap().len(), 2);

        store.save_programs(&[program("永續發展學程")]).unwrap();
        let all = store.all_programs().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "永續發展學程");
    }

    #[test]
    fn test_purge_clears_one_kind() {
        let (store, _) = setup();
        store.save_students(&[student("411285001", "王小明")]).unwrap();
        store
            .save_contacts(&[Contact::person("王小明", None)])
            .unwrap();

        assert_eq!(store.purge(EntityKind::Student).unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.students, 0);
        assert_eq!(stats.contacts, 1);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unibot.db");
        let clock = Arc::new(ManualClock::at("2024-10-01T12:00:00Z"));
        {
            let store = SqliteStore::new(&path, TtlPolicy::default(), clock.clone()).unwrap();
            store.save_students(&[student("411285001", "王小明")]).unwrap();
        }
        let store = SqliteStore::new(&path, TtlPolicy::default(), clock).unwrap();
        assert!(store.get_student("411285001").unwrap().is_some());
        store.ping().unwrap();
    }
}
