//! Student portfolio search (`lms` endpoint).
//!
//! The portfolio site is a legacy Big5 application: query strings carrying
//! names must be Big5 percent-escapes and pages decode as Big5.

use std::sync::Arc;

use scraper::Html;
use tracing::debug;

use super::{fetch_page, selector, text_of, AdapterError, Charset};
use crate::context::RequestContext;
use crate::fetcher::{Fetch, FetchRequest};
use crate::store::Student;

pub const STUDENT_ENDPOINT: &str = "lms";

const SEARCH_PATH: &str = "/portfolio/search.php";

/// Percent-encode `s` as Big5 bytes.
pub fn encode_big5_query(s: &str) -> Result<String, AdapterError> {
    let (bytes, _, unmappable) = encoding_rs::BIG5.encode(s);
    if unmappable {
        return Err(AdapterError::Encoding(format!(
            "'{}' has characters outside Big5",
            s
        )));
    }
    Ok(urlencoding::encode_binary(&bytes).into_owned())
}

/// Parse the result table: `id | name | department` rows.
pub fn parse_students(html: &str) -> Result<Vec<Student>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table.result tr")?;
    let cell_sel = selector("td")?;

    let mut students = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(text_of).collect();
        if cells.len() < 3 {
            continue;
        }
        match Student::new(cells[0].as_str(), cells[1].as_str(), cells[2].as_str()) {
            Ok(student) => students.push(student),
            Err(e) => debug!(row = ?cells, error = %e, "Skipping student row"),
        }
    }
    Ok(students)
}

/// Adapter for the student portfolio search.
#[derive(Clone)]
pub struct StudentAdapter {
    fetch: Arc<dyn Fetch>,
}

impl StudentAdapter {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self { fetch }
    }

    async fn search(
        &self,
        ctx: &RequestContext,
        query: String,
    ) -> Result<Vec<Student>, AdapterError> {
        let req = FetchRequest::new(STUDENT_ENDPOINT, SEARCH_PATH).with_query(query);
        match fetch_page(self.fetch.as_ref(), ctx, req, Charset::Big5).await? {
            Some(page) => parse_students(&page.html),
            None => Ok(Vec::new()),
        }
    }

    pub async fn by_id(&self, ctx: &RequestContext, id: &str) -> Result<Vec<Student>, AdapterError> {
        let students = self.search(ctx, format!("fmStudentID={}", id)).await?;
        Ok(students.into_iter().filter(|s| s.id == id).collect())
    }

    pub async fn by_name(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Vec<Student>, AdapterError> {
        let encoded = encode_big5_query(name)?;
        self.search(ctx, format!("fmName={}", encoded)).await
    }

    /// One cohort: admission year (ROC) and two-digit department code.
    pub async fn by_year_department(
        &self,
        ctx: &RequestContext,
        year: i32,
        department_code: &str,
    ) -> Result<Vec<Student>, AdapterError> {
        self.search(ctx, format!("fmYear={}&fmDept={}", year, department_code))
            .await
    }
}
