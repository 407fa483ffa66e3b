//! Course catalogue (`course` endpoint).

use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{child_text, fetch_page, resolve_url, selector, text_of, AdapterError, Charset};
use crate::context::RequestContext;
use crate::fetcher::{Fetch, FetchRequest};
use crate::store::{Course, Semester};

pub const COURSE_ENDPOINT: &str = "course";

/// Course-number prefixes: undergraduate, master, in-service master, PhD.
pub const DEGREE_PREFIXES: [char; 4] = ['U', 'M', 'N', 'P'];

/// What to ask the catalogue for within one semester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourseQuery {
    /// Title or teacher keyword.
    Keyword(String),
    /// Exact course number such as `U0001`.
    Number(String),
    /// Every course of one degree level.
    Degree(char),
}

impl CourseQuery {
    fn query_string(&self, semester: Semester) -> String {
        let base = format!("year={}&term={}", semester.year, semester.term);
        match self {
            CourseQuery::Keyword(k) => format!("{}&keyword={}", base, urlencoding::encode(k)),
            CourseQuery::Number(no) => {
                format!("{}&no={}", base, urlencoding::encode(&no.to_ascii_uppercase()))
            }
            CourseQuery::Degree(d) => format!("{}&degree={}", base, d.to_ascii_uppercase()),
        }
    }
}

struct RowSelectors {
    cell: Selector,
    no: Selector,
    title: Selector,
    link: Selector,
    teachers: Selector,
    time: Selector,
    location: Selector,
    note: Selector,
    item: Selector,
}

impl RowSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            cell: selector("td")?,
            no: selector("td.no")?,
            title: selector("td.title")?,
            link: selector("a[href]")?,
            teachers: selector("td.teachers")?,
            time: selector("td.time")?,
            location: selector("td.location")?,
            note: selector("td.note")?,
            item: selector("span")?,
        })
    }
}

/// Items of a multi-valued cell: `<span>` children, or the whole text.
fn list_cell(row: ElementRef<'_>, cell: &Selector, item: &Selector) -> Vec<String> {
    let Some(cell) = row.select(cell).next() else {
        return Vec::new();
    };
    let items: Vec<String> = cell
        .select(item)
        .map(text_of)
        .filter(|t| !t.is_empty())
        .collect();
    if !items.is_empty() {
        return items;
    }
    let text = text_of(cell);
    if text.is_empty() {
        Vec::new()
    } else {
        vec![text]
    }
}

fn parse_row(
    row: ElementRef<'_>,
    sels: &RowSelectors,
    page_url: &str,
    semester: Semester,
) -> Option<Result<Course, String>> {
    if row.select(&sels.cell).next().is_none() {
        return None;
    }
    let no = child_text(row, &sels.no)?;
    let title_cell = row.select(&sels.title).next()?;
    let title = text_of(title_cell);

    let year = row
        .value()
        .attr("data-year")
        .and_then(|y| y.parse().ok())
        .unwrap_or(semester.year);
    let term = row
        .value()
        .attr("data-term")
        .and_then(|t| t.parse().ok())
        .unwrap_or(semester.term);

    let mut course = match Course::new(year, term, no.as_str(), title) {
        Ok(c) => c,
        Err(e) => return Some(Err(e.to_string())),
    };

    let (teachers, teacher_urls) = match row.select(&sels.teachers).next() {
        Some(cell) => {
            let links: Vec<(String, String)> = cell
                .select(&sels.link)
                .filter_map(|a| {
                    let name = text_of(a);
                    let href = a.value().attr("href")?;
                    (!name.is_empty()).then(|| (name, resolve_url(page_url, href)))
                })
                .collect();
            if links.is_empty() {
                let names = text_of(cell)
                    .split(['、', ',', '，'])
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                (names, Vec::new())
            } else {
                links.into_iter().unzip()
            }
        }
        None => (Vec::new(), Vec::new()),
    };
    course = course.with_teachers(teachers, teacher_urls);

    course.detail_url = title_cell
        .select(&sels.link)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| resolve_url(page_url, href));
    course.times = list_cell(row, &sels.time, &sels.item);
    course.locations = list_cell(row, &sels.location, &sels.item);
    course.note = child_text(row, &sels.note);
    Some(Ok(course))
}

/// Parse `table#courses` rows. `semester` applies to rows that do not
/// carry their own `data-year` / `data-term`.
pub fn parse_courses(
    html: &str,
    page_url: &str,
    semester: Semester,
) -> Result<Vec<Course>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table#courses tr")?;
    let sels = RowSelectors::new()?;

    let mut courses = Vec::new();
    for row in document.select(&row_sel) {
        match parse_row(row, &sels, page_url, semester) {
            Some(Ok(course)) => courses.push(course),
            Some(Err(e)) => debug!(error = %e, "Skipping course row"),
            None => {}
        }
    }
    Ok(courses)
}

/// Adapter for course queries, semester listings and the semester probe.
#[derive(Clone)]
pub struct CourseAdapter {
    fetch: Arc<dyn Fetch>,
}

impl CourseAdapter {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self { fetch }
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        path: &str,
        query: String,
        semester: Semester,
    ) -> Result<Vec<Course>, AdapterError> {
        let req = FetchRequest::new(COURSE_ENDPOINT, path).with_query(query);
        match fetch_page(self.fetch.as_ref(), ctx, req, Charset::Utf8).await? {
            Some(page) => parse_courses(&page.html, &page.url, semester),
            None => Ok(Vec::new()),
        }
    }

    pub async fn search(
        &self,
        ctx: &RequestContext,
        semester: Semester,
        query: &CourseQuery,
    ) -> Result<Vec<Course>, AdapterError> {
        let path = match query {
            CourseQuery::Degree(_) => "/course/list",
            _ => "/course/query",
        };
        self.get(ctx, path, query.query_string(semester), semester)
            .await
    }

    pub async fn by_keyword(
        &self,
        ctx: &RequestContext,
        semester: Semester,
        keyword: &str,
    ) -> Result<Vec<Course>, AdapterError> {
        self.search(ctx, semester, &CourseQuery::Keyword(keyword.to_string()))
            .await
    }

    pub async fn by_number(
        &self,
        ctx: &RequestContext,
        semester: Semester,
        no: &str,
    ) -> Result<Vec<Course>, AdapterError> {
        let no = no.to_ascii_uppercase();
        let courses = self
            .search(ctx, semester, &CourseQuery::Number(no.clone()))
            .await?;
        Ok(courses.into_iter().filter(|c| c.no == no).collect())
    }

    /// Full listing of one degree level.
    pub async fn listing(
        &self,
        ctx: &RequestContext,
        semester: Semester,
        degree: char,
    ) -> Result<Vec<Course>, AdapterError> {
        self.search(ctx, semester, &CourseQuery::Degree(degree)).await
    }

    /// Whether the catalogue has any course for `semester`.
    pub async fn probe(&self, ctx: &RequestContext, semester: Semester) -> Result<bool, AdapterError> {
        let query = format!(
            "{}&limit=1",
            CourseQuery::Degree('U').query_string(semester)
        );
        let courses = self.get(ctx, "/course/list", query, semester).await?;
        Ok(!courses.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <table id="courses">
          <tr><th>課號</th><th>課名</th><th>教師</th></tr>
          <tr class="course">
            <td class="no">U0001</td>
            <td class="title"><a href="/course/detail?uid=1131U0001">線性代數</a></td>
            <td class="teachers"><a href="/teacher/1">張三</a>、<a href="/teacher/2">李四</a></td>
            <td class="time"><span>一 2,3</span><span>三 4</span></td>
            <td class="location"><span>資訊大樓 101</span></td>
            <td class="note">英語授課</td>
          </tr>
          <tr class="course" data-year="112" data-term="2">
            <td class="no">m0123</td>
            <td class="title">微積分</td>
            <td class="teachers">王五，趙六</td>
            <td class="time"></td>
            <td class="location">商學大樓 3F</td>
            <td class="note"></td>
          </tr>
          <tr class="course">
            <td class="no">X9999</td>
            <td class="title">壞資料</td>
          </tr>
        </table>
    "#;

    #[test]
    fn test_parse_courses() {
        let courses = parse_courses(
            PAGE,
            "https://course.example.edu.tw/course/query",
            Semester::new(113, 1),
        )
        .unwrap();
        assert_eq!(courses.len(), 2);

        let linear = &courses[0];
        assert_eq!(linear.uid, "1131U0001");
        assert_eq!(linear.teachers, vec!["張三", "李四"]);
        assert_eq!(
            linear.teacher_urls,
            vec![
                "https://course.example.edu.tw/teacher/1",
                "https://course.example.edu.tw/teacher/2"
            ]
        );
        assert_eq!(linear.times, vec!["一 2,3", "三 4"]);
        assert_eq!(linear.locations, vec!["資訊大樓 101"]);
        assert_eq!(linear.note.as_deref(), Some("英語授課"));
        assert_eq!(
            linear.detail_url.as_deref(),
            Some("https://course.example.edu.tw/course/detail?uid=1131U0001")
        );

        let calculus = &courses[1];
        assert_eq!(calculus.uid, "1122M0123");
        assert_eq!(calculus.teachers, vec!["王五", "趙六"]);
        assert!(calculus.teacher_urls.is_empty());
        assert!(calculus.times.is_empty());
        assert_eq!(calculus.locations, vec!["商學大樓 3F"]);
        assert!(calculus.note.is_none());
    }

    #[test]
    fn test_query_strings() {
        let sem = Semester::new(113, 2);
        assert_eq!(
            CourseQuery::Keyword("微積分".into()).query_string(sem),
            "year=113&term=2&keyword=%E5%BE%AE%E7%A9%8D%E5%88%86"
        );
        assert_eq!(
            CourseQuery::Number("u0001".into()).query_string(sem),
            "year=113&term=2&no=U0001"
        );
        assert_eq!(CourseQuery::Degree('m').query_string(sem), "year=113&term=2&degree=M");
    }
}
