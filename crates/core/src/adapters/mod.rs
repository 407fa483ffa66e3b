//! Site adapters: one per upstream endpoint.
//!
//! Each adapter knows its URL shapes and encoding quirks, issues the fetch
//! and parses the HTML into store entities. Parsing is synchronous and runs
//! after the response has been read. "Not found" (HTTP 404 or an empty
//! table) is an empty result, not an error.

mod contact;
mod course;
mod program;
mod student;

pub use contact::{parse_contacts, ContactAdapter, CONTACT_ENDPOINT};
pub use course::{parse_courses, CourseAdapter, CourseQuery, COURSE_ENDPOINT, DEGREE_PREFIXES};
pub use program::{parse_programs, ProgramAdapter, PROGRAM_ENDPOINT};
pub use student::{encode_big5_query, parse_students, StudentAdapter, STUDENT_ENDPOINT};

use scraper::{ElementRef, Selector};
use thiserror::Error;

use crate::context::RequestContext;
use crate::fetcher::{Fetch, FetchError, FetchRequest};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("cannot encode query: {0}")]
    Encoding(String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Character set of an endpoint's pages and query strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Charset {
    Utf8,
    Big5,
}

/// Fetch a page and decode it. `None` means the upstream reported 404.
pub(crate) async fn fetch_page(
    fetch: &dyn Fetch,
    ctx: &RequestContext,
    req: FetchRequest,
    charset: Charset,
) -> Result<Option<Page>, AdapterError> {
    match fetch.fetch(ctx, req).await {
        Ok(resp) => {
            let html = match charset {
                Charset::Utf8 => resp.text(),
                Charset::Big5 => encoding_rs::BIG5.decode(&resp.body).0.into_owned(),
            };
            Ok(Some(Page {
                url: resp.url,
                html,
            }))
        }
        Err(FetchError::UpstreamHttp { status: 404 }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// A decoded upstream page.
pub(crate) struct Page {
    pub url: String,
    pub html: String,
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector '{}': {}", css, e)))
}

/// Element text with whitespace collapsed.
pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the first descendant matching `sel`, if non-empty.
pub(crate) fn child_text(el: ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

/// Resolve a possibly relative link against the page URL.
pub(crate) fn resolve_url(base: &str, href: &str) -> String {
    match reqwest::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("https://course.example.edu.tw/course/query?x=1", "/teacher/7"),
            "https://course.example.edu.tw/teacher/7"
        );
        assert_eq!(
            resolve_url("not a url", "https://a.example/x"),
            "https://a.example/x"
        );
    }

    #[test]
    fn test_text_of_collapses_whitespace() {
        let html = scraper::Html::parse_fragment("<p>  線性\n  代數 <b>A</b> </p>");
        let p = html.select(&selector("p").unwrap()).next().unwrap();
        assert_eq!(text_of(p), "線性 代數 A");
    }
}
