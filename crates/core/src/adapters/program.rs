//! Degree program catalogue (`program` endpoint).

use std::sync::Arc;

use scraper::Html;

use super::{fetch_page, resolve_url, selector, text_of, AdapterError, Charset};
use crate::context::RequestContext;
use crate::fetcher::{Fetch, FetchRequest};
use crate::store::Program;

pub const PROGRAM_ENDPOINT: &str = "program";

const CATALOGUE_PATH: &str = "/programs";

/// Parse `ul.programs li` entries. Each needs a link with a non-empty label.
pub fn parse_programs(html: &str, page_url: &str) -> Result<Vec<Program>, AdapterError> {
    let document = Html::parse_document(html);
    let item_sel = selector("ul.programs li")?;
    let link_sel = selector("a[href]")?;

    let mut programs = Vec::new();
    for item in document.select(&item_sel) {
        let Some(link) = item.select(&link_sel).next() else {
            continue;
        };
        let name = text_of(link);
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        programs.push(Program {
            name,
            detail_url: resolve_url(page_url, href),
            category: item
                .value()
                .attr("data-category")
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        });
    }
    Ok(programs)
}

#[derive(Clone)]
pub struct ProgramAdapter {
    fetch: Arc<dyn Fetch>,
}

impl ProgramAdapter {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self { fetch }
    }

    /// The whole catalogue.
    pub async fn catalogue(&self, ctx: &RequestContext) -> Result<Vec<Program>, AdapterError> {
        let req = FetchRequest::new(PROGRAM_ENDPOINT, CATALOGUE_PATH);
        match fetch_page(self.fetch.as_ref(), ctx, req, Charset::Utf8).await? {
            Some(page) => parse_programs(&page.html, &page.url),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_programs() {
        let html = r#"
            <ul class="programs">
              <li data-category="學士學位學程"><a href="/p/ai">人工智慧學士學位學程</a></li>
              <li data-category=" "><a href="https://other.example/x">跨域學程</a></li>
              <li>沒有連結</li>
              <li><a href="/p/empty"> </a></li>
            </ul>
        "#;
        let programs = parse_programs(html, "https://www.example.edu.tw/programs").unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0].name, "人工智慧學士學位學程");
        assert_eq!(programs[0].detail_url, "https://www.example.edu.tw/p/ai");
        assert_eq!(programs[0].category.as_deref(), Some("學士學位學程"));
        assert_eq!(programs[1].detail_url, "https://other.example/x");
        assert!(programs[1].category.is_none());
    }
}
