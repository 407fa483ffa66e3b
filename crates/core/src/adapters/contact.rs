//! Campus directory (`sea` endpoint).

use std::sync::Arc;

use scraper::Html;
use tracing::debug;

use super::{child_text, fetch_page, resolve_url, selector, AdapterError, Charset};
use crate::context::RequestContext;
use crate::fetcher::{Fetch, FetchRequest};
use crate::store::{surrogate_contact_id, Contact, ContactKind};

pub const CONTACT_ENDPOINT: &str = "sea";

/// Parse `div.contact` cards. Cards without a name are skipped.
pub fn parse_contacts(html: &str, page_url: &str) -> Result<Vec<Contact>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.contact")?;
    let name_sel = selector(".name")?;
    let title_sel = selector(".title")?;
    let org_sel = selector(".org")?;
    let superior_sel = selector(".superior")?;
    let phone_sel = selector(".phone")?;
    let ext_sel = selector(".ext")?;
    let email_sel = selector(".email")?;
    let location_sel = selector(".location")?;
    let website_sel = selector("a.website")?;

    let mut contacts = Vec::new();
    for card in document.select(&card_sel) {
        let Some(name) = child_text(card, &name_sel) else {
            debug!("Skipping contact card without name");
            continue;
        };
        let kind = card
            .value()
            .attr("data-kind")
            .and_then(ContactKind::parse)
            .unwrap_or(ContactKind::Person);

        let mut contact = match kind {
            ContactKind::Person => Contact::person(name, child_text(card, &org_sel)),
            ContactKind::Organization => {
                Contact::organization(name, child_text(card, &superior_sel))
            }
        };
        contact.title = child_text(card, &title_sel);
        if kind == ContactKind::Person {
            contact.superior = child_text(card, &superior_sel);
        }
        contact.phone = child_text(card, &phone_sel);
        contact.extension = child_text(card, &ext_sel);
        contact.email = child_text(card, &email_sel);
        contact.location = child_text(card, &location_sel);
        contact.website = card
            .select(&website_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_url(page_url, href));
        contacts.push(contact);
    }
    Ok(contacts)
}

/// Adapter for the directory search and unit listings.
#[derive(Clone)]
pub struct ContactAdapter {
    fetch: Arc<dyn Fetch>,
}

impl ContactAdapter {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self { fetch }
    }

    async fn get(&self, ctx: &RequestContext, req: FetchRequest) -> Result<Vec<Contact>, AdapterError> {
        match fetch_page(self.fetch.as_ref(), ctx, req, Charset::Utf8).await? {
            Some(page) => parse_contacts(&page.html, &page.url),
            None => Ok(Vec::new()),
        }
    }

    /// Keyword search over people and units.
    pub async fn search(
        &self,
        ctx: &RequestContext,
        keyword: &str,
    ) -> Result<Vec<Contact>, AdapterError> {
        let req = FetchRequest::new(CONTACT_ENDPOINT, "/contact/search")
            .with_query(format!("q={}", urlencoding::encode(keyword)));
        self.get(ctx, req).await
    }

    /// Every organisational unit.
    pub async fn units(&self, ctx: &RequestContext) -> Result<Vec<Contact>, AdapterError> {
        let req = FetchRequest::new(CONTACT_ENDPOINT, "/contact/units");
        let units = self.get(ctx, req).await?;
        Ok(units
            .into_iter()
            .filter(|c| c.kind == ContactKind::Organization)
            .collect())
    }

    /// People belonging to one unit.
    pub async fn members(
        &self,
        ctx: &RequestContext,
        unit: &str,
    ) -> Result<Vec<Contact>, AdapterError> {
        let req = FetchRequest::new(CONTACT_ENDPOINT, "/contact/unit")
            .with_query(format!("name={}", urlencoding::encode(unit)));
        let mut members = self.get(ctx, req).await?;
        for member in &mut members {
            if member.kind == ContactKind::Person && member.organization.is_none() {
                member.organization = Some(unit.to_string());
                member.id = surrogate_contact_id(member.kind, &member.name, Some(unit));
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div class="contact" data-kind="organization">
          <span class="name">資訊中心</span>
          <span class="superior">行政單位</span>
          <span class="phone">02-8674-1111</span>
          <a class="website" href="/units/cc">網站</a>
        </div>
        <div class="contact" data-kind="person">
          <span class="name">王小明</span>
          <span class="title">組長</span>
          <span class="org">資訊中心</span>
          <span class="phone">02-8674-1111</span>
          <span class="ext">66666</span>
          <span class="email">wang@example.edu.tw</span>
        </div>
        <div class="contact"><span class="title">無名</span></div>
    "#;

    #[test]
    fn test_parse_contacts() {
        let contacts = parse_contacts(PAGE, "https://sea.example.edu.tw/contact/search").unwrap();
        assert_eq!(contacts.len(), 2);

        let unit = &contacts[0];
        assert_eq!(unit.kind, ContactKind::Organization);
        assert_eq!(unit.superior.as_deref(), Some("行政單位"));
        assert_eq!(
            unit.website.as_deref(),
            Some("https://sea.example.edu.tw/units/cc")
        );

        let person = &contacts[1];
        assert_eq!(person.kind, ContactKind::Person);
        assert_eq!(person.organization.as_deref(), Some("資訊中心"));
        assert_eq!(person.dial_string().as_deref(), Some("02-8674-1111,66666"));
        assert_eq!(person.id, "person:資訊中心/王小明");
    }
}
