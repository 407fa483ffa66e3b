//! Campus directory: people, units and emergency numbers.

use async_trait::async_trait;
use tracing::debug;

use super::{
    not_found, param, resolve_intent, two_tier, Handler, HandlerDeps, HandlerError, IntentSpec,
    KeywordMatcher, Params,
};
use crate::adapters::ContactAdapter;
use crate::context::RequestContext;
use crate::postback::Postback;
use crate::reply::{bubble_reply, Action, Bubble, Message};
use crate::store::{Contact, ContactKind, MatchMode};

pub(crate) const MODULE: &str = "contact";

pub const MAX_CONTACT_RESULTS: usize = 50;

const EXACT_FIELDS: &[&str] = &["name", "title"];
const FUZZY_FIELDS: &[&str] = &["name", "title", "organization", "superior"];

/// Always-available numbers, shown without touching the store.
pub const EMERGENCY_NUMBERS: &[(&str, &str)] = &[
    ("校安中心（24 小時）", "02-8674-1111,66119"),
    ("三峽校區警衛室", "02-8674-1111,66120"),
    ("臺北校區警衛室", "02-2502-4654"),
    ("健康中心", "02-8674-1111,66102"),
    ("報案專線", "110"),
    ("救護、消防", "119"),
];

pub(crate) const INTENTS: &[IntentSpec] = &[
    IntentSpec {
        name: "search",
        description: "Search staff or units by name, title or unit",
        required: &["query"],
        optional: &[],
    },
    IntentSpec {
        name: "emergency",
        description: "Show campus emergency phone numbers",
        required: &[],
        optional: &[],
    },
    IntentSpec {
        name: "members",
        description: "List the people of one organisational unit",
        required: &["unit"],
        optional: &[],
    },
];

fn dial_uri(dial: &str) -> String {
    let digits: String = dial
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '+')
        .collect();
    format!("tel:{}", digits)
}

pub struct ContactHandler {
    deps: HandlerDeps,
    adapter: ContactAdapter,
    keywords: KeywordMatcher,
    emergency_keywords: KeywordMatcher,
}

impl ContactHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            adapter: ContactAdapter::new(deps.fetch.clone()),
            deps,
            keywords: KeywordMatcher::new(&["聯絡", "聯繫", "電話", "分機", "contact"]),
            emergency_keywords: KeywordMatcher::new(&["緊急", "emergency"]),
        }
    }

    fn emergency() -> Vec<Message> {
        let actions = EMERGENCY_NUMBERS
            .iter()
            .take(4)
            .map(|(label, number)| Action::uri(label, dial_uri(number)))
            .collect();
        let mut text = String::from("緊急聯絡電話：");
        for (label, number) in EMERGENCY_NUMBERS {
            text.push_str(&format!("\n{}：{}", label, number));
        }
        vec![Message::text(text).with_quick_replies(actions)]
    }

    fn bubble(&self, contact: &Contact) -> Result<Bubble, HandlerError> {
        let mut bubble = Bubble::new(&contact.name);
        let subtitle = match contact.kind {
            ContactKind::Person => contact.organization.as_deref(),
            ContactKind::Organization => contact.superior.as_deref(),
        };
        if let Some(s) = subtitle {
            bubble = bubble.subtitle(s);
        }
        let dial = contact.dial_string();
        bubble = bubble
            .field("職稱", contact.title.as_deref())
            .field("電話", dial.as_deref())
            .field("Email", contact.email.as_deref())
            .field("地點", contact.location.as_deref());

        if let Some(dial) = &dial {
            bubble = bubble.action(Action::uri("撥打電話", dial_uri(dial)));
        }
        if let Some(email) = &contact.email {
            bubble = bubble.action(Action::uri("寄信", format!("mailto:{}", email)));
        }
        if let Some(site) = &contact.website {
            bubble = bubble.action(Action::uri("網站", site.clone()));
        }
        if contact.kind == ContactKind::Organization {
            let postback = Postback::new(MODULE, "members").with_param(contact.name.clone());
            bubble = bubble.action(Action::postback(
                "查看成員",
                &postback,
                self.deps.envelope.max_postback_bytes,
            )?);
        }
        Ok(bubble)
    }

    fn render(&self, contacts: Vec<Contact>) -> Result<Vec<Message>, HandlerError> {
        let total = contacts.len();
        let bubbles = contacts
            .iter()
            .take(MAX_CONTACT_RESULTS)
            .map(|c| self.bubble(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bubble_reply("聯絡資訊", bubbles, total, &self.deps.envelope))
    }

    async fn search(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Message>, HandlerError> {
        let store = &self.deps.store;
        let cached = two_tier(
            MODULE,
            &self.deps.metrics,
            || store.search_contacts(MatchMode::Exact, EXACT_FIELDS, query),
            || store.search_contacts(MatchMode::Fuzzy, FUZZY_FIELDS, query),
            |c: &Contact| c.id.clone(),
        )?;
        self.deps.record_lookup(MODULE, !cached.is_empty());
        if !cached.is_empty() {
            return self.render(cached);
        }

        let scraped = self.adapter.search(ctx, query).await?;
        if scraped.is_empty() {
            return Ok(not_found("聯絡資訊", query));
        }
        self.deps.store.save_contacts(&scraped)?;
        self.render(scraped)
    }

    async fn members(&self, ctx: &RequestContext, unit: &str) -> Result<Vec<Message>, HandlerError> {
        let cached = self.deps.store.contacts_by_organization(unit)?;
        self.deps.record_lookup(MODULE, !cached.is_empty());
        if !cached.is_empty() {
            return self.render(cached);
        }

        let scraped = self.adapter.members(ctx, unit).await?;
        if scraped.is_empty() {
            return Ok(not_found("成員", unit));
        }
        self.deps.store.save_contacts(&scraped)?;
        self.render(scraped)
    }
}

#[async_trait]
impl Handler for ContactHandler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn can_handle(&self, text: &str) -> bool {
        self.keywords.matches(text) || self.emergency_keywords.matches(text)
    }

    async fn handle_message(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> Result<Vec<Message>, HandlerError> {
        if self.emergency_keywords.matches(text) {
            return Ok(Self::emergency());
        }
        match self.keywords.strip(text) {
            Some((_, "")) => Ok(vec![Message::text(
                "請輸入「聯絡 關鍵字」，例如「聯絡 資訊中心」；輸入「緊急」查看緊急電話。",
            )]),
            Some((_, query)) => self.search(ctx, query).await,
            None => Ok(Vec::new()),
        }
    }

    async fn handle_postback(
        &self,
        ctx: &RequestContext,
        postback: &Postback,
    ) -> Result<Vec<Message>, HandlerError> {
        match postback.action.as_str() {
            "members" => {
                let unit = postback
                    .param(0)
                    .ok_or_else(|| HandlerError::MissingParameter("unit".to_string()))?;
                self.members(ctx, unit).await
            }
            "emergency" => Ok(Self::emergency()),
            "search" => match postback.param(0) {
                Some(q) => self.search(ctx, q).await,
                None => Err(HandlerError::MissingParameter("query".to_string())),
            },
            other => {
                debug!(action = other, "Unknown contact postback");
                Ok(Vec::new())
            }
        }
    }

    fn intents(&self) -> &'static [IntentSpec] {
        INTENTS
    }

    async fn dispatch_intent(
        &self,
        ctx: &RequestContext,
        intent: &str,
        params: &Params,
    ) -> Result<Vec<Message>, HandlerError> {
        let spec = resolve_intent(MODULE, INTENTS, intent, params)?;
        match spec.name {
            "emergency" => Ok(Self::emergency()),
            "members" => self.members(ctx, param(params, "unit").unwrap_or_default()).await,
            _ => self.search(ctx, param(params, "query").unwrap_or_default()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_emergency_needs_no_store() {
        let (handler, env) = fixtures::contact_handler();
        let reply = handler
            .handle_message(&RequestContext::background(), "緊急")
            .await
            .unwrap();
        assert!(reply[0].as_text().unwrap().contains("119"));
        assert_eq!(env.fetch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_abbreviation_hits_fuzzy_only() {
        let (handler, env) = fixtures::contact_handler();
        env.store
            .save_contacts(&[Contact::person("王小明", Some("資訊中心".into()))])
            .unwrap();

        let reply = handler
            .handle_message(&RequestContext::background(), "聯絡 王明")
            .await
            .unwrap();
        let Message::Carousel { bubbles, .. } = &reply[0] else {
            panic!("expected carousel, got {:?}", reply);
        };
        assert_eq!(bubbles.len(), 1);
        assert_eq!(bubbles[0].title, "王小明");
        assert_eq!(env.fetch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unit_offers_members_postback() {
        let (handler, env) = fixtures::contact_handler();
        let mut unit = Contact::organization("資訊中心", Some("行政單位".into()));
        unit.phone = Some("02-8674-1111".into());
        env.store.save_contacts(&[unit]).unwrap();

        let reply = handler
            .handle_message(&RequestContext::background(), "聯絡 資訊中心")
            .await
            .unwrap();
        let Message::Carousel { bubbles, .. } = &reply[0] else {
            panic!("expected carousel");
        };
        assert!(bubbles[0]
            .actions
            .iter()
            .any(|a| matches!(a, Action::Uri { uri, .. } if uri == "tel:0286741111")));
        assert!(bubbles[0].actions.iter().any(|a| a.label() == "查看成員"));
    }

    #[test]
    fn test_dial_uri_keeps_extension() {
        assert_eq!(dial_uri("02-8674-1111,66119"), "tel:0286741111,66119");
    }
}
