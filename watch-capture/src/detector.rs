//! Extraction of candidate events from the observed document.
//!
//! The detector is stateless: given the document as it is right now it yields
//! at most one `CandidateEvent`. Triggers only decide *when* it runs.
use std::collections::BTreeMap;

use watch_common::event::CandidateEvent;

use crate::document::Document;

/// What to use when none of a field's selectors produced text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// The document title, with the first occurrence of `remove` cut out.
    DocumentTitle { remove: Option<String> },
    Literal(String),
}

/// How to fill one optional attribute: selectors are tried in order and the
/// first non-empty trimmed text wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub name: String,
    pub selectors: Vec<String>,
    pub fallback: Fallback,
}

impl FieldRule {
    pub fn new(name: &str, selectors: &[&str], fallback: Fallback) -> Self {
        Self {
            name: name.to_owned(),
            selectors: selectors.iter().map(|s| (*s).to_owned()).collect(),
            fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRules {
    /// The location must contain this marker for anything to be extracted.
    pub location_marker: String,
    /// Query parameter holding the subject id.
    pub subject_param: String,
    pub fields: Vec<FieldRule>,
}

impl ExtractionRules {
    /// Rules for a video watch page: `/watch?v=<id>` with title and channel.
    pub fn watch_page() -> Self {
        Self {
            location_marker: "/watch".to_owned(),
            subject_param: "v".to_owned(),
            fields: vec![
                FieldRule::new(
                    "title",
                    &["h1.title yt-formatted-string"],
                    Fallback::DocumentTitle {
                        remove: Some("- YouTube".to_owned()),
                    },
                ),
                FieldRule::new(
                    "channel",
                    &["#channel-name a", "ytd-channel-name a"],
                    Fallback::Literal(String::new()),
                ),
            ],
        }
    }
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self::watch_page()
    }
}

pub struct ChangeDetector {
    rules: ExtractionRules,
}

impl ChangeDetector {
    pub fn new(rules: ExtractionRules) -> Self {
        Self { rules }
    }

    /// Extract the candidate event for the document's current state, or
    /// `None` when no subject is present.
    pub fn detect(&self, document: &dyn Document, observed_at_millis: u64) -> Option<CandidateEvent> {
        let location = document.location();
        if !location.contains(&self.rules.location_marker) {
            return None;
        }

        let subject_id = self.subject_id(&location)?;

        let attributes: BTreeMap<String, String> = self
            .rules
            .fields
            .iter()
            .map(|rule| (rule.name.clone(), extract_field(document, rule)))
            .collect();

        CandidateEvent::new(&subject_id, observed_at_millis, &location, attributes).ok()
    }

    fn subject_id(&self, location: &str) -> Option<String> {
        let parsed = url::Url::parse(location).ok()?;
        let (_, value) = parsed
            .query_pairs()
            .find(|(key, _)| key == self.rules.subject_param.as_str())?;

        if value.is_empty() {
            None
        } else {
            Some(value.into_owned())
        }
    }
}

fn extract_field(document: &dyn Document, rule: &FieldRule) -> String {
    let selected = rule.selectors.iter().find_map(|selector| {
        document
            .select_text(selector)
            .map(|text| text.trim().to_owned())
            .filter(|text| !text.is_empty())
    });

    match selected {
        Some(text) => text,
        None => match &rule.fallback {
            Fallback::DocumentTitle { remove } => {
                let title = document.title();
                match remove {
                    Some(pattern) => title.replacen(pattern.as_str(), "", 1).trim().to_owned(),
                    None => title.trim().to_owned(),
                }
            }
            Fallback::Literal(value) => value.clone(),
        },
    }
}
