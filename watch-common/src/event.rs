use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Keys the wire format reserves for the event envelope. Attributes using
/// them would collide with the envelope when flattened.
const RESERVED_KEYS: [&str; 3] = ["videoId", "url", "ts"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("missing videoId")]
    MissingSubject,
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

/// A normalized record of "something worth reporting" extracted from the
/// observed document, e.g. the video currently being watched.
///
/// Immutable once built: all fields are private and only readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCandidateEvent")]
pub struct CandidateEvent {
    #[serde(rename = "videoId")]
    subject_id: String,
    #[serde(rename = "ts")]
    observed_at_millis: u64,
    #[serde(rename = "url")]
    source_url: String,
    #[serde(flatten)]
    attributes: BTreeMap<String, String>,
}

impl CandidateEvent {
    pub fn new(
        subject_id: &str,
        observed_at_millis: u64,
        source_url: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<Self, EventError> {
        if subject_id.is_empty() {
            return Err(EventError::MissingSubject);
        }

        let attributes = attributes
            .into_iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .collect();

        Ok(Self {
            subject_id: subject_id.to_owned(),
            observed_at_millis,
            source_url: source_url.to_owned(),
            attributes,
        })
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn observed_at_millis(&self) -> u64 {
        self.observed_at_millis
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Stable hash over the subject and its attributes. Capture time and
    /// source URL are excluded: two observations of the same content share a key.
    pub fn emission_key(&self) -> EmissionKey {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, self.subject_id.as_bytes());
        for (key, value) in &self.attributes {
            update_framed(&mut hasher, key.as_bytes());
            update_framed(&mut hasher, value.as_bytes());
        }

        EmissionKey(format!("{:x}", hasher.finalize()))
    }
}

/// Length-prefix every field so ("ab", "c") and ("a", "bc") hash differently.
fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl TryFrom<Value> for CandidateEvent {
    type Error = EventError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let raw: RawCandidateEvent =
            serde_json::from_value(value).map_err(|e| EventError::Malformed(e.to_string()))?;
        raw.try_into()
    }
}

/// Lenient wire shape. Observers are not always careful with types, so
/// non-string attribute values are stringified and nulls are dropped.
#[derive(Deserialize)]
struct RawCandidateEvent {
    #[serde(rename = "videoId", default)]
    subject_id: Option<String>,
    #[serde(rename = "ts", default)]
    observed_at_millis: Option<u64>,
    #[serde(rename = "url", default)]
    source_url: Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, Value>,
}

impl TryFrom<RawCandidateEvent> for CandidateEvent {
    type Error = EventError;

    fn try_from(raw: RawCandidateEvent) -> Result<Self, Self::Error> {
        let subject_id = raw.subject_id.unwrap_or_default();
        let attributes = raw
            .attributes
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((key, s)),
                other => Some((key, other.to_string())),
            })
            .collect();

        CandidateEvent::new(
            &subject_id,
            raw.observed_at_millis.unwrap_or_default(),
            raw.source_url.as_deref().unwrap_or_default(),
            attributes,
        )
    }
}

/// Content fingerprint of a `CandidateEvent`, see `CandidateEvent::emission_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmissionKey(String);

impl EmissionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
