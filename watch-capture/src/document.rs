use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};

/// Read access to the current state of the observed document.
pub trait Document {
    /// Full current location, including query string.
    fn location(&self) -> String;
    /// The document's own title metadata.
    fn title(&self) -> String;
    /// Text content of the first node matching `selector`, if any.
    fn select_text(&self, selector: &str) -> Option<String>;
}

/// Flattened view of a document as reported by the host: the location, the
/// title, and the text of the nodes the extraction rules care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DocumentSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub nodes: HashMap<String, String>,
}

impl DocumentSnapshot {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: url.to_owned(),
            title: title.to_owned(),
            nodes: HashMap::new(),
        }
    }

    pub fn with_node(mut self, selector: &str, text: &str) -> Self {
        self.nodes.insert(selector.to_owned(), text.to_owned());
        self
    }
}

impl Document for DocumentSnapshot {
    fn location(&self) -> String {
        self.url.clone()
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    fn select_text(&self, selector: &str) -> Option<String> {
        self.nodes.get(selector).cloned()
    }
}

/// A snapshot the host keeps replacing as the document mutates. Clones share state.
#[derive(Clone, Default)]
pub struct LiveDocument {
    current: Arc<RwLock<DocumentSnapshot>>,
}

impl LiveDocument {
    pub fn new(snapshot: DocumentSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn replace(&self, snapshot: DocumentSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.read().clone()
    }
}

impl LiveDocument {
    fn read(&self) -> RwLockReadGuard<'_, DocumentSnapshot> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Document for LiveDocument {
    fn location(&self) -> String {
        self.read().location()
    }

    fn title(&self) -> String {
        self.read().title()
    }

    fn select_text(&self, selector: &str) -> Option<String> {
        self.read().select_text(selector)
    }
}
