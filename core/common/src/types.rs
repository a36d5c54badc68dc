//! Addressing types used throughout Tideline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path of a document collection, e.g. `plant` or `parents/p1/children`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath {
    components: Vec<String>,
}

impl CollectionPath {
    /// Create a collection path from string components.
    ///
    /// # Errors
    /// - Returns error if there are no components, or any component is
    ///   empty or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        if components.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection path cannot be empty".to_string(),
            ));
        }
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a `/`-separated collection path.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection path cannot be empty".to_string(),
            ));
        }
        Self::from_components(path.split('/').map(String::from).collect())
    }

    /// Address a document inside this collection.
    pub fn doc(&self, id: &str) -> crate::Result<DocumentKey> {
        validate_component(id)?;
        Ok(DocumentKey {
            collection: self.clone(),
            id: id.to_string(),
        })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Canonical string form without leading slash.
    pub fn as_string(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl FromStr for CollectionPath {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CollectionPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<CollectionPath> for String {
    fn from(path: CollectionPath) -> Self {
        path.as_string()
    }
}

/// Unique key of a document: its collection plus an id.
///
/// The string form is `collection/id`, so `plant/1` is document `1` of
/// collection `plant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentKey {
    collection: CollectionPath,
    id: String,
}

impl DocumentKey {
    /// Parse a key string; the last component is the id.
    ///
    /// # Errors
    /// - Returns error if the key has fewer than two components, or any
    ///   component is empty
    pub fn parse(key: &str) -> crate::Result<Self> {
        let trimmed = key.trim_matches('/');
        let mut components: Vec<String> = trimmed.split('/').map(String::from).collect();
        let id = components
            .pop()
            .filter(|_| !components.is_empty())
            .ok_or_else(|| {
                crate::Error::InvalidInput(format!(
                    "Document key must be <collection>/<id>: {}",
                    key
                ))
            })?;
        CollectionPath::from_components(components)?.doc(&id)
    }

    /// Collection this document belongs to.
    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    /// Document id within the collection.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

impl FromStr for DocumentKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.to_string()
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot be '{}'",
            comp
        )));
    }
    Ok(())
}
