//! Documents, queries and immutable index snapshots.
//!
//! An [`IndexSnapshot`] is fully loaded at open time. Once a reader holds one,
//! the files it was read from can be replaced or deleted without affecting it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::EntityType;

/// A single indexed document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Identifier of the entity this document was built from.
    pub id: String,
    /// Entity type the document belongs to.
    pub entity_type: EntityType,
    /// Field name to field text.
    pub fields: BTreeMap<String, String>,
}

impl Document {
    /// Creates a document with no fields.
    pub fn new(entity_type: impl Into<EntityType>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, replacing any previous value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns the key identifying this document inside an index.
    pub fn key(&self) -> DocKey {
        DocKey {
            entity_type: self.entity_type.clone(),
            id: self.id.clone(),
        }
    }
}

/// Unique key of a document within one index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    /// Entity type of the document.
    pub entity_type: EntityType,
    /// Entity identifier.
    pub id: String,
}

/// A query evaluated against every document of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    /// Matches every document.
    All,
    /// Matches documents whose field contains the token (case-insensitive).
    Term {
        /// Field name.
        field: String,
        /// Token to look for.
        value: String,
    },
    /// Matches when any sub-query matches.
    Or(Vec<Query>),
    /// Matches when every sub-query matches.
    And(Vec<Query>),
}

impl Query {
    /// Shorthand for a term query.
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Parses `field:value` clauses separated by ` OR `.
    ///
    /// `*` or an empty string yields [`Query::All`].
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() || input == "*" {
            return Some(Query::All);
        }
        let mut clauses = Vec::new();
        for clause in input.split(" OR ") {
            let (field, value) = clause.trim().split_once(':')?;
            if field.is_empty() || value.is_empty() {
                return None;
            }
            clauses.push(Query::term(field, value));
        }
        if clauses.len() == 1 {
            clauses.pop()
        } else {
            Some(Query::Or(clauses))
        }
    }

    /// Evaluates the query against one document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::All => true,
            Query::Term { field, value } => {
                let needle = value.to_lowercase();
                doc.fields
                    .get(field)
                    .map(|text| tokens(text).any(|t| t == needle))
                    .unwrap_or(false)
            }
            Query::Or(queries) => queries.iter().any(|q| q.matches(doc)),
            Query::And(queries) => queries.iter().all(|q| q.matches(doc)),
        }
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Immutable view of one committed index state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexSnapshot {
    version: u64,
    documents: BTreeMap<DocKey, Document>,
}

impl IndexSnapshot {
    /// Creates a snapshot from the committed documents at `version`.
    pub fn new(version: u64, documents: BTreeMap<DocKey, Document>) -> Self {
        Self { version, documents }
    }

    /// Commit version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> usize {
        self.documents.len()
    }

    /// Looks up a single document.
    pub fn get(&self, entity_type: &EntityType, id: &str) -> Option<&Document> {
        self.documents.get(&DocKey {
            entity_type: entity_type.clone(),
            id: id.to_string(),
        })
    }

    /// Returns every document matching the query, in key order.
    pub fn search(&self, query: &Query) -> Vec<Document> {
        self.documents
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect()
    }

    /// Iterates over all live documents.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storm(id: &str, location: &str) -> Document {
        Document::new("SnowStorm", id).with_field("location", location)
    }

    #[test]
    fn test_term_matches_token_case_insensitive() {
        let doc = storm("1", "Dallas, TX, USA");
        assert!(Query::term("location", "dallas").matches(&doc));
        assert!(Query::term("location", "TX").matches(&doc));
        assert!(!Query::term("location", "dal").matches(&doc));
        assert!(!Query::term("name", "dallas").matches(&doc));
    }

    #[test]
    fn test_boolean_queries() {
        let doc = storm("1", "Chennai, India");
        let or = Query::Or(vec![
            Query::term("location", "texas"),
            Query::term("location", "india"),
        ]);
        let and = Query::And(vec![
            Query::term("location", "texas"),
            Query::term("location", "india"),
        ]);
        assert!(or.matches(&doc));
        assert!(!and.matches(&doc));
        assert!(Query::All.matches(&doc));
    }

    #[test]
    fn test_parse() {
        assert_eq!(Query::parse("*"), Some(Query::All));
        assert_eq!(
            Query::parse("name:mouse"),
            Some(Query::term("name", "mouse"))
        );
        assert_eq!(
            Query::parse("name:mouse OR color:blue"),
            Some(Query::Or(vec![
                Query::term("name", "mouse"),
                Query::term("color", "blue"),
            ]))
        );
        assert_eq!(Query::parse("no-colon"), None);
        assert_eq!(Query::parse("name:"), None);
    }

    #[test]
    fn test_snapshot_search_and_get() {
        let mut docs = BTreeMap::new();
        for doc in [storm("1", "Dallas"), storm("2", "Melbourne, Australia")] {
            docs.insert(doc.key(), doc);
        }
        let snapshot = IndexSnapshot::new(3, docs);

        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.num_docs(), 2);
        assert_eq!(snapshot.search(&Query::term("location", "melbourne")).len(), 1);
        assert!(snapshot.get(&EntityType::new("SnowStorm"), "1").is_some());
        assert!(snapshot.get(&EntityType::new("Animal"), "1").is_none());
    }
}
