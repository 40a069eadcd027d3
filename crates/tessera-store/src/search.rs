//! Query fan-out across shards.
//!
//! Each directory is read on tokio's blocking pool in parallel. A failing
//! directory is never dropped silently: it shows up as a [`ShardFailure`] next
//! to the hits of the directories that answered, and the caller decides
//! whether to degrade or fail the whole query.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::directory::DirectoryProvider;
use crate::document::{Document, Query};
use crate::error::{StoreError, StoreResult};
use crate::router::ShardRouter;
use crate::types::EntityType;

/// A matching document and the directory it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardHit {
    /// Directory name.
    pub directory: String,
    /// The matching document.
    pub document: Document,
}

/// A directory whose read failed.
#[derive(Debug)]
pub struct ShardFailure {
    /// Directory name.
    pub directory: String,
    /// Why the read failed.
    pub error: StoreError,
}

/// Merged result of a fan-out query.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// Hits, grouped by directory in query order.
    pub hits: Vec<ShardHit>,
    /// Directories that could not be read.
    pub failures: Vec<ShardFailure>,
}

impl SearchOutcome {
    /// Whether at least one directory failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Number of hits.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether there are no hits.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// The documents, or [`StoreError::PartialQueryFailure`] if any directory failed.
    pub fn into_strict(self) -> StoreResult<Vec<Document>> {
        if self.is_partial() {
            return Err(StoreError::PartialQueryFailure {
                failed: self.failures.into_iter().map(|f| f.directory).collect(),
            });
        }
        Ok(self.hits.into_iter().map(|h| h.document).collect())
    }
}

/// Runs `query` against every provider in parallel.
pub async fn search_providers(
    providers: Vec<Arc<dyn DirectoryProvider>>,
    query: &Query,
) -> SearchOutcome {
    let mut tasks = JoinSet::new();
    let names: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();

    for (slot, provider) in providers.into_iter().enumerate() {
        let query = query.clone();
        tasks.spawn_blocking(move || {
            let result = provider
                .open_reader()
                .map(|snapshot| snapshot.search(&query));
            (slot, result)
        });
    }

    let mut results: Vec<Option<StoreResult<Vec<Document>>>> =
        (0..names.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((slot, result)) => results[slot] = Some(result),
            Err(e) => warn!(error = %e, "shard read task did not complete"),
        }
    }

    let mut outcome = SearchOutcome::default();
    for (directory, result) in names.into_iter().zip(results) {
        let result = result.unwrap_or_else(|| {
            Err(StoreError::Io(std::io::Error::other(
                "shard read task did not complete",
            )))
        });
        match result {
            Ok(documents) => outcome.hits.extend(documents.into_iter().map(|document| ShardHit {
                directory: directory.clone(),
                document,
            })),
            Err(error) => {
                warn!(directory = %directory, error = %error, "shard read failed");
                outcome.failures.push(ShardFailure { directory, error });
            }
        }
    }
    outcome
}

impl ShardRouter {
    /// Runs `query` over every directory of the given entity types.
    ///
    /// Fails only when an entity type is unknown; per-directory failures are
    /// reported in the outcome.
    pub async fn search(
        &self,
        entity_types: &[EntityType],
        query: &Query,
    ) -> StoreResult<SearchOutcome> {
        let providers = self.providers_for_query(entity_types)?;
        Ok(search_providers(providers, query).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryProviderKind;
    use crate::directory::{DirectoryStatus, IndexWriter, MemoryDirectory};
    use crate::document::IndexSnapshot;

    #[derive(Debug)]
    struct UninitializedDirectory;

    impl DirectoryProvider for UninitializedDirectory {
        fn name(&self) -> &str {
            "Animal.1"
        }

        fn kind(&self) -> DirectoryProviderKind {
            DirectoryProviderKind::FilesystemSlave
        }

        fn open_reader(&self) -> StoreResult<Arc<IndexSnapshot>> {
            Err(StoreError::NotYetInitialized {
                directory: self.name().to_string(),
            })
        }

        fn writer(&self) -> StoreResult<IndexWriter<'_>> {
            Err(StoreError::ReadOnly {
                directory: self.name().to_string(),
            })
        }

        fn status(&self) -> DirectoryStatus {
            DirectoryStatus {
                name: self.name().to_string(),
                kind: self.kind(),
                initialized: false,
                committed_version: None,
                generation: None,
            }
        }
    }

    fn populated(name: &str, docs: &[(&str, &str)]) -> Arc<dyn DirectoryProvider> {
        let dir = MemoryDirectory::new(name);
        {
            let mut writer = dir.writer().unwrap();
            for (id, animal) in docs {
                writer.add(Document::new("Animal", *id).with_field("name", *animal));
            }
            writer.commit().unwrap();
        }
        Arc::new(dir)
    }

    #[tokio::test]
    async fn test_fan_out_merges_hits() {
        let providers = vec![
            populated("Animal.0", &[("2", "Bear")]),
            populated("Animal.1", &[("1", "Mouse"), ("3", "Cat")]),
        ];
        let query = Query::parse("name:mouse OR name:bear").unwrap();
        let outcome = search_providers(providers, &query).await;

        assert!(!outcome.is_partial());
        assert_eq!(outcome.len(), 2);
        assert_eq!(outcome.hits[0].directory, "Animal.0");
        assert_eq!(outcome.hits[1].directory, "Animal.1");
        assert_eq!(outcome.into_strict().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_shard_is_reported_not_dropped() {
        let providers: Vec<Arc<dyn DirectoryProvider>> = vec![
            populated("Animal.0", &[("2", "Bear")]),
            Arc::new(UninitializedDirectory),
        ];
        let outcome = search_providers(providers, &Query::All).await;

        assert!(outcome.is_partial());
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome.failures[0].directory, "Animal.1");
        assert!(matches!(
            outcome.failures[0].error,
            StoreError::NotYetInitialized { .. }
        ));

        match outcome.into_strict() {
            Err(StoreError::PartialQueryFailure { failed }) => {
                assert_eq!(failed, vec!["Animal.1".to_string()])
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_fan_out() {
        let outcome = search_providers(Vec::new(), &Query::All).await;
        assert!(outcome.is_empty());
        assert!(!outcome.is_partial());
    }
}
