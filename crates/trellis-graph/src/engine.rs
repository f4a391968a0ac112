//! `GraphEngine`: the entry point wiring the store, configuration and the
//! search index writer.
//!
//! Operations live next to the component they belong to (`element`,
//! `visibility`, `identification`, `context`, `admin`, `fork`) as further
//! `impl GraphEngine` blocks. Each mutating operation runs in one
//! transaction; the search index only hears about it after commit.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::schema::GraphElement;
use crate::search::{SearchDocument, SearchIndexWriter, SqliteSearchIndex};
use crate::storage::{self, GraphStore};

/// Consistency and indexing engine over one graph database.
#[derive(Clone)]
pub struct GraphEngine {
    store: GraphStore,
    config: EngineConfig,
    index: Arc<dyn SearchIndexWriter>,
}

impl GraphEngine {
    /// Wrap an existing store. The schema must already be initialized.
    pub fn new(store: GraphStore, config: EngineConfig, index: Arc<dyn SearchIndexWriter>) -> Self {
        Self {
            store,
            config,
            index,
        }
    }

    /// Open the configured database, create the schema and use `index` as
    /// the search index writer.
    #[instrument(skip_all, fields(database = %config.database_path.display()))]
    pub async fn connect(config: EngineConfig, index: Arc<dyn SearchIndexWriter>) -> Result<Self> {
        let pool = open_pool(&config).await?;
        GraphStore::init_schema(&pool).await?;
        info!("graph store ready");
        Ok(Self::new(GraphStore::new(pool), config, index))
    }

    /// Open the configured database with the FTS5 search index stored
    /// alongside the graph.
    pub async fn open(config: EngineConfig) -> Result<(Self, SqliteSearchIndex)> {
        let pool = open_pool(&config).await?;
        GraphStore::init_schema(&pool).await?;
        let search = SqliteSearchIndex::new(pool.clone()).await?;
        let engine = Self::new(GraphStore::new(pool), config, Arc::new(search.clone()));
        Ok((engine, search))
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn search_index(&self) -> &Arc<dyn SearchIndexWriter> {
        &self.index
    }

    /// Post-commit work shared by every mutation: push removals, then flush
    /// the dirty set when configured to.
    ///
    /// The mutation is already committed, so failures are only logged.
    /// Elements whose document was not pushed stay dirty.
    pub(crate) async fn after_commit(&self, removed: &[String]) {
        for uri in removed {
            if let Err(err) = self.index.remove(uri).await {
                warn!(%uri, error = %err, "search index removal failed");
            }
        }
        if self.config.index_after_mutation {
            match self.index_dirty().await {
                Ok(indexed) => debug!(indexed, "flushed dirty elements"),
                Err(err) => warn!(error = %err, "dirty flush failed"),
            }
        }
    }

    /// Push an element's document; on failure flag it dirty again so the
    /// next `index_dirty` retries it.
    pub(crate) async fn push_document(&self, element: &GraphElement) -> Result<()> {
        let Err(err) = self.index.index(SearchDocument::from_element(element)).await else {
            return Ok(());
        };
        let mut conn = self.store.pool().acquire().await?;
        storage::mark_dirty(&mut conn, &[element.uri.clone()]).await?;
        Err(err)
    }
}

async fn open_pool(config: &EngineConfig) -> Result<SqlitePool> {
    if config.is_in_memory() {
        // One connection, never recycled: each new connection would be a fresh empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::from_str("sqlite:")?
        .filename(&config.database_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::search::MemorySearchIndex;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let index = Arc::new(MemorySearchIndex::new());
        let engine = GraphEngine::connect(EngineConfig::in_memory(), index)
            .await
            .unwrap();
        assert_eq!(engine.store().element_count().await.unwrap(), 0);
        assert_eq!(engine.config().context.max_length, 110);
    }

    struct UnreachableIndex;

    #[async_trait::async_trait]
    impl SearchIndexWriter for UnreachableIndex {
        async fn index(&self, _document: SearchDocument) -> Result<()> {
            Err(GraphError::invalid("search index unreachable"))
        }

        async fn remove(&self, _uri: &str) -> Result<()> {
            Err(GraphError::invalid("search index unreachable"))
        }
    }

    #[tokio::test]
    async fn test_committed_mutation_survives_index_failure() {
        let config = EngineConfig {
            index_after_mutation: true,
            ..EngineConfig::in_memory()
        };
        let engine = GraphEngine::connect(config, Arc::new(UnreachableIndex))
            .await
            .unwrap();

        let a = engine.create_vertex_with_label("roger", "vertex A").await.unwrap();
        let b = engine.create_vertex_with_label("roger", "vertex B").await.unwrap();
        let relation = engine.add_edge(&a.uri, &b.uri).await.unwrap();

        // contexts were computed but the push failed, so they stay dirty
        let stored = engine.get_element(&a.uri).await.unwrap();
        assert_eq!(stored.private_context, "vertex B");
        assert!(stored.dirty);
        assert!(engine.index_element(&a.uri).await.is_err());
        assert!(engine.get_element(&a.uri).await.unwrap().dirty);

        engine.remove_element(relation.uri()).await.unwrap();
        assert!(!engine.has_element(relation.uri()).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_with_sqlite_search() {
        let (engine, _search) = GraphEngine::open(EngineConfig::in_memory()).await.unwrap();
        let vertex = engine.create_vertex_with_label("roger", "vertex A").await.unwrap();
        assert!(engine.has_element(&vertex.uri).await.unwrap());
    }
}
