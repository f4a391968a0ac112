//! Search index collaborator.
//!
//! The engine pushes one [`SearchDocument`] per (re)indexed element and a
//! removal per deleted element, always after the owning transaction commits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::schema::{ElementKind, GraphElement, ShareLevel};

/// What the search index stores for one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub uri: String,
    pub owner: String,
    pub kind: ElementKind,
    pub label: String,
    pub private_context: String,
    pub friend_context: String,
    pub public_context: String,
    /// Audiences allowed to see the document.
    pub visible_to: Vec<ShareLevel>,
}

impl SearchDocument {
    pub fn from_element(element: &GraphElement) -> Self {
        Self {
            uri: element.uri.clone(),
            owner: element.owner.clone(),
            kind: element.kind,
            label: element.label.clone(),
            private_context: element.private_context.clone(),
            friend_context: element.friend_context.clone(),
            public_context: element.public_context.clone(),
            visible_to: element.share_level.visible_to(),
        }
    }

    /// Context shown to an audience, if that audience may see the document.
    pub fn context_for(&self, audience: ShareLevel) -> Option<&str> {
        if !self.visible_to.contains(&audience) {
            return None;
        }
        Some(match audience {
            ShareLevel::Private => &self.private_context,
            ShareLevel::Friends => &self.friend_context,
            ShareLevel::Public => &self.public_context,
        })
    }
}

/// Sink for indexed documents.
#[async_trait]
pub trait SearchIndexWriter: Send + Sync {
    async fn index(&self, document: SearchDocument) -> Result<()>;
    async fn remove(&self, uri: &str) -> Result<()>;
}

/// Records pushes in memory. Useful for tests and dry runs.
#[derive(Default)]
pub struct MemorySearchIndex {
    documents: Mutex<BTreeMap<String, SearchDocument>>,
    removed: Mutex<Vec<String>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, uri: &str) -> Option<SearchDocument> {
        self.documents.lock().await.get(uri).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }

    /// URIs removed so far, in push order.
    pub async fn removed(&self) -> Vec<String> {
        self.removed.lock().await.clone()
    }
}

#[async_trait]
impl SearchIndexWriter for MemorySearchIndex {
    async fn index(&self, document: SearchDocument) -> Result<()> {
        self.documents
            .lock()
            .await
            .insert(document.uri.clone(), document);
        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<()> {
        self.documents.lock().await.remove(uri);
        self.removed.lock().await.push(uri.to_string());
        Ok(())
    }
}

/// Who is searching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// The graph owner; sees every own document and its private context.
    Owner(String),
    /// A friend of the owners; sees friends-visible documents.
    Friends,
    Public,
}

impl Audience {
    fn tier(&self) -> ShareLevel {
        match self {
            Audience::Owner(_) => ShareLevel::Private,
            Audience::Friends => ShareLevel::Friends,
            Audience::Public => ShareLevel::Public,
        }
    }

    fn context_column(&self) -> &'static str {
        match self {
            Audience::Owner(_) => "private_context",
            Audience::Friends => "friend_context",
            Audience::Public => "public_context",
        }
    }
}

/// A search result with the context appropriate to the audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub uri: String,
    pub owner: String,
    pub label: String,
    pub context: String,
}

/// FTS5-backed document table.
#[derive(Clone)]
pub struct SqliteSearchIndex {
    pool: SqlitePool,
}

impl SqliteSearchIndex {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let index = Self { pool };
        index.init_schema().await?;
        Ok(index)
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS search_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                kind TEXT NOT NULL,
                label TEXT NOT NULL,
                private_context TEXT NOT NULL,
                friend_context TEXT NOT NULL,
                public_context TEXT NOT NULL,
                share_level INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS search_documents_fts USING fts5(\
                label, private_context, friend_context, public_context,\
                content='search_documents',\
                content_rowid='id'\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS search_documents_ai AFTER INSERT ON search_documents BEGIN\n\
                INSERT INTO search_documents_fts(rowid, label, private_context, friend_context, public_context)\n\
                VALUES (new.id, new.label, new.private_context, new.friend_context, new.public_context);\n\
            END;",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS search_documents_ad AFTER DELETE ON search_documents BEGIN\n\
                INSERT INTO search_documents_fts(search_documents_fts, rowid, label, private_context, friend_context, public_context)\n\
                VALUES ('delete', old.id, old.label, old.private_context, old.friend_context, old.public_context);\n\
            END;",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TRIGGER IF NOT EXISTS search_documents_au AFTER UPDATE ON search_documents BEGIN\n\
                INSERT INTO search_documents_fts(search_documents_fts, rowid, label, private_context, friend_context, public_context)\n\
                VALUES ('delete', old.id, old.label, old.private_context, old.friend_context, old.public_context);\n\
                INSERT INTO search_documents_fts(rowid, label, private_context, friend_context, public_context)\n\
                VALUES (new.id, new.label, new.private_context, new.friend_context, new.public_context);\n\
            END;",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Phrase search over label and the audience's context view.
    #[instrument(skip(self))]
    pub async fn search(&self, term: &str, audience: &Audience, limit: usize) -> Result<Vec<SearchHit>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let column = audience.context_column();
        let fts_query = format!("{{label {column}}} : \"{}\"", term.replace('"', "\"\""));
        let owner = match audience {
            Audience::Owner(owner) => Some(owner.as_str()),
            _ => None,
        };

        let rows = sqlx::query_as::<_, (String, String, String, String)>(&format!(
            "SELECT d.uri, d.owner, d.label, d.{column}
             FROM search_documents_fts f JOIN search_documents d ON d.id = f.rowid
             WHERE search_documents_fts MATCH ?1
               AND d.share_level >= ?2
               AND (?3 IS NULL OR d.owner = ?3)
             ORDER BY bm25(search_documents_fts)
             LIMIT ?4"
        ))
        .bind(&fts_query)
        .bind(audience.tier().as_int())
        .bind(owner)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        debug!(hits = rows.len(), "search complete");
        Ok(rows
            .into_iter()
            .map(|(uri, owner, label, context)| SearchHit {
                uri,
                owner,
                label,
                context,
            })
            .collect())
    }
}

#[async_trait]
impl SearchIndexWriter for SqliteSearchIndex {
    async fn index(&self, document: SearchDocument) -> Result<()> {
        // visible_to is always a prefix of the tier order, so its top tier is enough
        let share_level = document
            .visible_to
            .iter()
            .max()
            .copied()
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO search_documents (uri, owner, kind, label, private_context, friend_context, public_context, share_level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(uri) DO UPDATE SET
                owner = excluded.owner,
                kind = excluded.kind,
                label = excluded.label,
                private_context = excluded.private_context,
                friend_context = excluded.friend_context,
                public_context = excluded.public_context,
                share_level = excluded.share_level",
        )
        .bind(&document.uri)
        .bind(&document.owner)
        .bind(document.kind.as_str())
        .bind(&document.label)
        .bind(&document.private_context)
        .bind(&document.friend_context)
        .bind(&document.public_context)
        .bind(share_level.as_int())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<()> {
        sqlx::query("DELETE FROM search_documents WHERE uri = ?1")
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
