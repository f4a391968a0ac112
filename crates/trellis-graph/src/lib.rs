//! Trellis Graph - consistency and indexing engine for user knowledge graphs.
//!
//! Users own graphs of vertices, relations, tags and group relations, each
//! visible at a tier (private, friends, public). This crate keeps three
//! derived structures consistent under mutation:
//!
//! - **Neighbor counters**: per-tier neighbor counts cached on every element
//! - **Surround context**: a bounded string of neighbor labels per audience,
//!   pushed to a search index
//! - **Identification references**: reference counts on shared tags
//!
//! Vertices can also hold suggestions, proposed neighbors that become a new
//! relation and vertex when accepted.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trellis_graph::{EngineConfig, GraphEngine, MemorySearchIndex, ShareLevel};
//!
//! let engine = GraphEngine::connect(EngineConfig::in_memory(), Arc::new(MemorySearchIndex::new())).await?;
//! let a = engine.create_vertex_with_label("roger", "vertex A").await?;
//! let b = engine.create_vertex_with_label("roger", "vertex B").await?;
//! engine.add_edge(&a.uri, &b.uri).await?;
//! engine.set_share_level(&b.uri, ShareLevel::Public).await?;
//! engine.index_dirty().await?;
//! ```

pub mod admin;
pub mod config;
pub mod context;
pub mod element;
pub mod engine;
pub mod error;
pub mod fork;
pub mod identification;
pub mod schema;
pub mod search;
pub mod storage;
pub mod suggestion;
pub mod visibility;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use admin::{GraphStats, ReindexReport, VerifyFinding, VerifyReport, VerifySeverity};
pub use config::{ContextConfig, EngineConfig};
pub use context::{compute_context, compute_views, ContextCandidate, ContextViews};
pub use engine::GraphEngine;
pub use error::{GraphError, Result};
pub use fork::ForkCache;
pub use schema::{
    ElementKind, GraphElement, Identification, IdentificationInput, NeighborCount, Relation,
    ShareLevel, Suggestion, UserUris,
};
pub use search::{
    Audience, MemorySearchIndex, SearchDocument, SearchHit, SearchIndexWriter, SqliteSearchIndex,
};
pub use storage::GraphStore;
