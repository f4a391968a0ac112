//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::GraphEngine;
use crate::search::MemorySearchIndex;

pub(crate) const OWNER: &str = "roger";

/// Engine over a fresh in-memory database.
pub(crate) async fn engine() -> GraphEngine {
    engine_with_index(Arc::new(MemorySearchIndex::new())).await
}

pub(crate) async fn engine_with_index(index: Arc<MemorySearchIndex>) -> GraphEngine {
    GraphEngine::connect(EngineConfig::in_memory(), index)
        .await
        .unwrap()
}

/// `vertex A -> vertex B -> vertex C`, plus a group relation "to do"
/// including C, D and E.
pub(crate) struct Fixture {
    pub engine: GraphEngine,
    pub index: Arc<MemorySearchIndex>,
    pub a: String,
    pub b: String,
    pub c: String,
    pub d: String,
    pub e: String,
    pub ab: String,
    pub bc: String,
    pub group: String,
}

pub(crate) async fn three_vertices_and_group() -> Fixture {
    let index = Arc::new(MemorySearchIndex::new());
    let engine = engine_with_index(index.clone()).await;

    let mut vertices = Vec::new();
    for label in ["vertex A", "vertex B", "vertex C", "vertex D", "vertex E"] {
        vertices.push(engine.create_vertex_with_label(OWNER, label).await.unwrap().uri);
    }
    let [a, b, c, d, e] = <[String; 5]>::try_from(vertices).unwrap();

    let ab = engine.add_edge(&a, &b).await.unwrap().uri().to_string();
    let bc = engine.add_edge(&b, &c).await.unwrap().uri().to_string();
    let group = engine
        .create_group_relation(OWNER, "to do", &[c.clone(), d.clone(), e.clone()], &[])
        .await
        .unwrap()
        .uri;

    Fixture {
        engine,
        index,
        a,
        b,
        c,
        d,
        e,
        ab,
        bc,
        group,
    }
}
