pub mod reindex;
pub mod search;
pub mod stats;
pub mod verify;

use std::path::Path;

use anyhow::{Context, Result};
use trellis_graph::{EngineConfig, GraphEngine, SqliteSearchIndex};

/// Load the engine config from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(EngineConfig::default_path);
    EngineConfig::load(&path)
}

/// Open the graph database with its FTS5 search index.
pub async fn open_engine(config: EngineConfig) -> Result<(GraphEngine, SqliteSearchIndex)> {
    let database = config.database_path.display().to_string();
    GraphEngine::open(config)
        .await
        .with_context(|| format!("Failed to open graph database: {database}"))
}
