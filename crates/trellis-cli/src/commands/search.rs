use anyhow::{anyhow, Result};
use console::style;
use trellis_graph::{Audience, EngineConfig};

use crate::commands::open_engine;
use crate::ui;

pub fn owner_audience(owner: Option<String>) -> Result<Audience> {
    owner
        .map(Audience::Owner)
        .ok_or_else(|| anyhow!("--owner is required when searching as the owner"))
}

pub async fn run(config: EngineConfig, term: &str, audience: Audience, limit: usize) -> Result<()> {
    let (_engine, search) = open_engine(config).await?;
    let hits = search.search(term, &audience, limit).await?;

    if hits.is_empty() {
        ui::info("No results.");
        return Ok(());
    }

    for hit in hits {
        println!("{} {}", style(&hit.label).bold(), style(&hit.uri).dim());
        if !hit.context.is_empty() {
            ui::info(&hit.context);
        }
    }
    Ok(())
}
