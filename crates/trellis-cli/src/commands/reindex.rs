use anyhow::{Context, Result};
use trellis_graph::{EngineConfig, ReindexReport};

use crate::commands::open_engine;
use crate::ui;

pub async fn run(config: EngineConfig) -> Result<()> {
    let (engine, _search) = open_engine(config).await?;

    let spinner = ui::spinner("Reindexing graph");
    let report = engine.reindex_all().await.context("Reindex failed")?;
    spinner.finish_and_clear();

    print_report("Reindexed", &report);
    Ok(())
}

pub async fn refresh(config: EngineConfig, tags: bool) -> Result<()> {
    let (engine, _search) = open_engine(config).await?;

    let spinner = ui::spinner("Refreshing neighbor counts");
    let report = if tags {
        engine.refresh_nb_neighbors_of_tags().await
    } else {
        engine.refresh_nb_neighbors().await
    }
    .context("Neighbor refresh failed")?;
    spinner.finish_and_clear();

    print_report(if tags { "Refreshed tags" } else { "Refreshed" }, &report);
    Ok(())
}

pub async fn index_dirty(config: EngineConfig) -> Result<()> {
    let (engine, _search) = open_engine(config).await?;
    let indexed = engine.index_dirty().await.context("Indexing failed")?;
    if indexed == 0 {
        ui::info("Nothing to index.");
    } else {
        ui::success(&format!("Indexed {indexed} elements"));
    }
    Ok(())
}

fn print_report(verb: &str, report: &ReindexReport) {
    ui::success(&format!(
        "{verb} {} elements in {} ms",
        report.processed, report.duration_ms
    ));
    if report.failed > 0 {
        ui::error(&format!(
            "{} elements failed (run with RUST_LOG=warn for details)",
            report.failed
        ));
    }
}
