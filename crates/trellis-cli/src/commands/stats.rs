use anyhow::Result;
use console::style;
use trellis_graph::EngineConfig;

use crate::commands::open_engine;
use crate::ui;

pub async fn run(config: EngineConfig, json: bool) -> Result<()> {
    let (engine, _search) = open_engine(config).await?;
    let stats = engine.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    ui::header(&format!("{} elements", style(stats.total).bold()));
    for (kind, count) in &stats.by_kind {
        println!("  {:<16} {}", kind, count);
    }
    println!();
    if stats.dirty > 0 {
        ui::info(&format!(
            "{} elements have stale contexts. Run `trellis index-dirty`.",
            stats.dirty
        ));
    }
    Ok(())
}
