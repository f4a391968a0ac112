use anyhow::Result;
use console::style;
use trellis_graph::{EngineConfig, VerifySeverity};

use crate::commands::open_engine;
use crate::ui;

pub async fn run(config: EngineConfig, json: bool) -> Result<()> {
    let (engine, _search) = open_engine(config).await?;
    let report = engine.verify().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    ui::header(&format!(
        "Checked {} elements ({} relations, {} identifications)",
        report.counts.elements, report.counts.relations, report.counts.identifications
    ));

    for finding in &report.findings {
        let marker = match finding.severity {
            VerifySeverity::Error => style("error").red(),
            VerifySeverity::Warning => style("warning").yellow(),
        };
        println!("  {marker} {}", style(&finding.uri).dim());
        ui::info(&format!("  {}", finding.message));
    }
    if report.truncated > 0 {
        ui::info(&format!("... and {} more", report.truncated));
    }

    println!();
    if report.success {
        ui::success("Graph is consistent.");
    } else {
        ui::error("Inconsistencies found. Run `trellis reindex` to repair.");
        std::process::exit(1);
    }
    Ok(())
}
