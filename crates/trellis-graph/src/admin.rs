//! Whole-graph maintenance jobs.
//!
//! These recompute derived state from live adjacency, ignoring whatever is
//! cached on the elements, so they also repair drift. Each element is
//! committed on its own: a failure on one is logged and the pass moves on.

use std::time::Instant;

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::context;
use crate::engine::GraphEngine;
use crate::error::Result;
use crate::schema::{ElementKind, NeighborCount};
use crate::storage;
use crate::visibility;

const MAX_FINDINGS: usize = 64;

/// Summary of a whole-graph pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub processed: usize,
    pub failed: usize,
    pub duration_ms: u128,
}

/// Severity of a verification finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    Warning,
    Error,
}

/// One inconsistency found by [`GraphEngine::verify`].
#[derive(Debug, Clone, Serialize)]
pub struct VerifyFinding {
    pub severity: VerifySeverity,
    pub uri: String,
    pub message: String,
}

/// How much was examined.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyCounts {
    pub elements: u64,
    pub relations: u64,
    pub identifications: u64,
}

/// Result of a read-only audit.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Whether no errors were found.
    pub success: bool,
    pub findings: Vec<VerifyFinding>,
    pub counts: VerifyCounts,
    /// Findings beyond the reported ones.
    pub truncated: usize,
}

impl VerifyReport {
    fn push(&mut self, finding: VerifyFinding) {
        if finding.severity == VerifySeverity::Error {
            self.success = false;
        }
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(finding);
        } else {
            self.truncated += 1;
        }
    }
}

/// Element counts per kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub total: i64,
    pub by_kind: Vec<(String, i64)>,
    pub dirty: usize,
}

/// Authoritative recount of one element from its live neighbors.
///
/// Tags also get their reference count recomputed.
pub(crate) async fn recount_tx(conn: &mut SqliteConnection, uri: &str) -> Result<NeighborCount> {
    let element = storage::require_element(conn, uri).await?;
    let neighbors = storage::neighbors(conn, uri, element.kind).await?;
    let counts = NeighborCount::tally(neighbors.iter().map(|neighbor| neighbor.share_level));
    storage::write_counts(conn, uri, counts).await?;
    if element.kind == ElementKind::Tag {
        let attached = storage::elements_identified_to(conn, uri).await?;
        storage::set_nb_references(conn, uri, attached.len() as i64).await?;
    }
    Ok(counts)
}

impl GraphEngine {
    /// Re-derive relation tiers, then recount and re-index every element.
    ///
    /// Idempotent; safe to re-run after a partial failure.
    #[instrument(skip(self))]
    pub async fn reindex_all(&self) -> Result<ReindexReport> {
        let started = Instant::now();
        let mut report = ReindexReport::default();

        let relations = {
            let mut conn = self.store().pool().acquire().await?;
            storage::element_uris_of_kind(&mut conn, ElementKind::Relation).await?
        };
        for uri in &relations {
            if let Err(err) = self.repair_relation_tier(uri).await {
                warn!(%uri, error = %err, "relation tier repair failed");
                report.failed += 1;
            }
        }

        let uris = {
            let mut conn = self.store().pool().acquire().await?;
            storage::all_element_uris(&mut conn).await?
        };
        for uri in &uris {
            match self.reindex_one(uri).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    warn!(%uri, error = %err, "reindex failed");
                    report.failed += 1;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis();
        info!(
            processed = report.processed,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "reindex complete"
        );
        Ok(report)
    }

    async fn repair_relation_tier(&self, uri: &str) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let row = storage::get_relation_row(&mut tx, uri).await?;
        if let Some(row) = row {
            let tier = visibility::effective_tier(&mut tx, &row.source_uri, &row.destination_uri).await?;
            // counts are rebuilt in the second phase
            storage::update_share_level(&mut tx, uri, tier).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reindex_one(&self, uri: &str) -> Result<()> {
        let mut tx = self.store().begin().await?;
        recount_tx(&mut tx, uri).await?;
        let element = context::index_element_tx(&mut tx, uri, &self.config().context).await?;
        tx.commit().await?;
        self.push_document(&element).await
    }

    /// Recount neighbors of every non-tag element.
    #[instrument(skip(self))]
    pub async fn refresh_nb_neighbors(&self) -> Result<ReindexReport> {
        let started = Instant::now();
        let uris = {
            let mut conn = self.store().pool().acquire().await?;
            storage::all_element_uris(&mut conn).await?
        };
        let mut report = ReindexReport::default();
        for uri in &uris {
            match self.refresh_one(uri).await {
                Ok(true) => report.processed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(%uri, error = %err, "neighbor refresh failed");
                    report.failed += 1;
                }
            }
        }
        report.duration_ms = started.elapsed().as_millis();
        info!(processed = report.processed, "neighbor counts refreshed");
        Ok(report)
    }

    /// Recount one non-tag element; false when it is a tag or gone.
    async fn refresh_one(&self, uri: &str) -> Result<bool> {
        let mut tx = self.store().begin().await?;
        let Some(element) = storage::get_element(&mut tx, uri).await? else {
            return Ok(false);
        };
        if element.kind == ElementKind::Tag {
            return Ok(false);
        }
        recount_tx(&mut tx, uri).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Recount references and neighbors of every identification.
    #[instrument(skip(self))]
    pub async fn refresh_nb_neighbors_of_tags(&self) -> Result<ReindexReport> {
        let started = Instant::now();
        let uris = {
            let mut conn = self.store().pool().acquire().await?;
            storage::all_identification_uris(&mut conn).await?
        };
        let mut report = ReindexReport::default();
        for uri in &uris {
            let mut tx = self.store().begin().await?;
            match recount_tx(&mut tx, uri).await {
                Ok(_) => {
                    tx.commit().await?;
                    report.processed += 1;
                }
                Err(err) => {
                    warn!(%uri, error = %err, "tag refresh failed");
                    report.failed += 1;
                }
            }
        }
        report.duration_ms = started.elapsed().as_millis();
        info!(processed = report.processed, "tag counts refreshed");
        Ok(report)
    }

    /// Read-only audit of counters, relation tiers and reference counts.
    #[instrument(skip(self))]
    pub async fn verify(&self) -> Result<VerifyReport> {
        let mut conn = self.store().pool().acquire().await?;
        let mut report = VerifyReport {
            success: true,
            findings: Vec::new(),
            counts: VerifyCounts::default(),
            truncated: 0,
        };

        for uri in storage::all_element_uris(&mut conn).await? {
            let Some(element) = storage::get_element(&mut conn, &uri).await? else {
                continue;
            };
            report.counts.elements += 1;

            let neighbors = storage::neighbors(&mut conn, &uri, element.kind).await?;
            let expected =
                NeighborCount::tally(neighbors.iter().map(|neighbor| neighbor.share_level));
            if expected != element.nb_neighbors {
                report.push(VerifyFinding {
                    severity: VerifySeverity::Error,
                    uri: uri.clone(),
                    message: format!(
                        "neighbor counts {:?} differ from live adjacency {:?}",
                        element.nb_neighbors, expected
                    ),
                });
            }

            match element.kind {
                ElementKind::Relation => {
                    report.counts.relations += 1;
                    match storage::get_relation_row(&mut conn, &uri).await? {
                        Some(row) => {
                            let source = storage::get_element(&mut conn, &row.source_uri).await?;
                            let destination =
                                storage::get_element(&mut conn, &row.destination_uri).await?;
                            match (source, destination) {
                                (Some(source), Some(destination)) => {
                                    let tier = source.share_level.min(destination.share_level);
                                    if tier != element.share_level {
                                        report.push(VerifyFinding {
                                            severity: VerifySeverity::Error,
                                            uri: uri.clone(),
                                            message: format!(
                                                "relation tier {} should be {}",
                                                element.share_level.as_str(),
                                                tier.as_str()
                                            ),
                                        });
                                    }
                                }
                                _ => report.push(VerifyFinding {
                                    severity: VerifySeverity::Error,
                                    uri: uri.clone(),
                                    message: "relation endpoint is missing".to_string(),
                                }),
                            }
                        }
                        None => report.push(VerifyFinding {
                            severity: VerifySeverity::Error,
                            uri: uri.clone(),
                            message: "relation has no endpoints".to_string(),
                        }),
                    }
                }
                ElementKind::Tag => {
                    report.counts.identifications += 1;
                    let attached = storage::elements_identified_to(&mut conn, &uri).await?;
                    match storage::identification_by_uri(&mut conn, &uri).await? {
                        Some(record) if record.nb_references != attached.len() as i64 => {
                            report.push(VerifyFinding {
                                severity: VerifySeverity::Error,
                                uri: uri.clone(),
                                message: format!(
                                    "reference count {} but {} elements attached",
                                    record.nb_references,
                                    attached.len()
                                ),
                            });
                        }
                        Some(_) => {}
                        None => report.push(VerifyFinding {
                            severity: VerifySeverity::Warning,
                            uri: uri.clone(),
                            message: "tag element without identification record".to_string(),
                        }),
                    }
                }
                _ => {}
            }

            if neighbors.len() < storage::neighbor_uris(&mut conn, &uri, element.kind).await?.len() {
                report.push(VerifyFinding {
                    severity: VerifySeverity::Warning,
                    uri: uri.clone(),
                    message: "adjacency references elements that no longer exist".to_string(),
                });
            }
        }

        if !report.success {
            warn!(findings = report.findings.len(), "verification found inconsistencies");
        }
        Ok(report)
    }

    /// Element counts per kind and the size of the dirty set.
    pub async fn stats(&self) -> Result<GraphStats> {
        let total = self.store().element_count().await?;
        let by_kind = self.store().element_count_by_kind().await?;
        let mut conn = self.store().pool().acquire().await?;
        let dirty = storage::dirty_uris(&mut conn).await?.len();
        Ok(GraphStats {
            total,
            by_kind,
            dirty,
        })
    }
}
