//! Visibility propagation.
//!
//! Keeps per-tier neighbor counters and relation tiers consistent when an
//! element changes tier or an edge is added. Every helper here runs inside
//! the caller's transaction; a counter that would go negative aborts it.

use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::engine::GraphEngine;
use crate::error::{GraphError, Result};
use crate::schema::{ElementKind, GraphElement, NeighborCount, Relation, ShareLevel, UserUris};
use crate::storage::{self, NewElement};

/// Move `uri`'s contribution from `old` to `new` in every dependent's counters.
pub(crate) async fn propagate_tier_change(
    conn: &mut SqliteConnection,
    uri: &str,
    kind: ElementKind,
    old: ShareLevel,
    new: ShareLevel,
) -> Result<Vec<String>> {
    let dependents = storage::dependents(conn, uri, kind).await?;
    if old != new {
        let delta = NeighborCount::tier_change(old, new);
        for dependent in &dependents {
            storage::adjust_counts(conn, dependent, delta).await?;
        }
    }
    Ok(dependents)
}

/// Tier a relation must carry given its endpoints.
pub(crate) async fn effective_tier(
    conn: &mut SqliteConnection,
    source_uri: &str,
    destination_uri: &str,
) -> Result<ShareLevel> {
    let source = storage::require_element(conn, source_uri).await?;
    let destination = storage::require_element(conn, destination_uri).await?;
    Ok(source.share_level.min(destination.share_level))
}

/// Re-derive a relation's tier, propagating the change to its dependents.
///
/// Returns the URIs whose contexts are now stale (empty when unchanged).
pub(crate) async fn refresh_relation_tier(
    conn: &mut SqliteConnection,
    relation_uri: &str,
) -> Result<Vec<String>> {
    let row = storage::get_relation_row(conn, relation_uri)
        .await?
        .ok_or_else(|| GraphError::not_found(relation_uri))?;
    let relation = storage::require_element(conn, relation_uri).await?;
    let tier = effective_tier(conn, &row.source_uri, &row.destination_uri).await?;
    if tier == relation.share_level {
        return Ok(Vec::new());
    }
    storage::update_share_level(conn, relation_uri, tier).await?;
    let mut stale =
        propagate_tier_change(conn, relation_uri, ElementKind::Relation, relation.share_level, tier)
            .await?;
    stale.push(relation_uri.to_string());
    Ok(stale)
}

/// Change an element's tier and everything derived from it.
pub(crate) async fn set_share_level_tx(
    conn: &mut SqliteConnection,
    uri: &str,
    share_level: ShareLevel,
) -> Result<Vec<String>> {
    let element = storage::require_element(conn, uri).await?;
    if element.kind == ElementKind::Relation {
        return Err(GraphError::invalid(format!(
            "the tier of relation {uri} is derived from its endpoints"
        )));
    }
    let old = element.share_level;
    if old == share_level {
        return Ok(Vec::new());
    }

    storage::update_share_level(conn, uri, share_level).await?;
    let mut stale = propagate_tier_change(conn, uri, element.kind, old, share_level).await?;
    stale.push(uri.to_string());

    if element.kind == ElementKind::Vertex {
        for relation in storage::relations_of(conn, uri).await? {
            stale.extend(refresh_relation_tier(conn, &relation.uri).await?);
        }
    }

    storage::mark_dirty(conn, &stale).await?;
    Ok(stale)
}

/// Insert a relation between two existing, distinct vertices and count it.
pub(crate) async fn add_edge_tx(
    conn: &mut SqliteConnection,
    source_uri: &str,
    destination_uri: &str,
    relation_uri: &str,
) -> Result<Vec<String>> {
    if source_uri == destination_uri {
        return Err(GraphError::invalid(format!(
            "cannot relate {source_uri} to itself"
        )));
    }
    let source = storage::require_element(conn, source_uri).await?;
    let destination = storage::require_element(conn, destination_uri).await?;
    for endpoint in [&source, &destination] {
        if endpoint.kind != ElementKind::Vertex {
            return Err(GraphError::invalid(format!(
                "{} is a {}, relations connect vertices",
                endpoint.uri,
                endpoint.kind.as_str()
            )));
        }
    }

    let tier = source.share_level.min(destination.share_level);
    storage::insert_element(
        conn,
        &NewElement {
            uri: relation_uri,
            owner: &source.owner,
            kind: ElementKind::Relation,
            label: "",
            comment: "",
            share_level: tier,
        },
    )
    .await?;
    storage::insert_relation(conn, relation_uri, source_uri, destination_uri).await?;

    storage::adjust_counts(
        conn,
        source_uri,
        NeighborCount::of_neighbor(destination.share_level, 1),
    )
    .await?;
    storage::adjust_counts(
        conn,
        destination_uri,
        NeighborCount::of_neighbor(source.share_level, 1),
    )
    .await?;
    storage::write_counts(
        conn,
        relation_uri,
        NeighborCount::tally([source.share_level, destination.share_level]),
    )
    .await?;

    let mut stale = vec![
        relation_uri.to_string(),
        source_uri.to_string(),
        destination_uri.to_string(),
    ];
    stale.extend(storage::dependents(conn, source_uri, ElementKind::Vertex).await?);
    stale.extend(storage::dependents(conn, destination_uri, ElementKind::Vertex).await?);
    storage::mark_dirty(conn, &stale).await?;
    Ok(stale)
}

impl GraphEngine {
    /// Change the visibility tier of a vertex, tag or group relation.
    #[instrument(skip(self))]
    pub async fn set_share_level(&self, uri: &str, share_level: ShareLevel) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        let stale = set_share_level_tx(&mut tx, uri, share_level).await?;
        let element = storage::require_element(&mut tx, uri).await?;
        tx.commit().await?;
        debug!(stale = stale.len(), "share level changed");
        self.after_commit(&[]).await;
        Ok(element)
    }

    /// Relate two vertices. The relation is owned by the source's owner.
    #[instrument(skip(self))]
    pub async fn add_edge(&self, source_uri: &str, destination_uri: &str) -> Result<Relation> {
        let mut tx = self.store().begin().await?;
        let owner = storage::require_element(&mut tx, source_uri).await?.owner;
        let relation_uri = UserUris::new(owner).fresh_uri(ElementKind::Relation);
        add_edge_tx(&mut tx, source_uri, destination_uri, &relation_uri).await?;
        let relation = storage::get_relation(&mut tx, &relation_uri)
            .await?
            .ok_or_else(|| GraphError::not_found(&relation_uri))?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(relation)
    }
}
