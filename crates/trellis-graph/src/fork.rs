//! Fork, merge and set-based composite elements.
//!
//! - Fork copies a vertex into another user's graph and records provenance
//!   as an identification on the origin URI.
//! - Merge folds one vertex into another, keeping edge direction.
//! - Composites (composite vertices and group relations) hold non-owning
//!   included sets of vertices and edges.

use std::collections::{BTreeSet, HashMap};

use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

use crate::admin;
use crate::engine::GraphEngine;
use crate::error::{GraphError, Result};
use crate::identification;
use crate::schema::{
    ElementKind, GraphElement, IdentificationInput, NeighborCount, ShareLevel, UserUris,
};
use crate::storage::{self, NewElement};
use crate::visibility;

/// Forks made during one logical operation, keyed by (target user, origin URI).
///
/// Forking the same origin for the same user twice through one cache returns
/// the first fork.
#[derive(Debug, Default, Clone)]
pub struct ForkCache {
    forks: HashMap<(String, String), String>,
}

impl ForkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target_user: &str, origin_uri: &str) -> Option<&str> {
        self.forks
            .get(&(target_user.to_string(), origin_uri.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.forks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forks.is_empty()
    }
}

async fn fork_tx(
    conn: &mut SqliteConnection,
    cache: &mut ForkCache,
    target_user: &str,
    origin_uri: &str,
) -> Result<GraphElement> {
    if let Some(existing) = cache.get(target_user, origin_uri) {
        if let Some(element) = storage::get_element(conn, existing).await? {
            return Ok(element);
        }
    }

    let origin = storage::require_element(conn, origin_uri).await?;
    if origin.kind != ElementKind::Vertex {
        return Err(GraphError::invalid(format!(
            "only vertices can be forked, {origin_uri} is a {}",
            origin.kind.as_str()
        )));
    }

    let uri = UserUris::new(target_user).fresh_uri(ElementKind::Vertex);
    storage::insert_element(
        conn,
        &NewElement {
            uri: &uri,
            owner: target_user,
            kind: ElementKind::Vertex,
            label: &origin.label,
            comment: &origin.comment,
            share_level: ShareLevel::Private,
        },
    )
    .await?;

    let provenance = IdentificationInput::new(&origin.uri, &origin.label);
    let record = identification::find_or_create(conn, target_user, &provenance).await?;
    if record.label != origin.label {
        storage::update_label(conn, &record.uri, &origin.label).await?;
    }
    identification::attach_tx(conn, &uri, &record.uri).await?;

    cache
        .forks
        .insert((target_user.to_string(), origin_uri.to_string()), uri.clone());
    storage::require_element(conn, &uri).await
}

/// Fold `source_uri` into `target_uri` and delete the source.
async fn merge_tx(
    conn: &mut SqliteConnection,
    source_uri: &str,
    target_uri: &str,
) -> Result<Vec<String>> {
    if source_uri == target_uri {
        return Err(GraphError::invalid(format!("cannot merge {source_uri} into itself")));
    }
    let source = storage::require_element(conn, source_uri).await?;
    let target = storage::require_element(conn, target_uri).await?;
    for element in [&source, &target] {
        if element.kind != ElementKind::Vertex {
            return Err(GraphError::invalid(format!(
                "only vertices can be merged, {} is a {}",
                element.uri,
                element.kind.as_str()
            )));
        }
    }

    let mut removed = Vec::new();
    let mut affected = BTreeSet::from([target_uri.to_string()]);

    for row in storage::relations_of(conn, source_uri).await? {
        if row.other_end(source_uri) == target_uri {
            // would become a self loop
            for dependent in storage::dependents(conn, &row.uri, ElementKind::Relation).await? {
                affected.insert(dependent);
            }
            removed.extend(remove_relation_rows(conn, &row.uri).await?);
            continue;
        }
        let (new_source, new_destination) = if row.source_uri == source_uri {
            (target_uri, row.destination_uri.as_str())
        } else {
            (row.source_uri.as_str(), target_uri)
        };
        storage::update_relation_endpoints(conn, &row.uri, new_source, new_destination).await?;
        let tier = visibility::effective_tier(conn, new_source, new_destination).await?;
        storage::update_share_level(conn, &row.uri, tier).await?;
        affected.insert(row.uri.clone());
        affected.insert(row.other_end(source_uri).to_string());
        for dependent in storage::dependents(conn, &row.uri, ElementKind::Relation).await? {
            affected.insert(dependent);
        }
    }

    for owner in storage::owners_of(conn, source_uri).await? {
        storage::delete_inclusion(conn, &owner, source_uri).await?;
        if owner != target_uri {
            storage::insert_inclusion(conn, &owner, target_uri).await?;
        }
        affected.insert(owner);
    }
    for member in storage::members_of(conn, source_uri).await? {
        storage::delete_inclusion(conn, source_uri, &member).await?;
        if member != target_uri {
            storage::insert_inclusion(conn, target_uri, &member).await?;
        }
        affected.insert(member);
    }

    for record in storage::identifications_of(conn, source_uri).await? {
        storage::detach(conn, source_uri, &record.uri).await?;
        if !storage::attach(conn, target_uri, &record.uri).await? {
            storage::adjust_nb_references(conn, &record.uri, -1).await?;
        }
        affected.insert(record.uri);
    }

    storage::delete_element_row(conn, source_uri).await?;
    removed.push(source_uri.to_string());

    let affected: Vec<String> = affected
        .into_iter()
        .filter(|uri| !removed.contains(uri))
        .collect();
    for uri in &affected {
        admin::recount_tx(conn, uri).await?;
    }
    storage::mark_dirty(conn, &affected).await?;
    Ok(removed)
}

/// Delete a relation whose endpoints are about to merge; counts are
/// recomputed afterwards by the caller.
async fn remove_relation_rows(conn: &mut SqliteConnection, relation_uri: &str) -> Result<Vec<String>> {
    for owner in storage::owners_of(conn, relation_uri).await? {
        storage::delete_inclusion(conn, &owner, relation_uri).await?;
    }
    for record in storage::identifications_of(conn, relation_uri).await? {
        storage::detach(conn, relation_uri, &record.uri).await?;
        storage::adjust_nb_references(conn, &record.uri, -1).await?;
    }
    storage::delete_relation_row(conn, relation_uri).await?;
    storage::delete_element_row(conn, relation_uri).await?;
    Ok(vec![relation_uri.to_string()])
}

/// Create a composite element including `vertices` and `edges`.
pub(crate) async fn create_composite_tx(
    conn: &mut SqliteConnection,
    owner: &str,
    kind: ElementKind,
    label: &str,
    vertices: &[String],
    edges: &[String],
) -> Result<GraphElement> {
    let mut members: Vec<GraphElement> = Vec::new();
    for (uris, expected) in [(vertices, ElementKind::Vertex), (edges, ElementKind::Relation)] {
        for uri in uris {
            if members.iter().any(|member| &member.uri == uri) {
                continue;
            }
            let member = storage::require_element(conn, uri).await?;
            if member.kind != expected {
                return Err(GraphError::invalid(format!(
                    "{uri} is a {}, expected a {}",
                    member.kind.as_str(),
                    expected.as_str()
                )));
            }
            members.push(member);
        }
    }
    if members.len() < 2 {
        return Err(GraphError::invalid(format!(
            "a composite needs at least 2 distinct members, got {}",
            members.len()
        )));
    }

    let uri = UserUris::new(owner).fresh_uri(kind);
    storage::insert_element(
        conn,
        &NewElement {
            uri: &uri,
            owner,
            kind,
            label,
            comment: "",
            share_level: ShareLevel::Private,
        },
    )
    .await?;

    let contribution = NeighborCount::of_neighbor(ShareLevel::Private, 1);
    let mut stale = vec![uri.clone()];
    for member in &members {
        storage::insert_inclusion(conn, &uri, &member.uri).await?;
        storage::adjust_counts(conn, &member.uri, contribution).await?;
        stale.push(member.uri.clone());
    }
    storage::write_counts(
        conn,
        &uri,
        NeighborCount::tally(members.iter().map(|member| member.share_level)),
    )
    .await?;
    storage::mark_dirty(conn, &stale).await?;
    storage::require_element(conn, &uri).await
}

impl GraphEngine {
    /// Fork `origin_uri` into `target_user`'s graph, reusing forks recorded
    /// in `cache`.
    #[instrument(skip(self, cache))]
    pub async fn fork_for_user_using_cache(
        &self,
        cache: &mut ForkCache,
        target_user: &str,
        origin_uri: &str,
    ) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        let fork = fork_tx(&mut tx, cache, target_user, origin_uri).await?;
        tx.commit().await?;
        debug!(fork = %fork.uri, "vertex forked");
        self.after_commit(&[]).await;
        Ok(fork)
    }

    /// Fork with a throwaway cache.
    pub async fn fork_for_user(&self, target_user: &str, origin_uri: &str) -> Result<GraphElement> {
        let mut cache = ForkCache::new();
        self.fork_for_user_using_cache(&mut cache, target_user, origin_uri)
            .await
    }

    /// Merge `source_uri` into `target_uri`. The source is deleted.
    #[instrument(skip(self))]
    pub async fn merge_to(&self, source_uri: &str, target_uri: &str) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        let removed = merge_tx(&mut tx, source_uri, target_uri).await?;
        let target = storage::require_element(&mut tx, target_uri).await?;
        tx.commit().await?;
        info!(removed = removed.len(), "vertices merged");
        self.after_commit(&removed).await;
        Ok(target)
    }

    /// Create a composite vertex including the given vertices and edges.
    #[instrument(skip(self))]
    pub async fn create_from_graph_elements(
        &self,
        owner: &str,
        vertices: &[String],
        edges: &[String],
    ) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        let composite =
            create_composite_tx(&mut tx, owner, ElementKind::Vertex, "", vertices, edges).await?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(composite)
    }

    /// Create a group relation including the given vertices and edges.
    #[instrument(skip(self))]
    pub async fn create_group_relation(
        &self,
        owner: &str,
        label: &str,
        vertices: &[String],
        edges: &[String],
    ) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        let group = create_composite_tx(
            &mut tx,
            owner,
            ElementKind::GroupRelation,
            label,
            vertices,
            edges,
        )
        .await?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(group)
    }

    /// Vertices currently included in a composite.
    pub async fn included_vertices(&self, uri: &str) -> Result<Vec<GraphElement>> {
        let mut conn = self.store().pool().acquire().await?;
        storage::require_element(&mut conn, uri).await?;
        storage::members_of_kind(&mut conn, uri, ElementKind::Vertex).await
    }

    /// Edges currently included in a composite.
    pub async fn included_edges(&self, uri: &str) -> Result<Vec<GraphElement>> {
        let mut conn = self.store().pool().acquire().await?;
        storage::require_element(&mut conn, uri).await?;
        storage::members_of_kind(&mut conn, uri, ElementKind::Relation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, Fixture};

    #[tokio::test]
    async fn test_fork_copies_label_and_records_origin() {
        let Fixture { engine, b, .. } = test_support::three_vertices_and_group().await;
        engine.set_comment(&b, "origin comment").await.unwrap();

        let fork = engine.fork_for_user("carla", &b).await.unwrap();
        assert_ne!(fork.uri, b);
        assert_eq!(fork.owner, "carla");
        assert_eq!(fork.label, "vertex B");
        assert_eq!(fork.comment, "origin comment");

        let identifications = engine.identifications_of(&fork.uri).await.unwrap();
        let provenance = identifications.get(&b).unwrap();
        assert_eq!(provenance.label, "vertex B");
        assert_eq!(provenance.nb_references, 1);
    }

    #[tokio::test]
    async fn test_fork_cache_reuses_fork() {
        let Fixture { engine, a, b, .. } = test_support::three_vertices_and_group().await;
        let mut cache = ForkCache::new();
        let first = engine
            .fork_for_user_using_cache(&mut cache, "carla", &a)
            .await
            .unwrap();
        let again = engine
            .fork_for_user_using_cache(&mut cache, "carla", &a)
            .await
            .unwrap();
        let other = engine
            .fork_for_user_using_cache(&mut cache, "carla", &b)
            .await
            .unwrap();
        assert_eq!(first.uri, again.uri);
        assert_ne!(first.uri, other.uri);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_refork_refreshes_label_snapshot() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine.fork_for_user("carla", &a).await.unwrap();
        engine.set_label(&a, "vertex A renamed").await.unwrap();
        let second = engine.fork_for_user("carla", &a).await.unwrap();

        let provenance = engine.identifications_of(&second.uri).await.unwrap();
        let record = provenance.get(&a).unwrap();
        assert_eq!(record.label, "vertex A renamed");
        assert_eq!(record.nb_references, 2);
    }

    #[tokio::test]
    async fn test_only_vertices_fork() {
        let Fixture { engine, ab, .. } = test_support::three_vertices_and_group().await;
        assert!(engine
            .fork_for_user("carla", &ab)
            .await
            .unwrap_err()
            .is_invalid_argument());
    }

    #[tokio::test]
    async fn test_merge_preserves_edge_direction() {
        let Fixture { engine, a, b, c, ab, bc, .. } = test_support::three_vertices_and_group().await;
        let d = engine.create_vertex_with_label("roger", "vertex D'").await.unwrap();

        engine.merge_to(&b, &d.uri).await.unwrap();

        assert!(!engine.has_element(&b).await.unwrap());
        let ab = engine.get_relation(&ab).await.unwrap();
        assert_eq!(ab.source_uri, a);
        assert_eq!(ab.destination_uri, d.uri);
        let bc = engine.get_relation(&bc).await.unwrap();
        assert_eq!(bc.source_uri, d.uri);
        assert_eq!(bc.destination_uri, c);
        assert_eq!(engine.get_element(&d.uri).await.unwrap().nb_neighbors.private, 2);
        assert!(engine.verify().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_merge_drops_edges_between_the_two() {
        let Fixture { engine, a, b, ab, .. } = test_support::three_vertices_and_group().await;
        engine.merge_to(&a, &b).await.unwrap();
        assert!(!engine.has_element(&ab).await.unwrap());
        assert!(!engine.has_element(&a).await.unwrap());
        assert_eq!(engine.get_element(&b).await.unwrap().nb_neighbors.private, 1);
        assert!(engine.verify().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_merge_substitutes_memberships_and_identifications() {
        let Fixture { engine, b, c, group, .. } = test_support::three_vertices_and_group().await;
        let tag = engine
            .add_identification(&c, IdentificationInput::new("http://example.org/todo", "todo"))
            .await
            .unwrap();
        engine
            .add_identification(&b, IdentificationInput::new("http://example.org/todo", "todo"))
            .await
            .unwrap();

        engine.merge_to(&c, &b).await.unwrap();

        let members: Vec<String> = engine
            .included_vertices(&group)
            .await
            .unwrap()
            .into_iter()
            .map(|vertex| vertex.uri)
            .collect();
        assert!(members.contains(&b));
        assert!(!members.contains(&c));
        assert_eq!(engine.get_identification(&tag.uri).await.unwrap().nb_references, 1);
        assert!(engine.verify().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_merge_rejects_bad_arguments() {
        let Fixture { engine, a, ab, .. } = test_support::three_vertices_and_group().await;
        assert!(engine.merge_to(&a, &a).await.unwrap_err().is_invalid_argument());
        assert!(engine.merge_to(&ab, &a).await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn test_composite_needs_two_members() {
        let Fixture { engine, a, b, ab, .. } = test_support::three_vertices_and_group().await;
        let err = engine
            .create_from_graph_elements("roger", &[a.clone()], &[])
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());

        let err = engine
            .create_from_graph_elements("roger", &[ab.clone(), b.clone()], &[])
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());

        let err = engine
            .create_from_graph_elements("roger", &[a.clone(), "/nope".to_string()], &[])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_composite_tracks_removals() {
        let Fixture { engine, a, b, ab, bc, .. } = test_support::three_vertices_and_group().await;
        let composite = engine
            .create_from_graph_elements("roger", &[a.clone(), b.clone()], &[ab.clone(), bc.clone()])
            .await
            .unwrap();
        assert_eq!(composite.kind, ElementKind::Vertex);
        assert_eq!(composite.nb_neighbors.private, 4);
        assert_eq!(engine.included_vertices(&composite.uri).await.unwrap().len(), 2);
        assert_eq!(engine.included_edges(&composite.uri).await.unwrap().len(), 2);

        engine.remove_element(&bc).await.unwrap();
        let edges = engine.included_edges(&composite.uri).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].uri, ab);

        engine.remove_element(&a).await.unwrap();
        let vertices = engine.included_vertices(&composite.uri).await.unwrap();
        assert_eq!(vertices.len(), 1);
        assert_eq!(vertices[0].uri, b);
        assert!(engine.included_edges(&composite.uri).await.unwrap().is_empty());
        assert_eq!(
            engine.get_element(&composite.uri).await.unwrap().nb_neighbors.private,
            1
        );
        assert!(engine.verify().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_group_relation_fixture() {
        let Fixture { engine, c, group, .. } = test_support::three_vertices_and_group().await;
        let element = engine.get_element(&group).await.unwrap();
        assert_eq!(element.kind, ElementKind::GroupRelation);
        assert_eq!(element.label, "to do");
        assert_eq!(element.nb_neighbors.private, 3);
        assert_eq!(engine.get_element(&c).await.unwrap().nb_neighbors.private, 2);
    }
}
