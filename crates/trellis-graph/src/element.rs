//! Element lifecycle: creation, label/comment edits, edge helpers and removal.

use sqlx::SqliteConnection;
use tracing::{debug, info, instrument};

use crate::engine::GraphEngine;
use crate::error::{GraphError, Result};
use crate::schema::{ElementKind, GraphElement, NeighborCount, Relation, ShareLevel, UserUris};
use crate::storage::{self, NewElement};
use crate::visibility;

/// URIs touched by a removal.
#[derive(Debug, Default)]
pub(crate) struct Removal {
    pub removed: Vec<String>,
    pub stale: Vec<String>,
}

pub(crate) async fn create_vertex_tx(
    conn: &mut SqliteConnection,
    uri: &str,
    owner: &str,
    label: &str,
) -> Result<GraphElement> {
    storage::insert_element(
        conn,
        &NewElement {
            uri,
            owner,
            kind: ElementKind::Vertex,
            label,
            comment: "",
            share_level: ShareLevel::Private,
        },
    )
    .await?;
    storage::require_element(conn, uri).await
}

/// `short_id` as a URI for `owner`, or a fresh URI when it is already taken.
async fn uri_from_short_id(
    conn: &mut SqliteConnection,
    uris: &UserUris,
    kind: ElementKind,
    short_id: &str,
) -> Result<String> {
    let uri = uris.element_uri(kind, short_id);
    if short_id.is_empty() || storage::has_element(conn, &uri).await? {
        return Ok(uris.fresh_uri(kind));
    }
    Ok(uri)
}

/// Create a vertex labeled `label` and a relation from `source_uri` to it.
pub(crate) async fn add_vertex_and_relation_tx(
    conn: &mut SqliteConnection,
    source_uri: &str,
    label: &str,
    vertex_id: &str,
    relation_id: &str,
) -> Result<Relation> {
    let source = storage::require_element(conn, source_uri).await?;
    if source.kind != ElementKind::Vertex {
        return Err(GraphError::invalid(format!("{source_uri} is not a vertex")));
    }
    let uris = UserUris::new(&source.owner);
    let vertex_uri = uri_from_short_id(conn, &uris, ElementKind::Vertex, vertex_id).await?;
    create_vertex_tx(conn, &vertex_uri, &source.owner, label).await?;
    let relation_uri = uri_from_short_id(conn, &uris, ElementKind::Relation, relation_id).await?;
    visibility::add_edge_tx(conn, source_uri, &vertex_uri, &relation_uri).await?;
    storage::get_relation(conn, &relation_uri)
        .await?
        .ok_or_else(|| GraphError::not_found(&relation_uri))
}

/// Mark `uri` and every element that lists it as a neighbor dirty.
pub(crate) async fn mark_stale_around(
    conn: &mut SqliteConnection,
    element: &GraphElement,
) -> Result<()> {
    let mut stale = storage::dependents(conn, &element.uri, element.kind).await?;
    stale.push(element.uri.clone());
    storage::mark_dirty(conn, &stale).await
}

/// Remove one element without cascading to incident relations.
async fn remove_single(
    conn: &mut SqliteConnection,
    element: &GraphElement,
    removal: &mut Removal,
) -> Result<()> {
    let uri = element.uri.as_str();
    let own = NeighborCount::of_neighbor(element.share_level, -1);

    if element.kind == ElementKind::Relation {
        if let Some(row) = storage::get_relation_row(conn, uri).await? {
            let source = storage::get_element(conn, &row.source_uri).await?;
            let destination = storage::get_element(conn, &row.destination_uri).await?;
            // Each endpoint loses the other endpoint as a neighbor.
            if let (Some(source), Some(destination)) = (source, destination) {
                storage::adjust_counts(
                    conn,
                    &source.uri,
                    NeighborCount::of_neighbor(destination.share_level, -1),
                )
                .await?;
                storage::adjust_counts(
                    conn,
                    &destination.uri,
                    NeighborCount::of_neighbor(source.share_level, -1),
                )
                .await?;
                removal.stale.push(source.uri);
                removal.stale.push(destination.uri);
            }
            storage::delete_relation_row(conn, uri).await?;
        }
    }

    for owner in storage::owners_of(conn, uri).await? {
        storage::adjust_counts(conn, &owner, own).await?;
        storage::delete_inclusion(conn, &owner, uri).await?;
        removal.stale.push(owner);
    }

    for member in storage::members_of(conn, uri).await? {
        storage::adjust_counts(conn, &member, own).await?;
        storage::delete_inclusion(conn, uri, &member).await?;
        removal.stale.push(member);
    }

    for identification in storage::identifications_of(conn, uri).await? {
        storage::detach(conn, uri, &identification.uri).await?;
        storage::adjust_nb_references(conn, &identification.uri, -1).await?;
        storage::adjust_counts(conn, &identification.uri, own).await?;
        removal.stale.push(identification.uri);
    }

    if element.kind == ElementKind::Tag {
        for attached in storage::elements_identified_to(conn, uri).await? {
            storage::detach(conn, &attached, uri).await?;
        }
        storage::delete_identification_row(conn, uri).await?;
    }

    storage::delete_element_row(conn, uri).await?;
    removal.removed.push(uri.to_string());
    Ok(())
}

/// Remove an element; a vertex takes its incident relations with it.
pub(crate) async fn remove_element_tx(
    conn: &mut SqliteConnection,
    uri: &str,
) -> Result<Removal> {
    let element = storage::require_element(conn, uri).await?;
    let mut removal = Removal::default();

    if element.kind == ElementKind::Vertex {
        for row in storage::relations_of(conn, uri).await? {
            let relation = storage::require_element(conn, &row.uri).await?;
            remove_single(conn, &relation, &mut removal).await?;
        }
    }
    remove_single(conn, &element, &mut removal).await?;

    removal.stale.retain(|stale| !removal.removed.contains(stale));
    removal.stale.sort();
    removal.stale.dedup();
    storage::mark_dirty(conn, &removal.stale).await?;
    Ok(removal)
}

impl GraphEngine {
    /// Create an unlabeled private vertex.
    pub async fn create_vertex(&self, owner: &str) -> Result<GraphElement> {
        self.create_vertex_with_label(owner, "").await
    }

    #[instrument(skip(self))]
    pub async fn create_vertex_with_label(&self, owner: &str, label: &str) -> Result<GraphElement> {
        let uri = UserUris::new(owner).fresh_uri(ElementKind::Vertex);
        let mut tx = self.store().begin().await?;
        let vertex = create_vertex_tx(&mut tx, &uri, owner, label).await?;
        tx.commit().await?;
        debug!(%uri, "vertex created");
        self.after_commit(&[]).await;
        Ok(vertex)
    }

    pub async fn get_element(&self, uri: &str) -> Result<GraphElement> {
        self.store()
            .get_element(uri)
            .await?
            .ok_or_else(|| GraphError::not_found(uri))
    }

    pub async fn get_relation(&self, uri: &str) -> Result<Relation> {
        let mut conn = self.store().pool().acquire().await?;
        storage::get_relation(&mut conn, uri)
            .await?
            .ok_or_else(|| GraphError::not_found(uri))
    }

    pub async fn has_element(&self, uri: &str) -> Result<bool> {
        let mut conn = self.store().pool().acquire().await?;
        storage::has_element(&mut conn, uri).await
    }

    #[instrument(skip(self))]
    pub async fn set_label(&self, uri: &str, label: &str) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        storage::require_element(&mut tx, uri).await?;
        storage::update_label(&mut tx, uri, label).await?;
        let element = storage::require_element(&mut tx, uri).await?;
        mark_stale_around(&mut tx, &element).await?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(element)
    }

    #[instrument(skip(self, comment))]
    pub async fn set_comment(&self, uri: &str, comment: &str) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        storage::require_element(&mut tx, uri).await?;
        storage::update_comment(&mut tx, uri, comment).await?;
        let element = storage::require_element(&mut tx, uri).await?;
        mark_stale_around(&mut tx, &element).await?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(element)
    }

    /// Create a private vertex and a relation from `source_uri` to it.
    pub async fn add_vertex_and_relation(&self, source_uri: &str) -> Result<Relation> {
        self.add_vertex_and_relation_with_ids(source_uri, "", "").await
    }

    /// Like [`add_vertex_and_relation`](Self::add_vertex_and_relation) with
    /// caller-chosen short ids. An id whose URI is taken is replaced by a
    /// fresh one.
    #[instrument(skip(self))]
    pub async fn add_vertex_and_relation_with_ids(
        &self,
        source_uri: &str,
        vertex_id: &str,
        relation_id: &str,
    ) -> Result<Relation> {
        let mut tx = self.store().begin().await?;
        let relation =
            add_vertex_and_relation_tx(&mut tx, source_uri, "", vertex_id, relation_id).await?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(relation)
    }

    /// Swap a relation's source and destination.
    #[instrument(skip(self))]
    pub async fn inverse(&self, relation_uri: &str) -> Result<Relation> {
        let mut tx = self.store().begin().await?;
        let row = storage::get_relation_row(&mut tx, relation_uri)
            .await?
            .ok_or_else(|| GraphError::not_found(relation_uri))?;
        storage::update_relation_endpoints(&mut tx, relation_uri, &row.destination_uri, &row.source_uri)
            .await?;
        storage::mark_dirty(&mut tx, &[relation_uri.to_string()]).await?;
        let relation = storage::get_relation(&mut tx, relation_uri)
            .await?
            .ok_or_else(|| GraphError::not_found(relation_uri))?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(relation)
    }

    /// Remove any element. Removing a vertex also removes its relations.
    #[instrument(skip(self))]
    pub async fn remove_element(&self, uri: &str) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let removal = remove_element_tx(&mut tx, uri).await?;
        tx.commit().await?;
        info!(removed = removal.removed.len(), stale = removal.stale.len(), "element removed");
        self.after_commit(&removal.removed).await;
        Ok(())
    }

    /// Relations touching a vertex, in creation order.
    pub async fn connected_edges(&self, vertex_uri: &str) -> Result<Vec<Relation>> {
        let mut conn = self.store().pool().acquire().await?;
        storage::require_element(&mut conn, vertex_uri).await?;
        let mut relations = Vec::new();
        for row in storage::relations_of(&mut conn, vertex_uri).await? {
            if let Some(relation) = storage::get_relation(&mut conn, &row.uri).await? {
                relations.push(relation);
            }
        }
        Ok(relations)
    }

    /// First relation going from `source_uri` to `destination_uri`.
    pub async fn edge_between(
        &self,
        source_uri: &str,
        destination_uri: &str,
    ) -> Result<Option<Relation>> {
        Ok(self
            .connected_edges(source_uri)
            .await?
            .into_iter()
            .find(|relation| {
                relation.source_uri == source_uri && relation.destination_uri == destination_uri
            }))
    }

    /// Whether `relation_uri` touches `vertex_uri`.
    pub async fn has_edge(&self, vertex_uri: &str, relation_uri: &str) -> Result<bool> {
        Ok(self
            .connected_edges(vertex_uri)
            .await?
            .iter()
            .any(|relation| relation.uri() == relation_uri))
    }

    pub async fn has_destination_vertex(
        &self,
        source_uri: &str,
        destination_uri: &str,
    ) -> Result<bool> {
        Ok(self.edge_between(source_uri, destination_uri).await?.is_some())
    }
}
