//! Identification registry.
//!
//! An identification links elements to an external resource. One record
//! exists per external URI, exposed as a tag element; its reference count
//! is the number of elements currently attached. Records are kept at zero
//! references.

use std::collections::BTreeMap;

use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::engine::GraphEngine;
use crate::error::{GraphError, Result};
use crate::schema::{ElementKind, Identification, IdentificationInput, NeighborCount, UserUris};
use crate::storage::{self, NewElement};
use crate::suggestion;

/// Find or create the record for `input.external_uri`.
///
/// A new record's tag element is owned by `owner`.
pub(crate) async fn find_or_create(
    conn: &mut SqliteConnection,
    owner: &str,
    input: &IdentificationInput,
) -> Result<Identification> {
    if input.external_uri.trim().is_empty() {
        return Err(GraphError::invalid("identification external uri is empty"));
    }
    if let Some(existing) = storage::identification_by_external_uri(conn, &input.external_uri).await? {
        return Ok(existing);
    }

    let uri = UserUris::new(owner).fresh_uri(ElementKind::Tag);
    storage::insert_element(
        conn,
        &NewElement {
            uri: &uri,
            owner,
            kind: ElementKind::Tag,
            label: &input.label,
            comment: &input.comment,
            share_level: input.share_level,
        },
    )
    .await?;
    storage::insert_identification(conn, &uri, input).await?;
    debug!(%uri, external_uri = %input.external_uri, "identification created");
    storage::identification_by_uri(conn, &uri)
        .await?
        .ok_or_else(|| GraphError::not_found(&uri))
}

/// Attach `identification_uri` to `element_uri`; attaching twice is a no-op.
pub(crate) async fn attach_tx(
    conn: &mut SqliteConnection,
    element_uri: &str,
    identification_uri: &str,
) -> Result<bool> {
    let element = storage::require_element(conn, element_uri).await?;
    if !storage::attach(conn, element_uri, identification_uri).await? {
        return Ok(false);
    }
    storage::adjust_nb_references(conn, identification_uri, 1).await?;
    storage::adjust_counts(
        conn,
        identification_uri,
        NeighborCount::of_neighbor(element.share_level, 1),
    )
    .await?;
    storage::mark_dirty(conn, &[identification_uri.to_string()]).await?;
    Ok(true)
}

/// Detach; false when it was not attached.
pub(crate) async fn detach_tx(
    conn: &mut SqliteConnection,
    element_uri: &str,
    identification_uri: &str,
) -> Result<bool> {
    let element = storage::require_element(conn, element_uri).await?;
    if !storage::detach(conn, element_uri, identification_uri).await? {
        return Ok(false);
    }
    storage::adjust_nb_references(conn, identification_uri, -1).await?;
    storage::adjust_counts(
        conn,
        identification_uri,
        NeighborCount::of_neighbor(element.share_level, -1),
    )
    .await?;
    storage::mark_dirty(conn, &[identification_uri.to_string()]).await?;
    Ok(true)
}

pub(crate) async fn add_identification_tx(
    conn: &mut SqliteConnection,
    element_uri: &str,
    input: &IdentificationInput,
) -> Result<Identification> {
    let element = storage::require_element(conn, element_uri).await?;
    let identification = find_or_create(conn, &element.owner, input).await?;
    attach_tx(conn, element_uri, &identification.uri).await?;
    storage::identification_by_uri(conn, &identification.uri)
        .await?
        .ok_or_else(|| GraphError::not_found(&identification.uri))
}

impl GraphEngine {
    /// Attach an identification to an element, creating it on first use.
    #[instrument(skip(self, input), fields(external_uri = %input.external_uri))]
    pub async fn add_identification(
        &self,
        element_uri: &str,
        input: IdentificationInput,
    ) -> Result<Identification> {
        let mut tx = self.store().begin().await?;
        let identification = add_identification_tx(&mut tx, element_uri, &input).await?;
        tx.commit().await?;
        self.after_commit(&[]).await;
        Ok(identification)
    }

    /// Detach the identification keyed by `external_uri` from an element.
    ///
    /// Suggestions the element owed to that resource go with it.
    #[instrument(skip(self))]
    pub async fn remove_identification(&self, element_uri: &str, external_uri: &str) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let identification = storage::identification_by_external_uri(&mut tx, external_uri)
            .await?
            .ok_or_else(|| GraphError::not_found(external_uri))?;
        if !detach_tx(&mut tx, element_uri, &identification.uri).await? {
            return Err(GraphError::not_found(format!(
                "{external_uri} is not attached to {element_uri}"
            )));
        }
        let dropped = suggestion::forget_origin_tx(&mut tx, element_uri, external_uri).await?;
        tx.commit().await?;
        debug!(dropped, "identification removed");
        self.after_commit(&[]).await;
        Ok(())
    }

    /// Identifications attached to an element, keyed by external URI.
    pub async fn identifications_of(
        &self,
        element_uri: &str,
    ) -> Result<BTreeMap<String, Identification>> {
        let mut conn = self.store().pool().acquire().await?;
        storage::require_element(&mut conn, element_uri).await?;
        Ok(storage::identifications_of(&mut conn, element_uri)
            .await?
            .into_iter()
            .map(|identification| (identification.external_uri.clone(), identification))
            .collect())
    }

    /// Look up an identification by its tag element URI.
    pub async fn get_identification(&self, uri: &str) -> Result<Identification> {
        let mut conn = self.store().pool().acquire().await?;
        storage::identification_by_uri(&mut conn, uri)
            .await?
            .ok_or_else(|| GraphError::not_found(uri))
    }

    pub async fn identification_by_external_uri(
        &self,
        external_uri: &str,
    ) -> Result<Option<Identification>> {
        let mut conn = self.store().pool().acquire().await?;
        storage::identification_by_external_uri(&mut conn, external_uri).await
    }

    /// Elements an identification is attached to.
    pub async fn elements_identified_to(&self, identification_uri: &str) -> Result<Vec<String>> {
        let mut conn = self.store().pool().acquire().await?;
        storage::elements_identified_to(&mut conn, identification_uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ShareLevel;
    use crate::test_support::{self, Fixture};

    fn computer_science() -> IdentificationInput {
        IdentificationInput::new("http://dbpedia.org/resource/Computer_science", "Computer Science")
            .with_type("http://schema.org/Thing")
    }

    #[tokio::test]
    async fn test_registry_is_shared_across_elements() {
        let Fixture { engine, a, b, .. } = test_support::three_vertices_and_group().await;
        let first = engine.add_identification(&a, computer_science()).await.unwrap();
        let second = engine.add_identification(&b, computer_science()).await.unwrap();

        assert_eq!(first.uri, second.uri);
        assert_eq!(second.nb_references, 2);
        assert_eq!(second.external_type.as_deref(), Some("http://schema.org/Thing"));

        let tag = engine.get_element(&second.uri).await.unwrap();
        assert_eq!(tag.kind, ElementKind::Tag);
        assert_eq!(tag.label, "Computer Science");
        assert_eq!(tag.nb_neighbors.private, 2);
    }

    #[tokio::test]
    async fn test_attaching_twice_is_noop() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine.add_identification(&a, computer_science()).await.unwrap();
        let again = engine.add_identification(&a, computer_science()).await.unwrap();
        assert_eq!(again.nb_references, 1);
        assert_eq!(engine.identifications_of(&a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tag_counts_follow_attached_tiers() {
        let Fixture { engine, a, b, .. } = test_support::three_vertices_and_group().await;
        let tag = engine.add_identification(&a, computer_science()).await.unwrap();
        engine.add_identification(&b, computer_science()).await.unwrap();
        engine.set_share_level(&a, ShareLevel::Public).await.unwrap();

        let counts = engine.get_element(&tag.uri).await.unwrap().nb_neighbors;
        assert_eq!(counts.private, 2);
        assert_eq!(counts.public, 1);
        // the tag is not a neighbor of the element it is attached to
        assert_eq!(engine.get_element(&a).await.unwrap().nb_neighbors.private, 1);
    }

    #[tokio::test]
    async fn test_remove_identification_keeps_record() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        let tag = engine.add_identification(&a, computer_science()).await.unwrap();
        engine
            .remove_identification(&a, "http://dbpedia.org/resource/Computer_science")
            .await
            .unwrap();

        let record = engine.get_identification(&tag.uri).await.unwrap();
        assert_eq!(record.nb_references, 0);
        assert!(engine.identifications_of(&a).await.unwrap().is_empty());

        let err = engine
            .remove_identification(&a, "http://dbpedia.org/resource/Computer_science")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_identifications_keyed_by_external_uri() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine.add_identification(&a, computer_science()).await.unwrap();
        engine
            .add_identification(&a, IdentificationInput::new("http://example.org/art", "Art"))
            .await
            .unwrap();

        let keys: Vec<String> = engine.identifications_of(&a).await.unwrap().into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "http://dbpedia.org/resource/Computer_science".to_string(),
                "http://example.org/art".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_removing_element_detaches_identifications() {
        let Fixture { engine, a, b, .. } = test_support::three_vertices_and_group().await;
        let tag = engine.add_identification(&a, computer_science()).await.unwrap();
        engine.add_identification(&b, computer_science()).await.unwrap();
        engine.remove_element(&a).await.unwrap();

        let record = engine.get_identification(&tag.uri).await.unwrap();
        assert_eq!(record.nb_references, 1);
        assert_eq!(engine.get_element(&tag.uri).await.unwrap().nb_neighbors.private, 1);
    }
}
