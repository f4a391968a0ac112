//! Suggestions: neighbors proposed to a vertex from external resources.
//!
//! Accepting one grows the graph through the regular element and
//! identification paths, so counters and reference counts stay exact.

use std::collections::BTreeMap;

use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::element;
use crate::engine::GraphEngine;
use crate::error::{GraphError, Result};
use crate::identification;
use crate::schema::{ElementKind, GraphElement, IdentificationInput, Relation, Suggestion};
use crate::storage;

async fn require_vertex(conn: &mut SqliteConnection, uri: &str) -> Result<GraphElement> {
    let element = storage::require_element(conn, uri).await?;
    if element.kind != ElementKind::Vertex {
        return Err(GraphError::invalid(format!(
            "suggestions belong to vertices, {uri} is a {}",
            element.kind.as_str()
        )));
    }
    Ok(element)
}

fn check_same_as(suggestion: &Suggestion) -> Result<()> {
    if suggestion.same_as.trim().is_empty() {
        return Err(GraphError::invalid("suggestion same-as uri is empty"));
    }
    Ok(())
}

/// Store suggestions on a vertex. A suggestion already present takes the
/// new label and type and gains the new origins.
pub(crate) async fn add_suggestions_tx(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
    suggestions: &[Suggestion],
) -> Result<()> {
    require_vertex(conn, vertex_uri).await?;
    for suggestion in suggestions {
        check_same_as(suggestion)?;
        let mut merged = suggestion.clone();
        let existing = storage::suggestions_of(conn, vertex_uri)
            .await?
            .into_iter()
            .find(|current| current.same_as == suggestion.same_as);
        if let Some(existing) = existing {
            let mut origins = existing.origins;
            for origin in &suggestion.origins {
                if !origins.contains(origin) {
                    origins.push(origin.clone());
                }
            }
            merged.origins = origins;
        }
        storage::upsert_suggestion(conn, vertex_uri, &merged).await?;
    }
    Ok(())
}

/// Drop `origin` from the vertex's suggestions; those left without any
/// origin are deleted. Returns how many were deleted.
pub(crate) async fn forget_origin_tx(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
    origin: &str,
) -> Result<usize> {
    let mut deleted = 0;
    for mut suggestion in storage::suggestions_of(conn, vertex_uri).await? {
        if !suggestion.origins.iter().any(|current| current == origin) {
            continue;
        }
        suggestion.origins.retain(|current| current != origin);
        if suggestion.origins.is_empty() {
            storage::delete_suggestion(conn, vertex_uri, &suggestion.same_as).await?;
            deleted += 1;
        } else {
            storage::upsert_suggestion(conn, vertex_uri, &suggestion).await?;
        }
    }
    Ok(deleted)
}

/// Turn a suggestion into a new neighbor of `vertex_uri`.
///
/// The relation is labeled after the suggestion and identified to its
/// same-as resource; the new vertex is identified to the same-as resource
/// and to the external type.
pub(crate) async fn accept_suggestion_tx(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
    suggestion: &Suggestion,
) -> Result<Relation> {
    require_vertex(conn, vertex_uri).await?;
    check_same_as(suggestion)?;

    let relation =
        element::add_vertex_and_relation_tx(conn, vertex_uri, &suggestion.type_label, "", "")
            .await?;
    storage::update_label(conn, relation.uri(), &suggestion.label).await?;

    let same_as = IdentificationInput::new(&suggestion.same_as, &suggestion.label);
    identification::add_identification_tx(conn, relation.uri(), &same_as).await?;
    identification::add_identification_tx(conn, &relation.destination_uri, &same_as).await?;
    if let Some(external_type) = &suggestion.external_type {
        let type_input = IdentificationInput::new(external_type, &suggestion.type_label);
        identification::add_identification_tx(conn, &relation.destination_uri, &type_input)
            .await?;
    }
    storage::delete_suggestion(conn, vertex_uri, &suggestion.same_as).await?;

    let relation = storage::get_relation(conn, relation.uri())
        .await?
        .ok_or_else(|| GraphError::not_found(relation.uri()))?;
    element::mark_stale_around(conn, &relation.element).await?;
    Ok(relation)
}

fn keyed(suggestions: Vec<Suggestion>) -> BTreeMap<String, Suggestion> {
    suggestions
        .into_iter()
        .map(|suggestion| (suggestion.same_as.clone(), suggestion))
        .collect()
}

impl GraphEngine {
    /// Store suggestions on a vertex and return its full set, keyed by
    /// same-as URI.
    #[instrument(skip(self, suggestions), fields(count = suggestions.len()))]
    pub async fn add_suggestions(
        &self,
        vertex_uri: &str,
        suggestions: &[Suggestion],
    ) -> Result<BTreeMap<String, Suggestion>> {
        let mut tx = self.store().begin().await?;
        add_suggestions_tx(&mut tx, vertex_uri, suggestions).await?;
        let stored = storage::suggestions_of(&mut tx, vertex_uri).await?;
        tx.commit().await?;
        Ok(keyed(stored))
    }

    /// Pending suggestions of a vertex, keyed by same-as URI.
    pub async fn suggestions_of(&self, vertex_uri: &str) -> Result<BTreeMap<String, Suggestion>> {
        let mut conn = self.store().pool().acquire().await?;
        require_vertex(&mut conn, vertex_uri).await?;
        Ok(keyed(storage::suggestions_of(&mut conn, vertex_uri).await?))
    }

    /// Accept a suggestion, creating a labeled relation to a new vertex.
    /// A matching stored suggestion is consumed.
    #[instrument(skip(self, suggestion), fields(same_as = %suggestion.same_as))]
    pub async fn accept_suggestion(
        &self,
        vertex_uri: &str,
        suggestion: &Suggestion,
    ) -> Result<Relation> {
        let mut tx = self.store().begin().await?;
        let relation = accept_suggestion_tx(&mut tx, vertex_uri, suggestion).await?;
        tx.commit().await?;
        debug!(relation = %relation.uri(), "suggestion accepted");
        self.after_commit(&[]).await;
        Ok(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, Fixture};

    const PERSON: &str = "http://rdf.freebase.com/rdf/people/person";
    const EVENT: &str = "http://rdf.freebase.com/rdf/time/event";

    fn name_from_person() -> Suggestion {
        Suggestion::new("http://rdf.freebase.com/rdf/type/object/name", "Name")
            .with_type("http://rdf.freebase.com/rdf/type/text", "Text")
            .with_origin(PERSON)
    }

    fn start_date_from_event() -> Suggestion {
        Suggestion::new("http://rdf.freebase.com/rdf/time/event/start_date", "Start date")
            .with_type("http://rdf.freebase.com/rdf/type/datetime", "Date time")
            .with_origin(EVENT)
    }

    #[tokio::test]
    async fn test_add_suggestions_to_vertex() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        assert!(engine.suggestions_of(&a).await.unwrap().is_empty());

        engine.add_suggestions(&a, &[start_date_from_event()]).await.unwrap();

        let suggestions = engine.suggestions_of(&a).await.unwrap();
        let added = suggestions.values().next().unwrap();
        assert_eq!(added.label, "Start date");
        assert_eq!(
            added.external_type.as_deref(),
            Some("http://rdf.freebase.com/rdf/type/datetime")
        );
        assert_eq!(added.same_as, "http://rdf.freebase.com/rdf/time/event/start_date");
        assert_eq!(added.origins, vec![EVENT.to_string()]);
    }

    #[tokio::test]
    async fn test_same_suggestion_gains_origins() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine.add_suggestions(&a, &[name_from_person()]).await.unwrap();
        let from_symbol = Suggestion {
            origins: vec!["http://rdf.freebase.com/rdf/base/symbol".to_string()],
            ..name_from_person()
        };
        let stored = engine.add_suggestions(&a, &[from_symbol]).await.unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored.values().next().unwrap().origins,
            vec![
                PERSON.to_string(),
                "http://rdf.freebase.com/rdf/base/symbol".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_suggestions_belong_to_vertices() {
        let Fixture { engine, ab, .. } = test_support::three_vertices_and_group().await;
        let err = engine.add_suggestions(&ab, &[name_from_person()]).await.unwrap_err();
        assert!(err.is_invalid_argument());
        let err = engine
            .accept_suggestion(&ab, &name_from_person())
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn test_accepting_adds_a_new_neighbor() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        let edges_before = engine.connected_edges(&a).await.unwrap().len();

        engine.accept_suggestion(&a, &name_from_person()).await.unwrap();

        assert_eq!(engine.connected_edges(&a).await.unwrap().len(), edges_before + 1);
        assert_eq!(engine.get_element(&a).await.unwrap().nb_neighbors.private, 2);
    }

    #[tokio::test]
    async fn test_accepted_edge_has_suggestion_label_and_same_as() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        let name = name_from_person();
        let relation = engine.accept_suggestion(&a, &name).await.unwrap();

        assert_eq!(relation.element.label, "Name");
        let identifications = engine.identifications_of(relation.uri()).await.unwrap();
        assert_eq!(identifications.len(), 1);
        assert!(identifications.contains_key(&name.same_as));
    }

    #[tokio::test]
    async fn test_new_vertex_has_same_as_and_type() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        let name = name_from_person();
        let relation = engine.accept_suggestion(&a, &name).await.unwrap();

        let new_vertex = engine.get_element(&relation.destination_uri).await.unwrap();
        assert_eq!(new_vertex.label, "Text");
        let identifications = engine.identifications_of(&new_vertex.uri).await.unwrap();
        assert_eq!(identifications.len(), 2);
        assert!(identifications.contains_key(&name.same_as));
        assert!(identifications.contains_key("http://rdf.freebase.com/rdf/type/text"));

        // the relation and the new vertex share the same-as record
        let same_as = &identifications[&name.same_as];
        assert_eq!(same_as.nb_references, 2);
        assert_eq!(engine.get_element(&same_as.uri).await.unwrap().nb_neighbors.private, 2);
        assert!(engine.verify().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_accepting_consumes_stored_suggestion() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine
            .add_suggestions(&a, &[name_from_person(), start_date_from_event()])
            .await
            .unwrap();
        engine.accept_suggestion(&a, &name_from_person()).await.unwrap();

        let remaining: Vec<String> = engine.suggestions_of(&a).await.unwrap().into_keys().collect();
        assert_eq!(
            remaining,
            vec!["http://rdf.freebase.com/rdf/time/event/start_date".to_string()]
        );
    }

    #[tokio::test]
    async fn test_removing_identification_drops_dependent_suggestions() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine
            .add_identification(&a, IdentificationInput::new(PERSON, "Person"))
            .await
            .unwrap();
        engine
            .add_identification(&a, IdentificationInput::new(EVENT, "Event"))
            .await
            .unwrap();
        engine
            .add_suggestions(&a, &[name_from_person(), start_date_from_event()])
            .await
            .unwrap();
        assert_eq!(engine.suggestions_of(&a).await.unwrap().len(), 2);

        engine.remove_identification(&a, PERSON).await.unwrap();

        let remaining = engine.suggestions_of(&a).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("http://rdf.freebase.com/rdf/time/event/start_date"));
    }

    #[tokio::test]
    async fn test_removing_vertex_drops_its_suggestions() {
        let Fixture { engine, a, .. } = test_support::three_vertices_and_group().await;
        engine.add_suggestions(&a, &[name_from_person()]).await.unwrap();
        engine.remove_element(&a).await.unwrap();

        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM suggestions")
            .fetch_one(engine.store().pool())
            .await
            .unwrap();
        assert_eq!(left, 0);
        assert!(engine.suggestions_of(&a).await.unwrap_err().is_not_found());
    }
}
