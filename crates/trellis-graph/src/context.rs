//! Surround context computation.
//!
//! A context is a short string built from the labels of an element's
//! neighbors, best-connected first, bounded in length. Three views are kept
//! per element, one per audience tier.

use std::collections::HashSet;

use sqlx::SqliteConnection;
use tracing::{debug, instrument, warn};

use crate::config::ContextConfig;
use crate::engine::GraphEngine;
use crate::error::Result;
use crate::schema::{ElementKind, GraphElement, Neighbor, ShareLevel};
use crate::storage;

/// A neighbor considered for inclusion in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextCandidate {
    pub uri: String,
    pub label: String,
    /// Live adjacency degree of the candidate itself.
    pub degree: i64,
    pub share_level: ShareLevel,
}

/// The three cached context views of one element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextViews {
    pub private: String,
    pub friends: String,
    pub public: String,
}

/// Build a context string from candidate neighbors.
///
/// Blank labels, the subject itself and candidates sharing the subject's
/// label are skipped; repeated URIs keep their first occurrence. The rest
/// are ranked by degree (descending, stable) and appended while the result
/// stays within `max_length` characters. Items are never cut.
pub fn compute_context(
    subject_uri: &str,
    subject_label: &str,
    candidates: &[ContextCandidate],
    max_length: usize,
    separator: &str,
) -> String {
    let mut seen = HashSet::new();
    let mut ranked: Vec<&ContextCandidate> = candidates
        .iter()
        .filter(|candidate| {
            let label = candidate.label.trim();
            !label.is_empty() && candidate.uri != subject_uri && candidate.label != subject_label
        })
        .filter(|candidate| seen.insert(candidate.uri.as_str()))
        .collect();
    ranked.sort_by(|a, b| b.degree.cmp(&a.degree));

    let separator_len = separator.chars().count();
    let mut context = String::new();
    let mut length = 0;
    for candidate in ranked {
        let label_len = candidate.label.chars().count();
        let added = if context.is_empty() {
            label_len
        } else {
            separator_len + label_len
        };
        if length + added > max_length {
            break;
        }
        if !context.is_empty() {
            context.push_str(separator);
        }
        context.push_str(&candidate.label);
        length += added;
    }
    context
}

/// Compute the private, friends and public views from one candidate list.
pub fn compute_views(
    subject_uri: &str,
    subject_label: &str,
    candidates: &[ContextCandidate],
    config: &ContextConfig,
) -> ContextViews {
    let view = |min_tier: ShareLevel| {
        let visible: Vec<ContextCandidate> = candidates
            .iter()
            .filter(|candidate| candidate.share_level >= min_tier)
            .cloned()
            .collect();
        compute_context(
            subject_uri,
            subject_label,
            &visible,
            config.max_length,
            &config.separator,
        )
    };
    ContextViews {
        private: view(ShareLevel::Private),
        friends: view(ShareLevel::Friends),
        public: view(ShareLevel::Public),
    }
}

/// What a tag shows for the elements it is attached to. A relation has no
/// label of its own and stands in for its destination vertex.
async fn tagged_surroundings(
    conn: &mut SqliteConnection,
    attached: Vec<Neighbor>,
) -> Result<Vec<Neighbor>> {
    let mut surroundings = Vec::with_capacity(attached.len());
    for neighbor in attached {
        if neighbor.kind != ElementKind::Relation {
            surroundings.push(neighbor);
            continue;
        }
        let Some(row) = storage::get_relation_row(conn, &neighbor.uri).await? else {
            continue;
        };
        if let Some(destination) = storage::neighbor(conn, &row.destination_uri).await? {
            surroundings.push(destination);
        }
    }
    Ok(surroundings)
}

/// Neighbors of `element` with their live degree.
pub(crate) async fn gather_candidates(
    conn: &mut SqliteConnection,
    element: &GraphElement,
) -> Result<Vec<ContextCandidate>> {
    let mut neighbors = storage::neighbors(conn, &element.uri, element.kind).await?;
    if element.kind == ElementKind::Tag {
        neighbors = tagged_surroundings(conn, neighbors).await?;
    }
    let mut candidates = Vec::with_capacity(neighbors.len());
    for neighbor in neighbors {
        let degree = storage::degree(conn, &neighbor.uri, neighbor.kind).await?;
        candidates.push(ContextCandidate {
            uri: neighbor.uri,
            label: neighbor.label,
            degree,
            share_level: neighbor.share_level,
        });
    }
    Ok(candidates)
}

/// Recompute and persist the contexts of `uri`, clearing its dirty flag.
pub(crate) async fn index_element_tx(
    conn: &mut SqliteConnection,
    uri: &str,
    config: &ContextConfig,
) -> Result<GraphElement> {
    let element = storage::require_element(conn, uri).await?;
    let candidates = gather_candidates(conn, &element).await?;
    let views = compute_views(&element.uri, &element.label, &candidates, config);
    storage::write_contexts(conn, uri, &views.private, &views.friends, &views.public).await?;
    storage::require_element(conn, uri).await
}

impl GraphEngine {
    /// Recompute one element's contexts and push it to the search index.
    #[instrument(skip(self))]
    pub async fn index_element(&self, uri: &str) -> Result<GraphElement> {
        let mut tx = self.store().begin().await?;
        let element = index_element_tx(&mut tx, uri, &self.config().context).await?;
        tx.commit().await?;
        self.push_document(&element).await?;
        Ok(element)
    }

    /// Index every dirty element. Returns how many were indexed.
    ///
    /// Elements removed since they were flagged are skipped.
    #[instrument(skip(self))]
    pub async fn index_dirty(&self) -> Result<usize> {
        let uris = {
            let mut conn = self.store().pool().acquire().await?;
            storage::dirty_uris(&mut conn).await?
        };
        let mut indexed = 0;
        for uri in uris {
            match self.index_element(&uri).await {
                Ok(_) => indexed += 1,
                Err(err) if err.is_not_found() => {
                    warn!(%uri, "dirty element vanished before indexing");
                }
                Err(err) => return Err(err),
            }
        }
        debug!(indexed, "dirty set indexed");
        Ok(indexed)
    }

    /// Cached context of `uri` for an audience.
    pub async fn context_of(&self, uri: &str, audience: ShareLevel) -> Result<String> {
        let element = self.get_element(uri).await?;
        Ok(element.context_for(audience).to_string())
    }
}
