//! Graph schema definitions for Trellis.
//!
//! This module defines the core types of a user graph:
//! - `ShareLevel`: visibility tiers, totally ordered
//! - `ElementKind`: the element variants stored in the graph
//! - `NeighborCount`: per-tier neighbor counters cached on every element
//! - `GraphElement` / `Relation` / `Identification` / `Suggestion`: stored rows
//! - `UserUris`: user-scoped URI construction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GraphError, Result};

/// Visibility tier of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareLevel {
    /// Owner only
    Private = 0,
    /// Owner and their friends
    Friends = 1,
    /// Everyone
    Public = 2,
}

impl ShareLevel {
    pub const ALL: [ShareLevel; 3] = [ShareLevel::Private, ShareLevel::Friends, ShareLevel::Public];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShareLevel::Private => "private",
            ShareLevel::Friends => "friends",
            ShareLevel::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(ShareLevel::Private),
            "friends" => Ok(ShareLevel::Friends),
            "public" => Ok(ShareLevel::Public),
            other => Err(GraphError::invalid(format!("unknown share level: {other}"))),
        }
    }

    pub fn as_int(&self) -> i64 {
        *self as i64
    }

    pub fn from_int(i: i64) -> Result<Self> {
        match i {
            0 => Ok(ShareLevel::Private),
            1 => Ok(ShareLevel::Friends),
            2 => Ok(ShareLevel::Public),
            other => Err(GraphError::invalid(format!("invalid share level value: {other}"))),
        }
    }

    /// Tiers of audience allowed to see an element at this level.
    pub fn visible_to(&self) -> Vec<ShareLevel> {
        ShareLevel::ALL
            .into_iter()
            .filter(|audience| *audience <= *self)
            .collect()
    }
}

impl Default for ShareLevel {
    fn default() -> Self {
        ShareLevel::Private
    }
}

/// Kinds of elements in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    /// A node; may carry included sets when built as a composite
    Vertex,
    /// An edge between two vertices
    Relation,
    /// An identification exposed as an element
    Tag,
    /// A relation-like element grouping a set of vertices and edges
    GroupRelation,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Vertex => "vertex",
            ElementKind::Relation => "relation",
            ElementKind::Tag => "tag",
            ElementKind::GroupRelation => "group_relation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vertex" => Some(ElementKind::Vertex),
            "relation" => Some(ElementKind::Relation),
            "tag" => Some(ElementKind::Tag),
            "group_relation" => Some(ElementKind::GroupRelation),
            _ => None,
        }
    }

    /// Path segment used in element URIs.
    pub fn uri_segment(&self) -> &'static str {
        match self {
            ElementKind::Vertex => "vertex",
            ElementKind::Relation => "edge",
            ElementKind::Tag => "identification",
            ElementKind::GroupRelation => "group_relation",
        }
    }
}

/// Denormalized neighbor counters.
///
/// `private` counts every neighbor, `friend` and `public` count neighbors
/// whose tier is exactly that tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborCount {
    pub private: i64,
    pub friend: i64,
    pub public: i64,
}

impl NeighborCount {
    /// Counters contributed by a single neighbor at `tier`, times `sign`.
    pub fn of_neighbor(tier: ShareLevel, sign: i64) -> Self {
        let mut delta = NeighborCount {
            private: sign,
            ..Default::default()
        };
        match tier {
            ShareLevel::Private => {}
            ShareLevel::Friends => delta.friend = sign,
            ShareLevel::Public => delta.public = sign,
        }
        delta
    }

    /// Bucket move for a neighbor changing tier; `private` is untouched.
    pub fn tier_change(old: ShareLevel, new: ShareLevel) -> Self {
        let mut delta = NeighborCount::of_neighbor(new, 1);
        let removed = NeighborCount::of_neighbor(old, -1);
        delta.private = 0;
        delta.friend += removed.friend;
        delta.public += removed.public;
        delta
    }

    /// Authoritative tally over a list of neighbor tiers.
    pub fn tally<I: IntoIterator<Item = ShareLevel>>(tiers: I) -> Self {
        tiers
            .into_iter()
            .fold(NeighborCount::default(), |acc, tier| {
                acc.plus(NeighborCount::of_neighbor(tier, 1))
            })
    }

    pub fn plus(self, other: NeighborCount) -> Self {
        NeighborCount {
            private: self.private + other.private,
            friend: self.friend + other.friend,
            public: self.public + other.public,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == NeighborCount::default()
    }

    pub fn has_negative(&self) -> bool {
        self.private < 0 || self.friend < 0 || self.public < 0
    }

    pub fn total(&self) -> i64 {
        self.private
    }
}

/// A stored element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphElement {
    pub uri: String,
    pub owner: String,
    pub kind: ElementKind,
    pub label: String,
    pub comment: String,
    pub share_level: ShareLevel,
    pub nb_neighbors: NeighborCount,
    pub private_context: String,
    pub friend_context: String,
    pub public_context: String,
    pub dirty: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl GraphElement {
    /// Cached context for a given audience.
    pub fn context_for(&self, audience: ShareLevel) -> &str {
        match audience {
            ShareLevel::Private => &self.private_context,
            ShareLevel::Friends => &self.friend_context,
            ShareLevel::Public => &self.public_context,
        }
    }

    pub fn is_public(&self) -> bool {
        self.share_level == ShareLevel::Public
    }
}

/// A stored edge, with its element row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub element: GraphElement,
    pub source_uri: String,
    pub destination_uri: String,
}

impl Relation {
    pub fn uri(&self) -> &str {
        &self.element.uri
    }

    /// The endpoint opposite `vertex_uri`.
    pub fn other_end(&self, vertex_uri: &str) -> &str {
        if self.source_uri == vertex_uri {
            &self.destination_uri
        } else {
            &self.source_uri
        }
    }
}

/// A shared, reference-counted link to an external resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    /// URI of the tag element representing this identification
    pub uri: String,
    /// Registry key
    pub external_uri: String,
    /// Label captured when the identification was created (or re-forked)
    pub label: String,
    pub external_type: Option<String>,
    pub same_as: Option<String>,
    /// Number of elements currently attached
    pub nb_references: i64,
}

/// What a caller supplies to attach an identification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationInput {
    pub external_uri: String,
    pub label: String,
    pub comment: String,
    pub external_type: Option<String>,
    pub same_as: Option<String>,
    pub share_level: ShareLevel,
}

impl IdentificationInput {
    pub fn new(external_uri: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            external_uri: external_uri.into(),
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, external_type: impl Into<String>) -> Self {
        self.external_type = Some(external_type.into());
        self
    }

    pub fn with_same_as(mut self, same_as: impl Into<String>) -> Self {
        self.same_as = Some(same_as.into());
        self
    }

    pub fn with_share_level(mut self, share_level: ShareLevel) -> Self {
        self.share_level = share_level;
        self
    }
}

/// A proposed neighbor for a vertex, derived from an external resource.
///
/// Keyed per vertex by `same_as`. `origins` lists the external URIs of the
/// identifications that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub same_as: String,
    /// Label given to the relation when accepted
    pub label: String,
    pub external_type: Option<String>,
    /// Label given to the new vertex when accepted
    pub type_label: String,
    pub origins: Vec<String>,
}

impl Suggestion {
    pub fn new(same_as: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            same_as: same_as.into(),
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, external_type: impl Into<String>, type_label: impl Into<String>) -> Self {
        self.external_type = Some(external_type.into());
        self.type_label = type_label.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origins.push(origin.into());
        self
    }
}

/// A neighbor as seen from the element being counted or indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub uri: String,
    pub kind: ElementKind,
    pub label: String,
    pub share_level: ShareLevel,
}

/// URI construction for elements owned by one user.
#[derive(Debug, Clone)]
pub struct UserUris {
    owner: String,
}

impl UserUris {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// URI for an element built from a caller-chosen short id.
    pub fn element_uri(&self, kind: ElementKind, short_id: &str) -> String {
        format!(
            "/service/users/{}/graph/{}/{}",
            self.owner,
            kind.uri_segment(),
            short_id
        )
    }

    /// URI for a new element with a random short id.
    pub fn fresh_uri(&self, kind: ElementKind) -> String {
        self.element_uri(kind, &Uuid::new_v4().to_string())
    }

    /// Last path segment of an element URI.
    pub fn short_id(uri: &str) -> &str {
        uri.rsplit('/').next().unwrap_or(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_level_order() {
        assert!(ShareLevel::Private < ShareLevel::Friends);
        assert!(ShareLevel::Friends < ShareLevel::Public);
        assert_eq!(
            ShareLevel::Friends.min(ShareLevel::Public),
            ShareLevel::Friends
        );
    }

    #[test]
    fn test_share_level_rejects_unknown_values() {
        assert!(ShareLevel::from_int(7).unwrap_err().is_invalid_argument());
        assert!(ShareLevel::parse("everyone").unwrap_err().is_invalid_argument());
        assert_eq!(ShareLevel::parse("PUBLIC").unwrap(), ShareLevel::Public);
    }

    #[test]
    fn test_visible_to() {
        assert_eq!(ShareLevel::Private.visible_to(), vec![ShareLevel::Private]);
        assert_eq!(
            ShareLevel::Public.visible_to(),
            vec![ShareLevel::Private, ShareLevel::Friends, ShareLevel::Public]
        );
    }

    #[test]
    fn test_tier_change_is_exact_bucket_move() {
        let delta = NeighborCount::tier_change(ShareLevel::Friends, ShareLevel::Public);
        assert_eq!(
            delta,
            NeighborCount {
                private: 0,
                friend: -1,
                public: 1
            }
        );
        assert!(NeighborCount::tier_change(ShareLevel::Public, ShareLevel::Public).is_zero());
        assert!(NeighborCount::tier_change(ShareLevel::Private, ShareLevel::Private).is_zero());
    }

    #[test]
    fn test_tally() {
        let count = NeighborCount::tally([
            ShareLevel::Private,
            ShareLevel::Public,
            ShareLevel::Friends,
            ShareLevel::Public,
        ]);
        assert_eq!(count.private, 4);
        assert_eq!(count.friend, 1);
        assert_eq!(count.public, 2);
    }

    #[test]
    fn test_user_uris() {
        let uris = UserUris::new("roger");
        let uri = uris.element_uri(ElementKind::Vertex, "abc");
        assert_eq!(uri, "/service/users/roger/graph/vertex/abc");
        assert_eq!(UserUris::short_id(&uri), "abc");
        assert_ne!(
            uris.fresh_uri(ElementKind::Relation),
            uris.fresh_uri(ElementKind::Relation)
        );
    }
}
