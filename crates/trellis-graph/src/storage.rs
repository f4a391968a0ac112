//! Graph storage operations for SQLite.
//!
//! `GraphStore` owns the pool and the schema. Row-level helpers are free
//! functions over `&mut SqliteConnection` so that every engine mutation can
//! run them inside one transaction.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::instrument;

use crate::error::{GraphError, Result};
use crate::schema::{
    ElementKind, GraphElement, Identification, IdentificationInput, Neighbor, NeighborCount,
    Relation, ShareLevel, Suggestion,
};

/// Graph storage backed by SQLite.
#[derive(Clone)]
pub struct GraphStore {
    pool: SqlitePool,
}

type ElementRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    String,
    String,
    String,
    i64,
    String,
    String,
);

const ELEMENT_COLUMNS: &str = "uri, owner, kind, label, comment, share_level, \
    nb_private, nb_friend, nb_public, private_context, friend_context, public_context, \
    dirty, created_at, modified_at";

/// Endpoints of a stored relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRow {
    pub uri: String,
    pub source_uri: String,
    pub destination_uri: String,
}

impl RelationRow {
    pub fn other_end(&self, vertex_uri: &str) -> &str {
        if self.source_uri == vertex_uri {
            &self.destination_uri
        } else {
            &self.source_uri
        }
    }
}

/// Fields of an element about to be inserted.
#[derive(Debug, Clone)]
pub struct NewElement<'a> {
    pub uri: &'a str,
    pub owner: &'a str,
    pub kind: ElementKind,
    pub label: &'a str,
    pub comment: &'a str,
    pub share_level: ShareLevel,
}

impl GraphStore {
    /// Create a new GraphStore with an existing connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction; dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Initialize the graph schema (called during DB setup).
    #[instrument(skip_all)]
    pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS graph_elements (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                kind TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                comment TEXT NOT NULL DEFAULT '',
                share_level INTEGER NOT NULL DEFAULT 0,
                nb_private INTEGER NOT NULL DEFAULT 0,
                nb_friend INTEGER NOT NULL DEFAULT 0,
                nb_public INTEGER NOT NULL DEFAULT 0,
                private_context TEXT NOT NULL DEFAULT '',
                friend_context TEXT NOT NULL DEFAULT '',
                public_context TEXT NOT NULL DEFAULT '',
                dirty INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS relations (
                uri TEXT PRIMARY KEY,
                source_uri TEXT NOT NULL,
                destination_uri TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Non-owning included sets: owner -> member
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS included_elements (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_uri TEXT NOT NULL,
                member_uri TEXT NOT NULL,
                UNIQUE(owner_uri, member_uri)
            )",
        )
        .execute(pool)
        .await?;

        // Identification registry, keyed by external URI
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS identifications (
                uri TEXT PRIMARY KEY,
                external_uri TEXT NOT NULL UNIQUE,
                external_type TEXT,
                same_as TEXT,
                nb_references INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS identified_to (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                element_uri TEXT NOT NULL,
                identification_uri TEXT NOT NULL,
                UNIQUE(element_uri, identification_uri)
            )",
        )
        .execute(pool)
        .await?;

        // Pending suggestions per vertex; origins is a JSON array of external URIs
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS suggestions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                vertex_uri TEXT NOT NULL,
                same_as TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                external_type TEXT,
                type_label TEXT NOT NULL DEFAULT '',
                origins TEXT NOT NULL DEFAULT '[]',
                UNIQUE(vertex_uri, same_as)
            )",
        )
        .execute(pool)
        .await?;

        // Indexes for adjacency walks
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_uri)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_relations_destination ON relations(destination_uri)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_included_member ON included_elements(member_uri)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_identified_to_identification ON identified_to(identification_uri)",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_elements_dirty ON graph_elements(dirty)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Get an element by URI outside of any transaction.
    pub async fn get_element(&self, uri: &str) -> Result<Option<GraphElement>> {
        let mut conn = self.pool.acquire().await?;
        get_element(&mut conn, uri).await
    }

    /// Get total element count.
    pub async fn element_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_elements")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Get element count by kind.
    pub async fn element_count_by_kind(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT kind, COUNT(*) as count FROM graph_elements GROUP BY kind ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn parse_time(uri: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| GraphError::consistency(uri, format!("bad timestamp {value:?}: {err}")))
}

fn element_from_row(row: ElementRow) -> Result<GraphElement> {
    let (
        uri,
        owner,
        kind,
        label,
        comment,
        share_level,
        nb_private,
        nb_friend,
        nb_public,
        private_context,
        friend_context,
        public_context,
        dirty,
        created_at,
        modified_at,
    ) = row;
    let kind = ElementKind::parse(&kind)
        .ok_or_else(|| GraphError::consistency(&uri, format!("unknown element kind {kind}")))?;
    let created_at = parse_time(&uri, &created_at)?;
    let modified_at = parse_time(&uri, &modified_at)?;
    Ok(GraphElement {
        uri,
        owner,
        kind,
        label,
        comment,
        share_level: ShareLevel::from_int(share_level)?,
        nb_neighbors: NeighborCount {
            private: nb_private,
            friend: nb_friend,
            public: nb_public,
        },
        private_context,
        friend_context,
        public_context,
        dirty: dirty != 0,
        created_at,
        modified_at,
    })
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

pub async fn insert_element(conn: &mut SqliteConnection, element: &NewElement<'_>) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO graph_elements (uri, owner, kind, label, comment, share_level, dirty, created_at, modified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
    )
    .bind(element.uri)
    .bind(element.owner)
    .bind(element.kind.as_str())
    .bind(element.label)
    .bind(element.comment)
    .bind(element.share_level.as_int())
    .bind(&now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_element(conn: &mut SqliteConnection, uri: &str) -> Result<Option<GraphElement>> {
    let row = sqlx::query_as::<_, ElementRow>(&format!(
        "SELECT {ELEMENT_COLUMNS} FROM graph_elements WHERE uri = ?1"
    ))
    .bind(uri)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(element_from_row).transpose()
}

/// Like [`get_element`], but a missing element is `NotFound`.
pub async fn require_element(conn: &mut SqliteConnection, uri: &str) -> Result<GraphElement> {
    get_element(conn, uri)
        .await?
        .ok_or_else(|| GraphError::not_found(uri))
}

pub async fn has_element(conn: &mut SqliteConnection, uri: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_elements WHERE uri = ?1")
        .bind(uri)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

/// Delete the element row along with any suggestions it carries.
pub async fn delete_element_row(conn: &mut SqliteConnection, uri: &str) -> Result<()> {
    sqlx::query("DELETE FROM suggestions WHERE vertex_uri = ?1")
        .bind(uri)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM graph_elements WHERE uri = ?1")
        .bind(uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_label(conn: &mut SqliteConnection, uri: &str, label: &str) -> Result<()> {
    sqlx::query("UPDATE graph_elements SET label = ?2, modified_at = ?3 WHERE uri = ?1")
        .bind(uri)
        .bind(label)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_comment(conn: &mut SqliteConnection, uri: &str, comment: &str) -> Result<()> {
    sqlx::query("UPDATE graph_elements SET comment = ?2, modified_at = ?3 WHERE uri = ?1")
        .bind(uri)
        .bind(comment)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_share_level(
    conn: &mut SqliteConnection,
    uri: &str,
    share_level: ShareLevel,
) -> Result<()> {
    sqlx::query("UPDATE graph_elements SET share_level = ?2, modified_at = ?3 WHERE uri = ?1")
        .bind(uri)
        .bind(share_level.as_int())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn read_counts(conn: &mut SqliteConnection, uri: &str) -> Result<Option<NeighborCount>> {
    let row = sqlx::query_as::<_, (i64, i64, i64)>(
        "SELECT nb_private, nb_friend, nb_public FROM graph_elements WHERE uri = ?1",
    )
    .bind(uri)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(private, friend, public)| NeighborCount {
        private,
        friend,
        public,
    }))
}

pub async fn write_counts(
    conn: &mut SqliteConnection,
    uri: &str,
    counts: NeighborCount,
) -> Result<()> {
    if counts.has_negative() {
        return Err(GraphError::consistency(
            uri,
            format!("refusing to store negative counters {counts:?}"),
        ));
    }
    sqlx::query(
        "UPDATE graph_elements SET nb_private = ?2, nb_friend = ?3, nb_public = ?4 WHERE uri = ?1",
    )
    .bind(uri)
    .bind(counts.private)
    .bind(counts.friend)
    .bind(counts.public)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Apply a signed delta to an element's counters.
///
/// Fails with `Consistency` instead of storing a negative value.
pub async fn adjust_counts(
    conn: &mut SqliteConnection,
    uri: &str,
    delta: NeighborCount,
) -> Result<()> {
    if delta.is_zero() {
        return Ok(());
    }
    let current = read_counts(conn, uri)
        .await?
        .ok_or_else(|| GraphError::not_found(uri))?;
    let updated = current.plus(delta);
    if updated.has_negative() {
        return Err(GraphError::consistency(
            uri,
            format!("counters {current:?} adjusted by {delta:?} would go negative"),
        ));
    }
    write_counts(conn, uri, updated).await
}

pub async fn mark_dirty(conn: &mut SqliteConnection, uris: &[String]) -> Result<()> {
    for uri in uris {
        sqlx::query("UPDATE graph_elements SET dirty = 1 WHERE uri = ?1")
            .bind(uri)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn dirty_uris(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT uri FROM graph_elements WHERE dirty = 1 ORDER BY seq",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

/// Persist freshly computed contexts and clear the dirty flag.
pub async fn write_contexts(
    conn: &mut SqliteConnection,
    uri: &str,
    private_context: &str,
    friend_context: &str,
    public_context: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE graph_elements SET private_context = ?2, friend_context = ?3, public_context = ?4, dirty = 0
         WHERE uri = ?1",
    )
    .bind(uri)
    .bind(private_context)
    .bind(friend_context)
    .bind(public_context)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn all_element_uris(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>("SELECT uri FROM graph_elements ORDER BY seq")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

pub async fn element_uris_of_kind(
    conn: &mut SqliteConnection,
    kind: ElementKind,
) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT uri FROM graph_elements WHERE kind = ?1 ORDER BY seq",
    )
    .bind(kind.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

pub async fn insert_relation(
    conn: &mut SqliteConnection,
    uri: &str,
    source_uri: &str,
    destination_uri: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO relations (uri, source_uri, destination_uri) VALUES (?1, ?2, ?3)")
        .bind(uri)
        .bind(source_uri)
        .bind(destination_uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_relation_row(
    conn: &mut SqliteConnection,
    uri: &str,
) -> Result<Option<RelationRow>> {
    let row = sqlx::query_as::<_, (String, String, String)>(
        "SELECT uri, source_uri, destination_uri FROM relations WHERE uri = ?1",
    )
    .bind(uri)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(uri, source_uri, destination_uri)| RelationRow {
        uri,
        source_uri,
        destination_uri,
    }))
}

pub async fn get_relation(conn: &mut SqliteConnection, uri: &str) -> Result<Option<Relation>> {
    let Some(row) = get_relation_row(conn, uri).await? else {
        return Ok(None);
    };
    let element = require_element(conn, uri).await?;
    Ok(Some(Relation {
        element,
        source_uri: row.source_uri,
        destination_uri: row.destination_uri,
    }))
}

/// Relations touching `vertex_uri`, in creation order.
pub async fn relations_of(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
) -> Result<Vec<RelationRow>> {
    let rows = sqlx::query_as::<_, (String, String, String)>(
        "SELECT r.uri, r.source_uri, r.destination_uri
         FROM relations r JOIN graph_elements e ON e.uri = r.uri
         WHERE r.source_uri = ?1 OR r.destination_uri = ?1
         ORDER BY e.seq",
    )
    .bind(vertex_uri)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(uri, source_uri, destination_uri)| RelationRow {
            uri,
            source_uri,
            destination_uri,
        })
        .collect())
}

pub async fn update_relation_endpoints(
    conn: &mut SqliteConnection,
    uri: &str,
    source_uri: &str,
    destination_uri: &str,
) -> Result<()> {
    sqlx::query("UPDATE relations SET source_uri = ?2, destination_uri = ?3 WHERE uri = ?1")
        .bind(uri)
        .bind(source_uri)
        .bind(destination_uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_relation_row(conn: &mut SqliteConnection, uri: &str) -> Result<()> {
    sqlx::query("DELETE FROM relations WHERE uri = ?1")
        .bind(uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Included sets
// ---------------------------------------------------------------------------

pub async fn insert_inclusion(
    conn: &mut SqliteConnection,
    owner_uri: &str,
    member_uri: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO included_elements (owner_uri, member_uri) VALUES (?1, ?2)",
    )
    .bind(owner_uri)
    .bind(member_uri)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_inclusion(
    conn: &mut SqliteConnection,
    owner_uri: &str,
    member_uri: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM included_elements WHERE owner_uri = ?1 AND member_uri = ?2")
        .bind(owner_uri)
        .bind(member_uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Elements whose included sets contain `member_uri`.
pub async fn owners_of(conn: &mut SqliteConnection, member_uri: &str) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT owner_uri FROM included_elements WHERE member_uri = ?1 ORDER BY seq",
    )
    .bind(member_uri)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

/// Members of `owner_uri`'s included sets.
pub async fn members_of(conn: &mut SqliteConnection, owner_uri: &str) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT member_uri FROM included_elements WHERE owner_uri = ?1 ORDER BY seq",
    )
    .bind(owner_uri)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

/// Members of `owner_uri` restricted to one kind.
pub async fn members_of_kind(
    conn: &mut SqliteConnection,
    owner_uri: &str,
    kind: ElementKind,
) -> Result<Vec<GraphElement>> {
    // Element columns and inclusion columns do not overlap, so no aliasing.
    let rows = sqlx::query_as::<_, ElementRow>(&format!(
        "SELECT {ELEMENT_COLUMNS} FROM graph_elements e JOIN included_elements i ON i.member_uri = e.uri
         WHERE i.owner_uri = ?1 AND e.kind = ?2 ORDER BY i.seq"
    ))
    .bind(owner_uri)
    .bind(kind.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(element_from_row).collect()
}

// ---------------------------------------------------------------------------
// Identifications
// ---------------------------------------------------------------------------

pub async fn insert_identification(
    conn: &mut SqliteConnection,
    uri: &str,
    input: &IdentificationInput,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO identifications (uri, external_uri, external_type, same_as, nb_references)
         VALUES (?1, ?2, ?3, ?4, 0)",
    )
    .bind(uri)
    .bind(&input.external_uri)
    .bind(&input.external_type)
    .bind(&input.same_as)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

const IDENTIFICATION_SELECT: &str = "SELECT i.uri, i.external_uri, e.label, i.external_type, i.same_as, i.nb_references
     FROM identifications i JOIN graph_elements e ON e.uri = i.uri";

type IdentificationRow = (String, String, String, Option<String>, Option<String>, i64);

fn identification_from_row(row: IdentificationRow) -> Identification {
    let (uri, external_uri, label, external_type, same_as, nb_references) = row;
    Identification {
        uri,
        external_uri,
        label,
        external_type,
        same_as,
        nb_references,
    }
}

pub async fn identification_by_external_uri(
    conn: &mut SqliteConnection,
    external_uri: &str,
) -> Result<Option<Identification>> {
    let row = sqlx::query_as::<_, IdentificationRow>(&format!(
        "{IDENTIFICATION_SELECT} WHERE i.external_uri = ?1"
    ))
    .bind(external_uri)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(identification_from_row))
}

pub async fn identification_by_uri(
    conn: &mut SqliteConnection,
    uri: &str,
) -> Result<Option<Identification>> {
    let row = sqlx::query_as::<_, IdentificationRow>(&format!(
        "{IDENTIFICATION_SELECT} WHERE i.uri = ?1"
    ))
    .bind(uri)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(identification_from_row))
}

/// Identifications attached to an element, in attach order.
pub async fn identifications_of(
    conn: &mut SqliteConnection,
    element_uri: &str,
) -> Result<Vec<Identification>> {
    let rows = sqlx::query_as::<_, IdentificationRow>(&format!(
        "{IDENTIFICATION_SELECT} JOIN identified_to t ON t.identification_uri = i.uri
         WHERE t.element_uri = ?1 ORDER BY t.seq"
    ))
    .bind(element_uri)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(identification_from_row).collect())
}

/// Elements an identification is attached to, in attach order.
pub async fn elements_identified_to(
    conn: &mut SqliteConnection,
    identification_uri: &str,
) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT element_uri FROM identified_to WHERE identification_uri = ?1 ORDER BY seq",
    )
    .bind(identification_uri)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

/// Returns false when the attachment already existed.
pub async fn attach(
    conn: &mut SqliteConnection,
    element_uri: &str,
    identification_uri: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO identified_to (element_uri, identification_uri) VALUES (?1, ?2)",
    )
    .bind(element_uri)
    .bind(identification_uri)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Returns false when there was no such attachment.
pub async fn detach(
    conn: &mut SqliteConnection,
    element_uri: &str,
    identification_uri: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM identified_to WHERE element_uri = ?1 AND identification_uri = ?2",
    )
    .bind(element_uri)
    .bind(identification_uri)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn adjust_nb_references(
    conn: &mut SqliteConnection,
    uri: &str,
    delta: i64,
) -> Result<i64> {
    let current: Option<i64> =
        sqlx::query_scalar("SELECT nb_references FROM identifications WHERE uri = ?1")
            .bind(uri)
            .fetch_optional(&mut *conn)
            .await?;
    let current = current.ok_or_else(|| GraphError::not_found(uri))?;
    let updated = current + delta;
    if updated < 0 {
        return Err(GraphError::consistency(
            uri,
            format!("reference count {current} adjusted by {delta} would go negative"),
        ));
    }
    set_nb_references(conn, uri, updated).await?;
    Ok(updated)
}

pub async fn set_nb_references(conn: &mut SqliteConnection, uri: &str, value: i64) -> Result<()> {
    sqlx::query("UPDATE identifications SET nb_references = ?2 WHERE uri = ?1")
        .bind(uri)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn all_identification_uris(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT i.uri FROM identifications i JOIN graph_elements e ON e.uri = i.uri ORDER BY e.seq",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(uri,)| uri).collect())
}

pub async fn delete_identification_row(conn: &mut SqliteConnection, uri: &str) -> Result<()> {
    sqlx::query("DELETE FROM identifications WHERE uri = ?1")
        .bind(uri)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

type SuggestionRow = (String, String, Option<String>, String, String);

fn suggestion_from_row(row: SuggestionRow) -> Result<Suggestion> {
    let (same_as, label, external_type, type_label, origins) = row;
    let origins: Vec<String> = serde_json::from_str(&origins)?;
    Ok(Suggestion {
        same_as,
        label,
        external_type,
        type_label,
        origins,
    })
}

/// Insert or replace the suggestion keyed by `(vertex_uri, same_as)`.
pub async fn upsert_suggestion(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
    suggestion: &Suggestion,
) -> Result<()> {
    let origins = serde_json::to_string(&suggestion.origins)?;
    sqlx::query(
        "INSERT INTO suggestions (vertex_uri, same_as, label, external_type, type_label, origins)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(vertex_uri, same_as) DO UPDATE SET
            label = excluded.label,
            external_type = excluded.external_type,
            type_label = excluded.type_label,
            origins = excluded.origins",
    )
    .bind(vertex_uri)
    .bind(&suggestion.same_as)
    .bind(&suggestion.label)
    .bind(&suggestion.external_type)
    .bind(&suggestion.type_label)
    .bind(origins)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Suggestions of a vertex, in insertion order.
pub async fn suggestions_of(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
) -> Result<Vec<Suggestion>> {
    let rows = sqlx::query_as::<_, SuggestionRow>(
        "SELECT same_as, label, external_type, type_label, origins
         FROM suggestions WHERE vertex_uri = ?1 ORDER BY seq",
    )
    .bind(vertex_uri)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(suggestion_from_row).collect()
}

pub async fn delete_suggestion(
    conn: &mut SqliteConnection,
    vertex_uri: &str,
    same_as: &str,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM suggestions WHERE vertex_uri = ?1 AND same_as = ?2")
        .bind(vertex_uri)
        .bind(same_as)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Adjacency
// ---------------------------------------------------------------------------

/// URIs whose tiers make up `uri`'s neighbor counters, with multiplicity.
///
/// Vertices see the opposite end of each relation, relations see both
/// endpoints, tags see what they are attached to; every kind also sees the
/// elements including it and the elements it includes.
pub async fn neighbor_uris(
    conn: &mut SqliteConnection,
    uri: &str,
    kind: ElementKind,
) -> Result<Vec<String>> {
    let mut uris = Vec::new();
    match kind {
        ElementKind::Vertex => {
            for relation in relations_of(conn, uri).await? {
                uris.push(relation.other_end(uri).to_string());
            }
        }
        ElementKind::Relation => {
            if let Some(relation) = get_relation_row(conn, uri).await? {
                uris.push(relation.source_uri);
                uris.push(relation.destination_uri);
            }
        }
        ElementKind::Tag => {
            uris.extend(elements_identified_to(conn, uri).await?);
        }
        ElementKind::GroupRelation => {}
    }
    uris.extend(owners_of(conn, uri).await?);
    uris.extend(members_of(conn, uri).await?);
    Ok(uris)
}

/// Resolved neighbors of `uri`, skipping dangling references.
pub async fn neighbors(
    conn: &mut SqliteConnection,
    uri: &str,
    kind: ElementKind,
) -> Result<Vec<Neighbor>> {
    let mut resolved = Vec::new();
    for neighbor_uri in neighbor_uris(conn, uri, kind).await? {
        if let Some(neighbor) = neighbor(conn, &neighbor_uri).await? {
            resolved.push(neighbor);
        }
    }
    Ok(resolved)
}

/// `uri` as seen from one of its neighbors; `None` when it is dangling.
pub async fn neighbor(conn: &mut SqliteConnection, uri: &str) -> Result<Option<Neighbor>> {
    let row = sqlx::query_as::<_, (String, String, String, i64)>(
        "SELECT uri, kind, label, share_level FROM graph_elements WHERE uri = ?1",
    )
    .bind(uri)
    .fetch_optional(&mut *conn)
    .await?;
    let Some((uri, kind, label, share_level)) = row else {
        return Ok(None);
    };
    let Some(kind) = ElementKind::parse(&kind) else {
        return Ok(None);
    };
    Ok(Some(Neighbor {
        uri,
        kind,
        label,
        share_level: ShareLevel::from_int(share_level)?,
    }))
}

/// Live adjacency degree.
pub async fn degree(conn: &mut SqliteConnection, uri: &str, kind: ElementKind) -> Result<i64> {
    Ok(neighbors(conn, uri, kind).await?.len() as i64)
}

/// Elements whose neighbor lists contain `uri`, with multiplicity.
///
/// Exact inverse of [`neighbor_uris`].
pub async fn dependents(
    conn: &mut SqliteConnection,
    uri: &str,
    kind: ElementKind,
) -> Result<Vec<String>> {
    let mut uris = Vec::new();
    if kind == ElementKind::Vertex {
        for relation in relations_of(conn, uri).await? {
            uris.push(relation.other_end(uri).to_string());
            uris.push(relation.uri);
        }
    }
    uris.extend(owners_of(conn, uri).await?);
    uris.extend(members_of(conn, uri).await?);
    uris.extend(
        identifications_of(conn, uri)
            .await?
            .into_iter()
            .map(|identification| identification.uri),
    );
    Ok(uris)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        GraphStore::init_schema(&pool).await.unwrap();
        pool
    }

    fn vertex<'a>(uri: &'a str, label: &'a str) -> NewElement<'a> {
        NewElement {
            uri,
            owner: "roger",
            kind: ElementKind::Vertex,
            label,
            comment: "",
            share_level: ShareLevel::Private,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_element() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();

        insert_element(&mut conn, &vertex("v1", "vertex A")).await.unwrap();
        let element = require_element(&mut conn, "v1").await.unwrap();
        assert_eq!(element.label, "vertex A");
        assert_eq!(element.kind, ElementKind::Vertex);
        assert_eq!(element.share_level, ShareLevel::Private);
        assert!(element.nb_neighbors.is_zero());
        assert!(element.dirty);

        let missing = require_element(&mut conn, "nope").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_reported() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_element(&mut conn, &vertex("v1", "vertex A")).await.unwrap();
        sqlx::query("UPDATE graph_elements SET modified_at = 'yesterday' WHERE uri = 'v1'")
            .execute(&mut *conn)
            .await
            .unwrap();

        let err = get_element(&mut conn, "v1").await.unwrap_err();
        assert!(matches!(err, GraphError::Consistency { ref uri, .. } if uri == "v1"));
    }

    #[tokio::test]
    async fn test_suggestion_origins_stored_as_json() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let suggestion = Suggestion {
            same_as: "http://example.org/name".to_string(),
            label: "Name".to_string(),
            external_type: None,
            type_label: String::new(),
            origins: vec!["http://example.org/person".to_string()],
        };
        upsert_suggestion(&mut conn, "v1", &suggestion).await.unwrap();

        let raw: String = sqlx::query_scalar("SELECT origins FROM suggestions WHERE vertex_uri = 'v1'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(raw, r#"["http://example.org/person"]"#);
        assert_eq!(suggestions_of(&mut conn, "v1").await.unwrap(), vec![suggestion]);

        sqlx::query("UPDATE suggestions SET origins = 'not json'")
            .execute(&mut *conn)
            .await
            .unwrap();
        let err = suggestions_of(&mut conn, "v1").await.unwrap_err();
        assert!(matches!(err, GraphError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_adjust_counts_refuses_negative() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_element(&mut conn, &vertex("v1", "a")).await.unwrap();

        adjust_counts(&mut conn, "v1", NeighborCount::of_neighbor(ShareLevel::Public, 1))
            .await
            .unwrap();
        let err = adjust_counts(&mut conn, "v1", NeighborCount::of_neighbor(ShareLevel::Friends, -1))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Consistency { .. }));

        let counts = read_counts(&mut conn, "v1").await.unwrap().unwrap();
        assert_eq!(
            counts,
            NeighborCount {
                private: 1,
                friend: 0,
                public: 1
            }
        );
    }

    #[tokio::test]
    async fn test_neighbors_and_dependents_are_inverse() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_element(&mut conn, &vertex("a", "vertex A")).await.unwrap();
        insert_element(&mut conn, &vertex("b", "vertex B")).await.unwrap();
        insert_element(
            &mut conn,
            &NewElement {
                kind: ElementKind::Relation,
                ..vertex("ab", "")
            },
        )
        .await
        .unwrap();
        insert_relation(&mut conn, "ab", "a", "b").await.unwrap();

        let of_a = neighbor_uris(&mut conn, "a", ElementKind::Vertex).await.unwrap();
        assert_eq!(of_a, vec!["b".to_string()]);
        let of_ab = neighbor_uris(&mut conn, "ab", ElementKind::Relation).await.unwrap();
        assert_eq!(of_ab, vec!["a".to_string(), "b".to_string()]);

        let mut dependents_of_a = dependents(&mut conn, "a", ElementKind::Vertex).await.unwrap();
        dependents_of_a.sort();
        assert_eq!(dependents_of_a, vec!["ab".to_string(), "b".to_string()]);
        assert!(dependents(&mut conn, "ab", ElementKind::Relation)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_inclusions() {
        let pool = setup_test_db().await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(insert_inclusion(&mut conn, "g", "a").await.unwrap());
        assert!(!insert_inclusion(&mut conn, "g", "a").await.unwrap());
        insert_inclusion(&mut conn, "g", "b").await.unwrap();

        assert_eq!(
            members_of(&mut conn, "g").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(owners_of(&mut conn, "b").await.unwrap(), vec!["g".to_string()]);

        delete_inclusion(&mut conn, "g", "a").await.unwrap();
        assert_eq!(members_of(&mut conn, "g").await.unwrap(), vec!["b".to_string()]);
    }
}
