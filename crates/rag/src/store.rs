use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bytemuck::{cast_slice, pod_collect_to_vec};
use chrono::Utc;
use docqa_core::{cosine_similarity, dot_product, Chunk};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexError;
use crate::filter::{Filter, PayloadField};

pub const SCHEMA_VERSION: i64 = 1;
/// Reservations older than this are considered abandoned.
pub const RESERVATION_TTL_SECS: i64 = 600;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Distance::Cosine => cosine_similarity(a, b),
            Distance::Dot => dot_product(a, b),
        }
    }
}

impl FromStr for Distance {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cosine" => Ok(Distance::Cosine),
            "dot" => Ok(Distance::Dot),
            other => Err(format!("unknown distance '{other}'")),
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk with its vector, ready to be written.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f32,
}

/// Outcome of [`VectorIndex::try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller now owns ingestion of the document.
    Acquired,
    /// Chunks for the document are already stored.
    Exists,
    /// Another ingestion holds a live reservation.
    InProgress,
}

/// Storage contract the pipeline depends on.
pub trait VectorIndex: Send + Sync {
    fn create_collection(&self, name: &str, dim: usize, distance: Distance)
        -> Result<(), IndexError>;

    fn ensure_payload_index(&self, collection: &str, field: PayloadField)
        -> Result<(), IndexError>;

    /// Writes all points in one transaction. Points are keyed by chunk id.
    fn upsert(&self, collection: &str, points: &[IndexPoint]) -> Result<usize, IndexError>;

    /// Returns at most `limit` hits ordered by score, best first.
    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<usize, IndexError>;

    /// Atomically checks for existing chunks of `doc_id` and reserves the
    /// document for ingestion if there are none.
    fn try_reserve(&self, collection: &str, doc_id: &str) -> Result<Reservation, IndexError>;

    fn release(&self, collection: &str, doc_id: &str) -> Result<(), IndexError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
struct CollectionInfo {
    dimension: usize,
    distance: Distance,
}

/// [`VectorIndex`] backed by a single SQLite file with brute-force scoring.
#[derive(Clone)]
pub struct SqliteIndex {
    path: PathBuf,
}

impl SqliteIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let index = Self { path };
        index.init()?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection, IndexError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init(&self) -> Result<(), IndexError> {
        let mut conn = self.connection()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dimension INTEGER NOT NULL,
                distance TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS points (
                collection TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                doc_name TEXT NOT NULL,
                text TEXT NOT NULL,
                page_start INTEGER NOT NULL,
                page_end INTEGER NOT NULL,
                vector BLOB NOT NULL,
                PRIMARY KEY (collection, chunk_id),
                FOREIGN KEY(collection) REFERENCES collections(name)
            );
            CREATE TABLE IF NOT EXISTS payload_indexes (
                collection TEXT NOT NULL,
                field TEXT NOT NULL,
                PRIMARY KEY (collection, field)
            );
            CREATE TABLE IF NOT EXISTS reservations (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                reserved_at INTEGER NOT NULL,
                PRIMARY KEY (collection, doc_id)
            );
            "#,
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        let stored: String = tx.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        let found = stored.parse::<i64>().unwrap_or(-1);
        if found != SCHEMA_VERSION {
            return Err(IndexError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        tx.commit()?;
        Ok(())
    }

    fn collection_info(
        conn: &Connection,
        collection: &str,
    ) -> Result<Option<CollectionInfo>, IndexError> {
        let row = conn
            .query_row(
                "SELECT dimension, distance FROM collections WHERE name = ?1",
                [collection],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(dimension, distance)| CollectionInfo {
            dimension: dimension as usize,
            distance: distance.parse().unwrap_or_default(),
        }))
    }

    fn require_collection(
        conn: &Connection,
        collection: &str,
    ) -> Result<CollectionInfo, IndexError> {
        Self::collection_info(conn, collection)?
            .ok_or_else(|| IndexError::UnknownCollection(collection.to_string()))
    }
}

impl VectorIndex for SqliteIndex {
    fn create_collection(
        &self,
        name: &str,
        dim: usize,
        distance: Distance,
    ) -> Result<(), IndexError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = Self::collection_info(&tx, name)? {
            if existing.dimension != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: existing.dimension,
                    actual: dim,
                });
            }
            if existing.distance != distance {
                return Err(IndexError::DistanceMismatch {
                    collection: name.to_string(),
                    existing: existing.distance.to_string(),
                    requested: distance.to_string(),
                });
            }
            return Ok(());
        }
        tx.execute(
            "INSERT INTO collections (name, dimension, distance) VALUES (?1, ?2, ?3)",
            params![name, dim as i64, distance.as_str()],
        )?;
        tx.commit()?;
        debug!(collection = name, dim, distance = %distance, "created collection");
        Ok(())
    }

    fn ensure_payload_index(
        &self,
        collection: &str,
        field: PayloadField,
    ) -> Result<(), IndexError> {
        let conn = self.connection()?;
        Self::require_collection(&conn, collection)?;
        let column = field.column();
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_points_{column} ON points(collection, {column});"
        ))?;
        conn.execute(
            "INSERT OR IGNORE INTO payload_indexes (collection, field) VALUES (?1, ?2)",
            params![collection, field.as_str()],
        )?;
        Ok(())
    }

    fn upsert(&self, collection: &str, points: &[IndexPoint]) -> Result<usize, IndexError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let info = Self::require_collection(&tx, collection)?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != info.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: info.dimension,
                actual: bad.vector.len(),
            });
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO points (collection, chunk_id, doc_id, doc_name, text, page_start, page_end, vector) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for point in points {
                let chunk = &point.chunk;
                stmt.execute(params![
                    collection,
                    chunk.chunk_id,
                    chunk.doc_id,
                    chunk.doc_name,
                    chunk.text,
                    chunk.page_start,
                    chunk.page_end,
                    cast_slice::<f32, u8>(&point.vector),
                ])?;
            }
        }
        tx.commit()?;
        Ok(points.len())
    }

    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let conn = self.connection()?;
        let info = Self::require_collection(&conn, collection)?;
        if vector.len() != info.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: info.dimension,
                actual: vector.len(),
            });
        }
        let mut sql = String::from(
            "SELECT chunk_id, doc_id, doc_name, text, page_start, page_end, vector FROM points WHERE collection = ?1",
        );
        if let Some(filter) = filter {
            sql.push_str(&format!(" AND {} = ?2", filter.field().column()));
        }
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = match filter {
            Some(filter) => stmt.query(params![collection, filter.match_value()])?,
            None => stmt.query(params![collection])?,
        };
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let chunk = Chunk {
                chunk_id: row.get(0)?,
                doc_id: row.get(1)?,
                doc_name: row.get(2)?,
                text: row.get(3)?,
                page_start: row.get(4)?,
                page_end: row.get(5)?,
            };
            let blob: Vec<u8> = row.get(6)?;
            if blob.len() % std::mem::size_of::<f32>() != 0 {
                return Err(IndexError::CorruptVector(chunk.chunk_id));
            }
            let stored: Vec<f32> = pod_collect_to_vec::<u8, f32>(&blob);
            let score = info.distance.score(vector, &stored);
            hits.push(SearchHit { chunk, score });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<usize, IndexError> {
        let conn = self.connection()?;
        Self::require_collection(&conn, collection)?;
        let count: i64 = match filter {
            Some(filter) => conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM points WHERE collection = ?1 AND {} = ?2",
                    filter.field().column()
                ),
                params![collection, filter.match_value()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM points WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }

    fn try_reserve(&self, collection: &str, doc_id: &str) -> Result<Reservation, IndexError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::require_collection(&tx, collection)?;
        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM points WHERE collection = ?1 AND doc_id = ?2",
            params![collection, doc_id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(Reservation::Exists);
        }
        let now = Utc::now().timestamp();
        let reserved_at: Option<i64> = tx
            .query_row(
                "SELECT reserved_at FROM reservations WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(reserved_at) = reserved_at {
            if now - reserved_at < RESERVATION_TTL_SECS {
                return Ok(Reservation::InProgress);
            }
            debug!(collection, doc_id, reserved_at, "taking over stale reservation");
        }
        tx.execute(
            "INSERT OR REPLACE INTO reservations (collection, doc_id, reserved_at) VALUES (?1, ?2, ?3)",
            params![collection, doc_id, now],
        )?;
        tx.commit()?;
        Ok(Reservation::Acquired)
    }

    fn release(&self, collection: &str, doc_id: &str) -> Result<(), IndexError> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM reservations WHERE collection = ?1 AND doc_id = ?2",
            params![collection, doc_id],
        )?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{} (schema v{SCHEMA_VERSION})", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn point(doc_id: &str, chunk_id: &str, vector: Vec<f32>) -> IndexPoint {
        IndexPoint {
            chunk: Chunk {
                chunk_id: chunk_id.to_string(),
                doc_id: doc_id.to_string(),
                doc_name: format!("{doc_id}.pdf"),
                text: format!("text of {chunk_id}"),
                page_start: 1,
                page_end: 2,
            },
            vector,
        }
    }

    fn open_index() -> (tempfile::TempDir, SqliteIndex) {
        let dir = tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("index.sqlite")).unwrap();
        index.create_collection("docs", 3, Distance::Cosine).unwrap();
        (dir, index)
    }

    #[test]
    fn create_collection_is_idempotent_but_checks_dimension() {
        let (_dir, index) = open_index();
        index.create_collection("docs", 3, Distance::Cosine).unwrap();
        assert!(matches!(
            index.create_collection("docs", 4, Distance::Cosine),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 4 })
        ));
        assert!(matches!(
            index.create_collection("docs", 3, Distance::Dot),
            Err(IndexError::DistanceMismatch { .. })
        ));
    }

    #[test]
    fn search_respects_filter_and_order() {
        let (_dir, index) = open_index();
        index
            .upsert(
                "docs",
                &[
                    point("a", "a1", vec![1.0, 0.0, 0.0]),
                    point("a", "a2", vec![0.7, 0.7, 0.0]),
                    point("b", "b1", vec![1.0, 0.0, 0.0]),
                ],
            )
            .unwrap();
        let filter = Filter::doc_id("a").unwrap();
        let hits = index
            .search("docs", &[1.0, 0.0, 0.0], Some(&filter), 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.chunk_id, "a1");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|h| h.chunk.doc_id == "a"));

        let unfiltered = index.search("docs", &[1.0, 0.0, 0.0], None, 1).unwrap();
        assert_eq!(unfiltered.len(), 1);
    }

    #[test]
    fn filter_match_is_exact() {
        let (_dir, index) = open_index();
        index
            .upsert(
                "docs",
                &[
                    point("Manual", "m1", vec![1.0, 0.0, 0.0]),
                    point("manual", "m2", vec![1.0, 0.0, 0.0]),
                ],
            )
            .unwrap();
        let filter = Filter::doc_id("Manual").unwrap();
        assert_eq!(index.count("docs", Some(&filter)).unwrap(), 1);
        let hits = index
            .search("docs", &[1.0, 0.0, 0.0], Some(&filter), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_id, "m1");
    }

    #[test]
    fn upsert_replaces_by_chunk_id() {
        let (_dir, index) = open_index();
        let points = vec![point("a", "a1", vec![1.0, 0.0, 0.0])];
        index.upsert("docs", &points).unwrap();
        index.upsert("docs", &points).unwrap();
        assert_eq!(index.count("docs", None).unwrap(), 1);
    }

    #[test]
    fn wrong_dimension_rejects_whole_batch() {
        let (_dir, index) = open_index();
        let err = index
            .upsert(
                "docs",
                &[
                    point("a", "a1", vec![1.0, 0.0, 0.0]),
                    point("a", "a2", vec![1.0, 0.0]),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
        assert_eq!(index.count("docs", None).unwrap(), 0);
        assert!(index.search("docs", &[1.0], None, 5).is_err());
    }

    #[test]
    fn reservation_lifecycle() {
        let (_dir, index) = open_index();
        assert_eq!(index.try_reserve("docs", "a").unwrap(), Reservation::Acquired);
        assert_eq!(index.try_reserve("docs", "a").unwrap(), Reservation::InProgress);
        index.release("docs", "a").unwrap();
        assert_eq!(index.try_reserve("docs", "a").unwrap(), Reservation::Acquired);
        index
            .upsert("docs", &[point("a", "a1", vec![0.0, 1.0, 0.0])])
            .unwrap();
        index.release("docs", "a").unwrap();
        assert_eq!(index.try_reserve("docs", "a").unwrap(), Reservation::Exists);
    }

    #[test]
    fn stale_reservation_can_be_taken_over() {
        let (_dir, index) = open_index();
        let conn = index.connection().unwrap();
        conn.execute(
            "INSERT INTO reservations (collection, doc_id, reserved_at) VALUES ('docs', 'a', ?1)",
            params![Utc::now().timestamp() - RESERVATION_TTL_SECS - 1],
        )
        .unwrap();
        assert_eq!(index.try_reserve("docs", "a").unwrap(), Reservation::Acquired);
    }

    #[test]
    fn reopening_restores_points() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.sqlite");
        {
            let index = SqliteIndex::open(&path).unwrap();
            index.create_collection("docs", 3, Distance::Dot).unwrap();
            index
                .ensure_payload_index("docs", PayloadField::DocId)
                .unwrap();
            index
                .upsert("docs", &[point("a", "a1", vec![0.5, 0.5, 0.0])])
                .unwrap();
        }
        let reopened = SqliteIndex::open(&path).unwrap();
        reopened
            .ensure_payload_index("docs", PayloadField::DocId)
            .unwrap();
        let hits = reopened.search("docs", &[1.0, 1.0, 0.0], None, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[0].chunk.page_end, 2);
    }

    #[test]
    fn foreign_schema_version_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.sqlite");
        SqliteIndex::open(&path).unwrap();
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE meta SET value = '99' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        assert!(matches!(
            SqliteIndex::open(&path),
            Err(IndexError::SchemaVersion { found: 99, .. })
        ));
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let (_dir, index) = open_index();
        assert!(matches!(
            index.count("missing", None),
            Err(IndexError::UnknownCollection(_))
        ));
    }
}
