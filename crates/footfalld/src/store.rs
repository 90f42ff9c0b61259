//! SQLite identity store, driven through `tokio-rusqlite`'s connection thread.

use chrono::{DateTime, Utc};
use footfall_core::{
    Classification, IdentityId, IdentityRecord, IdentityStore, NewIdentity, ScopeId, StoreError,
};
use rusqlite::types::Type;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    scope_id        INTEGER NOT NULL,
    label           TEXT NOT NULL,
    embedding       BLOB NOT NULL,
    visit_count     INTEGER NOT NULL DEFAULT 1,
    first_seen      TEXT NOT NULL,
    last_seen       TEXT NOT NULL,
    display_name    TEXT,
    classification  TEXT,
    auxiliary_image BLOB,
    UNIQUE (scope_id, label)
);
CREATE INDEX IF NOT EXISTS idx_identities_scope ON identities (scope_id);
";

const COLUMNS: &str = "id, scope_id, label, embedding, visit_count, first_seen, last_seen, \
                       display_name, classification";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).await.map_err(unavailable)?;
        let store = Self { conn };
        store.init(true).await?;
        tracing::info!(path = %path.display(), "identity database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(unavailable)?;
        let store = Self { conn };
        store.init(false).await?;
        Ok(store)
    }

    async fn init(&self, wal: bool) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                if wal {
                    conn.pragma_update(None, "journal_mode", "WAL")?;
                }
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(n.max(0) as u64)
            })
            .await
            .map_err(unavailable)
    }

    pub async fn auxiliary_image(&self, id: IdentityId) -> Result<Option<Vec<u8>>, StoreError> {
        let image = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT auxiliary_image FROM identities WHERE id = ?1",
                        params![id.0],
                        |row| row.get::<_, Option<Vec<u8>>>(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(unavailable)?;
        image.ok_or(StoreError::NotFound(id))
    }

    async fn fetch(&self, id: IdentityId) -> Result<IdentityRecord, StoreError> {
        self.conn
            .call(move |conn| Ok(select_one(conn, id)?))
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(id))
    }
}

impl IdentityStore for SqliteStore {
    async fn list_for_scope(&self, scope: ScopeId) -> Result<Vec<IdentityRecord>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM identities WHERE scope_id = ?1 ORDER BY id"
                ))?;
                let records = stmt
                    .query_map(params![scope.0], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
            .map_err(unavailable)
    }

    async fn get_identity(&self, id: IdentityId) -> Result<IdentityRecord, StoreError> {
        self.fetch(id).await
    }

    async fn create_identity(&self, new: NewIdentity) -> Result<IdentityRecord, StoreError> {
        let label = new.label.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let seen = new.seen_at.to_rfc3339();
                let result = conn.execute(
                    "INSERT INTO identities
                         (scope_id, label, embedding, visit_count, first_seen, last_seen, auxiliary_image)
                     VALUES (?1, ?2, ?3, 1, ?4, ?4, ?5)",
                    params![
                        new.scope.0,
                        new.label,
                        encode_embedding(&new.vector),
                        seen,
                        new.auxiliary_image,
                    ],
                );
                match result {
                    Ok(_) => Ok(Some(IdentityId(conn.last_insert_rowid()))),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(unavailable)?;

        match inserted {
            Some(id) => self.fetch(id).await,
            None => Err(StoreError::DuplicateLabel(label)),
        }
    }

    async fn record_visit(
        &self,
        id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE identities SET visit_count = visit_count + 1, last_seen = ?2 WHERE id = ?1",
                    params![id.0, now.to_rfc3339()],
                )?;
                let record = if changed == 0 { None } else { select_one(&tx, id)? };
                tx.commit()?;
                Ok(record)
            })
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError> {
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM identities WHERE id = ?1", params![id.0])?))
            .await
            .map_err(unavailable)?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn annotate_identity(
        &self,
        id: IdentityId,
        display_name: Option<String>,
        classification: Option<Classification>,
    ) -> Result<IdentityRecord, StoreError> {
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE identities SET display_name = ?2, classification = ?3 WHERE id = ?1",
                    params![id.0, display_name, classification.map(|c| c.as_str())],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                Ok(select_one(conn, id)?)
            })
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(id))
    }
}

fn unavailable(err: tokio_rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn select_one(conn: &rusqlite::Connection, id: IdentityId) -> rusqlite::Result<Option<IdentityRecord>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM identities WHERE id = ?1"),
        params![id.0],
        row_to_record,
    )
    .optional()
}

fn row_to_record(row: &Row) -> rusqlite::Result<IdentityRecord> {
    let id = IdentityId(row.get("id")?);
    let blob: Vec<u8> = row.get("embedding")?;
    let classification: Option<String> = row.get("classification")?;

    Ok(IdentityRecord {
        id,
        label: row.get("label")?,
        scope: ScopeId(row.get("scope_id")?),
        embedding: decode_embedding(id, &blob),
        visit_count: row.get("visit_count")?,
        first_seen: parse_datetime(row, "first_seen")?,
        last_seen: parse_datetime(row, "last_seen")?,
        display_name: row.get("display_name")?,
        classification: classification.as_deref().and_then(Classification::parse),
    })
}

fn parse_datetime(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(column).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

/// Little-endian f32s, 4 bytes each.
fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// A truncated blob decodes to an empty vector, which fails dimension
/// validation upstream.
fn decode_embedding(id: IdentityId, bytes: &[u8]) -> Vec<f32> {
    if bytes.len() % 4 != 0 {
        tracing::warn!(identity = %id, len = bytes.len(), "embedding blob is not a whole number of f32s");
        return Vec::new();
    }
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use footfall_core::{FeatureVector, IdentityGateway, MatchConfig, Provenance, EMBEDDING_DIM};
    use std::sync::Arc;
    use std::time::Duration;

    fn basis(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn new_identity(scope: i64, label: &str, axis: usize) -> NewIdentity {
        NewIdentity {
            scope: ScopeId(scope),
            label: label.into(),
            vector: basis(axis),
            auxiliary_image: None,
            seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_embedding_blob_layout() {
        let bytes = encode_embedding(&[1.0, -0.5]);
        assert_eq!(bytes, [0, 0, 128, 63, 0, 0, 0, 191]);
        assert_eq!(decode_embedding(IdentityId(1), &bytes), vec![1.0, -0.5]);
        assert!(decode_embedding(IdentityId(1), &bytes[..7]).is_empty());
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store.create_identity(new_identity(1, "V-a", 0)).await.unwrap();
        store.create_identity(new_identity(2, "V-b", 1)).await.unwrap();

        assert_eq!(a.visit_count, 1);
        assert_eq!(a.embedding, basis(0));

        let scope1 = store.list_for_scope(ScopeId(1)).await.unwrap();
        assert_eq!(scope1.len(), 1);
        assert_eq!(scope1[0].label, "V-a");
        assert_eq!(scope1[0].first_seen.timestamp(), a.first_seen.timestamp());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_label_in_scope() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.create_identity(new_identity(1, "V-a", 0)).await.unwrap();
        assert_eq!(
            store.create_identity(new_identity(1, "V-a", 1)).await.unwrap_err(),
            StoreError::DuplicateLabel("V-a".into())
        );
        store.create_identity(new_identity(2, "V-a", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_record_visit() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store.create_identity(new_identity(1, "V-a", 0)).await.unwrap();
        let later = a.last_seen + chrono::Duration::minutes(10);

        let visited = store.record_visit(a.id, later).await.unwrap();
        assert_eq!(visited.visit_count, 2);
        assert_eq!(visited.last_seen.timestamp(), later.timestamp());
        assert_eq!(visited.embedding, a.embedding);

        let missing = IdentityId(404);
        assert_eq!(
            store.record_visit(missing, later).await.unwrap_err(),
            StoreError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn test_delete_and_ids_not_reused() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = store.create_identity(new_identity(1, "V-a", 0)).await.unwrap();
        store.delete_identity(a.id).await.unwrap();
        assert!(store.list_for_scope(ScopeId(1)).await.unwrap().is_empty());
        assert_eq!(store.delete_identity(a.id).await.unwrap_err(), StoreError::NotFound(a.id));

        let b = store.create_identity(new_identity(1, "V-b", 0)).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_annotate_and_image() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let mut new = new_identity(1, "V-a", 0);
        new.auxiliary_image = Some(vec![0xff, 0xd8, 0xff]);
        let a = store.create_identity(new).await.unwrap();
        assert_eq!(store.auxiliary_image(a.id).await.unwrap(), Some(vec![0xff, 0xd8, 0xff]));

        let annotated = store
            .annotate_identity(a.id, Some("Carla".into()), Some(Classification::Undecided))
            .await
            .unwrap();
        assert_eq!(annotated.display_name.as_deref(), Some("Carla"));
        assert_eq!(annotated.classification, Some(Classification::Undecided));
    }

    #[tokio::test]
    async fn test_gateway_over_sqlite() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let gw = IdentityGateway::new(Arc::clone(&store), &MatchConfig::default(), Duration::from_secs(2));

        let v = FeatureVector::new(basis(4), Provenance::Incoming).unwrap();
        let request = footfall_core::IdentifyRequest {
            vector: v.clone(),
            scope: ScopeId(9),
            auxiliary_image: None,
        };
        let first = gw.identify(request.clone()).await.unwrap();
        let second = gw.identify(request).await.unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(second.identity().visit_count, 2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_blob_skipped_by_gateway() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let a = store.create_identity(new_identity(1, "V-a", 0)).await.unwrap();
        store
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE identities SET embedding = ?2 WHERE id = ?1",
                    params![a.id.0, vec![1u8, 2, 3]],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let gw = IdentityGateway::new(Arc::clone(&store), &MatchConfig::default(), Duration::from_secs(2));
        assert!(gw.list_for_scope(ScopeId(1)).await.unwrap().is_empty());
    }
}
