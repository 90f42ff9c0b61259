//! Identity persistence backends.
//!
//! Backends are plain storage: they hand back raw [`IdentityRecord`]s and
//! never validate embeddings or serialize callers. Both concerns belong to
//! [`crate::gateway::IdentityGateway`].

use crate::types::{Classification, IdentityId, IdentityRecord, ScopeId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    #[error("identity store did not respond within {0:?}")]
    Timeout(Duration),
    #[error("identity {0} not found")]
    NotFound(IdentityId),
    #[error("label {0} already exists in scope")]
    DuplicateLabel(String),
}

impl StoreError {
    /// True when the store itself could not be reached, as opposed to a
    /// well-formed refusal.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Insert payload for a first sighting.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub scope: ScopeId,
    pub label: String,
    /// Persisted verbatim.
    pub vector: Vec<f32>,
    pub auxiliary_image: Option<Vec<u8>>,
    pub seen_at: DateTime<Utc>,
}

/// Storage backend for identities.
pub trait IdentityStore: Send + Sync + 'static {
    /// Every identity in `scope`, as one consistent snapshot.
    fn list_for_scope(
        &self,
        scope: ScopeId,
    ) -> impl Future<Output = Result<Vec<IdentityRecord>, StoreError>> + Send;

    fn get_identity(
        &self,
        id: IdentityId,
    ) -> impl Future<Output = Result<IdentityRecord, StoreError>> + Send;

    /// Insert with `visit_count = 1`. Fails with `DuplicateLabel` if the label
    /// is already taken within the scope.
    fn create_identity(
        &self,
        new: NewIdentity,
    ) -> impl Future<Output = Result<IdentityRecord, StoreError>> + Send;

    /// Increment the visit counter by one and set `last_seen`.
    fn record_visit(
        &self,
        id: IdentityId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<IdentityRecord, StoreError>> + Send;

    /// Remove permanently. Committed before the future resolves.
    fn delete_identity(&self, id: IdentityId) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn annotate_identity(
        &self,
        id: IdentityId,
        display_name: Option<String>,
        classification: Option<Classification>,
    ) -> impl Future<Output = Result<IdentityRecord, StoreError>> + Send;
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    records: BTreeMap<IdentityId, IdentityRecord>,
    images: BTreeMap<IdentityId, Vec<u8>>,
}

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing records, ids preserved.
    pub fn with_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        let mut inner = MemoryInner::default();
        for record in records {
            inner.next_id = inner.next_id.max(record.id.0);
            inner.records.insert(record.id, record);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn auxiliary_image(&self, id: IdentityId) -> Option<Vec<u8>> {
        self.inner.read().await.images.get(&id).cloned()
    }
}

impl IdentityStore for MemoryStore {
    async fn list_for_scope(&self, scope: ScopeId) -> Result<Vec<IdentityRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| r.scope == scope)
            .cloned()
            .collect())
    }

    async fn get_identity(&self, id: IdentityId) -> Result<IdentityRecord, StoreError> {
        let inner = self.inner.read().await;
        inner.records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn create_identity(&self, new: NewIdentity) -> Result<IdentityRecord, StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .records
            .values()
            .any(|r| r.scope == new.scope && r.label == new.label)
        {
            return Err(StoreError::DuplicateLabel(new.label));
        }

        inner.next_id += 1;
        let id = IdentityId(inner.next_id);
        let record = IdentityRecord {
            id,
            label: new.label,
            scope: new.scope,
            embedding: new.vector,
            visit_count: 1,
            first_seen: new.seen_at,
            last_seen: new.seen_at,
            display_name: None,
            classification: None,
        };
        inner.records.insert(id, record.clone());
        if let Some(image) = new.auxiliary_image {
            inner.images.insert(id, image);
        }
        Ok(record)
    }

    async fn record_visit(
        &self,
        id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<IdentityRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.visit_count = record.visit_count.saturating_add(1);
        record.last_seen = now;
        Ok(record.clone())
    }

    async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.records.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.images.remove(&id);
        Ok(())
    }

    async fn annotate_identity(
        &self,
        id: IdentityId,
        display_name: Option<String>,
        classification: Option<Classification>,
    ) -> Result<IdentityRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.display_name = display_name;
        record.classification = classification;
        Ok(record.clone())
    }
}
