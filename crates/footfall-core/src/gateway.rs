//! The only writer of identity records.
//!
//! Each identify call runs list → resolve → create-or-visit under a
//! per-scope async mutex, so concurrent first sightings of one visitor in
//! one scope are linearized and produce a single identity. Every backend
//! call and every lock acquisition is bounded by `store_timeout`.

use crate::resolver::{IdentityResolver, MatchConfig, Resolution};
use crate::store::{IdentityStore, NewIdentity, StoreError};
use crate::types::{
    Classification, FeatureVector, Identity, IdentityId, IdentifyRequest, MatchDecision, ScopeId,
    VectorError,
};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Fresh labels tried before giving up on a scope-local collision.
const LABEL_ATTEMPTS: usize = 5;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed feature vector: {0}")]
    MalformedVector(#[from] VectorError),
}

pub struct IdentityGateway<S> {
    store: Arc<S>,
    resolver: IdentityResolver,
    store_timeout: Duration,
    scopes: Mutex<HashMap<ScopeId, Arc<AsyncMutex<()>>>>,
}

impl<S: IdentityStore> IdentityGateway<S> {
    pub fn new(store: Arc<S>, matching: &MatchConfig, store_timeout: Duration) -> Self {
        Self {
            store,
            resolver: IdentityResolver::new(matching),
            store_timeout,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.resolver.threshold()
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Resolve one vector against its scope, creating or visiting an identity.
    pub async fn identify(&self, request: IdentifyRequest) -> Result<MatchDecision, IdentifyError> {
        let IdentifyRequest {
            vector,
            scope,
            auxiliary_image,
        } = request;

        let _guard = self.lock_scope(scope).await?;
        let mut population = self.load_scope(scope).await?;

        match self.resolver.resolve(&vector, &population) {
            Resolution::Returning { index, similarity } => {
                let mut identity = population.swap_remove(index);
                let record = self
                    .bounded("record_visit", self.store.record_visit(identity.id, Utc::now()))
                    .await?;
                identity.visit_count = record.visit_count;
                identity.last_seen = record.last_seen;
                tracing::info!(
                    scope = %scope,
                    identity = %identity.id,
                    label = %identity.label,
                    similarity,
                    visits = identity.visit_count,
                    "returning visitor"
                );
                Ok(MatchDecision::Returning {
                    identity,
                    similarity,
                })
            }
            Resolution::New { best_similarity } => {
                let identity = self.insert(scope, vector, auxiliary_image).await?;
                tracing::info!(
                    scope = %scope,
                    identity = %identity.id,
                    label = %identity.label,
                    best_similarity,
                    population = population.len(),
                    "new visitor"
                );
                Ok(MatchDecision::New { identity })
            }
        }
    }

    /// Like [`identify`](Self::identify), for raw wire values.
    pub async fn identify_values(
        &self,
        values: Vec<f32>,
        scope: ScopeId,
        auxiliary_image: Option<Vec<u8>>,
    ) -> Result<MatchDecision, IdentifyError> {
        let request = IdentifyRequest::new(values, scope, auxiliary_image).map_err(|err| {
            tracing::warn!(scope = %scope, error = %err, "rejecting identify request");
            err
        })?;
        self.identify(request).await
    }

    /// Current identities for a scope. Stored records with malformed vectors
    /// are logged and left out.
    pub async fn list_for_scope(&self, scope: ScopeId) -> Result<Vec<Identity>, StoreError> {
        self.load_scope(scope).await
    }

    /// Create an identity outside of resolution, under the scope lock.
    pub async fn create_identity(
        &self,
        scope: ScopeId,
        vector: FeatureVector,
        auxiliary_image: Option<Vec<u8>>,
    ) -> Result<Identity, IdentifyError> {
        let _guard = self.lock_scope(scope).await?;
        self.insert(scope, vector, auxiliary_image).await
    }

    pub async fn record_visit(&self, id: IdentityId) -> Result<Identity, IdentifyError> {
        let record = self
            .bounded("record_visit", self.store.record_visit(id, Utc::now()))
            .await?;
        Ok(Identity::try_from(record)?)
    }

    /// Remove an identity. Once this returns, no later resolution in its
    /// scope can match it.
    pub async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError> {
        let record = self.bounded("get_identity", self.store.get_identity(id)).await?;
        let _guard = self.lock_scope(record.scope).await?;
        self.bounded("delete_identity", self.store.delete_identity(id))
            .await?;
        tracing::info!(identity = %id, scope = %record.scope, label = %record.label, "identity deleted");
        Ok(())
    }

    pub async fn annotate_identity(
        &self,
        id: IdentityId,
        display_name: Option<String>,
        classification: Option<Classification>,
    ) -> Result<Identity, IdentifyError> {
        let record = self
            .bounded(
                "annotate_identity",
                self.store.annotate_identity(id, display_name, classification),
            )
            .await?;
        tracing::info!(
            identity = %id,
            classification = record.classification.map(|c| c.as_str()),
            "identity annotated"
        );
        Ok(Identity::try_from(record)?)
    }

    async fn insert(
        &self,
        scope: ScopeId,
        vector: FeatureVector,
        auxiliary_image: Option<Vec<u8>>,
    ) -> Result<Identity, IdentifyError> {
        let mut new = NewIdentity {
            scope,
            label: generate_label(),
            vector: vector.into_values(),
            auxiliary_image,
            seen_at: Utc::now(),
        };

        let mut attempt = 1;
        let record = loop {
            match self
                .bounded("create_identity", self.store.create_identity(new.clone()))
                .await
            {
                Ok(record) => break record,
                Err(StoreError::DuplicateLabel(label)) if attempt < LABEL_ATTEMPTS => {
                    tracing::warn!(scope = %scope, label = %label, attempt, "label collision, regenerating");
                    new.label = generate_label();
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        Ok(Identity::try_from(record)?)
    }

    async fn load_scope(&self, scope: ScopeId) -> Result<Vec<Identity>, StoreError> {
        let records = self
            .bounded("list_for_scope", self.store.list_for_scope(scope))
            .await?;

        let mut population = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            if record.scope != scope {
                tracing::warn!(identity = %id, expected = %scope, actual = %record.scope, "store returned identity from another scope");
                continue;
            }
            match Identity::try_from(record) {
                Ok(identity) => population.push(identity),
                Err(err) => {
                    tracing::warn!(identity = %id, scope = %scope, error = %err, "skipping stored identity with malformed vector");
                }
            }
        }
        Ok(population)
    }

    async fn lock_scope(&self, scope: ScopeId) -> Result<OwnedMutexGuard<()>, StoreError> {
        let lock = {
            let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(scopes.entry(scope).or_default())
        };
        tokio::time::timeout(self.store_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(scope = %scope, timeout = ?self.store_timeout, "timed out waiting for scope lock");
                StoreError::Timeout(self.store_timeout)
            })
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if err.is_unavailable() {
                    tracing::error!(op, error = %err, "identity store call failed");
                }
                Err(err)
            }
            Err(_) => {
                tracing::error!(op, timeout = ?self.store_timeout, "identity store call timed out");
                Err(StoreError::Timeout(self.store_timeout))
            }
        }
    }
}

/// Opaque human-facing label, e.g. `V-3f9a0c1d`.
fn generate_label() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("V-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::tests::{basis, vector};
    use crate::types::{IdentityRecord, Provenance, EMBEDDING_DIM};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway<S: IdentityStore>(store: S) -> Arc<IdentityGateway<S>> {
        Arc::new(IdentityGateway::new(
            Arc::new(store),
            &MatchConfig::default(),
            Duration::from_millis(500),
        ))
    }

    fn request(values: Vec<f32>, scope: i64) -> IdentifyRequest {
        IdentifyRequest {
            vector: vector(values),
            scope: ScopeId(scope),
            auxiliary_image: None,
        }
    }

    /// Memory store that yields inside every read, widening the race window
    /// between `list_for_scope` and `create_identity`.
    #[derive(Default)]
    struct SlowListStore {
        inner: MemoryStore,
        creates: AtomicUsize,
    }

    impl IdentityStore for SlowListStore {
        async fn list_for_scope(&self, scope: ScopeId) -> Result<Vec<IdentityRecord>, StoreError> {
            let records = self.inner.list_for_scope(scope).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            records
        }
        async fn get_identity(&self, id: IdentityId) -> Result<IdentityRecord, StoreError> {
            self.inner.get_identity(id).await
        }
        async fn create_identity(&self, new: NewIdentity) -> Result<IdentityRecord, StoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create_identity(new).await
        }
        async fn record_visit(
            &self,
            id: IdentityId,
            now: chrono::DateTime<Utc>,
        ) -> Result<IdentityRecord, StoreError> {
            self.inner.record_visit(id, now).await
        }
        async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError> {
            self.inner.delete_identity(id).await
        }
        async fn annotate_identity(
            &self,
            id: IdentityId,
            display_name: Option<String>,
            classification: Option<Classification>,
        ) -> Result<IdentityRecord, StoreError> {
            self.inner.annotate_identity(id, display_name, classification).await
        }
    }

    /// Either never answers or always fails.
    struct BrokenStore {
        hang: bool,
    }

    impl BrokenStore {
        async fn fail<T>(&self) -> Result<T, StoreError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    impl IdentityStore for BrokenStore {
        async fn list_for_scope(&self, _: ScopeId) -> Result<Vec<IdentityRecord>, StoreError> {
            self.fail().await
        }
        async fn get_identity(&self, _: IdentityId) -> Result<IdentityRecord, StoreError> {
            self.fail().await
        }
        async fn create_identity(&self, _: NewIdentity) -> Result<IdentityRecord, StoreError> {
            panic!("create must not be attempted when the scope cannot be read")
        }
        async fn record_visit(
            &self,
            _: IdentityId,
            _: chrono::DateTime<Utc>,
        ) -> Result<IdentityRecord, StoreError> {
            self.fail().await
        }
        async fn delete_identity(&self, _: IdentityId) -> Result<(), StoreError> {
            self.fail().await
        }
        async fn annotate_identity(
            &self,
            _: IdentityId,
            _: Option<String>,
            _: Option<Classification>,
        ) -> Result<IdentityRecord, StoreError> {
            self.fail().await
        }
    }

    #[tokio::test]
    async fn test_first_sighting_then_return() {
        let gw = gateway(MemoryStore::new());

        let first = gw.identify(request(basis(0), 1)).await.unwrap();
        assert!(first.is_new());
        assert_eq!(first.identity().visit_count, 1);
        assert!(first.identity().label.starts_with("V-"));
        assert_eq!(first.identity().label.len(), 10);

        let second = gw.identify(request(basis(0), 1)).await.unwrap();
        match &second {
            MatchDecision::Returning { identity, similarity } => {
                assert_eq!(identity.id, first.identity().id);
                assert_eq!(identity.visit_count, 2);
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            other => panic!("expected returning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let gw = gateway(MemoryStore::new());
        let a = gw.identify(request(basis(0), 1)).await.unwrap();
        let b = gw.identify(request(basis(0), 2)).await.unwrap();
        assert!(a.is_new());
        assert!(b.is_new());
        assert_ne!(a.identity().id, b.identity().id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_sightings_create_once() {
        const N: usize = 8;
        let gw = gateway(SlowListStore::default());

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let gw = Arc::clone(&gw);
                tokio::spawn(async move { gw.identify(request(basis(3), 1)).await })
            })
            .collect();

        let mut decisions = Vec::new();
        for handle in handles {
            decisions.push(handle.await.unwrap().unwrap());
        }

        let new: Vec<_> = decisions.iter().filter(|d| d.is_new()).collect();
        assert_eq!(new.len(), 1);
        let id = new[0].identity().id;
        assert!(decisions.iter().all(|d| d.identity().id == id));
        assert_eq!(gw.store().creates.load(Ordering::SeqCst), 1);

        let stored = gw.list_for_scope(ScopeId(1)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].visit_count, N as u32);
    }

    #[tokio::test]
    async fn test_malformed_stored_vector_skipped() {
        let now = Utc::now();
        let broken = IdentityRecord {
            id: IdentityId(1),
            label: "V-broken".into(),
            scope: ScopeId(1),
            embedding: vec![1.0; 128],
            visit_count: 4,
            first_seen: now,
            last_seen: now,
            display_name: None,
            classification: None,
        };
        let good = IdentityRecord {
            id: IdentityId(2),
            label: "V-good".into(),
            embedding: basis(1),
            ..broken.clone()
        };
        let gw = gateway(MemoryStore::with_records([broken, good]));

        let listed = gw.list_for_scope(ScopeId(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "V-good");

        let decision = gw.identify(request(basis(1), 1)).await.unwrap();
        assert_eq!(decision.identity().id, IdentityId(2));
        assert!(!decision.is_new());
    }

    #[tokio::test]
    async fn test_malformed_incoming_vector_rejected() {
        let gw = gateway(MemoryStore::new());
        let err = gw.identify_values(vec![0.5; 10], ScopeId(1), None).await.unwrap_err();
        assert!(matches!(err, IdentifyError::MalformedVector(VectorError::WrongDimension { .. })));
        assert!(gw.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_not_new() {
        let gw = gateway(BrokenStore { hang: false });
        let err = gw.identify(request(basis(0), 1)).await.unwrap_err();
        assert!(matches!(err, IdentifyError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_hanging_store_times_out() {
        let gw = Arc::new(IdentityGateway::new(
            Arc::new(BrokenStore { hang: true }),
            &MatchConfig::default(),
            Duration::from_millis(20),
        ));
        let err = gw.identify(request(basis(0), 1)).await.unwrap_err();
        assert!(matches!(
            err,
            IdentifyError::Store(StoreError::Timeout(t)) if t == Duration::from_millis(20)
        ));
        assert_eq!(
            gw.delete_identity(IdentityId(1)).await.unwrap_err(),
            StoreError::Timeout(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn test_held_scope_lock_times_out() {
        let gw = Arc::new(IdentityGateway::new(
            Arc::new(MemoryStore::new()),
            &MatchConfig::default(),
            Duration::from_millis(20),
        ));
        let _held = gw.lock_scope(ScopeId(1)).await.unwrap();
        let err = gw.identify(request(basis(0), 1)).await.unwrap_err();
        assert!(matches!(err, IdentifyError::Store(StoreError::Timeout(_))));

        // Other scopes are unaffected.
        assert!(gw.identify(request(basis(0), 2)).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_deleted_identity_unrecognizable() {
        let gw = gateway(MemoryStore::new());
        let first = gw.identify(request(basis(0), 1)).await.unwrap();
        gw.delete_identity(first.identity().id).await.unwrap();

        let again = gw.identify(request(basis(0), 1)).await.unwrap();
        assert!(again.is_new());
        assert_ne!(again.identity().id, first.identity().id);
        assert_eq!(
            gw.delete_identity(first.identity().id).await.unwrap_err(),
            StoreError::NotFound(first.identity().id)
        );
    }

    #[tokio::test]
    async fn test_vector_fixed_at_creation() {
        let gw = gateway(MemoryStore::new());
        let mut near = basis(0);
        near[1] = 0.5;
        let first = gw.identify(request(basis(0), 1)).await.unwrap();
        let second = gw.identify(request(near, 1)).await.unwrap();
        assert!(!second.is_new());

        let stored = gw.list_for_scope(ScopeId(1)).await.unwrap();
        assert_eq!(stored[0].embedding, first.identity().embedding);
    }

    #[tokio::test]
    async fn test_create_and_visit_directly() {
        let gw = gateway(MemoryStore::new());
        let v = FeatureVector::new(basis(2), Provenance::Fused).unwrap();
        let created = gw.create_identity(ScopeId(5), v, Some(vec![1, 2, 3])).await.unwrap();
        assert_eq!(created.visit_count, 1);
        assert_eq!(gw.store().auxiliary_image(created.id).await, Some(vec![1, 2, 3]));

        let visited = gw.record_visit(created.id).await.unwrap();
        assert_eq!(visited.visit_count, 2);
        assert!(visited.last_seen >= created.last_seen);
    }

    #[tokio::test]
    async fn test_annotate_identity() {
        let gw = gateway(MemoryStore::new());
        let created = gw.identify(request(basis(0), 1)).await.unwrap();
        let annotated = gw
            .annotate_identity(created.identity().id, Some("Bea".into()), Some(Classification::Occasional))
            .await
            .unwrap();
        assert_eq!(annotated.display_name.as_deref(), Some("Bea"));
        assert_eq!(annotated.classification, Some(Classification::Occasional));
    }

    #[tokio::test]
    async fn test_zero_vector_never_matches() {
        let gw = gateway(MemoryStore::new());
        gw.identify(request(basis(0), 1)).await.unwrap();
        let zero = gw.identify(request(vec![0.0; EMBEDDING_DIM], 1)).await.unwrap();
        assert!(zero.is_new());
    }

    #[test]
    fn test_label_format() {
        let label = generate_label();
        assert_eq!(label.len(), 10);
        assert!(label[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
