use crate::store::SqliteStore;
use footfall_core::{
    Classification, IdentifyError, IdentifyResponse, IdentityGateway, IdentityId, ScopeId,
    StoreError,
};
use std::sync::Arc;
use std::time::Instant;
use zbus::interface;

/// D-Bus interface for the Footfall identity daemon.
///
/// Bus name: org.footfall.Footfall1
/// Object path: /org/footfall/Footfall1
pub struct FootfallService {
    gateway: Arc<IdentityGateway<SqliteStore>>,
    store_kind: &'static str,
    started: Instant,
}

impl FootfallService {
    pub fn new(gateway: Arc<IdentityGateway<SqliteStore>>, store_kind: &'static str) -> Self {
        Self {
            gateway,
            store_kind,
            started: Instant::now(),
        }
    }
}

#[interface(name = "org.footfall.Footfall1")]
impl FootfallService {
    /// Resolve a feature vector within a scope. Returns the decision as JSON.
    /// An empty `auxiliary_image` means none.
    async fn identify(
        &self,
        vector: Vec<f64>,
        scope: i64,
        auxiliary_image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::debug!(scope, dims = vector.len(), "identify requested");
        let values = vector.into_iter().map(|v| v as f32).collect();
        let image = (!auxiliary_image.is_empty()).then_some(auxiliary_image);

        let decision = self
            .gateway
            .identify_values(values, ScopeId(scope), image)
            .await
            .map_err(to_fdo)?;
        to_json(&IdentifyResponse::from(&decision))
    }

    /// List identities in a scope as JSON. Vectors are not included.
    async fn list_identities(&self, scope: i64) -> zbus::fdo::Result<String> {
        tracing::info!(scope, "list_identities requested");
        let identities = self
            .gateway
            .list_for_scope(ScopeId(scope))
            .await
            .map_err(|e| to_fdo(e.into()))?;
        to_json(&identities)
    }

    /// Remove an identity. Returns false if it did not exist.
    async fn remove_identity(&self, id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        match self.gateway.delete_identity(IdentityId(id)).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(to_fdo(e.into())),
        }
    }

    /// Set or clear the display name and classification. Empty strings clear.
    async fn annotate_identity(
        &self,
        id: i64,
        display_name: &str,
        classification: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, classification, "annotate_identity requested");
        let classification = match classification {
            "" => None,
            value => Some(Classification::parse(value).ok_or_else(|| {
                zbus::fdo::Error::InvalidArgs(format!("unknown classification '{value}'"))
            })?),
        };
        let display_name = (!display_name.is_empty()).then(|| display_name.to_string());

        let identity = self
            .gateway
            .annotate_identity(IdentityId(id), display_name, classification)
            .await
            .map_err(to_fdo)?;
        to_json(&identity)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let identities = self.gateway.store().count().await.ok();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "store": self.store_kind,
            "identities": identities,
            "similarity_threshold": self.gateway.similarity_threshold(),
            "store_timeout_secs": self.gateway.store_timeout().as_secs(),
            "uptime_secs": self.started.elapsed().as_secs(),
        })
        .to_string())
    }
}

fn to_fdo(err: IdentifyError) -> zbus::fdo::Error {
    match err {
        IdentifyError::MalformedVector(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        IdentifyError::Store(StoreError::NotFound(id)) => {
            zbus::fdo::Error::UnknownObject(format!("identity {id} not found"))
        }
        IdentifyError::Store(e) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}
