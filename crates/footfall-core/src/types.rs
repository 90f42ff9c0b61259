use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Dimensionality of every feature vector (ArcFace-style 512-d embeddings).
pub const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("expected {expected}-dim feature vector, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("feature vector contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Where a feature vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Returned by the extractor for a single frame.
    PerFrame,
    /// Damped weighted mean of several per-frame vectors.
    Fused,
    /// Loaded from the identity store.
    Stored,
    /// Received over the identify boundary.
    Incoming,
}

/// Unit-norm face feature vector.
///
/// The only constructor normalizes, so every value of this type has
/// Euclidean norm 1 (or is the zero vector, whose similarity to anything is 0).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    values: Vec<f32>,
    provenance: Provenance,
}

impl FeatureVector {
    /// Validate dimensionality and finiteness, then L2-normalize.
    pub fn new(values: Vec<f32>, provenance: Provenance) -> Result<Self, VectorError> {
        if values.len() != EMBEDDING_DIM {
            return Err(VectorError::WrongDimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::NonFinite(idx));
        }

        let norm = l2_norm(&values);
        let values = if norm > 0.0 {
            values.into_iter().map(|v| v / norm).collect()
        } else {
            values
        };

        Ok(Self { values, provenance })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Both sides are unit-norm by construction, so this is a plain dot
    /// product; a zero vector yields 0.
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Partition (a physical site) within which identities are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub i64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator-assigned classification. `None` on an identity means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Regular,
    Occasional,
    Undecided,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Regular => "regular",
            Classification::Occasional => "occasional",
            Classification::Undecided => "undecided",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regular" => Some(Classification::Regular),
            "occasional" => Some(Classification::Occasional),
            "undecided" => Some(Classification::Undecided),
            _ => None,
        }
    }
}

/// A durable visitor record.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: IdentityId,
    pub label: String,
    pub scope: ScopeId,
    #[serde(skip)]
    pub embedding: FeatureVector,
    pub visit_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub display_name: Option<String>,
    pub classification: Option<Classification>,
}

/// Identity as persisted by a store backend, before the embedding is validated.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub label: String,
    pub scope: ScopeId,
    pub embedding: Vec<f32>,
    pub visit_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub display_name: Option<String>,
    pub classification: Option<Classification>,
}

impl TryFrom<IdentityRecord> for Identity {
    type Error = VectorError;

    fn try_from(record: IdentityRecord) -> Result<Self, Self::Error> {
        let embedding = FeatureVector::new(record.embedding, Provenance::Stored)?;
        Ok(Identity {
            id: record.id,
            label: record.label,
            scope: record.scope,
            embedding,
            visit_count: record.visit_count,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            display_name: record.display_name,
            classification: record.classification,
        })
    }
}

/// Result of resolving one fused vector against a scope.
#[derive(Debug, Clone)]
pub enum MatchDecision {
    New { identity: Identity },
    Returning { identity: Identity, similarity: f32 },
}

impl MatchDecision {
    pub fn identity(&self) -> &Identity {
        match self {
            MatchDecision::New { identity } | MatchDecision::Returning { identity, .. } => identity,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, MatchDecision::New { .. })
    }
}

/// Identify call from a capture device to the decision service.
#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub vector: FeatureVector,
    pub scope: ScopeId,
    /// Opaque; forwarded to persistence, never inspected.
    pub auxiliary_image: Option<Vec<u8>>,
}

impl IdentifyRequest {
    /// Build a request from raw wire values; malformed vectors are rejected here.
    pub fn new(
        values: Vec<f32>,
        scope: ScopeId,
        auxiliary_image: Option<Vec<u8>>,
    ) -> Result<Self, VectorError> {
        Ok(Self {
            vector: FeatureVector::new(values, Provenance::Incoming)?,
            scope,
            auxiliary_image,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    New,
    Returning,
}

/// Wire form of a [`MatchDecision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResponse {
    pub decision: DecisionKind,
    pub identity_id: i64,
    pub label: String,
    pub visit_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl From<&MatchDecision> for IdentifyResponse {
    fn from(decision: &MatchDecision) -> Self {
        let identity = decision.identity();
        let (kind, similarity) = match decision {
            MatchDecision::New { .. } => (DecisionKind::New, None),
            MatchDecision::Returning { similarity, .. } => (DecisionKind::Returning, Some(*similarity)),
        };
        IdentifyResponse {
            decision: kind,
            identity_id: identity.id.0,
            label: identity.label.clone(),
            visit_count: identity.visit_count,
            similarity,
        }
    }
}
