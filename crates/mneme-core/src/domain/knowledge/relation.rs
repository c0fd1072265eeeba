//! Directed, typed relations between entities

use serde::{Deserialize, Serialize};

use super::entity::{initial_version, new_id};
use super::temporal::{Temporal, now_millis};

/// Cost of traversing an edge without a usable strength
pub const DEFAULT_EDGE_COST: f64 = 1.0;

/// A directed edge `from -[relation_type]-> to`.
///
/// `(from, to, relation_type)` identifies the relation among current
/// versions. Strength and confidence are expected in `[0, 1]`; values
/// outside that range are kept as given and reported by the validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RelationMetadata>,
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default = "initial_version")]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
}

impl Relation {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
            strength: None,
            confidence: None,
            metadata: None,
            id: new_id(),
            created_at: now,
            updated_at: now,
            version: 1,
            valid_from: None,
            valid_to: None,
            changed_by: None,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_metadata(mut self, metadata: RelationMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_validity(mut self, valid_from: Option<i64>, valid_to: Option<i64>) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    pub fn key(&self) -> RelationKey {
        RelationKey::new(&self.from, &self.to, &self.relation_type)
    }

    pub fn matches_key(&self, key: &RelationKey) -> bool {
        self.from == key.from && self.to == key.to && self.relation_type == key.relation_type
    }

    pub fn touches(&self, name: &str) -> bool {
        self.from == name || self.to == name
    }

    /// Traversal cost for weighted path finding: `1 / strength`.
    pub fn edge_cost(&self) -> f64 {
        edge_cost(self.strength)
    }
}

pub(crate) fn edge_cost(strength: Option<f64>) -> f64 {
    match strength {
        Some(s) if s.is_finite() && s > 0.0 => 1.0 / s,
        _ => DEFAULT_EDGE_COST,
    }
}

impl Temporal for Relation {
    fn valid_from(&self) -> Option<i64> {
        self.valid_from
    }

    fn valid_to(&self) -> Option<i64> {
        self.valid_to
    }
}

/// Bookkeeping attached to a relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationMetadata {
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_from: Option<Vec<String>>,
}

impl RelationMetadata {
    pub fn now() -> Self {
        let now = now_millis();
        Self {
            created_at: now,
            updated_at: now,
            last_accessed: None,
            inferred_from: None,
        }
    }

    pub fn inferred_from(mut self, sources: Vec<String>) -> Self {
        self.inferred_from = Some(sources);
        self
    }
}

/// Identity of a current relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationKey {
    pub from: String,
    pub to: String,
    pub relation_type: String,
}

impl RelationKey {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
        }
    }
}

impl std::fmt::Display for RelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.from, self.relation_type, self.to)
    }
}
