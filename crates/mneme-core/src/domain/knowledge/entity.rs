//! Knowledge entities
//!
//! An entity is a named node of the graph. Its name is unique among the
//! current versions stored by a backend; older versions are kept only by
//! backends with history support.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::temporal::{Temporal, now_millis};

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn initial_version() -> u64 {
    1
}

/// A named node with free-form observations.
///
/// Serialized in camelCase so persisted documents and tool payloads share
/// one shape. Temporal fields are optional on input and filled in by the
/// storage layer on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<EntityEmbedding>,
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

impl Entity {
    /// Create a new entity with no observations
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            observations: Vec::new(),
            embedding: None,
            id: new_id(),
            created_at: now,
            updated_at: now,
            version: 1,
            valid_from: None,
            valid_to: None,
            changed_by: None,
        }
    }

    pub fn with_observations<I, S>(mut self, observations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observations = observations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observations.push(observation.into());
        self
    }

    pub fn with_validity(mut self, valid_from: Option<i64>, valid_to: Option<i64>) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    pub fn with_changed_by(mut self, changed_by: impl Into<String>) -> Self {
        self.changed_by = Some(changed_by.into());
        self
    }

    /// Append observations not already present, returning the ones added.
    pub fn merge_observations<'a, I>(&mut self, contents: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut added = Vec::new();
        for content in contents {
            if !self.observations.contains(content) {
                self.observations.push(content.clone());
                added.push(content.clone());
            }
        }
        added
    }

    /// Drop the listed observations, returning true if anything changed.
    pub fn remove_observations(&mut self, observations: &[String]) -> bool {
        let before = self.observations.len();
        self.observations.retain(|o| !observations.contains(o));
        self.observations.len() != before
    }

    /// Mark this record as the next version written at `now`.
    pub fn bump_version(&mut self, now: i64) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Case-insensitive substring match on name, type or any observation
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.name.to_lowercase().contains(&query)
            || self.entity_type.to_lowercase().contains(&query)
            || self
                .observations
                .iter()
                .any(|o| o.to_lowercase().contains(&query))
    }

    /// Text fed to the embedding model for this entity
    pub fn embedding_text(&self) -> String {
        let mut text = format!("Name: {}\nType: {}\nObservations:", self.name, self.entity_type);
        for observation in &self.observations {
            text.push_str("\n- ");
            text.push_str(observation);
        }
        text
    }

    /// Copy without the embedding payload
    pub fn without_embedding(mut self) -> Self {
        self.embedding = None;
        self
    }
}

impl Temporal for Entity {
    fn valid_from(&self) -> Option<i64> {
        self.valid_from
    }

    fn valid_to(&self) -> Option<i64> {
        self.valid_to
    }
}

/// A stored embedding for an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityEmbedding {
    pub vector: Vec<f32>,
    pub model: String,
    pub last_updated: i64,
}

impl EntityEmbedding {
    pub fn new(vector: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            vector,
            model: model.into(),
            last_updated: now_millis(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}
