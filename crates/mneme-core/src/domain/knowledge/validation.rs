//! Validators for knowledge records and raw payloads
//!
//! Validators report; they never clamp or rewrite values.

use serde_json::Value;

use super::entity::Entity;
use super::relation::Relation;
use super::temporal::Temporal;
use crate::error::{Error, Result};

fn in_unit_range(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// True iff the relation has a strength in `[0, 1]`
pub fn has_strength(relation: &Relation) -> bool {
    relation.strength.is_some_and(in_unit_range)
}

/// True iff the relation has a confidence in `[0, 1]`
pub fn has_confidence(relation: &Relation) -> bool {
    relation.confidence.is_some_and(in_unit_range)
}

pub fn has_valid_time_range<T: Temporal>(record: &T) -> bool {
    record.has_valid_time_range()
}

/// Structural validity: non-empty endpoints and type.
///
/// Out-of-range strength or confidence does not make a relation invalid
/// here; `has_strength`/`has_confidence` report those separately. Metadata
/// timestamps are informational and never checked.
pub fn is_relation(relation: &Relation) -> bool {
    !relation.from.is_empty() && !relation.to.is_empty() && !relation.relation_type.is_empty()
}

/// Reject entities that cannot be written.
pub fn validate_entity(entity: &Entity) -> Result<()> {
    if entity.name.trim().is_empty() {
        return Err(Error::Validation("entity name must not be empty".into()));
    }
    if entity.entity_type.trim().is_empty() {
        return Err(Error::Validation(format!(
            "entity '{}' must have an entityType",
            entity.name
        )));
    }
    if !entity.has_valid_time_range() {
        return Err(Error::Validation(format!(
            "entity '{}' has validFrom after validTo",
            entity.name
        )));
    }
    Ok(())
}

/// Reject relations that cannot be written, including out-of-range scores.
pub fn validate_relation(relation: &Relation) -> Result<()> {
    if !is_relation(relation) {
        return Err(Error::Validation(format!(
            "relation '{}' needs non-empty from, to and relationType",
            relation.key()
        )));
    }
    if relation.strength.is_some() && !has_strength(relation) {
        return Err(Error::Validation(format!(
            "relation '{}' has strength {:?} outside [0, 1]",
            relation.key(),
            relation.strength
        )));
    }
    if relation.confidence.is_some() && !has_confidence(relation) {
        return Err(Error::Validation(format!(
            "relation '{}' has confidence {:?} outside [0, 1]",
            relation.key(),
            relation.confidence
        )));
    }
    if !relation.has_valid_time_range() {
        return Err(Error::Validation(format!(
            "relation '{}' has validFrom after validTo",
            relation.key()
        )));
    }
    Ok(())
}

fn require_string<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a str> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(Error::Validation(format!("'{}' must not be empty", field))),
        Some(_) => Err(Error::Validation(format!("'{}' must be a string", field))),
        None => Err(Error::Validation(format!("'{}' is required", field))),
    }
}

fn optional_number(obj: &serde_json::Map<String, Value>, field: &str) -> Result<Option<f64>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(_) => Err(Error::Validation(format!("'{}' must be a number", field))),
    }
}

fn string_array(value: &Value, field: &str) -> Result<()> {
    match value {
        Value::Array(items) if items.iter().all(Value::is_string) => Ok(()),
        _ => Err(Error::Validation(format!(
            "'{}' must be an array of strings",
            field
        ))),
    }
}

fn check_time_range(obj: &serde_json::Map<String, Value>) -> Result<()> {
    let from = optional_number(obj, "validFrom")?;
    let to = optional_number(obj, "validTo")?;
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(Error::Validation("validFrom must not be after validTo".into()));
        }
    }
    Ok(())
}

/// Check a raw entity payload before deserializing it
pub fn validate_entity_payload(payload: &Value) -> Result<()> {
    let obj = payload
        .as_object()
        .ok_or_else(|| Error::Validation("entity must be an object".into()))?;
    require_string(obj, "name")?;
    require_string(obj, "entityType")?;
    match obj.get("observations") {
        Some(observations) => string_array(observations, "observations")?,
        None => return Err(Error::Validation("'observations' is required".into())),
    }
    check_time_range(obj)
}

/// Check a raw relation payload before deserializing it.
///
/// Only types are checked for strength and confidence; range checks belong
/// to `has_strength` and `has_confidence`.
pub fn validate_relation_payload(payload: &Value) -> Result<()> {
    let obj = payload
        .as_object()
        .ok_or_else(|| Error::Validation("relation must be an object".into()))?;
    require_string(obj, "from")?;
    require_string(obj, "to")?;
    require_string(obj, "relationType")?;
    optional_number(obj, "strength")?;
    optional_number(obj, "confidence")?;

    if let Some(metadata) = obj.get("metadata").filter(|m| !m.is_null()) {
        let meta = metadata
            .as_object()
            .ok_or_else(|| Error::Validation("'metadata' must be an object".into()))?;
        for field in ["createdAt", "updatedAt"] {
            if optional_number(meta, field)?.is_none() {
                return Err(Error::Validation(format!("metadata.{} is required", field)));
            }
        }
        optional_number(meta, "lastAccessed")?;
        if let Some(inferred) = meta.get("inferredFrom").filter(|v| !v.is_null()) {
            string_array(inferred, "metadata.inferredFrom")?;
        }
    }
    check_time_range(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::RelationMetadata;
    use serde_json::json;

    #[test]
    fn test_strength_out_of_range_is_reported_not_clamped() {
        let relation = Relation::new("a", "b", "knows").with_strength(1.5);

        assert!(!has_strength(&relation));
        assert!(is_relation(&relation));
        assert_eq!(relation.strength, Some(1.5));
        assert!(validate_relation(&relation).is_err());
    }

    #[test]
    fn test_metadata_timestamps_are_not_validated() {
        let relation = Relation::new("a", "b", "knows").with_metadata(RelationMetadata {
            created_at: 5,
            updated_at: 1,
            last_accessed: None,
            inferred_from: None,
        });

        assert!(is_relation(&relation));
        assert!(validate_relation(&relation).is_ok());
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(has_confidence(&Relation::new("a", "b", "r").with_confidence(0.0)));
        assert!(has_confidence(&Relation::new("a", "b", "r").with_confidence(1.0)));
        assert!(!has_confidence(&Relation::new("a", "b", "r").with_confidence(-0.1)));
        assert!(!has_confidence(&Relation::new("a", "b", "r")));
    }

    #[test]
    fn test_validate_entity() {
        assert!(validate_entity(&Entity::new("a", "t")).is_ok());
        assert!(validate_entity(&Entity::new("", "t")).is_err());
        assert!(validate_entity(&Entity::new("a", "")).is_err());
        assert!(validate_entity(&Entity::new("a", "t").with_validity(Some(2), Some(1))).is_err());
    }

    #[test]
    fn test_entity_payload() {
        assert!(validate_entity_payload(&json!({
            "name": "a", "entityType": "t", "observations": ["x"]
        }))
        .is_ok());
        assert!(validate_entity_payload(&json!({"name": "a", "entityType": "t"})).is_err());
        assert!(validate_entity_payload(&json!({
            "name": "a", "entityType": "t", "observations": [1]
        }))
        .is_err());
        assert!(validate_entity_payload(&json!({
            "name": "a", "entityType": "t", "observations": [], "validFrom": 5, "validTo": 1
        }))
        .is_err());
        assert!(validate_entity_payload(&json!("a")).is_err());
    }

    #[test]
    fn test_relation_payload() {
        assert!(validate_relation_payload(&json!({
            "from": "a", "to": "b", "relationType": "r", "strength": 2.0
        }))
        .is_ok());
        assert!(validate_relation_payload(&json!({
            "from": "a", "to": "b", "relationType": "r", "strength": "high"
        }))
        .is_err());
        assert!(validate_relation_payload(&json!({"from": "a", "to": "b"})).is_err());
        assert!(validate_relation_payload(&json!({
            "from": "a", "to": "b", "relationType": "r",
            "metadata": {"createdAt": 1}
        }))
        .is_err());
        assert!(validate_relation_payload(&json!({
            "from": "a", "to": "b", "relationType": "r",
            "metadata": {"createdAt": 1, "updatedAt": 2, "inferredFrom": ["x"]}
        }))
        .is_ok());
    }
}
