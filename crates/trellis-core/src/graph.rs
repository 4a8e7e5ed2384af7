//! # Canonical Graph
//!
//! In-memory snapshot of the property graph: the canonical modality every
//! table and vector view is derived from.
//!
//! All collections are `BTreeMap`s keyed by [`InternalId`], so iteration order
//! (and therefore every derived table row order) is deterministic.

use crate::{Entity, InternalId, Relationship, TrellisError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A point-in-time view of entities and relationships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    entities: BTreeMap<InternalId, Entity>,
    relationships: BTreeMap<InternalId, Relationship>,
}

/// Which endpoint states a relationship may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPolicy {
    /// Both endpoints must exist; retired endpoints are fine.
    ///
    /// Stored graphs keep relationships of entities retired later, so
    /// reconstructed snapshots are only checked for existence.
    Exists,
    /// Both endpoints must exist and be live. Used for new writes.
    Live,
}

impl GraphSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity.
    pub fn upsert_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.internal_id, entity);
    }

    /// Insert or replace a relationship after checking its endpoints.
    pub fn insert_relationship(
        &mut self,
        relationship: Relationship,
        policy: EndpointPolicy,
    ) -> Result<(), TrellisError> {
        self.check_endpoints(&relationship, policy)?;
        self.relationships
            .insert(relationship.internal_id, relationship);
        Ok(())
    }

    /// Insert a relationship without endpoint checks.
    ///
    /// Used while loading, when relationships may arrive before entities;
    /// call [`GraphSnapshot::validate`] once loading is done.
    pub fn insert_relationship_unchecked(&mut self, relationship: Relationship) {
        self.relationships
            .insert(relationship.internal_id, relationship);
    }

    /// Check every relationship's endpoints against `policy`.
    pub fn validate(&self, policy: EndpointPolicy) -> Result<(), TrellisError> {
        for relationship in self.relationships.values() {
            self.check_endpoints(relationship, policy)?;
        }
        Ok(())
    }

    fn check_endpoints(
        &self,
        relationship: &Relationship,
        policy: EndpointPolicy,
    ) -> Result<(), TrellisError> {
        for (role, id) in [
            ("source", relationship.source_id),
            ("target", relationship.target_id),
        ] {
            match self.entities.get(&id) {
                None => {
                    return Err(TrellisError::Transform(format!(
                        "relationship {} has missing {role} entity {id}",
                        relationship.internal_id
                    )));
                }
                Some(entity) if entity.retired && policy == EndpointPolicy::Live => {
                    return Err(TrellisError::InvalidInput(format!(
                        "relationship {} points at retired {role} entity {id}",
                        relationship.internal_id
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn entity(&self, id: InternalId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    #[must_use]
    pub fn relationship(&self, id: InternalId) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    #[must_use]
    pub fn contains_entity(&self, id: InternalId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Relationships in id order.
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Structural equality: same ids, same content.
    ///
    /// Ids are content-derived, so two graphs built from the same logical
    /// records are isomorphic exactly when this holds. Attribute values are
    /// compared with [`crate::Value::same_content`].
    #[must_use]
    pub fn is_isomorphic_to(&self, other: &GraphSnapshot) -> bool {
        if self.entities.len() != other.entities.len()
            || self.relationships.len() != other.relationships.len()
        {
            return false;
        }
        let entities_match = self.entities.iter().all(|(id, a)| {
            other.entities.get(id).is_some_and(|b| {
                a.canonical_name == b.canonical_name
                    && a.entity_type == b.entity_type
                    && a.retired == b.retired
                    && a.confidence == b.confidence
                    && same_attributes(&a.attributes, &b.attributes)
            })
        });
        let relationships_match = self.relationships.iter().all(|(id, a)| {
            other.relationships.get(id).is_some_and(|b| {
                a.source_id == b.source_id
                    && a.target_id == b.target_id
                    && a.rel_type == b.rel_type
                    && a.confidence == b.confidence
                    && same_attributes(&a.attributes, &b.attributes)
            })
        });
        entities_match && relationships_match
    }
}

fn same_attributes(a: &crate::Attributes, b: &crate::Attributes) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| value.same_content(other)))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, TypeLabel, UncertaintyRecord, Value};

    fn entity(name: &str, ty: &str) -> Entity {
        Entity::new(
            name,
            TypeLabel::parse(ty).expect("label"),
            Attributes::new(),
            UncertaintyRecord::leaf(0.1, "test").expect("record"),
        )
    }

    fn employs(source: &Entity, target: &Entity) -> Relationship {
        Relationship::new(
            source.internal_id,
            target.internal_id,
            TypeLabel::parse("EMPLOYS").expect("label"),
            Attributes::new(),
            UncertaintyRecord::leaf(0.2, "test").expect("record"),
        )
    }

    #[test]
    fn relationship_requires_existing_endpoints() {
        let mut graph = GraphSnapshot::new();
        let acme = entity("Acme Corp", "ORG");
        let jane = entity("Jane Doe", "PERSON");
        graph.upsert_entity(acme.clone());

        let err = graph
            .insert_relationship(employs(&acme, &jane), EndpointPolicy::Exists)
            .expect_err("missing target");
        assert!(err.to_string().contains("missing target"));

        graph.upsert_entity(jane.clone());
        graph
            .insert_relationship(employs(&acme, &jane), EndpointPolicy::Exists)
            .expect("both endpoints exist");
        assert_eq!(graph.relationship_count(), 1);
    }

    #[test]
    fn live_policy_rejects_retired_endpoint() {
        let mut graph = GraphSnapshot::new();
        let acme = entity("Acme Corp", "ORG");
        let mut jane = entity("Jane Doe", "PERSON");
        jane.retired = true;
        graph.upsert_entity(acme.clone());
        graph.upsert_entity(jane.clone());

        assert!(
            graph
                .insert_relationship(employs(&acme, &jane), EndpointPolicy::Live)
                .is_err()
        );
        assert!(
            graph
                .insert_relationship(employs(&acme, &jane), EndpointPolicy::Exists)
                .is_ok()
        );
    }

    #[test]
    fn validate_catches_unchecked_dangling_edge() {
        let mut graph = GraphSnapshot::new();
        let acme = entity("Acme Corp", "ORG");
        let jane = entity("Jane Doe", "PERSON");
        graph.upsert_entity(acme.clone());
        graph.insert_relationship_unchecked(employs(&acme, &jane));
        assert!(graph.validate(EndpointPolicy::Exists).is_err());
    }

    #[test]
    fn isomorphism_ignores_numeric_representation() {
        let mut a = GraphSnapshot::new();
        let mut b = GraphSnapshot::new();
        let mut acme = entity("Acme Corp", "ORG");
        acme.attributes.insert("employees".to_string(), Value::Int(40));
        a.upsert_entity(acme.clone());
        acme.attributes
            .insert("employees".to_string(), Value::Float(40.0));
        b.upsert_entity(acme);
        assert!(a.is_isomorphic_to(&b));

        b.upsert_entity(entity("Jane Doe", "PERSON"));
        assert!(!a.is_isomorphic_to(&b));
    }

    #[test]
    fn iteration_order_is_by_id() {
        let mut graph = GraphSnapshot::new();
        for name in ["c", "a", "b"] {
            graph.upsert_entity(entity(name, "ORG"));
        }
        let ids: Vec<InternalId> = graph.entities().map(|e| e.internal_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
