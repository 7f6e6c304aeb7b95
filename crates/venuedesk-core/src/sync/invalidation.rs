//! Which cached views a write can affect.
//!
//! List and detail views are cached under independent keys, so every write
//! has to reach both. The mapping lives in one table, [`STANDARD_RULES`], with
//! one row per entity.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::Entity;

use super::key::{KeyPart, QueryKey};

/// Payload field holding an entity's own id.
const ID_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A related entity whose detail view embeds the written one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelatedDetail {
    pub entity: Entity,
    /// Payload field carrying the related entity's id.
    pub via: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRule {
    pub entity: Entity,
    /// Payload field scoping the entity's list views.
    pub list_scope: Option<&'static str>,
    pub related: &'static [RelatedDetail],
}

pub const STANDARD_RULES: &[EntityRule] = &[
    EntityRule {
        entity: Entity::Venue,
        list_scope: Entity::Venue.parent_field(),
        related: &[RelatedDetail { entity: Entity::Owner, via: "ownerId" }],
    },
    EntityRule {
        entity: Entity::Contract,
        list_scope: Entity::Contract.parent_field(),
        related: &[RelatedDetail { entity: Entity::Venue, via: "venueId" }],
    },
    EntityRule {
        entity: Entity::Goal,
        list_scope: Entity::Goal.parent_field(),
        related: &[RelatedDetail { entity: Entity::Venue, via: "venueId" }],
    },
    EntityRule {
        entity: Entity::Expense,
        list_scope: Entity::Expense.parent_field(),
        related: &[RelatedDetail { entity: Entity::Venue, via: "venueId" }],
    },
    EntityRule {
        entity: Entity::Owner,
        list_scope: Entity::Owner.parent_field(),
        related: &[],
    },
    EntityRule {
        entity: Entity::Permission,
        list_scope: Entity::Permission.parent_field(),
        related: &[RelatedDetail { entity: Entity::Owner, via: "ownerId" }],
    },
];

/// Resolves the key patterns a write must invalidate.
#[derive(Debug, Clone)]
pub struct InvalidationRules {
    rules: Vec<EntityRule>,
}

impl Default for InvalidationRules {
    fn default() -> Self {
        Self::new(STANDARD_RULES.to_vec())
    }
}

impl InvalidationRules {
    pub fn new(rules: Vec<EntityRule>) -> Self {
        Self { rules }
    }

    pub fn rule_for(&self, entity: Entity) -> Option<&EntityRule> {
        self.rules.iter().find(|rule| rule.entity == entity)
    }

    /// Key patterns (prefixes) covering every view a write on `entity` can
    /// change.
    ///
    /// Lists are narrowed to the parent id when the payload carries it and
    /// cover all lists of the entity otherwise. An entity without a rule
    /// still gets all of its lists and its own detail view.
    pub fn resolve(&self, entity: Entity, operation: Operation, payload: &Value) -> Vec<QueryKey> {
        let rule = self.rule_for(entity);
        let mut keys = Vec::new();

        let parent = rule
            .and_then(|r| r.list_scope)
            .and_then(|field| id_field(payload, field));
        keys.push(match parent {
            Some(parent_id) => QueryKey::lists_under(entity, parent_id),
            None => QueryKey::lists(entity),
        });

        if let Some(id) = id_field(payload, ID_FIELD) {
            keys.push(QueryKey::detail(entity, id));
        }

        for related in rule.map(|r| r.related).unwrap_or_default() {
            if let Some(id) = id_field(payload, related.via) {
                keys.push(QueryKey::detail(related.entity, id));
            }
        }

        debug!(
            entity = %entity,
            operation = %operation,
            keys = keys.len(),
            "Resolved invalidation keys"
        );
        keys
    }
}

fn id_field(payload: &Value, field: &str) -> Option<KeyPart> {
    payload.get(field).and_then(KeyPart::id_from_value)
}
