//! Entity catalogue for the administration API.
//!
//! Every administered resource is named by an [`Entity`]. The entity decides
//! the REST path, the query-key scope, and which parent identifier scopes its
//! list views.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Venue,
    Contract,
    Goal,
    Expense,
    Owner,
    Permission,
}

impl Entity {
    pub const ALL: [Entity; 6] = [
        Entity::Venue,
        Entity::Contract,
        Entity::Goal,
        Entity::Expense,
        Entity::Owner,
        Entity::Permission,
    ];

    /// REST collection path, also used as the scope of every query key.
    pub const fn path(&self) -> &'static str {
        match self {
            Entity::Venue => "venues",
            Entity::Contract => "contracts",
            Entity::Goal => "goals",
            Entity::Expense => "expenses",
            Entity::Owner => "owners",
            Entity::Permission => "permissions",
        }
    }

    /// Payload/query field holding the parent id that scopes list views.
    pub const fn parent_field(&self) -> Option<&'static str> {
        match self {
            Entity::Venue | Entity::Owner => Some("organizationId"),
            Entity::Contract | Entity::Goal | Entity::Expense => Some("venueId"),
            Entity::Permission => Some("ownerId"),
        }
    }

    /// Parse a user-supplied entity name. Accepts singular or plural forms.
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|e| e.path() == lower || e.path().trim_end_matches('s') == lower)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Venue => "venue",
            Entity::Contract => "contract",
            Entity::Goal => "goal",
            Entity::Expense => "expense",
            Entity::Owner => "owner",
            Entity::Permission => "permission",
        };
        f.write_str(name)
    }
}

/// Parameters for a list request.
///
/// `parent_id` is sent under the entity's [`Entity::parent_field`]; an empty
/// `search` means "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub parent_id: Option<String>,
    pub search: String,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoped(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            search: String::new(),
        }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }
}
