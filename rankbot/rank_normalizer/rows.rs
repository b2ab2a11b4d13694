use serde::Serialize;

use crate::{config::IdentifierSettings, query::Binding};

/// Bare identifiers extracted from one result binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    /// Entity id, e.g. `Q42`.
    pub entity: String,
    /// Property id, e.g. `P31`.
    pub property: String,
}

impl ResultRow {
    /// Reads `?item` and `?prop` from `binding`, stripping the IRI prefixes.
    /// Returns `None` when either identifier ends up empty.
    #[must_use]
    pub fn from_binding(binding: &Binding, prefixes: &IdentifierSettings) -> Option<Self> {
        let entity = strip(binding, "item", &prefixes.entity_prefix);
        let property = strip(binding, "prop", &prefixes.property_prefix);
        if entity.is_empty() || property.is_empty() {
            return None;
        }
        Some(Self {
            entity: entity.to_string(),
            property: property.to_string(),
        })
    }
}

fn strip<'a>(binding: &'a Binding, variable: &str, prefix: &str) -> &'a str {
    binding.get(variable).map_or("", |term| {
        let value = term.value.trim();
        value.strip_prefix(prefix).unwrap_or(value)
    })
}
