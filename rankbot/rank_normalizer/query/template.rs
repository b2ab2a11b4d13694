use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::executor::QueryError;

const OFFSET_PLACEHOLDER: &str = "{offset}";
const LIMIT_PLACEHOLDER: &str = "{limit}";

/// Item/property pairs whose statement group has a preferred statement but no
/// normal one. The `bd:slice` service bounds the scan of preferred statements.
pub const PREFERRED_WITHOUT_NORMAL: &str = r"SELECT DISTINCT ?item ?prop WHERE {
  SERVICE bd:slice {
    ?statement_node wikibase:rank wikibase:PreferredRank .
    bd:serviceParam bd:slice.offset {offset} .
    bd:serviceParam bd:slice.limit {limit} .
  }
  ?item ?prop ?statement_node .
  FILTER NOT EXISTS { ?item ?prop [ wikibase:rank wikibase:NormalRank ] }
}";

/// One RDF term in a SPARQL JSON result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingTerm {
    /// `uri`, `literal` or `bnode`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Lexical value.
    #[serde(default)]
    pub value: String,
}

impl BindingTerm {
    /// Builds a `uri` term.
    #[must_use]
    pub fn uri(value: impl Into<String>) -> Self {
        Self {
            kind: "uri".into(),
            value: value.into(),
        }
    }
}

/// One solution: variable name to term.
pub type Binding = BTreeMap<String, BindingTerm>;

/// Query text with `{offset}` and `{limit}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    text: String,
}

impl QueryTemplate {
    /// Wraps `text`, which must contain both placeholders.
    pub fn new(text: impl Into<String>) -> Result<Self, QueryError> {
        let text = text.into();
        for placeholder in [OFFSET_PLACEHOLDER, LIMIT_PLACEHOLDER] {
            if !text.contains(placeholder) {
                return Err(QueryError::Template(placeholder));
            }
        }
        Ok(Self { text })
    }

    /// The stock preferred-without-normal query.
    #[must_use]
    pub fn preferred_without_normal() -> Self {
        Self {
            text: PREFERRED_WITHOUT_NORMAL.to_string(),
        }
    }

    /// Substitutes one slice window into the template.
    #[must_use]
    pub fn render(&self, offset: u64, limit: u64) -> String {
        self.text
            .replace(OFFSET_PLACEHOLDER, &offset.to_string())
            .replace(LIMIT_PLACEHOLDER, &limit.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_slice_window() {
        let query = QueryTemplate::preferred_without_normal().render(200_000, 100_000);
        assert!(query.contains("bd:slice.offset 200000 ."));
        assert!(query.contains("bd:slice.limit 100000 ."));
        assert!(!query.contains("{offset}"));
        assert!(query.contains("FILTER NOT EXISTS { ?item ?prop"));
    }

    #[test]
    fn rejects_template_without_limit() {
        let err = QueryTemplate::new("SELECT * WHERE { } OFFSET {offset}").unwrap_err();
        assert!(matches!(err, QueryError::Template("{limit}")));
    }

    #[test]
    fn binding_ignores_extra_term_fields() {
        let term: BindingTerm = serde_json::from_str(
            r#"{"type":"literal","value":"x","xml:lang":"en"}"#,
        )
        .unwrap();
        assert_eq!(term.kind, "literal");
        assert_eq!(term.value, "x");
    }
}
