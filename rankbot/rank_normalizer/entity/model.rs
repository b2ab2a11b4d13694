use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Statement rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    /// Best value among alternatives.
    Preferred,
    /// Default rank.
    Normal,
    /// Discouraged value.
    Deprecated,
}

impl Rank {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preferred => "preferred",
            Self::Normal => "normal",
            Self::Deprecated => "deprecated",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "preferred" => Some(Self::Preferred),
            "normal" => Some(Self::Normal),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

/// Why a statement could not be read as a claim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Statement is not a JSON object.
    #[error("statement is not a JSON object")]
    NotAnObject,
    /// Statement has no `rank`.
    #[error("statement has no rank")]
    MissingRank,
    /// Statement rank is not one of the three known values.
    #[error("unknown rank '{0}'")]
    UnknownRank(String),
}

/// One statement: its parsed rank plus the full JSON it came from.
///
/// The JSON is kept verbatim so that a resubmitted statement differs from the
/// stored one only in the fields deliberately changed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Claim {
    rank: Rank,
    json: Value,
}

impl Claim {
    /// Parses a statement object.
    pub fn from_json(json: Value) -> Result<Self, ClaimError> {
        let raw_rank = json
            .as_object()
            .ok_or(ClaimError::NotAnObject)?
            .get("rank")
            .and_then(Value::as_str)
            .ok_or(ClaimError::MissingRank)?;
        let rank =
            Rank::parse(raw_rank).ok_or_else(|| ClaimError::UnknownRank(raw_rank.into()))?;
        Ok(Self { rank, json })
    }

    /// Statement rank.
    #[must_use]
    pub const fn rank(&self) -> Rank {
        self.rank
    }

    /// Statement GUID, when the repository assigned one.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.json.get("id").and_then(Value::as_str)
    }

    /// Statement JSON as read.
    #[must_use]
    pub const fn as_json(&self) -> &Value {
        &self.json
    }

    /// Copy of the claim with a different rank.
    #[must_use]
    pub fn with_rank(&self, rank: Rank) -> Self {
        let mut json = self.json.clone();
        if let Value::Object(fields) = &mut json {
            fields.insert("rank".into(), Value::String(rank.as_str().into()));
        }
        Self { rank, json }
    }

    /// Statement JSON with the rank set to normal, ready for submission.
    #[must_use]
    pub fn demoted(&self) -> Value {
        self.with_rank(Rank::Normal).json
    }
}

impl TryFrom<Value> for Claim {
    type Error = ClaimError;

    fn try_from(json: Value) -> Result<Self, Self::Error> {
        Self::from_json(json)
    }
}

impl Serialize for Claim {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.json.serialize(serializer)
    }
}

/// Repository view of one entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityItem {
    /// Identifier that was requested.
    pub id: String,
    /// Whether the entity exists.
    pub exists: bool,
    /// Whether the identifier is a redirect.
    pub redirect: bool,
    /// Redirect target, when known.
    pub redirect_target: Option<String>,
    /// Latest revision id, used as the base of conditional writes.
    pub last_revision: Option<u64>,
    /// Claims per property, in repository order.
    pub claims: IndexMap<String, Vec<Claim>>,
}

impl EntityItem {
    /// Existing, non-redirect entity with no claims.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exists: true,
            ..Self::default()
        }
    }

    /// Entity that does not exist.
    #[must_use]
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Entity whose identifier redirects elsewhere.
    #[must_use]
    pub fn redirected(id: impl Into<String>, target: Option<String>) -> Self {
        Self {
            id: id.into(),
            exists: true,
            redirect: true,
            redirect_target: target,
            ..Self::default()
        }
    }

    /// Sets the latest revision.
    #[must_use]
    pub const fn with_revision(mut self, revision: u64) -> Self {
        self.last_revision = Some(revision);
        self
    }

    /// Appends a claim under `property`.
    #[must_use]
    pub fn with_claim(mut self, property: impl Into<String>, claim: Claim) -> Self {
        self.claims.entry(property.into()).or_default().push(claim);
        self
    }

    /// Claims under `property`; empty when there are none.
    #[must_use]
    pub fn claims_for(&self, property: &str) -> &[Claim] {
        self.claims
            .get(property)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Replaces the stored claim carrying the same statement id as `claim`.
    /// Returns whether a claim was replaced.
    pub fn replace_claim(&mut self, claim: Claim) -> bool {
        let Some(id) = claim.id().map(str::to_owned) else {
            return false;
        };
        for claims in self.claims.values_mut() {
            if let Some(slot) = claims.iter_mut().find(|c| c.id() == Some(id.as_str())) {
                *slot = claim;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn statement(id: &str, rank: &str) -> Value {
        json!({
            "id": id,
            "type": "statement",
            "rank": rank,
            "mainsnak": { "snaktype": "value", "property": "P31",
                          "datavalue": { "value": { "id": "Q5" }, "type": "wikibase-entityid" } },
            "references": [ { "hash": "abc" } ]
        })
    }

    #[test]
    fn parses_rank_and_keeps_json() {
        let claim = Claim::from_json(statement("Q1$a", "preferred")).unwrap();
        assert_eq!(claim.rank(), Rank::Preferred);
        assert_eq!(claim.id(), Some("Q1$a"));
        assert_eq!(claim.as_json()["references"][0]["hash"], "abc");
    }

    #[test]
    fn rejects_unknown_or_missing_rank() {
        assert_eq!(
            Claim::from_json(statement("Q1$a", "best")).unwrap_err(),
            ClaimError::UnknownRank("best".into())
        );
        assert_eq!(
            Claim::from_json(json!({ "id": "Q1$a" })).unwrap_err(),
            ClaimError::MissingRank
        );
        assert!(serde_json::from_value::<Claim>(json!([])).is_err());
    }

    #[test]
    fn demotion_only_touches_rank() {
        let claim = Claim::from_json(statement("Q1$a", "preferred")).unwrap();
        let mut expected = statement("Q1$a", "normal");
        let demoted = claim.demoted();
        assert_eq!(demoted, expected);
        expected["rank"] = json!("preferred");
        assert_eq!(claim.as_json(), &expected);
    }

    #[test]
    fn replaces_claim_by_statement_id() {
        let preferred = Claim::from_json(statement("Q1$a", "preferred")).unwrap();
        let mut item = EntityItem::new("Q1").with_claim("P31", preferred.clone());
        assert!(item.replace_claim(preferred.with_rank(Rank::Normal)));
        assert_eq!(item.claims_for("P31")[0].rank(), Rank::Normal);
        assert!(item.claims_for("P279").is_empty());
    }
}
