use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    config::EditSettings,
    entity::{Claim, EntityEdit, EntityRepository, Rank, RepositoryError},
    telemetry::BotTelemetry,
};

/// Why a pair was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Identifier is not an item (property, lexeme, or malformed).
    NotAnItem,
    /// Entity does not exist.
    Missing,
    /// Entity is a redirect.
    Redirect,
    /// A normal-rank claim exists, so the preferred rank is deliberate.
    NormalRankPresent,
    /// No preferred claim under the property.
    NothingPreferred,
}

impl SkipReason {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAnItem => "not_an_item",
            Self::Missing => "missing",
            Self::Redirect => "redirect",
            Self::NormalRankPresent => "normal_rank_present",
            Self::NothingPreferred => "nothing_preferred",
        }
    }
}

/// Result of one normalization call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// One edit was submitted.
    Edited {
        /// Claims demoted by the edit.
        demoted: usize,
        /// Revision created.
        revision: Option<u64>,
    },
    /// Dry run: an edit would have been submitted.
    WouldEdit {
        /// Claims that would be demoted.
        demoted: usize,
    },
    /// Nothing to do.
    Skipped(SkipReason),
}

/// Whether `id` names an item: `Q` followed by one or more digits.
#[must_use]
pub fn is_item_id(id: &str) -> bool {
    id.strip_prefix('Q')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Decides the demotions for the claims of one property.
///
/// Any normal claim means the preferred ones are intentional. Otherwise every
/// preferred claim is demoted; deprecated claims are never touched.
pub fn plan_demotions(claims: &[Claim]) -> Result<Vec<Value>, SkipReason> {
    if claims.iter().any(|claim| claim.rank() == Rank::Normal) {
        return Err(SkipReason::NormalRankPresent);
    }
    let demoted: Vec<Value> = claims
        .iter()
        .filter(|claim| claim.rank() == Rank::Preferred)
        .map(Claim::demoted)
        .collect();
    if demoted.is_empty() {
        return Err(SkipReason::NothingPreferred);
    }
    Ok(demoted)
}

/// Applies the rank rule to one (entity, property) pair at a time.
#[derive(Clone)]
pub struct RankNormalizer {
    repository: Arc<dyn EntityRepository>,
    summary: String,
    dry_run: bool,
    telemetry: Option<BotTelemetry>,
}

impl fmt::Debug for RankNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankNormalizer")
            .field("summary", &self.summary)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl RankNormalizer {
    /// Creates a normalizer editing through `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn EntityRepository>, settings: &EditSettings) -> Self {
        Self {
            repository,
            summary: settings.full_summary(),
            dry_run: settings.dry_run,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: BotTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Summary attached to edits.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Normalizes `property` on `entity_id`, submitting at most one edit.
    ///
    /// Entity state is read fresh on every call. Skips are outcomes, not
    /// errors; repository failures (edit submission included) propagate.
    pub async fn normalize(
        &self,
        entity_id: &str,
        property_id: &str,
    ) -> Result<NormalizeOutcome, RepositoryError> {
        if !is_item_id(entity_id) {
            return Ok(self.skip(entity_id, property_id, SkipReason::NotAnItem));
        }
        let item = self.repository.load(entity_id).await?;
        if !item.exists {
            return Ok(self.skip(entity_id, property_id, SkipReason::Missing));
        }
        if item.redirect {
            self.log(
                LogLevel::Debug,
                "normalize.redirect",
                json!({ "entity": entity_id, "target": item.redirect_target }),
            );
            return Ok(self.skip(entity_id, property_id, SkipReason::Redirect));
        }
        let demoted = match plan_demotions(item.claims_for(property_id)) {
            Ok(demoted) => demoted,
            Err(reason) => return Ok(self.skip(entity_id, property_id, reason)),
        };
        let count = demoted.len();
        if self.dry_run {
            self.log(
                LogLevel::Info,
                "normalize.dry_run",
                json!({ "entity": entity_id, "property": property_id, "demoted": count }),
            );
            return Ok(NormalizeOutcome::WouldEdit { demoted: count });
        }
        let edit = EntityEdit {
            entity_id: entity_id.to_string(),
            base_revision: item.last_revision,
            claims: demoted,
            summary: self.summary.clone(),
        };
        let receipt = self.repository.submit(&edit).await?;
        self.log(
            LogLevel::Info,
            "normalize.edited",
            json!({
                "entity": entity_id,
                "property": property_id,
                "demoted": count,
                "revision": receipt.revision,
            }),
        );
        Ok(NormalizeOutcome::Edited {
            demoted: count,
            revision: receipt.revision,
        })
    }

    fn skip(&self, entity_id: &str, property_id: &str, reason: SkipReason) -> NormalizeOutcome {
        self.log(
            LogLevel::Debug,
            "normalize.skipped",
            json!({ "entity": entity_id, "property": property_id, "reason": reason.as_str() }),
        );
        NormalizeOutcome::Skipped(reason)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityItem, MemoryRepository};

    fn claim(id: &str, rank: &str) -> Claim {
        Claim::from_json(json!({
            "id": id,
            "type": "statement",
            "rank": rank,
            "mainsnak": { "snaktype": "value", "property": "P31" }
        }))
        .unwrap()
    }

    fn normalizer(repo: &Arc<MemoryRepository>) -> RankNormalizer {
        RankNormalizer::new(repo.clone(), &EditSettings::default())
    }

    #[test]
    fn item_ids_are_q_and_digits() {
        assert!(is_item_id("Q42"));
        assert!(!is_item_id("P31"));
        assert!(!is_item_id("L7"));
        assert!(!is_item_id("Q"));
        assert!(!is_item_id("Q42-F1"));
        assert!(!is_item_id(""));
    }

    #[test]
    fn plan_leaves_deprecated_claims_alone() {
        let claims = [claim("Q1$a", "preferred"), claim("Q1$b", "deprecated")];
        let demoted = plan_demotions(&claims).unwrap();
        assert_eq!(demoted.len(), 1);
        assert_eq!(demoted[0]["id"], "Q1$a");
        assert_eq!(demoted[0]["rank"], "normal");
        assert_eq!(plan_demotions(&[]), Err(SkipReason::NothingPreferred));
        assert_eq!(
            plan_demotions(&[claim("Q1$c", "deprecated")]),
            Err(SkipReason::NothingPreferred)
        );
    }

    #[tokio::test]
    async fn demotes_all_preferred_claims_in_one_edit() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(
            EntityItem::new("Q1")
                .with_revision(10)
                .with_claim("P31", claim("Q1$a", "preferred"))
                .with_claim("P31", claim("Q1$b", "preferred"))
                .with_claim("P17", claim("Q1$c", "preferred")),
        );
        let outcome = normalizer(&repo).normalize("Q1", "P31").await.unwrap();
        assert_eq!(
            outcome,
            NormalizeOutcome::Edited {
                demoted: 2,
                revision: Some(11)
            }
        );
        let edits = repo.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].base_revision, Some(10));
        assert_eq!(
            edits[0].summary,
            "remove unnecessary use of preferred rank #preferredRankCleanup"
        );
        let stored = repo.item("Q1").unwrap();
        assert!(stored
            .claims_for("P31")
            .iter()
            .all(|claim| claim.rank() == Rank::Normal));
        assert_eq!(stored.claims_for("P17")[0].rank(), Rank::Preferred);
    }

    #[tokio::test]
    async fn normal_sibling_means_no_edit() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(
            EntityItem::new("Q2")
                .with_claim("P31", claim("Q2$a", "preferred"))
                .with_claim("P31", claim("Q2$b", "normal")),
        );
        let outcome = normalizer(&repo).normalize("Q2", "P31").await.unwrap();
        assert_eq!(outcome, NormalizeOutcome::Skipped(SkipReason::NormalRankPresent));
        assert!(repo.edits().is_empty());
    }

    #[tokio::test]
    async fn non_item_ids_are_skipped_without_reading() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(EntityItem::new("P31").with_claim("P1629", claim("P31$a", "preferred")));
        repo.insert(EntityItem::new("L5").with_claim("P5185", claim("L5$a", "preferred")));
        let normalizer = normalizer(&repo);
        for id in ["P31", "L5"] {
            let outcome = normalizer.normalize(id, "P1629").await.unwrap();
            assert_eq!(outcome, NormalizeOutcome::Skipped(SkipReason::NotAnItem));
        }
        assert!(repo.loads().is_empty());
        assert!(repo.edits().is_empty());
    }

    #[tokio::test]
    async fn missing_and_redirected_entities_are_skipped() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(EntityItem::redirected("Q3", Some("Q4".into())));
        let normalizer = normalizer(&repo);
        assert_eq!(
            normalizer.normalize("Q3", "P31").await.unwrap(),
            NormalizeOutcome::Skipped(SkipReason::Redirect)
        );
        assert_eq!(
            normalizer.normalize("Q404", "P31").await.unwrap(),
            NormalizeOutcome::Skipped(SkipReason::Missing)
        );
        assert!(repo.edits().is_empty());
    }

    #[tokio::test]
    async fn redirect_skip_records_target() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("normalize.log");
        let telemetry = BotTelemetry::builder("rankbot")
            .log_path(&log_path)
            .min_level(LogLevel::Debug)
            .build()
            .unwrap();
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(EntityItem::redirected("Q8", Some("Q9".into())));
        let outcome = normalizer(&repo)
            .with_telemetry(telemetry)
            .normalize("Q8", "P31")
            .await
            .unwrap();
        assert_eq!(outcome, NormalizeOutcome::Skipped(SkipReason::Redirect));
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("\"target\":\"Q9\""));
        assert!(content.contains("\"reason\":\"redirect\""));
    }

    #[tokio::test]
    async fn second_call_is_a_no_op() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(EntityItem::new("Q5").with_claim("P31", claim("Q5$a", "preferred")));
        let normalizer = normalizer(&repo);
        assert!(matches!(
            normalizer.normalize("Q5", "P31").await.unwrap(),
            NormalizeOutcome::Edited { demoted: 1, .. }
        ));
        assert_eq!(
            normalizer.normalize("Q5", "P31").await.unwrap(),
            NormalizeOutcome::Skipped(SkipReason::NormalRankPresent)
        );
        assert_eq!(repo.edits().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_submits_nothing() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(EntityItem::new("Q6").with_claim("P31", claim("Q6$a", "preferred")));
        let settings = EditSettings {
            dry_run: true,
            ..EditSettings::default()
        };
        let normalizer = RankNormalizer::new(repo.clone(), &settings);
        assert_eq!(
            normalizer.normalize("Q6", "P31").await.unwrap(),
            NormalizeOutcome::WouldEdit { demoted: 1 }
        );
        assert!(repo.edits().is_empty());
    }

    #[tokio::test]
    async fn rejected_edit_propagates() {
        let repo = Arc::new(MemoryRepository::rejecting("protectedpage"));
        repo.insert(EntityItem::new("Q7").with_claim("P31", claim("Q7$a", "preferred")));
        let err = normalizer(&repo).normalize("Q7", "P31").await.unwrap_err();
        assert!(err.to_string().contains("protectedpage"));
    }
}
