//! Run orchestration: stream rows, normalize each pair, keep score.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{pin_mut, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::{BotConfig, IdentifierSettings},
    entity::{EntityRepository, WikibaseRepository},
    normalizer::{NormalizeOutcome, RankNormalizer, SkipReason},
    query::{
        QueryExecutor, QueryPolicy, QuerySlicer, QueryTemplate, QueryTransport,
        ReqwestQueryTransport, Sleeper, TokioSleeper,
    },
    rows::ResultRow,
    telemetry::BotTelemetry,
};

/// Tally of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the row stream ended.
    pub finished_at: Option<DateTime<Utc>>,
    /// Rows received from the query service.
    pub rows: usize,
    /// Rows dropped because an identifier was empty.
    pub malformed_rows: usize,
    /// Edits submitted.
    pub edits: usize,
    /// Edits a dry run would have submitted.
    pub planned_edits: usize,
    /// Claims demoted (or that would have been, in a dry run).
    pub claims_demoted: usize,
    /// Pairs left alone, per reason.
    pub skipped: BTreeMap<SkipReason, usize>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            rows: 0,
            malformed_rows: 0,
            edits: 0,
            planned_edits: 0,
            claims_demoted: 0,
            skipped: BTreeMap::new(),
        }
    }

    fn record(&mut self, outcome: NormalizeOutcome) {
        match outcome {
            NormalizeOutcome::Edited { demoted, .. } => {
                self.edits += 1;
                self.claims_demoted += demoted;
            }
            NormalizeOutcome::WouldEdit { demoted } => {
                self.planned_edits += 1;
                self.claims_demoted += demoted;
            }
            NormalizeOutcome::Skipped(reason) => {
                *self.skipped.entry(reason).or_default() += 1;
            }
        }
    }

    /// Pairs skipped for `reason`.
    #[must_use]
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }
}

/// One run's client context: query executor, normalizer and their settings,
/// built once and used strictly sequentially.
#[derive(Debug)]
pub struct RankRuntime {
    executor: QueryExecutor,
    normalizer: RankNormalizer,
    template: QueryTemplate,
    page_size: u64,
    identifiers: IdentifierSettings,
    telemetry: Option<BotTelemetry>,
}

impl RankRuntime {
    /// Assembles a runtime from prepared parts.
    #[must_use]
    pub fn new(executor: QueryExecutor, normalizer: RankNormalizer, config: &BotConfig) -> Self {
        Self {
            executor,
            normalizer,
            template: QueryTemplate::preferred_without_normal(),
            page_size: config.query.page_size,
            identifiers: config.identifiers.clone(),
            telemetry: None,
        }
    }

    /// Builds the production context: reqwest transport to the query
    /// service, Wikibase client for entity reads and edits, JSON telemetry.
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        config.validate()?;
        let telemetry = BotTelemetry::builder("rankbot")
            .settings(&config.logging)
            .build()
            .context("initializing telemetry")?;
        let user_agent = config.user_agent();
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let transport: Arc<dyn QueryTransport> = Arc::new(
            ReqwestQueryTransport::new(
                config.query.endpoint.clone(),
                &user_agent,
                config.query.request_timeout_secs.map(Duration::from_secs),
            )
            .context("building query transport")?,
        );
        let repository: Arc<dyn EntityRepository> = Arc::new(
            WikibaseRepository::new(&config.repository, &user_agent, sleeper.clone())
                .context("building repository client")?,
        );
        let executor = QueryExecutor::new(transport, sleeper, QueryPolicy::from(&config.query))
            .with_telemetry(telemetry.clone());
        let normalizer =
            RankNormalizer::new(repository, &config.edit).with_telemetry(telemetry.clone());
        let template = config.query.template().context("loading query template")?;
        Ok(Self::new(executor, normalizer, config)
            .with_template(template)
            .with_telemetry(telemetry))
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: BotTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Replaces the stock query.
    #[must_use]
    pub fn with_template(mut self, template: QueryTemplate) -> Self {
        self.template = template;
        self
    }

    /// Streams every qualifying pair and normalizes it, one at a time.
    ///
    /// The first error from the query service or the repository ends the
    /// run; rows already processed stay edited.
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::new();
        self.log(
            LogLevel::Info,
            "run.started",
            json!({ "page_size": self.page_size, "summary": self.normalizer.summary() }),
        );
        let slicer = QuerySlicer::new(&self.executor, self.template.clone(), self.page_size)
            .with_telemetry(self.telemetry.clone());
        let rows = slicer.into_stream();
        pin_mut!(rows);
        while let Some(binding) = rows
            .try_next()
            .await
            .with_context(|| format!("query failed after {} rows", report.rows))?
        {
            report.rows += 1;
            let Some(row) = ResultRow::from_binding(&binding, &self.identifiers) else {
                report.malformed_rows += 1;
                continue;
            };
            let outcome = self
                .normalizer
                .normalize(&row.entity, &row.property)
                .await
                .with_context(|| format!("normalizing {} {}", row.entity, row.property))?;
            report.record(outcome);
        }
        report.finished_at = Some(Utc::now());
        self.log(
            LogLevel::Info,
            "run.finished",
            serde_json::to_value(&report).unwrap_or_default(),
        );
        Ok(report)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::{Claim, EntityItem, MemoryRepository},
        query::{Binding, BindingTerm, RawResponse, RecordingSleeper, ScriptedTransport},
    };

    fn row(entity: &str, property: &str) -> (String, String) {
        (
            format!("http://www.wikidata.org/entity/{entity}"),
            format!("http://www.wikidata.org/prop/{property}"),
        )
    }

    fn page(rows: &[(String, String)]) -> RawResponse {
        let bindings: Vec<Binding> = rows
            .iter()
            .map(|(item, prop)| {
                let mut binding = Binding::new();
                binding.insert("item".into(), BindingTerm::uri(item.as_str()));
                binding.insert("prop".into(), BindingTerm::uri(prop.as_str()));
                binding
            })
            .collect();
        RawResponse::new(
            200,
            Duration::from_millis(400),
            json!({ "results": { "bindings": bindings } }).to_string(),
        )
    }

    fn end_of_slices() -> RawResponse {
        RawResponse::new(400, Duration::from_millis(40), "offset is out of range")
    }

    fn claim(id: &str, rank: &str) -> Claim {
        Claim::from_json(json!({ "id": id, "rank": rank, "mainsnak": {} })).unwrap()
    }

    fn runtime(
        responses: Vec<RawResponse>,
        repo: &Arc<MemoryRepository>,
        page_size: u64,
    ) -> RankRuntime {
        let mut config = BotConfig::default();
        config.query.page_size = page_size;
        let executor = QueryExecutor::new(
            Arc::new(ScriptedTransport::from_responses(responses)),
            Arc::new(RecordingSleeper::new()),
            QueryPolicy::from(&config.query),
        );
        let normalizer = RankNormalizer::new(repo.clone(), &config.edit);
        RankRuntime::new(executor, normalizer, &config)
    }

    #[tokio::test]
    async fn run_normalizes_each_pair_and_tallies() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(
            EntityItem::new("Q1")
                .with_revision(1)
                .with_claim("P31", claim("Q1$a", "preferred"))
                .with_claim("P31", claim("Q1$b", "preferred"))
                .with_claim("P17", claim("Q1$c", "preferred")),
        );
        repo.insert(
            EntityItem::new("Q2")
                .with_claim("P31", claim("Q2$a", "preferred"))
                .with_claim("P31", claim("Q2$b", "normal")),
        );
        let responses = vec![
            page(&[row("Q1", "P31"), row("Q1", "P17")]),
            page(&[row("Q2", "P31"), row("L9", "P31")]),
            page(&[row("", "P31")]),
            end_of_slices(),
        ];
        let report = runtime(responses, &repo, 2).run().await.unwrap();

        assert_eq!(report.rows, 5);
        assert_eq!(report.malformed_rows, 1);
        assert_eq!(report.edits, 2);
        assert_eq!(report.claims_demoted, 3);
        assert_eq!(report.skipped_for(SkipReason::NormalRankPresent), 1);
        assert_eq!(report.skipped_for(SkipReason::NotAnItem), 1);
        assert!(report.finished_at.is_some());

        let edits = repo.edits();
        assert_eq!(edits.len(), 2);
        assert!(edits.iter().all(|edit| edit.entity_id == "Q1"));
        assert_eq!(repo.loads(), vec!["Q1", "Q1", "Q2"]);
    }

    #[tokio::test]
    async fn rerun_after_normalization_edits_nothing() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(EntityItem::new("Q3").with_claim("P31", claim("Q3$a", "preferred")));

        let first = runtime(vec![page(&[row("Q3", "P31")]), end_of_slices()], &repo, 10)
            .run()
            .await
            .unwrap();
        let second = runtime(vec![page(&[row("Q3", "P31")]), end_of_slices()], &repo, 10)
            .run()
            .await
            .unwrap();

        assert_eq!(first.edits, 1);
        assert_eq!(second.edits, 0);
        assert_eq!(second.skipped_for(SkipReason::NormalRankPresent), 1);
        assert_eq!(repo.edits().len(), 1);
    }

    #[tokio::test]
    async fn failed_edit_halts_the_run() {
        let repo = Arc::new(MemoryRepository::rejecting("abusefilter-disallowed"));
        repo.insert(EntityItem::new("Q4").with_claim("P31", claim("Q4$a", "preferred")));
        repo.insert(EntityItem::new("Q5").with_claim("P31", claim("Q5$a", "preferred")));
        let responses = vec![page(&[row("Q4", "P31"), row("Q5", "P31")]), end_of_slices()];
        let err = runtime(responses, &repo, 10).run().await.unwrap_err();
        assert!(format!("{err:#}").contains("abusefilter-disallowed"));
        assert_eq!(repo.loads(), vec!["Q4"]);
    }

    #[tokio::test]
    async fn custom_template_drives_the_slices() {
        let repo = Arc::new(MemoryRepository::new());
        let transport = Arc::new(ScriptedTransport::from_responses([
            page(&[row("L9", "P31")]),
            end_of_slices(),
        ]));
        let mut config = BotConfig::default();
        config.query.page_size = 50;
        config.query.template =
            Some("SELECT ?item ?prop WHERE { } OFFSET {offset} LIMIT {limit}".into());
        let executor = QueryExecutor::new(
            transport.clone(),
            Arc::new(RecordingSleeper::new()),
            QueryPolicy::from(&config.query),
        );
        let normalizer = RankNormalizer::new(repo.clone(), &config.edit);
        let report = RankRuntime::new(executor, normalizer, &config)
            .with_template(config.query.template().unwrap())
            .run()
            .await
            .unwrap();

        assert_eq!(report.skipped_for(SkipReason::NotAnItem), 1);
        assert_eq!(
            transport.queries(),
            vec![
                "SELECT ?item ?prop WHERE { } OFFSET 0 LIMIT 50",
                "SELECT ?item ?prop WHERE { } OFFSET 50 LIMIT 50",
            ]
        );
    }

    #[tokio::test]
    async fn fatal_query_failure_halts_the_run() {
        let repo = Arc::new(MemoryRepository::new());
        let responses = vec![RawResponse::new(
            500,
            Duration::from_secs(3),
            "java.lang.OutOfMemoryError",
        )];
        let err = runtime(responses, &repo, 10).run().await.unwrap_err();
        assert!(format!("{err:#}").contains("http status 500"));
        assert!(repo.loads().is_empty());
    }
}
