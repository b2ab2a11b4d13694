use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use super::{
    pacing::Sleeper,
    template::Binding,
    transport::{QueryTransport, RawResponse},
};
use crate::{config::QuerySettings, telemetry::BotTelemetry};

/// Marker the service prints when a slice offset runs past the data.
pub const OFFSET_OUT_OF_RANGE_MARKER: &str = "offset is out of range";
/// Marker the service prints when a query hits the server-side time limit.
pub const SERVER_TIMEOUT_MARKER: &str = "java.util.concurrent.TimeoutException";

/// Errors that end a run at the query layer.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The request never produced a response.
    #[error("query transport failed: {0}")]
    Transport(String),
    /// The response could not be read as SPARQL JSON and was not retriable.
    #[error(
        "cannot parse query response as JSON; http status {}; query time {:.2} sec; attempts {}",
        .status,
        .elapsed.as_secs_f64(),
        .attempts
    )]
    Unparseable {
        /// HTTP status of the last response.
        status: u16,
        /// Elapsed time of the last response.
        elapsed: Duration,
        /// Attempts made, the failing one included.
        attempts: u32,
    },
    /// A query template is missing a slice placeholder.
    #[error("query template lacks the {0} placeholder")]
    Template(&'static str),
}

/// Delays, thresholds and retry bound applied to every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Pause after every successful query.
    pub courtesy_delay: Duration,
    /// Pause before retrying a server-side timeout.
    pub timeout_cooldown: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Below this, a malformed response may mean "no more slices".
    pub fast_response: Duration,
    /// Above this, a malformed response may be a server-side timeout.
    pub slow_response: Duration,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::from(&QuerySettings::default())
    }
}

impl From<&QuerySettings> for QueryPolicy {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            courtesy_delay: settings.courtesy_delay(),
            timeout_cooldown: settings.timeout_cooldown(),
            max_attempts: settings.max_attempts.max(1),
            fast_response: Duration::from_millis(settings.fast_response_ms),
            slow_response: Duration::from_millis(settings.slow_response_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SparqlPayload {
    #[serde(default)]
    results: SparqlResults,
}

#[derive(Debug, Default, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<Binding>,
}

#[derive(Debug)]
enum Verdict {
    Rows(Vec<Binding>),
    EndOfSlices,
    RetryAfterTimeout,
    Fatal,
}

/// Runs single queries against the service, one at a time.
#[derive(Clone)]
pub struct QueryExecutor {
    transport: Arc<dyn QueryTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: QueryPolicy,
    telemetry: Option<BotTelemetry>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("policy", &self.policy)
            .finish()
    }
}

impl QueryExecutor {
    /// Creates an executor over `transport`, pausing through `sleeper`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn QueryTransport>,
        sleeper: Arc<dyn Sleeper>,
        policy: QueryPolicy,
    ) -> Self {
        Self {
            transport,
            sleeper,
            policy,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: BotTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Runs `query` and returns its bindings.
    ///
    /// An empty vector means either an empty result or the end-of-slices
    /// signal; both end pagination. Server-side timeouts are retried until
    /// `max_attempts` is spent, after which they are fatal like any other
    /// unparseable response.
    pub async fn execute(&self, query: &str) -> Result<Vec<Binding>, QueryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self.transport.post_query(query).await?;
            match self.classify(&response, attempt) {
                Verdict::Rows(bindings) => {
                    self.log(
                        LogLevel::Debug,
                        "query.completed",
                        json!({
                            "attempt": attempt,
                            "rows": bindings.len(),
                            "elapsed_ms": millis(response.elapsed),
                        }),
                    );
                    self.sleeper.sleep(self.policy.courtesy_delay).await;
                    return Ok(bindings);
                }
                Verdict::EndOfSlices => {
                    self.log(
                        LogLevel::Debug,
                        "query.slices_exhausted",
                        json!({ "elapsed_ms": millis(response.elapsed) }),
                    );
                    return Ok(Vec::new());
                }
                Verdict::RetryAfterTimeout => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        "query service timed out, cooling down before retry"
                    );
                    self.log(
                        LogLevel::Warn,
                        "query.timeout_retry",
                        json!({
                            "attempt": attempt,
                            "status": response.status,
                            "elapsed_ms": millis(response.elapsed),
                            "cooldown_ms": millis(self.policy.timeout_cooldown),
                        }),
                    );
                    self.sleeper.sleep(self.policy.timeout_cooldown).await;
                }
                Verdict::Fatal => {
                    self.log(
                        LogLevel::Error,
                        "query.failed",
                        json!({
                            "attempt": attempt,
                            "status": response.status,
                            "elapsed_ms": millis(response.elapsed),
                        }),
                    );
                    return Err(QueryError::Unparseable {
                        status: response.status,
                        elapsed: response.elapsed,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    fn classify(&self, response: &RawResponse, attempt: u32) -> Verdict {
        if let Ok(payload) = serde_json::from_str::<SparqlPayload>(&response.body) {
            return Verdict::Rows(payload.results.bindings);
        }
        if response.elapsed < self.policy.fast_response
            && response.body.contains(OFFSET_OUT_OF_RANGE_MARKER)
        {
            return Verdict::EndOfSlices;
        }
        if attempt < self.policy.max_attempts
            && response.elapsed > self.policy.slow_response
            && response.body.contains(SERVER_TIMEOUT_MARKER)
        {
            return Verdict::RetryAfterTimeout;
        }
        Verdict::Fatal
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{pacing::RecordingSleeper, transport::ScriptedTransport};

    const ROWS: &str = r#"{"head":{"vars":["item","prop"]},"results":{"bindings":[
        {"item":{"type":"uri","value":"http://www.wikidata.org/entity/Q1"},
         "prop":{"type":"uri","value":"http://www.wikidata.org/prop/P31"}}]}}"#;

    fn timeout_page() -> RawResponse {
        RawResponse::new(
            500,
            Duration::from_secs(60),
            "SPARQL-QUERY: ...\njava.util.concurrent.TimeoutException\n\tat ...",
        )
    }

    fn executor(
        responses: Vec<RawResponse>,
    ) -> (QueryExecutor, Arc<ScriptedTransport>, Arc<RecordingSleeper>) {
        let transport = Arc::new(ScriptedTransport::from_responses(responses));
        let sleeper = Arc::new(RecordingSleeper::new());
        let executor =
            QueryExecutor::new(transport.clone(), sleeper.clone(), QueryPolicy::default());
        (executor, transport, sleeper)
    }

    #[tokio::test]
    async fn returns_bindings_after_courtesy_delay() {
        let (executor, _, sleeper) =
            executor(vec![RawResponse::new(200, Duration::from_millis(300), ROWS)]);
        let rows = executor.execute("SELECT").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["prop"].value, "http://www.wikidata.org/prop/P31");
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn json_without_results_is_empty() {
        let (executor, _, _) = executor(vec![RawResponse::new(200, Duration::ZERO, "{}")]);
        assert!(executor.execute("SELECT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fast_out_of_range_response_ends_slicing() {
        let (executor, transport, sleeper) = executor(vec![RawResponse::new(
            400,
            Duration::from_millis(120),
            "java.lang.IllegalArgumentException: offset is out of range",
        )]);
        assert!(executor.execute("SELECT").await.unwrap().is_empty());
        assert_eq!(transport.queries().len(), 1);
        assert!(sleeper.recorded().is_empty());
    }

    #[tokio::test]
    async fn slow_out_of_range_response_is_fatal() {
        let (executor, _, _) = executor(vec![RawResponse::new(
            400,
            Duration::from_secs(2),
            "offset is out of range",
        )]);
        let err = executor.execute("SELECT").await.unwrap_err();
        assert!(matches!(err, QueryError::Unparseable { status: 400, attempts: 1, .. }));
    }

    #[tokio::test]
    async fn timeout_is_retried_then_succeeds() {
        let (executor, transport, sleeper) = executor(vec![
            timeout_page(),
            RawResponse::new(200, Duration::from_secs(3), ROWS),
        ]);
        let rows = executor.execute("SELECT").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(transport.queries(), vec!["SELECT", "SELECT"]);
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(30), Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn persistent_timeout_stops_after_three_attempts() {
        let (executor, transport, sleeper) =
            executor(vec![timeout_page(), timeout_page(), timeout_page(), timeout_page()]);
        let err = executor.execute("SELECT").await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Unparseable { status: 500, attempts: 3, .. }
        ));
        assert_eq!(transport.queries().len(), 3);
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(30); 2]);
        assert!(err.to_string().contains("http status 500"));
        assert!(err.to_string().contains("query time 60.00 sec"));
    }

    #[tokio::test]
    async fn slow_response_without_timeout_marker_is_not_retried() {
        let (executor, transport, _) = executor(vec![
            RawResponse::new(502, Duration::from_secs(70), "<html>Bad Gateway</html>"),
            RawResponse::new(200, Duration::ZERO, ROWS),
        ]);
        assert!(executor.execute("SELECT").await.is_err());
        assert_eq!(transport.queries().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let (executor, _, _) = executor(Vec::new());
        assert!(matches!(
            executor.execute("SELECT").await,
            Err(QueryError::Transport(_))
        ));
    }
}
