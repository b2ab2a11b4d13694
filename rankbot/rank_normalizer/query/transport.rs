use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{header::ACCEPT, Client};

use super::executor::QueryError;

/// Media type requested from the query service.
pub const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// What came back from one query round trip, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Time until the response headers arrived.
    pub elapsed: Duration,
    /// Response body as text.
    pub body: String,
}

impl RawResponse {
    /// Convenience constructor.
    #[must_use]
    pub fn new(status: u16, elapsed: Duration, body: impl Into<String>) -> Self {
        Self {
            status,
            elapsed,
            body: body.into(),
        }
    }
}

/// Sends query text to the service.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Posts `query` and returns the raw response, whatever its status.
    async fn post_query(&self, query: &str) -> Result<RawResponse, QueryError>;
}

/// Production transport: form-encoded POST with JSON results requested.
#[derive(Debug, Clone)]
pub struct ReqwestQueryTransport {
    client: Client,
    endpoint: String,
}

impl ReqwestQueryTransport {
    /// Builds a client identifying itself with `user_agent`.
    pub fn new(
        endpoint: impl Into<String>,
        user_agent: &str,
        request_timeout: Option<Duration>,
    ) -> Result<Self, QueryError> {
        let mut builder = Client::builder().user_agent(user_agent);
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| QueryError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl QueryTransport for ReqwestQueryTransport {
    async fn post_query(&self, query: &str) -> Result<RawResponse, QueryError> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, SPARQL_RESULTS_JSON)
            .form(&[("query", query)])
            .send()
            .await
            .map_err(|err| QueryError::Transport(err.to_string()))?;
        let elapsed = started.elapsed();
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| QueryError::Transport(err.to_string()))?;
        Ok(RawResponse {
            status,
            elapsed,
            body,
        })
    }
}

type Responder = Box<dyn Fn(&str) -> RawResponse + Send + Sync>;

/// Loopback transport answering from a script; records every query it sees.
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<RawResponse>>,
    responder: Option<Responder>,
    seen: Mutex<Vec<String>>,
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("queued", &self.queue.lock().len())
            .field("seen", &self.seen.lock().len())
            .finish()
    }
}

impl ScriptedTransport {
    /// Replays `responses` in order, then fails.
    #[must_use]
    pub fn from_responses(responses: impl IntoIterator<Item = RawResponse>) -> Self {
        Self {
            queue: Mutex::new(responses.into_iter().collect()),
            responder: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Answers every query with `responder(query)`.
    #[must_use]
    pub fn with_responder(responder: impl Fn(&str) -> RawResponse + Send + Sync + 'static) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queries received so far.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl QueryTransport for ScriptedTransport {
    async fn post_query(&self, query: &str) -> Result<RawResponse, QueryError> {
        self.seen.lock().push(query.to_string());
        if let Some(responder) = &self.responder {
            return Ok(responder(query));
        }
        self.queue
            .lock()
            .pop_front()
            .ok_or_else(|| QueryError::Transport("scripted transport exhausted".into()))
    }
}
