use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use reqwest::{header::RETRY_AFTER, Client, Method};
use serde_json::Value;

use super::{
    model::{Claim, EntityItem},
    repository::{EditReceipt, EntityEdit, EntityRepository, RepositoryError},
};
use crate::{config::RepositorySettings, query::pacing::Sleeper};

const DEFAULT_LAG_WAIT: Duration = Duration::from_secs(5);

/// Wikibase action API client authenticated with an OAuth 2 bearer token.
///
/// The token is obtained outside this crate; the client only attaches it.
/// A CSRF token is fetched on first write and reused for the rest of the run.
pub struct WikibaseRepository {
    client: Client,
    api_url: String,
    access_token: Option<String>,
    maxlag: Option<u32>,
    maxlag_retries: u32,
    bot_flag: bool,
    sleeper: Arc<dyn Sleeper>,
    csrf_token: Mutex<Option<String>>,
}

impl std::fmt::Debug for WikibaseRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WikibaseRepository")
            .field("api_url", &self.api_url)
            .field("authenticated", &self.access_token.is_some())
            .field("maxlag", &self.maxlag)
            .finish()
    }
}

impl WikibaseRepository {
    /// Builds the client from settings.
    pub fn new(
        settings: &RepositorySettings,
        user_agent: &str,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, RepositoryError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|err| RepositoryError::Transport(err.to_string()))?;
        Ok(Self::with_client(settings, client, sleeper))
    }

    /// Builds the client around a prepared `reqwest::Client`.
    #[must_use]
    pub fn with_client(
        settings: &RepositorySettings,
        client: Client,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            client,
            api_url: settings.api_url.clone(),
            access_token: settings.access_token.clone(),
            maxlag: settings.maxlag,
            maxlag_retries: settings.maxlag_retries,
            bot_flag: settings.bot_flag,
            sleeper,
            csrf_token: Mutex::new(None),
        }
    }

    async fn call(
        &self,
        method: Method,
        params: &[(&str, String)],
    ) -> Result<Value, RepositoryError> {
        let mut params = params.to_vec();
        params.push(("format", "json".into()));
        params.push(("formatversion", "2".into()));
        if let Some(maxlag) = self.maxlag {
            params.push(("maxlag", maxlag.to_string()));
        }
        let mut waits = 0;
        loop {
            let mut request = self.client.request(method.clone(), &self.api_url);
            request = if method == Method::GET {
                request.query(&params)
            } else {
                request.form(&params)
            };
            if let Some(token) = &self.access_token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|err| RepositoryError::Transport(err.to_string()))?;
            let delay = retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok()),
            );
            let body: Value = response
                .json()
                .await
                .map_err(|err| RepositoryError::Decode(err.to_string()))?;
            match lag_verdict(body, delay, waits, self.maxlag_retries) {
                LagVerdict::Done(body) => return Ok(body),
                LagVerdict::Wait(delay) => {
                    waits += 1;
                    tracing::warn!(waits, ?delay, "repository lagged, waiting");
                    self.sleeper.sleep(delay).await;
                }
                LagVerdict::Failed(err) => return Err(err),
            }
        }
    }

    async fn csrf_token(&self) -> Result<String, RepositoryError> {
        let cached = self.csrf_token.lock().clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        let body = self
            .call(
                Method::GET,
                &[
                    ("action", "query".into()),
                    ("meta", "tokens".into()),
                    ("type", "csrf".into()),
                ],
            )
            .await?;
        let token = csrf_from(&body)?;
        *self.csrf_token.lock() = Some(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl EntityRepository for WikibaseRepository {
    async fn load(&self, id: &str) -> Result<EntityItem, RepositoryError> {
        let body = self
            .call(
                Method::GET,
                &[
                    ("action", "wbgetentities".into()),
                    ("ids", id.to_string()),
                    ("props", "info|claims".into()),
                ],
            )
            .await?;
        parse_entity(id, &body)
    }

    async fn submit(&self, edit: &EntityEdit) -> Result<EditReceipt, RepositoryError> {
        if self.access_token.is_none() {
            return Err(RepositoryError::Unauthenticated);
        }
        let token = self.csrf_token().await?;
        let body = self
            .call(Method::POST, &edit_params(edit, token, self.bot_flag))
            .await?;
        Ok(EditReceipt {
            revision: body.pointer("/entity/lastrevid").and_then(Value::as_u64),
        })
    }
}

#[derive(Debug)]
enum LagVerdict {
    Done(Value),
    Wait(Duration),
    Failed(RepositoryError),
}

/// Seconds from a `Retry-After` header; the default wait when absent or not
/// a plain number.
fn retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(DEFAULT_LAG_WAIT, Duration::from_secs)
}

fn lag_verdict(body: Value, delay: Duration, waits: u32, max_waits: u32) -> LagVerdict {
    match api_error(&body) {
        None => LagVerdict::Done(body),
        Some((code, _)) if code == "maxlag" && waits < max_waits => LagVerdict::Wait(delay),
        Some((code, _)) if code == "maxlag" => {
            LagVerdict::Failed(RepositoryError::Lagged { waits })
        }
        Some((code, info)) => LagVerdict::Failed(RepositoryError::Api { code, info }),
    }
}

/// The anonymous token `+\` means the bearer token was not accepted.
fn csrf_from(body: &Value) -> Result<String, RepositoryError> {
    body.pointer("/query/tokens/csrftoken")
        .and_then(Value::as_str)
        .filter(|token| *token != "+\\")
        .map(str::to_owned)
        .ok_or(RepositoryError::Unauthenticated)
}

fn edit_params(edit: &EntityEdit, token: String, bot: bool) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("action", "wbeditentity".to_string()),
        ("id", edit.entity_id.clone()),
        ("data", edit.payload().to_string()),
        ("summary", edit.summary.clone()),
    ];
    if let Some(base) = edit.base_revision {
        params.push(("baserevid", base.to_string()));
    }
    if bot {
        params.push(("bot", "1".into()));
    }
    params.push(("token", token));
    params
}

fn api_error(body: &Value) -> Option<(String, String)> {
    let error = body.get("error")?;
    let code = error.get("code").and_then(Value::as_str).unwrap_or("unknown");
    let info = error.get("info").and_then(Value::as_str).unwrap_or_default();
    Some((code.to_string(), info.to_string()))
}

/// Reads one entity out of a `wbgetentities` response.
fn parse_entity(requested: &str, body: &Value) -> Result<EntityItem, RepositoryError> {
    let entities = body
        .get("entities")
        .and_then(Value::as_object)
        .ok_or_else(|| RepositoryError::Decode("response has no entities object".into()))?;
    let entity = entities
        .get(requested)
        .or_else(|| entities.values().next())
        .ok_or_else(|| RepositoryError::Decode(format!("response lacks entity {requested}")))?;

    if entity.get("missing").is_some() {
        return Ok(EntityItem::missing(requested));
    }
    let returned_id = entity.get("id").and_then(Value::as_str);
    if let Some(redirect) = entity.get("redirects") {
        let target = redirect
            .get("to")
            .and_then(Value::as_str)
            .or(returned_id)
            .map(str::to_owned);
        return Ok(EntityItem::redirected(requested, target));
    }
    if let Some(actual) = returned_id.filter(|actual| *actual != requested) {
        return Ok(EntityItem::redirected(requested, Some(actual.to_owned())));
    }

    let mut claims: IndexMap<String, Vec<Claim>> = IndexMap::new();
    if let Some(groups) = entity.get("claims").and_then(Value::as_object) {
        for (property, statements) in groups {
            let statements = statements.as_array().ok_or_else(|| {
                RepositoryError::Decode(format!("claims of {property} are not a list"))
            })?;
            let parsed = statements
                .iter()
                .cloned()
                .map(Claim::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| RepositoryError::Decode(format!("{requested}/{property}: {err}")))?;
            claims.insert(property.clone(), parsed);
        }
    }
    Ok(EntityItem {
        id: requested.to_string(),
        exists: true,
        redirect: false,
        redirect_target: None,
        last_revision: entity.get("lastrevid").and_then(Value::as_u64),
        claims,
    })
}
