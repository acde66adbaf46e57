//! Client for the session registry.
//!
//! Every call is a single self-contained request: no login state, no pooled
//! connection kept between calls, no retries. Transport and HTTP failures map
//! to [`SessionsError::RegistryUnavailable`]; a reply carrying an `error`
//! field maps to [`SessionsError::Remote`]. Retrying is the caller's business.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{RegistryConfig, SessionsConfig};
use crate::error::{Result, SessionsError};
use crate::types::{Resource, Session, SessionUsers};

/// Section of the remote configuration used by this daemon.
pub const SESSIONS_SECTION: &str = "sessions";

// ---------------------------------------------------------------------------
// Registry trait
// ---------------------------------------------------------------------------

pub trait Registry: Send + Sync {
    /// Sessions matching `filter`, keyed by id.
    fn sessions(&self, filter: Value) -> Result<BTreeMap<i64, Session>>;

    fn resources(&self) -> Result<BTreeMap<i64, Resource>>;

    /// One named configuration section.
    fn config(&self, section: &str) -> Result<Value>;

    fn session_users(&self, session_id: i64) -> Result<SessionUsers>;

    /// Sessions that currently have queued actions.
    fn poll_active_sessions(&self) -> Result<Vec<Session>>;

    /// Replace the whole session record. Last writer wins.
    fn update_session(&self, session: &Session) -> Result<()>;

    fn sessions_config(&self) -> Result<SessionsConfig> {
        Ok(serde_json::from_value(self.config(SESSIONS_SECTION)?)?)
    }

    /// Sessions still acquiring data.
    fn active_sessions(&self) -> Result<Vec<Session>> {
        let filter = json!({"condition": "status='running'"});
        Ok(self.sessions(filter)?.into_values().collect())
    }
}

// ---------------------------------------------------------------------------
// HttpRegistry
// ---------------------------------------------------------------------------

/// JSON-over-HTTP registry client: `POST <url>/api/<endpoint>`.
pub struct HttpRegistry {
    base_url: String,
    client: Client,
    poll_timeout: Duration,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| SessionsError::RegistryUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            poll_timeout: config.poll_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one request and return the decoded JSON reply.
    pub fn request(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        self.send(endpoint, payload, None)
    }

    /// Like [`request`](Self::request), with a per-request timeout replacing
    /// the client default.
    fn send(&self, endpoint: &str, payload: &Value, timeout: Option<Duration>) -> Result<Value> {
        let url = format!("{}/api/{endpoint}", self.base_url);
        debug!(%url, ?timeout, "registry request");
        let mut req = self.client.post(&url).json(payload);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let resp = req
            .send()
            .map_err(|e| SessionsError::RegistryUnavailable(format!("{endpoint}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SessionsError::RegistryUnavailable(format!(
                "{endpoint}: HTTP {status}"
            )));
        }
        let body: Value = resp
            .json()
            .map_err(|e| SessionsError::RegistryUnavailable(format!("{endpoint}: {e}")))?;

        if let Some(err) = body.as_object().and_then(|o| o.get("error")) {
            return Err(SessionsError::Remote {
                endpoint: endpoint.to_string(),
                message: crate::config::value_text(err),
            });
        }
        Ok(body)
    }

    /// Fetch a list of records and key them by their `id`.
    pub fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<BTreeMap<i64, T>> {
        let body = self.request(endpoint, payload)?;
        let Value::Array(items) = body else {
            return Err(SessionsError::Remote {
                endpoint: endpoint.to_string(),
                message: "expected a list of records".into(),
            });
        };
        let mut out = BTreeMap::new();
        for item in items {
            let id = item.get("id").and_then(Value::as_i64).ok_or_else(|| {
                SessionsError::Remote {
                    endpoint: endpoint.to_string(),
                    message: "record without integer id".into(),
                }
            })?;
            out.insert(id, serde_json::from_value(item)?);
        }
        Ok(out)
    }

    fn field<T: DeserializeOwned>(&self, endpoint: &str, payload: &Value, key: &str) -> Result<T> {
        let mut body = self.request(endpoint, payload)?;
        let value = body
            .get_mut(key)
            .map(Value::take)
            .ok_or_else(|| SessionsError::Remote {
                endpoint: endpoint.to_string(),
                message: format!("reply has no '{key}' field"),
            })?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Registry for HttpRegistry {
    fn sessions(&self, filter: Value) -> Result<BTreeMap<i64, Session>> {
        self.fetch("get_sessions", &filter)
    }

    fn resources(&self) -> Result<BTreeMap<i64, Resource>> {
        self.fetch("get_resources", &json!({"attrs": ["id", "name"]}))
    }

    fn config(&self, section: &str) -> Result<Value> {
        self.field("get_config", &json!({"attrs": {"config": section}}), "config")
    }

    fn session_users(&self, session_id: i64) -> Result<SessionUsers> {
        self.field(
            "get_session_users",
            &json!({"attrs": {"id": session_id}}),
            "session_users",
        )
    }

    fn poll_active_sessions(&self) -> Result<Vec<Session>> {
        let body = self.send("poll_active_sessions", &json!({}), Some(self.poll_timeout))?;
        Ok(serde_json::from_value(body)?)
    }

    fn update_session(&self, session: &Session) -> Result<()> {
        self.request("update_session", &json!({"attrs": session}))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
