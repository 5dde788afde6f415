//! One-shot REST bootstrap before live sync attaches.
//!
//! `GET {api}/sessions/{id}` yields the stored document; `POST {api}/sessions`
//! creates a new one. Failures here are terminal for the session view and
//! are never retried.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::document::{DocumentSnapshot, DEFAULT_CODE, DEFAULT_LANGUAGE};
use crate::error::{SyncError, SyncResult};
use crate::presence::Participant;

/// Session record as stored by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub users: Vec<Participant>,
}

impl Session {
    /// Starting document for live sync, with defaults for empty fields.
    pub fn snapshot(&self) -> DocumentSnapshot {
        let text = if self.code.is_empty() {
            DEFAULT_CODE.to_owned()
        } else {
            self.code.clone()
        };
        let language = if self.language.is_empty() {
            DEFAULT_LANGUAGE.to_owned()
        } else {
            self.language.clone()
        };
        DocumentSnapshot::new(text, language)
    }
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    language: &'a str,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session: Session,
}

/// Client for the session REST endpoints.
#[derive(Debug, Clone)]
pub struct SessionApi {
    http: Client,
    base_url: String,
}

impl SessionApi {
    /// Create a client from configuration.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        Self::with_timeout(&config.api_url, config.request_timeout)
    }

    /// Create a client for `base_url` (e.g. `http://localhost:8080/api`).
    pub fn with_timeout(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("codestream-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a session and return its record.
    pub async fn create_session(&self, language: &str, code: &str) -> SyncResult<Session> {
        let url = format!("{}/sessions", self.base_url);
        debug!("POST {url}");

        let response = self
            .http
            .post(&url)
            .json(&CreateSessionRequest { language, code })
            .send()
            .await?;
        let created: CreateSessionResponse = check(response).await?.json().await?;

        info!("Created session {} ({})", created.session.id, created.session.language);
        Ok(created.session)
    }

    /// Fetch the stored session record.
    pub async fn fetch_session(&self, session_id: &str) -> SyncResult<Session> {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        debug!("GET {url}");

        let response = self.http.get(&url).send().await?;
        let session: Session = check(response).await?.json().await?;
        Ok(session)
    }

    /// Fetch the starting document for live sync.
    pub async fn fetch_snapshot(&self, session_id: &str) -> SyncResult<DocumentSnapshot> {
        Ok(self.fetch_session(session_id).await?.snapshot())
    }
}

/// Map non-success statuses to a terminal bootstrap error.
async fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    warn!("Session bootstrap failed: {status} {message}");
    Err(SyncError::Bootstrap {
        status: status.as_u16(),
        message,
    })
}
