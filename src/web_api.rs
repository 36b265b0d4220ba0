//! Web API session negotiation.
//!
//! Before a realtime connection can be opened the client asks the Web API for
//! a websocket endpoint. `rtm.start` returns the full workspace snapshot,
//! `rtm.connect` a compact one that is cheaper to fetch on reconnect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::{retry_async, with_timeout, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
/// Production Web API base URL.
pub const WEB_API_BASE_URL: &str = "https://slack.com/api";

/// Application error codes that no amount of retrying will fix.
const FATAL_ERROR_CODES: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "missing_scope",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WebApiDefaults;

impl WebApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Applied when the caller does not supply its own deadline.
    pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(25);
    pub const JITTER: Duration = Duration::from_millis(25);
}

/// Selects which negotiation endpoint is used.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NegotiationMode {
    /// `rtm.start`: complete session snapshot, suited to a cold start.
    Full,
    /// `rtm.connect`: minimal snapshot, suited to fast reconnects.
    Compact,
}

impl NegotiationMode {
    pub fn method(self) -> &'static str {
        match self {
            Self::Full => "rtm.start",
            Self::Compact => "rtm.connect",
        }
    }
}

/// Extra form parameters sent with every negotiation request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NegotiationParams {
    pub batch_presence_aware: bool,
    pub presence_sub: bool,
    pub include_locale: bool,
}

impl NegotiationParams {
    fn to_form(&self) -> Vec<(&'static str, &'static str)> {
        let mut form = Vec::new();
        if self.batch_presence_aware {
            form.push(("batch_presence_aware", "1"));
        }
        if self.presence_sub {
            form.push(("presence_sub", "true"));
        }
        if self.include_locale {
            form.push(("include_locale", "true"));
        }
        form
    }
}

/// Deadline and cancellation for one negotiation call.
#[derive(Clone, Debug)]
pub struct NegotiateContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl NegotiateContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Binds the context to an existing cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for NegotiateContext {
    fn default() -> Self {
        Self::with_timeout(WebApiDefaults::NEGOTIATION_TIMEOUT)
    }
}

/// Identity of the connecting user.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UserDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Workspace the session belongs to.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TeamDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
}

/// Session metadata returned by negotiation.
///
/// The snapshot collections are only populated by [`NegotiationMode::Full`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub url: String,
    #[serde(rename = "self")]
    pub user: UserDetails,
    pub team: TeamDetails,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ims: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bots: Vec<Value>,
    /// Remaining top-level fields, including server capability flags.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Source of session negotiations for the connection manager.
#[async_trait]
pub trait Negotiator: Send + Sync + 'static {
    /// Returns the session info together with the websocket endpoint to dial.
    async fn negotiate(
        &self,
        mode: NegotiationMode,
        ctx: &NegotiateContext,
    ) -> Result<(SessionInfo, String), NegotiationError>;
}

#[derive(Clone, Debug)]
pub struct WebApiClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub params: NegotiationParams,
}

impl Default for WebApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: WEB_API_BASE_URL.to_string(),
            connect_timeout: WebApiDefaults::CONNECT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: Some(WebApiDefaults::MAX_ATTEMPTS),
                initial_backoff: WebApiDefaults::BACKOFF,
                max_backoff: WebApiDefaults::BACKOFF,
                jitter: WebApiDefaults::JITTER,
            },
            params: NegotiationParams::default(),
        }
    }
}

/// Web API client limited to the negotiation calls.
#[derive(Clone)]
pub struct WebApiClient {
    http: Client,
    token: SecretString,
    base_url: String,
    retry_policy: RetryPolicy,
    params: NegotiationParams,
}

impl WebApiClient {
    pub fn new(token: SecretString) -> Result<Self, NegotiationError> {
        Self::with_options(token, WebApiClientOptions::default())
    }

    pub fn with_options(
        token: SecretString,
        options: WebApiClientOptions,
    ) -> Result<Self, NegotiationError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(NegotiationError::Transport)?;

        Ok(Self {
            http,
            token,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            retry_policy: options.retry_policy,
            params: options.params,
        })
    }

    /// Calls `rtm.start` with the default deadline.
    pub async fn start_rtm(&self) -> Result<(SessionInfo, String), NegotiationError> {
        self.negotiate(NegotiationMode::Full, &NegotiateContext::default())
            .await
    }

    /// Calls `rtm.connect` with the default deadline.
    pub async fn connect_rtm(&self) -> Result<(SessionInfo, String), NegotiationError> {
        self.negotiate(NegotiationMode::Compact, &NegotiateContext::default())
            .await
    }

    fn endpoint(&self, mode: NegotiationMode) -> String {
        format!("{}/{}", self.base_url, mode.method())
    }

    async fn send_attempt(&self, endpoint: &str) -> Result<SessionInfo, NegotiationError> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(self.token.expose_secret())
            .form(&self.params.to_form())
            .send()
            .await
            .map_err(NegotiationError::Transport)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(NegotiationError::RateLimited { retry_after });
        }

        let body = response.text().await.map_err(NegotiationError::Transport)?;
        if !status.is_success() {
            return Err(NegotiationError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_negotiation_response(&body)
    }
}

#[async_trait]
impl Negotiator for WebApiClient {
    async fn negotiate(
        &self,
        mode: NegotiationMode,
        ctx: &NegotiateContext,
    ) -> Result<(SessionInfo, String), NegotiationError> {
        let endpoint = self.endpoint(mode);
        let policy = self.retry_policy.clone();
        let call = retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.send_attempt(&endpoint).await }
            },
            NegotiationError::is_retryable,
        );

        let info = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(NegotiationError::Cancelled),
            result = with_timeout(ctx.timeout, call) => {
                result.map_err(|_| NegotiationError::Timeout(ctx.timeout))??
            }
        };

        debug!(
            event = "rtm_negotiated",
            method = mode.method(),
            url = %info.url,
            team = %info.team.id
        );
        let url = info.url.clone();
        Ok((info, url))
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("malformed negotiation response: {0}")]
    Malformed(String),

    /// The server answered `ok: false`; `code` is its error string verbatim.
    #[error("{code}")]
    Application { code: String },

    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),

    #[error("negotiation cancelled")]
    Cancelled,
}

impl NegotiationError {
    /// Whether a single negotiation call should retry the request itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => status.is_server_error(),
            Self::RateLimited { .. }
            | Self::Malformed(_)
            | Self::Application { .. }
            | Self::Timeout(_)
            | Self::Cancelled => false,
        }
    }

    /// Whether the error indicates bad credentials or configuration.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Application { code } => FATAL_ERROR_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Minimum wait the server asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub(crate) fn parse_negotiation_response(body: &str) -> Result<SessionInfo, NegotiationError> {
    let mut value: Value = serde_json::from_str(body)
        .map_err(|err| NegotiationError::Malformed(format!("invalid json: {err}")))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| NegotiationError::Malformed("expected a json object".to_string()))?;

    let ok = object
        .remove("ok")
        .and_then(|ok| ok.as_bool())
        .ok_or_else(|| NegotiationError::Malformed("missing ok flag".to_string()))?;
    if !ok {
        let code = object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        return Err(NegotiationError::Application { code });
    }

    let info = SessionInfo::deserialize(&value)
        .map_err(|err| NegotiationError::Malformed(err.to_string()))?;
    if info.url.trim().is_empty() {
        return Err(NegotiationError::Malformed(
            "response is missing the websocket url".to_string(),
        ));
    }
    Ok(info)
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
