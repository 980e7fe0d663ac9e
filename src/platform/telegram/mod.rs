//! Telegram bot notifier with out-of-band account linking.
//!
//! Besides delivering `telegram:<chat>` destinations, the notifier lets an
//! application prove that one of its users owns a Telegram account: the
//! application stores a link request under a random token, the user sends
//! `/start <token>` to the bot, and the application later consumes the
//! confirmed request with [`Telegram::check_token`].

pub mod api;
pub mod markup;
pub mod poller;
pub mod requests;
pub mod updates;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::platform::{parse_destination, query_value, Notifier, NotifyError};
use api::{BotApi, BotIdentity, ParseMode, SendOptions};
use poller::IngestMode;
use requests::{LinkError, LinkRequests, LinkedIdentity};

pub use markup::{escape_text, sanitize_html};

pub const SCHEME: &str = "telegram";
pub const DEFAULT_API_PREFIX: &str = "https://api.telegram.org/bot";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Construction parameters for [`Telegram`].
#[derive(Debug, Clone)]
pub struct TelegramParams {
    pub token: String,
    /// Prefix the token is appended to; must end where the token begins.
    pub api_prefix: String,
    /// Per-request timeout. Zero means [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Zero means [`DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Zero means [`DEFAULT_SWEEP_INTERVAL`].
    pub sweep_interval: Duration,
}

impl Default for TelegramParams {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

pub struct Telegram {
    api: BotApi,
    identity: BotIdentity,
    requests: LinkRequests,
    mode: Mutex<IngestMode>,
    /// Next expected update id; zero until the first batch is seen.
    cursor: tokio::sync::Mutex<i64>,
    timeout: Duration,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl Telegram {
    /// Connect to the bot API and fetch the bot identity.
    ///
    /// Transport and decoding failures are retried a few times before the
    /// construction fails.
    pub async fn new(params: TelegramParams) -> Result<Self, NotifyError> {
        let timeout = non_zero_or(params.timeout, DEFAULT_TIMEOUT);
        let api = BotApi::new(&params.api_prefix, &params.token, timeout)?;

        let identity = api.fetch_identity(&CancellationToken::new()).await?;
        info!(
            "Telegram notifier ready as @{} ({})",
            identity.username, identity.id
        );

        Ok(Self {
            api,
            identity,
            requests: LinkRequests::new(),
            mode: Mutex::new(IngestMode::Idle),
            cursor: tokio::sync::Mutex::new(0),
            timeout,
            poll_interval: non_zero_or(params.poll_interval, DEFAULT_POLL_INTERVAL),
            sweep_interval: non_zero_or(params.sweep_interval, DEFAULT_SWEEP_INTERVAL),
        })
    }

    pub fn bot_username(&self) -> &str {
        &self.identity.username
    }

    pub fn bot_identity(&self) -> &BotIdentity {
        &self.identity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Store a link request for `user` under `token`.
    pub fn add_token(&self, token: &str, user: &str, site: &str, expires_at: DateTime<Utc>) {
        self.requests.add(token, user, site, expires_at);
    }

    /// Consume a confirmed link request, returning the Telegram user id and
    /// the request's site.
    pub fn check_token(&self, token: &str, user: &str) -> Result<LinkedIdentity, LinkError> {
        self.requests.check_and_consume(token, user)
    }

    /// Create a link request with a fresh token valid for `ttl`.
    ///
    /// Returns the token and the deep link the user should open to answer it.
    pub fn new_link_request(&self, user: &str, site: &str, ttl: Duration) -> (String, String) {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.add_token(&token, user, site, Utc::now() + ttl);
        let link = format!("https://t.me/{}?start={}", self.identity.username, token);
        (token, link)
    }

    /// Send `text` to `chat_id` directly, bypassing destination parsing.
    pub async fn send_text(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), NotifyError> {
        self.api.send_message(cancel, chat_id, text, options).await
    }
}

fn non_zero_or(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

#[async_trait]
impl Notifier for Telegram {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn describe(&self) -> String {
        "telegram notifications destination".to_string()
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        destination: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        let (chat_id, query) = parse_destination(destination, SCHEME)?;
        let parse_mode = match query_value(&query, "parseMode") {
            Some(value) => Some(ParseMode::parse(value).ok_or_else(|| {
                NotifyError::Destination(format!("unsupported parse mode {}", value))
            })?),
            None => None,
        };
        if cancel.is_cancelled() {
            return Err(NotifyError::Cancelled);
        }

        debug!("Sending telegram message to {}", chat_id);
        self.api
            .send_message(cancel, &chat_id, text, &SendOptions { parse_mode })
            .await
    }
}
