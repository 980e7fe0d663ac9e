use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::updates::Update;
use crate::platform::{BadResponse, NotifyError};

/// Attempts made to fetch the bot identity before giving up.
pub const IDENTITY_ATTEMPTS: usize = 3;
/// Pause between identity attempts.
pub const IDENTITY_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Markup mode forwarded as `parse_mode` on outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
        }
    }

    /// Parse the `parseMode` destination parameter (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("html") {
            Some(ParseMode::Html)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub parse_mode: Option<ParseMode>,
}

/// The bot's own account, fetched once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

/// Standard response envelope of the bot API.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: Option<bool>,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    #[serde(default)]
    username: String,
}

/// HTTP client for the three bot API calls.
pub struct BotApi {
    http: reqwest::Client,
    api_prefix: String,
    token: String,
}

impl BotApi {
    /// `api_prefix` is concatenated with the token, e.g.
    /// `https://api.telegram.org/bot` + token + `/getMe`.
    pub fn new(api_prefix: &str, token: &str, timeout: Duration) -> Result<Self, NotifyError> {
        if api_prefix.is_empty() {
            return Err(NotifyError::Config("empty api url not allowed".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            http,
            api_prefix: api_prefix.to_string(),
            token: token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}{}/{}", self.api_prefix, self.token, method)
    }

    /// Fetch the bot identity, retrying transport and decoding failures.
    pub async fn fetch_identity(&self, cancel: &CancellationToken) -> Result<BotIdentity, NotifyError> {
        let mut attempt = 1;
        loop {
            match self.get_me(cancel).await {
                Ok(identity) => return Ok(identity),
                Err(e) if attempt < IDENTITY_ATTEMPTS && is_retryable(&e) => {
                    warn!(
                        "Bot identity attempt {}/{} failed: {}",
                        attempt, IDENTITY_ATTEMPTS, e
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(NotifyError::Cancelled),
                        _ = tokio::time::sleep(IDENTITY_RETRY_DELAY) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_me(&self, cancel: &CancellationToken) -> Result<BotIdentity, NotifyError> {
        let request = self.http.get(self.method_url("getMe"));
        let envelope: Envelope<BotUser> = self.execute(cancel, request).await?;
        let user = envelope.result.ok_or(BadResponse::EmptyResult)?;
        Ok(BotIdentity {
            id: user.id,
            username: user.username,
        })
    }

    /// Fetch events newer than `offset`. The offset is omitted when zero.
    pub async fn get_updates(
        &self,
        cancel: &CancellationToken,
        offset: i64,
    ) -> Result<Vec<Update>, NotifyError> {
        let request = self
            .http
            .get(self.method_url("getUpdates"))
            .query(&updates_query(offset));
        let envelope: Envelope<Vec<Update>> = self.execute(cancel, request).await?;
        Ok(envelope.result.unwrap_or_default())
    }

    pub async fn send_message(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> Result<(), NotifyError> {
        let mut query = vec![("chat_id", chat_id), ("text", text)];
        if let Some(mode) = options.parse_mode {
            query.push(("parse_mode", mode.as_str()));
        }
        let request = self.http.post(self.method_url("sendMessage")).query(&query);
        let envelope: Envelope<serde_json::Value> = self.execute(cancel, request).await?;
        if envelope.ok == Some(false) {
            return Err(BadResponse::Status {
                status: 200,
                description: envelope.description,
            }
            .into());
        }
        Ok(())
    }

    /// Send `request`, racing it against `cancel`, and decode the JSON body.
    async fn execute<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: reqwest::RequestBuilder,
    ) -> Result<T, NotifyError> {
        if cancel.is_cancelled() {
            return Err(NotifyError::Cancelled);
        }

        let call = async {
            let response = request.send().await.map_err(NotifyError::Unreachable)?;
            let status = response.status();
            debug!("Bot API answered with {}", status);
            let body = response.bytes().await.map_err(NotifyError::Unreachable)?;

            if !status.is_success() {
                let description = serde_json::from_slice::<Envelope<serde_json::Value>>(&body)
                    .ok()
                    .and_then(|envelope| envelope.description);
                return Err(BadResponse::Status {
                    status: status.as_u16(),
                    description,
                }
                .into());
            }

            serde_json::from_slice(&body)
                .map_err(|e| NotifyError::from(BadResponse::Decode(e.to_string())))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotifyError::Cancelled),
            result = call => result,
        }
    }
}

fn updates_query(offset: i64) -> Vec<(&'static str, String)> {
    if offset == 0 {
        Vec::new()
    } else {
        vec![("offset", offset.to_string())]
    }
}

fn is_retryable(e: &NotifyError) -> bool {
    matches!(
        e,
        NotifyError::Unreachable(_) | NotifyError::BadResponse(BadResponse::Decode(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    fn api(server: &MockServer, token: &str) -> BotApi {
        BotApi::new(&format!("{}/", server.base_url()), token, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_identity() {
        let server = MockServer::start();
        let get_me = server.mock(|when, then| {
            when.method(GET).path("/good-token/getMe");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"id": 707381019, "is_bot": true, "username": "notify_test_bot"}
            }));
        });

        let identity = api(&server, "good-token")
            .fetch_identity(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(identity.id, 707381019);
        assert_eq!(identity.username, "notify_test_bot");
        get_me.assert_calls(1);
    }

    #[tokio::test]
    async fn test_fetch_identity_empty_result_is_terminal() {
        let server = MockServer::start();
        let get_me = server.mock(|when, then| {
            when.method(GET).path("/empty-json/getMe");
            then.status(200).body("{}");
        });

        let err = api(&server, "empty-json")
            .fetch_identity(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "received empty result");
        get_me.assert_calls(1);
    }

    #[tokio::test]
    async fn test_fetch_identity_retries_malformed_json() {
        let server = MockServer::start();
        let get_me = server.mock(|when, then| {
            when.method(GET).path("/non-json-resp/getMe");
            then.status(200).body("not-a-json");
        });

        let started = std::time::Instant::now();
        let err = api(&server, "non-json-resp")
            .fetch_identity(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to decode json response:"));
        assert!(err.is_bad_response());
        get_me.assert_calls(3);
        assert!(started.elapsed() >= IDENTITY_RETRY_DELAY * 2);
    }

    #[tokio::test]
    async fn test_fetch_identity_status_is_terminal() {
        let server = MockServer::start();
        let get_me = server.mock(|when, then| {
            when.method(GET).path("/404/getMe");
            then.status(404);
        });

        let err = api(&server, "404")
            .fetch_identity(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unexpected API status code 404");
        get_me.assert_calls(1);
    }

    #[tokio::test]
    async fn test_fetch_identity_unreachable() {
        let api = BotApi::new("http://127.0.0.1:1/", "no-such-thing", Duration::from_secs(1)).unwrap();
        let err = api
            .fetch_identity(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert!(!err.is_bad_response());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let err = BotApi::new("", "token", Duration::from_secs(1)).err().unwrap();
        assert!(err.to_string().contains("empty api url not allowed"));
    }

    #[test]
    fn test_updates_query_omits_zero_offset() {
        assert!(updates_query(0).is_empty());
        assert_eq!(updates_query(1001), vec![("offset", "1001".to_string())]);
    }

    #[tokio::test]
    async fn test_get_updates_error_description() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/t/getUpdates");
            then.status(400).body(r#"{"ok":false,"error_code":400,"description":"Very bad request"}"#);
        });

        let err = api(&server, "t")
            .get_updates(&CancellationToken::new(), 0)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected API status code 400, error: \"Very bad request\""
        );
    }

    #[tokio::test]
    async fn test_get_updates_sends_offset() {
        let server = MockServer::start();
        let updates = server.mock(|when, then| {
            when.method(GET)
                .path("/t/getUpdates")
                .query_param("offset", "42");
            then.status(200).json_body(json!({
                "ok": true,
                "result": [{"update_id": 42}, {"update_id": 43}]
            }));
        });

        let result = api(&server, "t")
            .get_updates(&CancellationToken::new(), 42)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1].update_id, 43);
        updates.assert_calls(1);
    }

    #[tokio::test]
    async fn test_send_message_query_params() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/t/sendMessage")
                .query_param("chat_id", "123")
                .query_param("text", "hello there")
                .query_param("parse_mode", "HTML");
            then.status(200).json_body(json!({"ok": true, "result": {"message_id": 100}}));
        });

        let options = SendOptions {
            parse_mode: Some(ParseMode::Html),
        };
        api(&server, "t")
            .send_message(&CancellationToken::new(), "123", "hello there", &options)
            .await
            .unwrap();
        send.assert_calls(1);
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_issued() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST).path("/t/sendMessage");
            then.status(200).body("{}");
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = api(&server, "t")
            .send_message(&cancel, "123", "hi", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        send.assert_calls(0);
    }

    #[tokio::test]
    async fn test_in_flight_call_is_aborted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/t/getUpdates");
            then.status(200)
                .delay(Duration::from_secs(1))
                .body(r#"{"ok":true,"result":[]}"#);
        });

        let api = api(&server, "t");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = api.get_updates(&cancel, 0).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(ParseMode::parse("HTML"), Some(ParseMode::Html));
        assert_eq!(ParseMode::parse("html"), Some(ParseMode::Html));
        assert_eq!(ParseMode::parse("Markdown"), None);
    }
}
