use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::platform::{parse_destination, query_value, BadResponse, Notifier, NotifyError};

pub const SCHEME: &str = "slack";
pub const DEFAULT_API_BASE: &str = "https://slack.com/api/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_LIMIT: &str = "200";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    error: Option<String>,
    #[serde(flatten)]
    payload: T,
}

#[derive(Debug, Deserialize)]
struct ChannelPage {
    #[serde(default)]
    channels: Vec<Channel>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct Ignored {}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<Attachment<'a>>,
}

#[derive(Debug, Serialize)]
struct Attachment<'a> {
    title: &'a str,
    title_link: &'a str,
    text: &'a str,
}

/// Posts notifications to Slack channels addressed by name.
pub struct Slack {
    http: reqwest::Client,
    token: String,
    api_base: String,
    /// Channel name to id, filled lazily.
    channels: Mutex<HashMap<String, String>>,
}

impl Slack {
    pub fn new(token: &str, api_base: &str) -> Result<Self, NotifyError> {
        if token.is_empty() {
            return Err(NotifyError::Config("slack token is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to build http client: {}", e)))?;
        let api_base = if api_base.is_empty() {
            DEFAULT_API_BASE
        } else {
            api_base
        };
        Ok(Self {
            http,
            token: token.to_string(),
            api_base: api_base.to_string(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    async fn channel_id(&self, cancel: &CancellationToken, name: &str) -> Result<String, NotifyError> {
        if let Some(id) = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(id.clone());
        }

        let mut cursor = String::new();
        loop {
            let query = [("limit", PAGE_LIMIT), ("cursor", cursor.as_str())];
            let request = self
                .http
                .get(format!("{}conversations.list", self.api_base))
                .query(&query);
            let page: ChannelPage = self.call(cancel, request).await?;

            let mut found = None;
            {
                let mut cache = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
                for channel in page.channels {
                    if channel.name == name {
                        found = Some(channel.id.clone());
                    }
                    cache.insert(channel.name, channel.id);
                }
            }
            if let Some(id) = found {
                debug!("Resolved slack channel {} to {}", name, id);
                return Ok(id);
            }

            cursor = page
                .response_metadata
                .map(|meta| meta.next_cursor)
                .unwrap_or_default();
            if cursor.is_empty() {
                return Err(NotifyError::Destination(format!(
                    "no such slack channel {:?}",
                    name
                )));
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: reqwest::RequestBuilder,
    ) -> Result<T, NotifyError> {
        if cancel.is_cancelled() {
            return Err(NotifyError::Cancelled);
        }
        let call = async {
            let response = request
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(NotifyError::Unreachable)?;
            let status = response.status();
            if !status.is_success() {
                return Err(BadResponse::Status {
                    status: status.as_u16(),
                    description: None,
                }
                .into());
            }
            let body: ApiResponse<T> = response
                .json()
                .await
                .map_err(|e| NotifyError::from(BadResponse::Decode(e.to_string())))?;
            if !body.ok {
                return Err(BadResponse::Status {
                    status: status.as_u16(),
                    description: body.error,
                }
                .into());
            }
            Ok(body.payload)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotifyError::Cancelled),
            result = call => result,
        }
    }
}

#[async_trait]
impl Notifier for Slack {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn describe(&self) -> String {
        "slack notifications destination".to_string()
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        destination: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        let (channel, query) = parse_destination(destination, SCHEME)?;
        let title = query_value(&query, "title").unwrap_or_default();
        let title_link = query_value(&query, "titleLink").unwrap_or_default();
        let attachment_text = query_value(&query, "attachmentText").unwrap_or_default();

        let channel_id = self.channel_id(cancel, &channel).await?;

        let mut attachments = Vec::new();
        if !title.is_empty() || !title_link.is_empty() || !attachment_text.is_empty() {
            attachments.push(Attachment {
                title,
                title_link,
                text: attachment_text,
            });
        }
        let message = PostMessage {
            channel: &channel_id,
            text,
            attachments,
        };
        let request = self
            .http
            .post(format!("{}chat.postMessage", self.api_base))
            .json(&message);
        let _: Ignored = self.call(cancel, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    fn slack(server: &MockServer) -> Slack {
        Slack::new("xoxb-test", &server.url("/api/")).unwrap()
    }

    #[tokio::test]
    async fn test_send_resolves_channel_across_pages() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/api/conversations.list")
                .header("authorization", "Bearer xoxb-test")
                .query_param("cursor", "");
            then.status(200).json_body(json!({
                "ok": true,
                "channels": [{"id": "C1", "name": "random"}],
                "response_metadata": {"next_cursor": "page2"}
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/api/conversations.list")
                .query_param("cursor", "page2");
            then.status(200).json_body(json!({
                "ok": true,
                "channels": [{"id": "C2", "name": "general"}],
                "response_metadata": {"next_cursor": ""}
            }));
        });
        let post = server.mock(|when, then| {
            when.method(POST)
                .path("/api/chat.postMessage")
                .json_body(json!({
                    "channel": "C2",
                    "text": "test message",
                    "attachments": [{"title": "t", "title_link": "https://example.org", "text": "more"}]
                }));
            then.status(200).json_body(json!({"ok": true}));
        });

        let notifier = slack(&server);
        let cancel = CancellationToken::new();
        notifier
            .send(
                &cancel,
                "slack:general?title=t&titleLink=https%3A%2F%2Fexample.org&attachmentText=more",
                "test message",
            )
            .await
            .unwrap();
        post.assert_calls(1);

        // Cached after the first lookup.
        notifier
            .send(
                &cancel,
                "slack:general?title=t&titleLink=https%3A%2F%2Fexample.org&attachmentText=more",
                "test message",
            )
            .await
            .unwrap();
        first.assert_calls(1);
        second.assert_calls(1);
        post.assert_calls(2);
    }

    #[tokio::test]
    async fn test_send_unknown_channel() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/conversations.list");
            then.status(200)
                .json_body(json!({"ok": true, "channels": [{"id": "C1", "name": "random"}]}));
        });

        let err = slack(&server)
            .send(&CancellationToken::new(), "slack:general", "text")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Destination(_)));
    }

    #[tokio::test]
    async fn test_send_api_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/conversations.list");
            then.status(200)
                .json_body(json!({"ok": false, "error": "invalid_auth"}));
        });

        let err = slack(&server)
            .send(&CancellationToken::new(), "slack:general", "text")
            .await
            .unwrap_err();
        assert!(err.is_bad_response());
        assert!(err.to_string().contains("invalid_auth"));
    }

    #[tokio::test]
    async fn test_send_cancelled() {
        let server = MockServer::start();
        let list = server.mock(|when, then| {
            when.method(GET).path("/api/conversations.list");
            then.status(200).json_body(json!({"ok": true, "channels": []}));
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = slack(&server)
            .send(&cancel, "slack:general?title=test", "")
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        list.assert_calls(0);
    }

    #[test]
    fn test_new_requires_token() {
        assert!(matches!(
            Slack::new("", DEFAULT_API_BASE),
            Err(NotifyError::Config(_))
        ));
        let notifier = Slack::new("xoxb", "").unwrap();
        assert_eq!(notifier.api_base, DEFAULT_API_BASE);
        assert_eq!(notifier.describe(), "slack notifications destination");
    }
}
