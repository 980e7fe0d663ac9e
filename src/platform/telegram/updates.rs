use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::{ParseMode, SendOptions};
use super::markup::escape_text;
use super::Telegram;

/// Command word a user sends to the bot to answer a link request.
pub const LINK_COMMAND: &str = "/start";

/// One inbound event from the bot API.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub text: String,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<Sender>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind == "private"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    result: Vec<Update>,
}

/// Decode a batch delivered in push mode: the fetch-updates envelope, a bare
/// array of events, or a single event as sent by a webhook.
pub(crate) fn decode_batch(raw: &str) -> Result<Vec<Update>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let is_envelope = value
        .as_object()
        .is_some_and(|fields| fields.contains_key("result"));
    if value.is_array() {
        serde_json::from_value(value)
    } else if is_envelope {
        serde_json::from_value::<BatchEnvelope>(value).map(|envelope| envelope.result)
    } else {
        serde_json::from_value::<Update>(value).map(|update| vec![update])
    }
}

/// Extract the token from a `/start <token>` message.
pub fn parse_link_command(text: &str) -> Option<&str> {
    let token = text.strip_prefix(LINK_COMMAND)?.strip_prefix(' ')?.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

impl Telegram {
    /// Confirm link requests answered in `updates` and advance `cursor` past
    /// the highest event seen. Returns how many requests were confirmed.
    pub(crate) async fn process_updates(
        &self,
        cancel: &CancellationToken,
        updates: &[Update],
        cursor: &mut i64,
    ) -> usize {
        let mut confirmed = 0;

        for update in updates {
            let Some(message) = &update.message else {
                continue;
            };
            if !message.chat.is_private() {
                continue;
            }
            let Some(token) = parse_link_command(&message.text) else {
                continue;
            };
            let Some(sender) = &message.from else {
                continue;
            };

            let telegram_id = sender.id.to_string();
            let Some(site) = self.requests.confirm(token, &telegram_id, Utc::now()) else {
                debug!("Ignoring link command for unknown or expired token");
                continue;
            };
            confirmed += 1;
            info!("Link request confirmed by telegram user {}", telegram_id);

            // The store lock is already released here.
            let ack = format!(
                "Success! Your account is linked, you can return to <b>{}</b> now.",
                escape_text(&site)
            );
            let options = SendOptions {
                parse_mode: Some(ParseMode::Html),
            };
            if let Err(e) = self
                .api
                .send_message(cancel, &message.chat.id.to_string(), &ack, &options)
                .await
            {
                warn!("Failed to acknowledge link request: {}", e);
            }
        }

        if let Some(highest) = updates.iter().map(|update| update.update_id).max() {
            *cursor = (*cursor).max(highest.saturating_add(1));
        }

        confirmed
    }
}
