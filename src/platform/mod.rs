pub mod email;
pub mod error;
pub mod slack;
pub mod telegram;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use error::{BadResponse, NotifyError};

/// A notification backend (Telegram, email, webhook, Slack).
///
/// Every backend answers to one destination scheme and delivers a text body
/// to the target encoded in the rest of the destination.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Destination prefix this notifier answers to (e.g. "telegram")
    fn scheme(&self) -> &str;

    /// Human-readable description of the instance
    fn describe(&self) -> String;

    /// Deliver `text` to `destination`.
    async fn send(
        &self,
        cancel: &CancellationToken,
        destination: &str,
        text: &str,
    ) -> Result<(), NotifyError>;

    /// Description and scheme in one call
    fn identify(&self) -> (String, &str) {
        (self.describe(), self.scheme())
    }
}

/// Route `text` to the first notifier whose scheme prefixes `destination`.
pub async fn send(
    cancel: &CancellationToken,
    notifiers: &[Arc<dyn Notifier>],
    destination: &str,
    text: &str,
) -> Result<(), NotifyError> {
    for notifier in notifiers {
        if destination.starts_with(notifier.scheme()) {
            debug!("Routing destination to {}", notifier.describe());
            return notifier.send(cancel, destination, text).await;
        }
    }

    let scheme = destination
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .unwrap_or(destination);
    Err(NotifyError::UnsupportedScheme(scheme.to_string()))
}

/// Split `scheme:target?query` into the target and decoded query pairs,
/// rejecting any scheme other than `expected`.
pub(crate) fn parse_destination(
    destination: &str,
    expected: &str,
) -> Result<(String, Vec<(String, String)>), NotifyError> {
    let scheme = destination
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .unwrap_or("");
    if scheme != expected {
        return Err(NotifyError::Destination(format!(
            "unsupported scheme {}, should be {}",
            scheme, expected
        )));
    }

    let url = reqwest::Url::parse(destination)
        .map_err(|e| NotifyError::Destination(format!("parse {:?}: {}", destination, e)))?;
    let target = url.path().to_string();
    if target.is_empty() {
        return Err(NotifyError::Destination(format!(
            "empty target in {:?}",
            destination
        )));
    }

    let query = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    Ok((target, query))
}

/// Look up a query parameter returned by [`parse_destination`].
pub(crate) fn query_value<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}
