use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::platform::{BadResponse, Notifier, NotifyError};

pub const SCHEME: &str = "http";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct WebhookParams {
    /// Zero means [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Extra request headers as `"Name: value"` lines.
    pub headers: Vec<String>,
}

/// Delivers notifications as a plain-text POST to `http(s)://` destinations.
pub struct Webhook {
    http: reqwest::Client,
    headers: HeaderMap,
}

impl Webhook {
    pub fn new(params: WebhookParams) -> Result<Self, NotifyError> {
        let timeout = if params.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            params.timeout
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to build http client: {}", e)))?;

        debug!("Created webhook notifier with timeout {:?}", timeout);
        Ok(Self {
            http,
            headers: parse_headers(&params.headers),
        })
    }
}

/// Turn `"Name: value"` lines into a header map, skipping malformed lines.
fn parse_headers(lines: &[String]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            warn!("Skipping malformed webhook header line");
            continue;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping invalid webhook header {:?}", name.trim()),
        }
    }
    headers
}

#[async_trait]
impl Notifier for Webhook {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn describe(&self) -> String {
        "webhook notifications destination".to_string()
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        destination: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        let url = reqwest::Url::parse(destination)
            .map_err(|e| NotifyError::Destination(format!("parse {:?}: {}", destination, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(NotifyError::Destination(format!(
                "unsupported scheme {}, should be http or https",
                url.scheme()
            )));
        }
        if cancel.is_cancelled() {
            return Err(NotifyError::Cancelled);
        }

        let request = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .body(text.to_string());

        let call = async {
            let response = request.send().await.map_err(NotifyError::Unreachable)?;
            let status = response.status();
            if status != reqwest::StatusCode::OK {
                let body = response.text().await.unwrap_or_default();
                return Err(NotifyError::from(BadResponse::Status {
                    status: status.as_u16(),
                    description: Some(body).filter(|body| !body.is_empty()),
                }));
            }
            Ok(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotifyError::Cancelled),
            result = call => result,
        }
    }
}
