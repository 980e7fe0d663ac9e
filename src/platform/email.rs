//! SMTP notifier for `mailto:` destinations, built on `lettre`.
//!
//! Destinations look like `mailto:joe@example.org?subject=Hello&from=bot@example.org`.
//! The `from` parameter overrides the configured sender.

use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::platform::{parse_destination, query_value, Notifier, NotifyError};

pub const SCHEME: &str = "mailto";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct SmtpParams {
    pub host: String,
    pub port: u16,
    /// Implicit TLS from the first byte.
    pub tls: bool,
    /// Upgrade a plain connection with STARTTLS.
    pub starttls: bool,
    pub username: String,
    pub password: String,
    /// Zero means [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Sender used when the destination has no `from` parameter.
    pub from: String,
}

pub struct Email {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
    username: String,
    from: Option<Mailbox>,
}

impl Email {
    pub fn new(params: SmtpParams) -> Result<Self, NotifyError> {
        if params.host.is_empty() {
            return Err(NotifyError::Config("smtp host is required".to_string()));
        }
        let timeout = if params.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            params.timeout
        };
        let from = if params.from.is_empty() {
            None
        } else {
            Some(parse_mailbox(&params.from).map_err(NotifyError::Config)?)
        };

        let mut builder = if params.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&params.host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
        } else if params.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&params.host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&params.host)
        };
        builder = builder.port(params.port).timeout(Some(timeout));
        if !params.username.is_empty() && !params.password.is_empty() {
            builder = builder.credentials(Credentials::new(
                params.username.clone(),
                params.password.clone(),
            ));
        }

        debug!(
            "Created email notifier for server {}:{} with user {}, timeout={:?}",
            params.host, params.port, params.username, timeout
        );
        Ok(Self {
            transport: builder.build(),
            host: params.host,
            port: params.port,
            username: params.username,
            from,
        })
    }

    fn message(&self, destination: &str, text: &str) -> Result<Message, NotifyError> {
        let (to, query) = parse_destination(destination, SCHEME)?;
        let to = parse_mailbox(&to).map_err(NotifyError::Destination)?;
        let from = match query_value(&query, "from") {
            Some(from) => parse_mailbox(from).map_err(NotifyError::Destination)?,
            None => self.from.clone().ok_or_else(|| {
                NotifyError::Destination("no from address in destination or config".to_string())
            })?,
        };

        let mut message = Message::builder().from(from).to(to);
        if let Some(subject) = query_value(&query, "subject") {
            message = message.subject(subject);
        }
        message
            .body(text.to_string())
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, String> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| format!("bad address {:?}: {}", address, e))
}

#[async_trait]
impl Notifier for Email {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn describe(&self) -> String {
        format!(
            "email: with username '{}' at server {}:{}",
            self.username, self.host, self.port
        )
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        destination: &str,
        text: &str,
    ) -> Result<(), NotifyError> {
        let message = self.message(destination, text)?;
        if cancel.is_cancelled() {
            return Err(NotifyError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotifyError::Cancelled),
            result = self.transport.send(message) => {
                result.map_err(|e| NotifyError::Smtp(e.to_string()))?;
                info!("Email delivered via {}:{}", self.host, self.port);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SmtpParams {
        SmtpParams {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "user".to_string(),
            password: "secret".to_string(),
            timeout: Duration::from_secs(1),
            from: "bot@example.org".to_string(),
            ..SmtpParams::default()
        }
    }

    #[test]
    fn test_describe() {
        let email = Email::new(params()).unwrap();
        assert_eq!(
            email.describe(),
            "email: with username 'user' at server 127.0.0.1:1"
        );
        assert_eq!(email.scheme(), "mailto");
    }

    #[test]
    fn test_new_validates_config() {
        assert!(matches!(
            Email::new(SmtpParams::default()),
            Err(NotifyError::Config(_))
        ));
        assert!(matches!(
            Email::new(SmtpParams {
                from: "not-an-address".to_string(),
                ..params()
            }),
            Err(NotifyError::Config(_))
        ));
        assert!(Email::new(SmtpParams {
            tls: true,
            ..params()
        })
        .is_ok());
        assert!(Email::new(SmtpParams {
            starttls: true,
            ..params()
        })
        .is_ok());
    }

    #[test]
    fn test_message_headers() {
        let email = Email::new(params()).unwrap();
        let message = email
            .message(
                "mailto:joe@example.org?subject=Hello&from=alerts@example.org",
                "body text",
            )
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("To: joe@example.org"), "{}", raw);
        assert!(raw.contains("From: alerts@example.org"), "{}", raw);
        assert!(raw.contains("Subject: Hello"), "{}", raw);
        assert!(raw.contains("body text"), "{}", raw);

        let raw = String::from_utf8(
            email
                .message("mailto:joe@example.org", "x")
                .unwrap()
                .formatted(),
        )
        .unwrap();
        assert!(raw.contains("From: bot@example.org"), "{}", raw);
    }

    #[test]
    fn test_message_destination_errors() {
        let email = Email::new(params()).unwrap();
        assert!(matches!(
            email.message("mailto:not-an-address", "x"),
            Err(NotifyError::Destination(_))
        ));
        assert!(matches!(
            email.message("telegram:123", "x"),
            Err(NotifyError::Destination(_))
        ));

        let no_sender = Email::new(SmtpParams {
            from: String::new(),
            ..params()
        })
        .unwrap();
        assert!(matches!(
            no_sender.message("mailto:joe@example.org", "x"),
            Err(NotifyError::Destination(_))
        ));
    }

    #[tokio::test]
    async fn test_send_cancelled() {
        let email = Email::new(params()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = email
            .send(&cancel, "mailto:joe@example.org", "x")
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_connection_refused() {
        let email = Email::new(params()).unwrap();
        let err = email
            .send(&CancellationToken::new(), "mailto:joe@example.org", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Smtp(_)));
    }
}
