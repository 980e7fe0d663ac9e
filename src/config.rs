use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::platform::email::SmtpParams;
use crate::platform::telegram::TelegramParams;
use crate::platform::webhook::WebhookParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: Option<TelegramConfig>,
    pub webhook: Option<WebhookConfig>,
    pub email: Option<EmailConfig>,
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_telegram_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// When set, updates are pushed to this address instead of polled.
    #[serde(default)]
    pub webhook_listen: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
    /// Extra headers as "Name: value"
    #[serde(default)]
    pub headers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_email_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub from: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    pub token: String,
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
}

fn default_api_prefix() -> String {
    "https://api.telegram.org/bot".to_string()
}

fn default_telegram_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_smtp_port() -> u16 {
    25
}

fn default_email_timeout() -> u64 {
    10
}

fn default_slack_api_base() -> String {
    "https://slack.com/api/".to_string()
}

impl TelegramConfig {
    pub fn params(&self) -> TelegramParams {
        TelegramParams {
            token: self.bot_token.clone(),
            api_prefix: self.api_prefix.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

impl WebhookConfig {
    pub fn params(&self) -> WebhookParams {
        WebhookParams {
            timeout: Duration::from_secs(self.timeout_secs),
            headers: self.headers.clone(),
        }
    }
}

impl EmailConfig {
    pub fn params(&self) -> SmtpParams {
        SmtpParams {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls,
            starttls: self.starttls,
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            from: self.from.clone(),
        }
    }
}

/// Replace a whole-value `${VAR}` reference with the variable's content.
fn resolve_env(value: &mut String) -> Result<()> {
    let Some(name) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(());
    };
    let resolved = std::env::var(name)
        .with_context(|| format!("Environment variable {} is not set", name))?;
    *value = resolved;
    Ok(())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(telegram) = config.telegram.as_mut() {
            resolve_env(&mut telegram.bot_token)?;
            if telegram.poll_interval_secs == 0 || telegram.sweep_interval_secs == 0 {
                bail!(
                    "[telegram] poll_interval_secs and sweep_interval_secs must be positive in {}",
                    path.display()
                );
            }
        }
        if let Some(email) = config.email.as_mut() {
            resolve_env(&mut email.password)?;
        }
        if let Some(slack) = config.slack.as_mut() {
            resolve_env(&mut slack.token)?;
        }

        if config.telegram.is_none()
            && config.webhook.is_none()
            && config.email.is_none()
            && config.slack.is_none()
        {
            bail!("No notifier configured in {}", path.display());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_applies_defaults() {
        let file = write_config(
            r#"
[telegram]
bot_token = "123:abc"

[webhook]
"#,
        );
        let config = Config::load(file.path()).unwrap();
        let telegram = config.telegram.unwrap();
        assert_eq!(telegram.api_prefix, "https://api.telegram.org/bot");
        assert_eq!(telegram.timeout_secs, 5);
        assert_eq!(telegram.poll_interval_secs, 5);
        assert_eq!(telegram.sweep_interval_secs, 60);
        assert!(telegram.webhook_listen.is_none());

        let params = telegram.params();
        assert_eq!(params.token, "123:abc");
        assert_eq!(params.sweep_interval, Duration::from_secs(60));

        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.timeout_secs, 5);
        assert!(webhook.headers.is_empty());
        assert!(config.email.is_none());
        assert!(config.slack.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
[telegram]
bot_token = "123:abc"
api_prefix = "http://localhost:8081/bot"
poll_interval_secs = 1
webhook_listen = "127.0.0.1:8080"

[webhook]
timeout_secs = 3
headers = ["Authorization: Bearer x"]

[email]
host = "smtp.example.org"
port = 465
tls = true
username = "bot"
password = "pass"
from = "bot@example.org"

[slack]
token = "xoxb-1"
"#,
        );
        let config = Config::load(file.path()).unwrap();
        let telegram = config.telegram.unwrap();
        assert_eq!(telegram.api_prefix, "http://localhost:8081/bot");
        assert_eq!(
            telegram.webhook_listen,
            Some("127.0.0.1:8080".parse().unwrap())
        );

        let email = config.email.unwrap().params();
        assert_eq!(email.port, 465);
        assert!(email.tls);
        assert!(!email.starttls);
        assert_eq!(email.timeout, Duration::from_secs(10));

        assert_eq!(config.webhook.unwrap().params().headers.len(), 1);
        assert_eq!(config.slack.unwrap().api_base, "https://slack.com/api/");
    }

    #[test]
    fn test_load_resolves_env_tokens() {
        std::env::set_var("NOTIFYBOT_TEST_TOKEN", "from-env");
        let file = write_config(
            r#"
[telegram]
bot_token = "${NOTIFYBOT_TEST_TOKEN}"
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.telegram.unwrap().bot_token, "from-env");

        let file = write_config(
            r#"
[slack]
token = "${NOTIFYBOT_TEST_MISSING_VAR}"
"#,
        );
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("NOTIFYBOT_TEST_MISSING_VAR"));
    }

    #[test]
    fn test_load_rejects_zero_intervals() {
        for field in ["poll_interval_secs", "sweep_interval_secs"] {
            let file = write_config(&format!(
                "[telegram]\nbot_token = \"123:abc\"\n{} = 0\n",
                field
            ));
            let err = Config::load(file.path()).unwrap_err();
            assert!(err.to_string().contains("must be positive"), "{}", err);
        }
    }

    #[test]
    fn test_load_requires_a_notifier() {
        let file = write_config("");
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("No notifier configured"));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/notifybot.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
