use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::{extract::State, http::StatusCode, routing::post, Router};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notifybot::config::Config;
use notifybot::platform::{
    self, email::Email, slack::Slack, telegram::Telegram, webhook::Webhook, Notifier, NotifyError,
};

// ── Notifier assembly ──────────────────────────────────────────────────────────

struct Notifiers {
    all: Vec<Arc<dyn Notifier>>,
    telegram: Option<Arc<Telegram>>,
}

async fn build_notifiers(config: &Config) -> Result<Notifiers> {
    let mut all: Vec<Arc<dyn Notifier>> = Vec::new();

    let telegram = match &config.telegram {
        Some(tg) => {
            let telegram = Arc::new(
                Telegram::new(tg.params())
                    .await
                    .context("Failed to initialize telegram notifier")?,
            );
            all.push(telegram.clone());
            Some(telegram)
        }
        None => None,
    };
    if let Some(slack) = &config.slack {
        let slack = Slack::new(&slack.token, &slack.api_base)
            .context("Failed to initialize slack notifier")?;
        all.push(Arc::new(slack));
    }
    if let Some(email) = &config.email {
        let email = Email::new(email.params()).context("Failed to initialize email notifier")?;
        all.push(Arc::new(email));
    }
    if let Some(webhook) = &config.webhook {
        let webhook =
            Webhook::new(webhook.params()).context("Failed to initialize webhook notifier")?;
        all.push(Arc::new(webhook));
    }

    for notifier in &all {
        let (description, scheme) = notifier.identify();
        info!("  {}: {}", scheme, description);
    }
    Ok(Notifiers { all, telegram })
}

// ── Push endpoint ──────────────────────────────────────────────────────────────

async fn push_update(State(telegram): State<Arc<Telegram>>, body: String) -> StatusCode {
    match telegram
        .process_update(&CancellationToken::new(), &body)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(NotifyError::InvalidUpdate(e)) => {
            warn!("Rejected pushed update: {}", e);
            StatusCode::BAD_REQUEST
        }
        Err(NotifyError::ModeConflict) => StatusCode::CONFLICT,
        Err(e) => {
            warn!("Failed to process pushed update: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn push_router(telegram: Arc<Telegram>) -> Router {
    Router::new()
        .route("/telegram/updates", post(push_update))
        .with_state(telegram)
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,notifybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Usage: notifybot [config.toml] [send <destination> <text>]
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let notifiers = build_notifiers(&config).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            cancel.cancel();
        }
    });

    if args.get(1).map(String::as_str) == Some("send") {
        let (Some(destination), Some(text)) = (args.get(2), args.get(3)) else {
            bail!("Usage: notifybot <config> send <destination> <text>");
        };
        platform::send(&cancel, &notifiers.all, destination, text)
            .await
            .with_context(|| format!("Failed to send notification to {}", destination))?;
        info!("Notification sent to {}", destination);
        return Ok(());
    }

    let (Some(telegram), Some(tg_config)) = (notifiers.telegram, &config.telegram) else {
        bail!("Daemon mode requires a [telegram] section");
    };

    match tg_config.webhook_listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind to {addr}"))?;
            info!("Accepting pushed telegram updates on http://{addr}/telegram/updates");

            axum::serve(listener, push_router(telegram))
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .context("Server error")?;
        }
        None => {
            telegram
                .run(cancel)
                .await
                .context("Telegram poll loop failed")?;
        }
    }

    info!("Stopped");
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
