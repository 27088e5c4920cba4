//! # Structured Logging Module
//!
//! Environment-aware structured logging for the bus. Subscriptions report
//! their lifecycle (connect, disconnect, reconnect, probe failure) through
//! [`log_subscription_event`] so a log pipeline can key on one event shape.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
///
/// `RUST_LOG` wins when set; otherwise the level follows `TASKER_ENV`.
/// `TASKER_BUS_LOG_FORMAT=json` switches the console output to JSON lines.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("TASKER_BUS_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("TASKER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Subscription lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    ProbeFailed,
    Closed,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::ProbeFailed => "probe_failed",
            Self::Closed => "closed",
        }
    }
}

/// Log a subscription lifecycle event
pub fn log_subscription_event(
    event: SubscriptionEvent,
    channel: &str,
    provider: &str,
    details: Option<&str>,
) {
    match event {
        SubscriptionEvent::Disconnected | SubscriptionEvent::ProbeFailed => tracing::warn!(
            event = event.as_str(),
            channel = %channel,
            provider = %provider,
            details = details,
            "SUBSCRIPTION_EVENT"
        ),
        _ => tracing::info!(
            event = event.as_str(),
            channel = %channel,
            provider = %provider,
            details = details,
            "SUBSCRIPTION_EVENT"
        ),
    }
}
