//! Cart configuration

use std::time::Duration;

use clap::{Args, Parser};

/// Default grace window before a removal is sent to the remote cart.
pub const DEFAULT_UNDO_GRACE_MS: u64 = 5_000;

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Compact, human-readable logs.
    Compact,

    /// Structured JSON logs.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Args)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Log format (compact, json)
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Storefront cart configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "storefront-cart", about = "Storefront cart client", long_about = None)]
pub struct CartConfig {
    /// Base URL of the remote cart API
    #[arg(long = "api-url", env = "CART_API_URL")]
    pub api_url: String,

    /// Bearer token sent with every cart request
    #[arg(long, env = "CART_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Grace window, in milliseconds, during which a removal can be undone
    #[arg(long, env = "CART_UNDO_GRACE_MS", default_value_t = DEFAULT_UNDO_GRACE_MS)]
    pub undo_grace_ms: u64,

    /// Remote request timeout in seconds
    #[arg(long, env = "CART_REQUEST_TIMEOUT_SECS", default_value_t = 10_u64)]
    pub request_timeout_secs: u64,

    /// Logging output settings.
    #[command(flatten)]
    pub logging: LoggingConfig,
}

impl CartConfig {
    /// Load configuration from environment and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be parsed
    pub fn load() -> Result<Self, clap::Error> {
        // Load .env file if present (ignore if missing)
        _ = dotenvy::dotenv();

        Self::try_parse()
    }

    /// The undo grace window.
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.undo_grace_ms)
    }

    /// Timeout applied to each remote request.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The API base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }
}
