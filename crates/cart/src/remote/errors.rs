//! Remote cart errors and their classification.
//!
//! Error bodies from the cart API are not uniformly shaped. [`RemoteFailure`]
//! captures the three signals that matter (status, message, available stock)
//! and [`classify`] folds them into the closed [`CartErrorKind`] taxonomy.
//! Nothing past this module looks at raw payloads.

use std::fmt::{Display, Formatter, Result as FmtResult};

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

const NOT_FOUND_PHRASES: &[&str] = &[
    "not found",
    "no longer exists",
    "does not exist",
    "not in cart",
];

const OUT_OF_STOCK_PHRASES: &[&str] = &["out of stock", "sold out"];

const CONFLICT_PHRASES: &[&str] = &["conflict", "modified", "stale", "version mismatch"];

const STOCK_FIELDS: &[&str] = &["availableStock", "available_stock", "stock", "available"];

const NESTED_FIELDS: &[&str] = &["data", "details", "error"];

/// Errors that can occur when talking to the remote cart.
#[derive(Debug, Error)]
pub enum CartApiError {
    /// Transport failure, or the HTTP client could not be built.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body did not have the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The remote cart refused the request.
    #[error("request rejected: {0}")]
    Rejected(RemoteFailure),
}

/// The loosely-typed pieces of a rejected request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFailure {
    /// HTTP status, when the failure came with one.
    pub status: Option<u16>,
    /// Human-readable message found in the body.
    pub message: Option<String>,
    /// Units still in stock, when the body reports them.
    pub available_stock: Option<u32>,
}

impl RemoteFailure {
    /// Pull the known signals out of an arbitrary error body.
    pub fn from_body(status: Option<u16>, body: &Value) -> Self {
        Self {
            status,
            message: find_message(body),
            available_stock: find_stock(body),
        }
    }

    /// A failure described by status code alone.
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A failure described by message alone.
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Classify into a [`CartErrorKind`].
    ///
    /// Not-found wins over everything: clamping a line that no longer exists is
    /// meaningless. An explicit stock figure comes next, then conflict signals.
    pub fn kind(&self) -> CartErrorKind {
        if self.status == Some(StatusCode::NOT_FOUND.as_u16())
            || self.message_mentions(NOT_FOUND_PHRASES)
        {
            return CartErrorKind::NotFound;
        }

        if let Some(available) = self.available_stock {
            return CartErrorKind::InsufficientStock { available };
        }

        if self.message_mentions(OUT_OF_STOCK_PHRASES) {
            return CartErrorKind::InsufficientStock { available: 0 };
        }

        if matches!(self.status, Some(409 | 412)) || self.message_mentions(CONFLICT_PHRASES) {
            return CartErrorKind::Conflict;
        }

        CartErrorKind::Unknown
    }

    fn message_mentions(&self, phrases: &[&str]) -> bool {
        self.message.as_deref().is_some_and(|message| {
            let message = message.to_lowercase();

            phrases.iter().any(|phrase| message.contains(phrase))
        })
    }
}

impl Display for RemoteFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match (self.status, self.message.as_deref()) {
            (Some(status), Some(message)) => write!(f, "status {status}: {message}"),
            (Some(status), None) => write!(f, "status {status}"),
            (None, Some(message)) => f.write_str(message),
            (None, None) => f.write_str("no details"),
        }?;

        if let Some(available) = self.available_stock {
            write!(f, " (available stock {available})")?;
        }

        Ok(())
    }
}

/// Why the remote cart disagreed with a local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartErrorKind {
    /// The line item is gone remotely.
    NotFound,

    /// Only `available` units can be had.
    InsufficientStock {
        /// Units still in stock.
        available: u32,
    },

    /// The local copy is stale relative to the remote cart.
    Conflict,

    /// Anything else, network failures included.
    Unknown,
}

/// Classify any remote error.
pub fn classify(error: &CartApiError) -> CartErrorKind {
    match error {
        CartApiError::Rejected(failure) => failure.kind(),
        CartApiError::Http(source) => source
            .status()
            .map_or(CartErrorKind::Unknown, |status| {
                RemoteFailure::with_status(status.as_u16()).kind()
            }),
        CartApiError::Decode(_) => CartErrorKind::Unknown,
    }
}

fn find_message(body: &Value) -> Option<String> {
    match body {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Object(map) => ["message", "error", "detail"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|value| match value {
                Value::String(text) => Some(text.clone()),
                Value::Object(_) => find_message(value),
                _ => None,
            }),
        _ => None,
    }
}

fn find_stock(body: &Value) -> Option<u32> {
    let Value::Object(map) = body else {
        return None;
    };

    STOCK_FIELDS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(Value::as_u64)
        .map(|stock| u32::try_from(stock).unwrap_or(u32::MAX))
        .or_else(|| {
            NESTED_FIELDS
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(find_stock)
        })
}
