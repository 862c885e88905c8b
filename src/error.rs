//! Huginn error types and failure classification.
//!
//! Every failure that passes through the cache, the retry executor or the
//! correlation monitor is reduced to an [`ErrorKind`]. Classification is
//! deterministic: an explicit backend error code wins, then the HTTP status,
//! then message substring patterns, and finally [`ErrorKind::Unknown`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Category of a failure, independent of its concrete type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Validation,
    NotFound,
    /// Conflicting write, including duplicate-key violations.
    Conflict,
    PermissionDenied,
    RateLimited,
    ServerInternal,
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::Validation,
        ErrorKind::NotFound,
        ErrorKind::Conflict,
        ErrorKind::PermissionDenied,
        ErrorKind::RateLimited,
        ErrorKind::ServerInternal,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerInternal => "server_internal",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether failures of this kind are worth retrying when no explicit
    /// retry policy says otherwise.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ServerInternal
        )
    }

    /// Default severity assigned to a failure of this kind.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict => Severity::Warning,
            ErrorKind::Connection
            | ErrorKind::Timeout
            | ErrorKind::RateLimited
            | ErrorKind::Unknown => Severity::Error,
            ErrorKind::PermissionDenied | ErrorKind::ServerInternal => Severity::Critical,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly a failure should be reported.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    #[default]
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        })
    }
}

/// Huginn error types
#[derive(Debug, thiserror::Error)]
pub enum HuginnError {
    // Data source errors
    /// A failure reported by the remote data service. `code` carries a
    /// backend-specific error code (e.g. a SQLSTATE such as `23505`).
    #[error("backend error{}: {message}", fmt_backend_tags(.code, .status))]
    Backend {
        code: Option<String>,
        status: Option<u16>,
        message: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Executor errors
    /// Final error of a retry executor invocation.
    #[error(transparent)]
    Retry(Box<RetryFailure>),

    /// A background task or listener panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

fn fmt_backend_tags(code: &Option<String>, status: &Option<u16>) -> String {
    match (code, status) {
        (Some(code), Some(status)) => format!(" ({status}, {code})"),
        (Some(code), None) => format!(" ({code})"),
        (None, Some(status)) => format!(" ({status})"),
        (None, None) => String::new(),
    }
}

/// The last error of a retry executor run, annotated with how the run ended.
#[derive(Debug, thiserror::Error)]
#[error("{source} [kind: {kind}, attempts: {attempts}{}]", exhausted_suffix(.retries_exhausted))]
pub struct RetryFailure {
    pub source: HuginnError,
    /// Classified kind of `source`.
    pub kind: ErrorKind,
    /// Number of times the operation was called.
    pub attempts: u32,
    /// Whether the policy considered this kind retryable.
    pub retriable: bool,
    /// True when the operation kept failing with a retryable error until
    /// the policy ran out of retries.
    pub retries_exhausted: bool,
}

fn exhausted_suffix(exhausted: &bool) -> &'static str {
    if *exhausted { ", retries exhausted" } else { "" }
}

impl HuginnError {
    /// Convenience constructor for a backend failure with a message only.
    pub fn backend(message: impl Into<String>) -> Self {
        HuginnError::Backend {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    /// Classify this error into an [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            HuginnError::Backend {
                code,
                status,
                message,
            } => code
                .as_deref()
                .and_then(kind_for_code)
                .or_else(|| status.and_then(kind_for_status))
                .unwrap_or_else(|| classify_message(message)),
            HuginnError::Connection(_) => ErrorKind::Connection,
            HuginnError::Timeout(_) => ErrorKind::Timeout,
            HuginnError::RateLimited { .. } => ErrorKind::RateLimited,
            HuginnError::Validation(_) => ErrorKind::Validation,
            HuginnError::NotFound(_) => ErrorKind::NotFound,
            HuginnError::Conflict(_) => ErrorKind::Conflict,
            HuginnError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            HuginnError::Retry(failure) => failure.kind,
            HuginnError::Panicked(_) | HuginnError::Configuration(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the caller could reasonably try again later.
    ///
    /// For executor errors this is the policy's verdict; otherwise the
    /// kind's default transience.
    pub fn is_retriable(&self) -> bool {
        match self {
            HuginnError::Retry(failure) => failure.retriable,
            other => other.kind().is_transient(),
        }
    }

    /// Whether a retry executor gave up after exhausting its retries.
    pub fn retries_exhausted(&self) -> bool {
        matches!(self, HuginnError::Retry(failure) if failure.retries_exhausted)
    }

    /// Number of attempts made, if this error came out of a retry executor.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            HuginnError::Retry(failure) => Some(failure.attempts),
            _ => None,
        }
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HuginnError::RateLimited { retry_after } => *retry_after,
            HuginnError::Retry(failure) => failure.source.retry_after(),
            _ => None,
        }
    }

    /// The innermost error, unwrapping executor annotations.
    pub fn root(&self) -> &HuginnError {
        match self {
            HuginnError::Retry(failure) => failure.source.root(),
            other => other,
        }
    }
}

/// Map a backend error code (SQLSTATE or REST-layer code) to a kind.
pub fn kind_for_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "23505" => ErrorKind::Conflict,
        "23502" | "23503" | "23514" | "22001" | "22P02" => ErrorKind::Validation,
        "42501" | "PGRST301" | "PGRST302" => ErrorKind::PermissionDenied,
        "PGRST116" => ErrorKind::NotFound,
        "57014" => ErrorKind::Timeout,
        "53300" => ErrorKind::RateLimited,
        _ if code.starts_with("08") => ErrorKind::Connection,
        "XX000" | "XX001" | "XX002" => ErrorKind::ServerInternal,
        _ => return None,
    };
    Some(kind)
}

/// Map an HTTP status code to a kind.
pub fn kind_for_status(status: u16) -> Option<ErrorKind> {
    let kind = match status {
        400 | 422 => ErrorKind::Validation,
        401 | 403 => ErrorKind::PermissionDenied,
        404 => ErrorKind::NotFound,
        408 | 504 => ErrorKind::Timeout,
        409 => ErrorKind::Conflict,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::ServerInternal,
        _ => return None,
    };
    Some(kind)
}

/// Ordered message patterns. Earlier entries win, so "connection timed out"
/// is a timeout and "violates unique constraint" is a conflict.
const MESSAGE_PATTERNS: &[(&str, ErrorKind)] = &[
    ("timed out", ErrorKind::Timeout),
    ("timeout", ErrorKind::Timeout),
    ("rate limit", ErrorKind::RateLimited),
    ("too many requests", ErrorKind::RateLimited),
    ("duplicate key", ErrorKind::Conflict),
    ("already exists", ErrorKind::Conflict),
    ("unique constraint", ErrorKind::Conflict),
    ("permission denied", ErrorKind::PermissionDenied),
    ("unauthorized", ErrorKind::PermissionDenied),
    ("forbidden", ErrorKind::PermissionDenied),
    ("row-level security", ErrorKind::PermissionDenied),
    ("not found", ErrorKind::NotFound),
    ("no rows", ErrorKind::NotFound),
    ("connection", ErrorKind::Connection),
    ("network", ErrorKind::Connection),
    ("fetch failed", ErrorKind::Connection),
    ("econnrefused", ErrorKind::Connection),
    ("econnreset", ErrorKind::Connection),
    ("validation", ErrorKind::Validation),
    ("invalid", ErrorKind::Validation),
    ("violates", ErrorKind::Validation),
    ("internal server error", ErrorKind::ServerInternal),
    ("internal error", ErrorKind::ServerInternal),
];

/// Classify a free-form error message by substring patterns.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_beats_status_and_message() {
        let err = HuginnError::Backend {
            code: Some("23505".into()),
            status: Some(400),
            message: "request timed out".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn status_beats_message() {
        let err = HuginnError::Backend {
            code: None,
            status: Some(404),
            message: "connection reset".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unknown_code_falls_through_to_status() {
        let err = HuginnError::Backend {
            code: Some("ZZ999".into()),
            status: Some(503),
            message: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::ServerInternal);
    }

    #[test]
    fn message_pattern_precedence() {
        assert_eq!(classify_message("Connection timed out"), ErrorKind::Timeout);
        assert_eq!(
            classify_message("duplicate key value violates unique constraint"),
            ErrorKind::Conflict
        );
        assert_eq!(classify_message("TypeError: fetch failed"), ErrorKind::Connection);
        assert_eq!(classify_message("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn connection_class_codes() {
        assert_eq!(kind_for_code("08006"), Some(ErrorKind::Connection));
        assert_eq!(kind_for_code("08001"), Some(ErrorKind::Connection));
    }

    #[test]
    fn backend_display_includes_tags() {
        let err = HuginnError::Backend {
            code: Some("42501".into()),
            status: Some(403),
            message: "nope".into(),
        };
        assert_eq!(err.to_string(), "backend error (403, 42501): nope");
        assert_eq!(HuginnError::backend("boom").to_string(), "backend error: boom");
    }
}
