//! Provider error taxonomy and classification.
//!
//! Upstream failures are classified from the HTTP status when available,
//! falling back to message text. The classification drives three distinct
//! decisions downstream: whether to retry at all, whether to rotate to
//! another profile, and how long to cool the failing profile down.

use std::time::Duration;

use thiserror::Error;

/// What an upstream failure signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401/403 — credentials rejected.
    Auth,
    /// 429 / "reset after Ns".
    RateLimit,
    /// Deadline or 408/504.
    Timeout,
    /// 402 / quota exhausted — operator action required.
    Billing,
    /// The request exceeded the model's context window.
    ContextOverflow,
    /// Upstream 5xx.
    ServerError,
    /// Connection refused/reset, DNS, EOF.
    NetworkError,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Whether the retry policy may re-attempt this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::NetworkError
                | ErrorKind::ContextOverflow
        )
    }
}

/// A classified provider failure.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// The HTTP status, when the failure came off the wire.
    pub status: Option<u16>,
}

impl ProviderError {
    /// Build an error with an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProviderError {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Classify from status and/or body text.
    pub fn classify(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = status
            .and_then(classify_status)
            .unwrap_or_else(|| classify_message(&message));
        ProviderError {
            kind,
            message,
            status,
        }
    }

    /// Whether the retry policy may re-attempt this error.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Map an HTTP status to an error kind, when the status is decisive.
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::Auth),
        402 => Some(ErrorKind::Billing),
        408 | 504 => Some(ErrorKind::Timeout),
        413 => Some(ErrorKind::ContextOverflow),
        429 => Some(ErrorKind::RateLimit),
        500..=503 | 505..=599 => Some(ErrorKind::ServerError),
        _ => None,
    }
}

/// Classify from message text when no decisive status is present.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("context_length_exceeded")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long")
    {
        return ErrorKind::ContextOverflow;
    }
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("reset after")
    {
        return ErrorKind::RateLimit;
    }
    if lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
        || lower.contains("forbidden")
    {
        return ErrorKind::Auth;
    }
    if lower.contains("quota")
        || lower.contains("billing")
        || lower.contains("payment")
        || lower.contains("insufficient credit")
    {
        return ErrorKind::Billing;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        return ErrorKind::Timeout;
    }
    if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("reset by peer")
        || lower.contains("dns")
        || lower.contains("unexpected eof")
        || lower.contains("broken pipe")
        || lower.contains("network")
    {
        return ErrorKind::NetworkError;
    }
    if lower.contains("internal server")
        || lower.contains("bad gateway")
        || lower.contains("service unavailable")
        || lower.contains("overloaded")
    {
        return ErrorKind::ServerError;
    }

    ErrorKind::Unknown
}

/// Extract an upstream retry hint ("reset after 3s", "retry after 30")
/// from rate-limit error text. Returns the raw hinted duration.
pub fn parse_rate_limit_hint(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    for marker in ["reset after", "retry after", "retry-after:", "try again in"] {
        if let Some(pos) = lower.find(marker) {
            let rest = &lower[pos + marker.len()..];
            let digits: String = rest
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(secs) = digits.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
        }
    }
    None
}

/// Clamp a rate-limit wait to the default band the orchestrator sleeps in.
pub fn clamp_rate_limit_wait(hint: Option<Duration>) -> Duration {
    const MIN: Duration = Duration::from_secs(30);
    const MAX: Duration = Duration::from_secs(60);
    match hint {
        Some(d) => d.clamp(MIN, MAX),
        None => MIN,
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(401), Some(ErrorKind::Auth));
        assert_eq!(classify_status(403), Some(ErrorKind::Auth));
        assert_eq!(classify_status(402), Some(ErrorKind::Billing));
        assert_eq!(classify_status(429), Some(ErrorKind::RateLimit));
        assert_eq!(classify_status(504), Some(ErrorKind::Timeout));
        assert_eq!(classify_status(413), Some(ErrorKind::ContextOverflow));
        assert_eq!(classify_status(500), Some(ErrorKind::ServerError));
        assert_eq!(classify_status(503), Some(ErrorKind::ServerError));
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(404), None);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify_message("This model's maximum context length is 128000 tokens"),
            ErrorKind::ContextOverflow
        );
        assert_eq!(
            classify_message("Rate limit exceeded, reset after 3s"),
            ErrorKind::RateLimit
        );
        assert_eq!(classify_message("Invalid API key provided"), ErrorKind::Auth);
        assert_eq!(
            classify_message("You exceeded your current quota"),
            ErrorKind::Billing
        );
        assert_eq!(classify_message("request timed out"), ErrorKind::Timeout);
        assert_eq!(
            classify_message("connection refused (os error 111)"),
            ErrorKind::NetworkError
        );
        assert_eq!(
            classify_message("upstream returned bad gateway"),
            ErrorKind::ServerError
        );
        assert_eq!(classify_message("something odd happened"), ErrorKind::Unknown);
    }

    #[test]
    fn test_status_takes_precedence_over_message() {
        // A 401 whose body mentions "rate limit" is still an auth failure.
        let err = ProviderError::classify(Some(401), "rate limit something");
        assert_eq!(err.kind, ErrorKind::Auth);
    }

    #[test]
    fn test_undecisive_status_falls_back_to_message() {
        let err = ProviderError::classify(Some(400), "maximum context length exceeded");
        assert_eq!(err.kind, ErrorKind::ContextOverflow);
    }

    #[test]
    fn test_retryable_partition() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::RateLimit,
            ErrorKind::ServerError,
            ErrorKind::NetworkError,
            ErrorKind::ContextOverflow,
        ] {
            assert!(kind.is_retryable(), "{kind:?} should be retryable");
        }
        for kind in [ErrorKind::Auth, ErrorKind::Billing] {
            assert!(!kind.is_retryable(), "{kind:?} should not be retryable");
        }
    }

    #[test]
    fn test_parse_rate_limit_hint() {
        assert_eq!(
            parse_rate_limit_hint("Rate limit reached, reset after 3s"),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            parse_rate_limit_hint("429 Too Many Requests. Retry after 45 seconds"),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            parse_rate_limit_hint("please try again in 12s"),
            Some(Duration::from_secs(12))
        );
        assert_eq!(parse_rate_limit_hint("no hint here"), None);
    }

    #[test]
    fn test_clamp_rate_limit_wait() {
        assert_eq!(
            clamp_rate_limit_wait(Some(Duration::from_secs(3))),
            Duration::from_secs(30)
        );
        assert_eq!(
            clamp_rate_limit_wait(Some(Duration::from_secs(45))),
            Duration::from_secs(45)
        );
        assert_eq!(
            clamp_rate_limit_wait(Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
        assert_eq!(clamp_rate_limit_wait(None), Duration::from_secs(30));
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::classify(Some(429), "Rate limit exceeded");
        assert_eq!(err.to_string(), "Rate limit exceeded");
        assert_eq!(err.status, Some(429));
    }
}
