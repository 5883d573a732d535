//! Client-visible gateway errors.

use crate::{limit::QuotaScope, upstream::UpstreamError};
use thiserror::Error;

/// Everything the gateway reports to a client, each with a stable kind
/// string and an HTTP status.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing X-API-Key header")]
    MissingApiKey,

    #[error("unknown, disabled or revoked API key")]
    InvalidApiKey,

    #[error("no active route matches")]
    NoRoute,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("{} quota exhausted", scope.as_str())]
    QuotaExceeded { scope: QuotaScope, retry_after_seconds: u64 },

    #[error("temporarily blocked: {reason}")]
    AbuseBlocked { reason: String, retry_after_seconds: u64 },

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in error bodies and request logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "missing_api_key",
            Self::InvalidApiKey => "invalid_api_key",
            Self::NoRoute => "no_route",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::AbuseBlocked { .. } => "abuse_blocked",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal",
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => 401,
            Self::NoRoute => 404,
            Self::RateLimited { .. } | Self::QuotaExceeded { .. } | Self::AbuseBlocked { .. } => {
                429
            }
            Self::UpstreamTimeout => 504,
            Self::Upstream(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// `Retry-After` value for denials that carry one.
    #[must_use]
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds }
            | Self::QuotaExceeded { retry_after_seconds, .. }
            | Self::AbuseBlocked { retry_after_seconds, .. } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Human-readable detail included in the error body, where one adds
    /// anything beyond the kind.
    #[must_use]
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::QuotaExceeded { scope, .. } => Some(format!("{} quota exhausted", scope.as_str())),
            Self::AbuseBlocked { reason, .. } => Some(format!("temporarily blocked: {reason}")),
            Self::Upstream(msg) | Self::Internal(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::Timeout => Self::UpstreamTimeout,
            UpstreamError::Connect(msg) | UpstreamError::Protocol(msg) => Self::Upstream(msg),
            UpstreamError::InvalidRequest(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_mapping() {
        let cases: Vec<(GatewayError, &str, u16)> = vec![
            (GatewayError::MissingApiKey, "missing_api_key", 401),
            (GatewayError::InvalidApiKey, "invalid_api_key", 401),
            (GatewayError::NoRoute, "no_route", 404),
            (GatewayError::RateLimited { retry_after_seconds: 2 }, "rate_limited", 429),
            (
                GatewayError::QuotaExceeded {
                    scope: QuotaScope::Daily,
                    retry_after_seconds: 60,
                },
                "quota_exceeded",
                429,
            ),
            (
                GatewayError::AbuseBlocked {
                    reason: "rate_spike".to_string(),
                    retry_after_seconds: 300,
                },
                "abuse_blocked",
                429,
            ),
            (GatewayError::UpstreamTimeout, "upstream_timeout", 504),
            (GatewayError::Upstream("boom".to_string()), "upstream_error", 502),
            (GatewayError::Internal("bug".to_string()), "internal", 500),
        ];

        for (error, kind, status) in cases {
            assert_eq!(error.kind(), kind);
            assert_eq!(error.http_status(), status);
        }
    }

    #[test]
    fn test_retry_after_only_on_denials() {
        assert_eq!(
            GatewayError::RateLimited { retry_after_seconds: 3 }.retry_after_seconds(),
            Some(3)
        );
        assert_eq!(GatewayError::UpstreamTimeout.retry_after_seconds(), None);
        assert_eq!(GatewayError::MissingApiKey.retry_after_seconds(), None);
    }

    #[test]
    fn test_upstream_error_conversion() {
        assert!(matches!(
            GatewayError::from(UpstreamError::Timeout),
            GatewayError::UpstreamTimeout
        ));
        assert!(matches!(
            GatewayError::from(UpstreamError::Connect("refused".to_string())),
            GatewayError::Upstream(_)
        ));
        assert!(matches!(
            GatewayError::from(UpstreamError::InvalidRequest("method".to_string())),
            GatewayError::Internal(_)
        ));
    }
}
