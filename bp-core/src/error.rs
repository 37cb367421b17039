use thiserror::Error;

/// Unified error type for the gateway, one family of variants per row of
/// the error taxonomy table.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("transient network error: {0}")]
    Transient(#[from] std::io::Error),

    #[error("peer failure ({addr}): {detail}")]
    PeerFailure { addr: String, detail: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("client violation: {0}")]
    ClientViolation(String),

    #[error("cache bypass: {0}")]
    CacheBypass(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GatewayError {
    /// Map to the default plain-text status line, per spec.md §7.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Transient(_) => 504,
            GatewayError::PeerFailure { .. } => 502,
            GatewayError::ProtocolViolation(_) => 502,
            GatewayError::ClientViolation(_) => 400,
            GatewayError::CacheBypass(_) => 200,
            GatewayError::Internal(_) => 500,
            GatewayError::Fatal(_) => 500,
            GatewayError::Config(_) => 500,
            GatewayError::Serde(_) => 500,
        }
    }

    /// `tracing` level this error should be logged at.
    pub fn log_level(&self) -> tracing::Level {
        match self {
            GatewayError::Internal(_) | GatewayError::Fatal(_) => tracing::Level::ERROR,
            _ => tracing::Level::WARN,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Fatal(_))
    }

    /// Render the default plain-text error page; `detail` is appended only
    /// when `verbose` is set (spec.md §7's `verbose_response`).
    pub fn to_status_page(&self, verbose: bool) -> String {
        let status = self.status_code();
        let reason = reason_phrase(status);
        if verbose {
            format!("{status} {reason}\n\n{self}\n")
        } else {
            format!("{status} {reason}\n")
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::PeerFailure {
                addr: "10.0.0.1:80".into(),
                detail: "connection refused".into()
            }
            .status_code(),
            502
        );
        assert_eq!(
            GatewayError::ClientViolation("uri too long".into()).status_code(),
            400
        );
        assert_eq!(GatewayError::Internal("assert failed".into()).status_code(), 500);
        assert_eq!(GatewayError::Fatal("oom".into()).status_code(), 500);
    }

    #[test]
    fn test_verbose_status_page_includes_detail() {
        let err = GatewayError::ProtocolViolation("bad chunk size".into());
        let plain = err.to_status_page(false);
        let verbose = err.to_status_page(true);
        assert!(!plain.contains("bad chunk size"));
        assert!(verbose.contains("bad chunk size"));
        assert!(plain.starts_with("502"));
    }

    #[test]
    fn test_fatal_flag() {
        assert!(GatewayError::Fatal("out of memory".into()).is_fatal());
        assert!(!GatewayError::ClientViolation("x".into()).is_fatal());
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(
            GatewayError::Internal("x".into()).log_level(),
            tracing::Level::ERROR
        );
        assert_eq!(
            GatewayError::ClientViolation("x".into()).log_level(),
            tracing::Level::WARN
        );
    }
}
