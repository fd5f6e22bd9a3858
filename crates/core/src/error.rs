use thiserror::Error;

/// Fetch outcomes that terminate a download attempt. The `Display` strings
/// are stable identifiers recorded in logs and drive the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP_{0}")]
    Http(u16),

    #[error("NOT_HTML")]
    NotHtml,

    #[error("TOO_LARGE_HEADER")]
    TooLargeHeader,

    #[error("TOO_LARGE_BODY")]
    TooLargeBody,

    #[error("TIMEOUT_CONNECT")]
    TimeoutConnect,

    #[error("TIMEOUT_DURING_READ")]
    TimeoutDuringRead,

    #[error("CONNECTION_ERROR")]
    Connection,

    #[error("REDIRECT_LOOP")]
    RedirectLoop,

    #[error("NET_ERROR:{0}")]
    Net(String),
}

impl FetchError {
    /// Network-class failures are retried (up to the fetch retry budget);
    /// permanent failures move the frontier row straight to error state.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::TimeoutConnect
            | FetchError::TimeoutDuringRead
            | FetchError::Connection
            | FetchError::Net(_) => true,
            FetchError::Http(code) => *code >= 500,
            _ => false,
        }
    }

    /// Whether the in-client retry layer should re-issue the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::TimeoutConnect
                | FetchError::Connection
                | FetchError::Http(500)
                | FetchError::Http(502)
                | FetchError::Http(503)
                | FetchError::Http(504)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_strings() {
        assert_eq!(FetchError::Http(404).to_string(), "HTTP_404");
        assert_eq!(FetchError::TooLargeBody.to_string(), "TOO_LARGE_BODY");
        assert_eq!(
            FetchError::Net("dns failure".into()).to_string(),
            "NET_ERROR:dns failure"
        );
    }

    #[test]
    fn retry_policy_splits_network_from_permanent() {
        assert!(FetchError::TimeoutConnect.is_retryable());
        assert!(FetchError::Connection.is_retryable());
        assert!(FetchError::Http(503).is_retryable());
        assert!(!FetchError::Http(404).is_retryable());
        assert!(!FetchError::NotHtml.is_retryable());
        assert!(!FetchError::TooLargeBody.is_retryable());
    }
}
