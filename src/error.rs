use thiserror::Error;

/// Type alias for Result with CleanupError
pub type Result<T> = std::result::Result<T, CleanupError>;

/// Error types for the inbox cleanup toolkit
#[derive(Error, Debug)]
pub enum CleanupError {
    /// Provider API returned an error
    #[error("Provider API error: {0}")]
    ApiError(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Token refresh was needed but no refresh token is available
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Outbound HTTP request failed (unsubscribe links, token endpoints)
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// A job with this id is already scheduled
    #[error("Job '{0}' already exists")]
    JobAlreadyExists(String),

    /// No job with this id is scheduled
    #[error("Job '{0}' does not exist")]
    JobNotFound(String),

    /// Scheduler interval must be positive
    #[error("Invalid job interval: {0}")]
    InvalidInterval(String),

    /// User lacks the premium level required for a feature
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CleanupError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CleanupError::RateLimitExceeded { .. }
                | CleanupError::ServerError { .. }
                | CleanupError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Map a non-success HTTP status (plus response body) onto an error variant
    pub fn from_status(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        let message = format!("HTTP {}: {}", status, body.trim());
        match status {
            429 => CleanupError::RateLimitExceeded {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            404 => CleanupError::MessageNotFound(message),
            400 => CleanupError::BadRequest(message),
            401 => CleanupError::AuthError(message),
            403 => CleanupError::Forbidden(message),
            500..=599 => CleanupError::ServerError { status, message },
            _ => CleanupError::ApiError(message),
        }
    }
}

const DEFAULT_RETRY_AFTER: u64 = 5;

/// Parse a Retry-After header value
///
/// The value can be either delay-seconds ("120") or an HTTP-date
/// ("Wed, 21 Oct 2015 07:28:00 GMT"). Dates in the past and unparseable
/// values return None.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }

    let http_date = httpdate::parse_http_date(value.trim()).ok()?;
    http_date
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|d| d.as_secs())
}

fn retry_after_from_headers(headers: &hyper::HeaderMap) -> u64 {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for CleanupError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => CleanupError::RateLimitExceeded {
                        retry_after: retry_after_from_headers(response.headers()),
                    },
                    404 => CleanupError::MessageNotFound("Resource not found".to_string()),
                    400 => CleanupError::BadRequest(message),
                    403 => CleanupError::Forbidden(message),
                    500..=599 => CleanupError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => CleanupError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => {
                CleanupError::BadRequest(format!("{}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                CleanupError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => CleanupError::NetworkError(err.to_string()),
            _ => CleanupError::ApiError(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for CleanupError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            return CleanupError::NetworkError(error.to_string());
        }
        if let Some(status) = error.status() {
            return CleanupError::from_status(status.as_u16(), &error.to_string(), None);
        }
        CleanupError::HttpError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rate_limit = CleanupError::RateLimitExceeded { retry_after: 5 };
        assert!(rate_limit.is_transient());
        assert!(!rate_limit.is_permanent());

        let server_error = CleanupError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(server_error.is_transient());

        let network_error = CleanupError::NetworkError("Connection timeout".to_string());
        assert!(network_error.is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(CleanupError::BadRequest("Invalid query".to_string()).is_permanent());
        assert!(CleanupError::MessageNotFound("msg123".to_string()).is_permanent());
        assert!(CleanupError::JobAlreadyExists("A".to_string()).is_permanent());
        assert!(CleanupError::MissingRefreshToken.is_permanent());
    }

    #[test]
    fn test_error_display() {
        let error = CleanupError::RateLimitExceeded { retry_after: 10 };
        let display = format!("{}", error);
        assert!(display.contains("Rate limit exceeded"));
        assert!(display.contains("10 seconds"));

        let job = CleanupError::JobNotFound("B".to_string());
        assert_eq!(job.to_string(), "Job 'B' does not exist");
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            CleanupError::from_status(429, "", Some(30)),
            CleanupError::RateLimitExceeded { retry_after: 30 }
        ));
        assert!(matches!(
            CleanupError::from_status(429, "", None),
            CleanupError::RateLimitExceeded { retry_after: 5 }
        ));
        assert!(matches!(
            CleanupError::from_status(404, "gone", None),
            CleanupError::MessageNotFound(_)
        ));
        assert!(matches!(
            CleanupError::from_status(401, "expired", None),
            CleanupError::AuthError(_)
        ));
        assert!(matches!(
            CleanupError::from_status(502, "bad gateway", None),
            CleanupError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            CleanupError::from_status(418, "teapot", None),
            CleanupError::ApiError(_)
        ));
    }

    #[test]
    fn test_parse_retry_after_integer() {
        assert_eq!(parse_retry_after("120"), Some(120));
        assert_eq!(parse_retry_after("0"), Some(0));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("invalid"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future_time = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(future_time);

        let retry_after = parse_retry_after(&http_date).unwrap();
        assert!(
            (58..=61).contains(&retry_after),
            "Expected ~60, got {}",
            retry_after
        );
    }

    #[test]
    fn test_parse_retry_after_past_http_date() {
        let past_time = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(past_time);
        assert_eq!(parse_retry_after(&http_date), None);
    }

    #[test]
    fn test_retry_after_from_headers_default() {
        let headers = hyper::HeaderMap::new();
        assert_eq!(retry_after_from_headers(&headers), 5);

        let mut headers = hyper::HeaderMap::new();
        headers.insert("retry-after", hyper::header::HeaderValue::from_static("3600"));
        assert_eq!(retry_after_from_headers(&headers), 3600);
    }
}
