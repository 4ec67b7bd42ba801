//! Error types for the field monitor

use crate::model::InstanceId;
use std::fmt;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug)]
pub enum MonitorError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP client could not be built or a request failed outside a fetch
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Daemon configuration error
    Config(String),

    /// No configuration stored for the instance
    ConfigMissing(InstanceId),

    /// Instance configuration rejected at save time
    InvalidConfig(String),

    /// Time window that can never be active
    InvalidScheduleWindow(String),

    /// Remote value fetch failed
    Fetch(FetchError),

    /// Alert could not be delivered
    AlertDelivery(AlertError),

    /// Stored document could not be read or upgraded
    Store(String),

    /// Generic error with message
    Other(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Io(err) => write!(f, "IO error: {}", err),
            MonitorError::Http(err) => write!(f, "HTTP error: {}", err),
            MonitorError::Json(err) => write!(f, "JSON error: {}", err),
            MonitorError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MonitorError::ConfigMissing(id) => write!(f, "No configuration for instance {}", id),
            MonitorError::InvalidConfig(msg) => write!(f, "Invalid instance configuration: {}", msg),
            MonitorError::InvalidScheduleWindow(msg) => write!(f, "Invalid schedule window: {}", msg),
            MonitorError::Fetch(err) => write!(f, "Fetch error: {}", err),
            MonitorError::AlertDelivery(err) => write!(f, "Alert delivery error: {}", err),
            MonitorError::Store(msg) => write!(f, "Store error: {}", msg),
            MonitorError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Io(err) => Some(err),
            MonitorError::Http(err) => Some(err),
            MonitorError::Json(err) => Some(err),
            MonitorError::Fetch(err) => Some(err),
            MonitorError::AlertDelivery(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        MonitorError::Io(err)
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        MonitorError::Http(err)
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Json(err)
    }
}

impl From<FetchError> for MonitorError {
    fn from(err: FetchError) -> Self {
        MonitorError::Fetch(err)
    }
}

impl From<AlertError> for MonitorError {
    fn from(err: AlertError) -> Self {
        MonitorError::AlertDelivery(err)
    }
}

/// Why a single fetch of the latest value failed.
///
/// Every variant is cycle-local: the controller renders an error state and
/// waits for the next scheduled cycle instead of retrying in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection refused, DNS failure, reset, ...
    Network(String),

    /// No response within the fetch timeout
    Timeout,

    /// Remote answered with a non-success status
    HttpStatus(u16),

    /// Body was not a feed entry
    Parse(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Network(msg) => write!(f, "Net Error: {}", msg),
            FetchError::Timeout => write!(f, "Timeout"),
            FetchError::HttpStatus(code) => write!(f, "Error: {}", code),
            FetchError::Parse(msg) => write!(f, "Bad Data: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus(status.as_u16())
        } else if err.is_decode() {
            FetchError::Parse(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Alert sink failure. Logged by the controller, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertError {
    pub message: String,
}

impl AlertError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AlertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AlertError {}

impl From<reqwest::Error> for AlertError {
    fn from(err: reqwest::Error) -> Self {
        AlertError::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        assert_eq!(FetchError::HttpStatus(404).to_string(), "Error: 404");
        assert_eq!(FetchError::Timeout.to_string(), "Timeout");
        assert_eq!(
            FetchError::Network("connection refused".to_string()).to_string(),
            "Net Error: connection refused"
        );
    }

    #[test]
    fn test_monitor_error_wraps_fetch_error() {
        let err: MonitorError = FetchError::Timeout.into();
        assert!(matches!(err, MonitorError::Fetch(FetchError::Timeout)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_missing_display() {
        let err = MonitorError::ConfigMissing(InstanceId(7));
        assert_eq!(err.to_string(), "No configuration for instance 7");
    }
}
