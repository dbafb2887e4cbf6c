//! Error types for Ebbtide

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EbbtideError>;

#[derive(Error, Debug)]
pub enum EbbtideError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EbbtideError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            EbbtideError::InvalidInput(_) => 3,
            EbbtideError::Platform(PlatformError::Authentication(_)) => 2,
            EbbtideError::Platform(_) => 1,
            EbbtideError::Config(_) => 1,
            EbbtideError::Io(_) => 1,
        }
    }

    /// The platform error inside this error, if any
    pub fn as_platform(&self) -> Option<&PlatformError> {
        match self {
            EbbtideError::Platform(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures reported by a platform connector.
///
/// Raised by `fetch_page` these are fatal to the current run; raised by
/// `execute` they are recorded against the single item and the run goes on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// The item no longer exists on the platform.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("Timeline ordering violated: {0}")]
    Ordering(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl PlatformError {
    /// Whether this error means the target is already gone
    pub fn is_already_gone(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = EbbtideError::InvalidInput("bad platform".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = EbbtideError::Platform(PlatformError::Authentication("expired".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_platform_errors() {
        for platform_error in [
            PlatformError::Network("timeout".to_string()),
            PlatformError::RateLimit("slow down".to_string()),
            PlatformError::NotFound("gone".to_string()),
            PlatformError::Ordering("newer item after older".to_string()),
        ] {
            assert_eq!(EbbtideError::Platform(platform_error).exit_code(), 1);
        }
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = EbbtideError::Config(ConfigError::MissingField("prune.max_age".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = EbbtideError::Platform(PlatformError::Network("connection refused".to_string()));
        assert_eq!(
            error.to_string(),
            "Platform error: Network error: connection refused"
        );

        let error = EbbtideError::Config(ConfigError::invalid("prune.max_age", "not a duration"));
        assert_eq!(
            error.to_string(),
            "Configuration error: Invalid value for prune.max_age: not a duration"
        );
    }

    #[test]
    fn test_error_conversion_from_platform_error() {
        let error: EbbtideError = PlatformError::Action("denied".to_string()).into();
        assert!(matches!(
            error.as_platform(),
            Some(PlatformError::Action(_))
        ));
    }

    #[test]
    fn test_already_gone_detection() {
        assert!(PlatformError::NotFound("status 1".to_string()).is_already_gone());
        assert!(!PlatformError::Network("status 1".to_string()).is_already_gone());
    }

    #[test]
    fn test_config_error_read_error_formatting() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let message = ConfigError::ReadError(io_error).to_string();
        assert!(message.contains("Failed to read config file"));
    }
}
