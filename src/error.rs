use thiserror::Error;

/// Why a location request produced no fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("Location request timed out after {0:.1}s")]
    Timeout(f64),

    #[error("Location service disabled")]
    ServiceDisabled,

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location provider error: {0}")]
    Provider(String),
}

impl LocationError {
    /// Only a permission denial needs user action before fixes can resume.
    pub fn is_capability_loss(&self) -> bool {
        matches!(self, LocationError::PermissionDenied)
    }
}

/// Peer payload that could not be turned into a location report.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Payload is not a valid message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: f64 },
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("No peers connected")]
    NoPeers,

    #[error("Send failed: {0}")]
    Send(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine stopped")]
    Stopped,

    #[error("Engine task failed: {0}")]
    TaskFailed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_loss() {
        assert!(LocationError::PermissionDenied.is_capability_loss());
        assert!(!LocationError::Timeout(7.0).is_capability_loss());
        assert!(!LocationError::ServiceDisabled.is_capability_loss());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            LocationError::Timeout(7.0).to_string(),
            "Location request timed out after 7.0s"
        );
        assert_eq!(EngineError::Stopped.to_string(), "Engine stopped");
    }
}
