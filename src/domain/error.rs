use crate::domain::models::AdapterState;
use thiserror::Error;
use uuid::Uuid;

/// Why GATT resolution could not reach the Ready state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryFailure {
    #[error("target service {0} not found")]
    ServiceMissing(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),
    #[error("{0}")]
    Platform(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Bluetooth adapter unavailable ({0})")]
    AdapterUnavailable(AdapterState),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(#[from] DiscoveryFailure),

    #[error("session task is no longer running")]
    MailboxClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_failed_message() {
        let err = SessionError::from(DiscoveryFailure::Platform("GATT error 133".into()));
        assert_eq!(err.to_string(), "Discovery failed: GATT error 133");
    }
}
