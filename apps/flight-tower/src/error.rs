use thiserror::Error;

/// Failures raised by flight and registry operations.
///
/// Every variant is recoverable: the coordinator reports it to the
/// originating connection as an `error` frame and keeps the socket open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlightError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Capacity(String),
    #[error("{0}")]
    StaleState(String),
}

/// The `registered` frame could not be written to a fresh socket.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to encode registration: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to deliver registration: {0}")]
    Deliver(#[from] axum::Error),
}

impl FlightError {
    pub fn validation(message: impl Into<String>) -> Self {
        FlightError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        FlightError::Conflict(message.into())
    }

    pub fn flight_not_found() -> Self {
        FlightError::NotFound("Flight not found".into())
    }

    pub fn flight_full() -> Self {
        FlightError::Capacity("Flight is full".into())
    }

    /// The creator of the flight is gone; clients see the same wording as a
    /// missing flight.
    pub fn creator_gone() -> Self {
        FlightError::StaleState("Flight not found".into())
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            FlightError::Validation(_) => "validation",
            FlightError::Conflict(_) => "conflict",
            FlightError::NotFound(_) => "not_found",
            FlightError::Capacity(_) => "capacity",
            FlightError::StaleState(_) => "stale_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn stale_state_reads_like_not_found() {
        assert_eq!(
            FlightError::creator_gone().to_string(),
            FlightError::flight_not_found().to_string()
        );
        assert_ne!(
            FlightError::creator_gone().metric_label(),
            FlightError::flight_not_found().metric_label()
        );
    }
}
