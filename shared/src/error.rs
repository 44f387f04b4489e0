//! Error types for RTunnel.
//!
//! Every failure on the relay path maps onto a synthesized HTTP status. The
//! caller only ever sees the canonical reason phrase; the detail carried by
//! the variant is for the operator's logs.

use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// No client is attached to the relay.
    #[error("no active tunnel channel")]
    NoActiveChannel,

    /// The client's router had no pattern for the request path.
    #[error("no target pattern matched {0}")]
    NoTargetMatch(String),

    /// The target could not be reached (refused, DNS, timeout).
    #[error("upstream transport failure: {0}")]
    UpstreamTransportFailure(String),

    /// No response arrived before the deadline.
    #[error("no response within {0:?}")]
    CorrelationTimeout(std::time::Duration),

    /// The channel carrying the request went away.
    #[error("tunnel channel lost: {0}")]
    ChannelLost(String),

    /// Connection-level admission failure.
    #[error("tunnel connection rejected: {0}")]
    AuthRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Status code surfaced to the public caller for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::NoActiveChannel
            | RelayError::NoTargetMatch(_)
            | RelayError::ChannelLost(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamTransportFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::CorrelationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::AuthRejected(_) => StatusCode::UNAUTHORIZED,
            RelayError::Protocol(_) | RelayError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Generic status text, safe to hand to the original caller.
    pub fn status_text(&self) -> &'static str {
        self.status().canonical_reason().unwrap_or("Error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayError::NoActiveChannel.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RelayError::NoTargetMatch("/other".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::UpstreamTransportFailure("refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RelayError::CorrelationTimeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::ChannelLost("superseded".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::AuthRejected("missing bearer".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_status_text_hides_detail() {
        let err = RelayError::UpstreamTransportFailure("connect ECONNREFUSED 10.0.0.3:80".into());
        assert_eq!(err.status_text(), "Internal Server Error");
        assert_eq!(RelayError::NoActiveChannel.status_text(), "Bad Gateway");
    }
}
