use crate::ids::Principal;

/// Rejection reasons for a bearer credential presented at connection time.
///
/// Always surfaced as a refused upgrade; a connection is never partially
/// authenticated.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    #[error("credential malformed: {0}")]
    Malformed(String),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("credential expired")]
    Expired,
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl AuthError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed(_) => "malformed",
            Self::SignatureInvalid => "signature_invalid",
            Self::Expired => "expired",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
        }
    }
}

/// An inbound frame that could not be turned into a routable message.
/// Local to the reader; the session keeps running.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("payload is not valid utf-8")]
    InvalidUtf8,
}

impl DecodeError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::InvalidUtf8 => "invalid_utf8",
        }
    }
}

/// Non-fatal delivery outcomes. The sender is not notified.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("recipient {0} is not connected")]
    RecipientUnavailable(Principal),
    #[error("outbound queue for {0} is full, message dropped")]
    Backpressure(Principal),
    /// The registry itself is gone (process shutting down).
    #[error("registry unavailable")]
    RegistryClosed,
}

impl RouteError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RecipientUnavailable(_) => "recipient_unavailable",
            Self::Backpressure(_) => "backpressure",
            Self::RegistryClosed => "registry_closed",
        }
    }
}

/// Failure reported by the persistence collaborator. Never affects delivery.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("persistence task failed: {0}")]
    Task(String),
}

impl PersistenceError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Task(_) => "task",
        }
    }
}

/// Physical connection failure. Terminates the owning session only.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("no activity for {0}s")]
    HeartbeatTimeout(u64),
    #[error("encode failed: {0}")]
    Encode(String),
}

impl TransportError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::Encode(_) => "encode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_kinds() {
        assert_eq!(AuthError::Missing.error_kind(), "missing");
        assert_eq!(AuthError::Expired.error_kind(), "expired");
        assert_eq!(
            AuthError::UnsupportedAlgorithm("none".into()).error_kind(),
            "unsupported_algorithm"
        );
    }

    #[test]
    fn route_error_display_names_recipient() {
        let err = RouteError::RecipientUnavailable(Principal::new("u3"));
        assert_eq!(err.to_string(), "recipient u3 is not connected");
        assert_eq!(err.error_kind(), "recipient_unavailable");

        let err = RouteError::Backpressure(Principal::new("u1"));
        assert!(err.to_string().contains("u1"));
        assert_eq!(err.error_kind(), "backpressure");
    }

    #[test]
    fn transport_error_kinds() {
        assert_eq!(TransportError::HeartbeatTimeout(90).to_string(), "no activity for 90s");
        assert_eq!(TransportError::Write("eof".into()).error_kind(), "write");
    }
}
