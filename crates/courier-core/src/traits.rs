use async_trait::async_trait;

use crate::errors::{AuthError, PersistenceError};
use crate::ids::Principal;
use crate::message::Message;

/// Validates a bearer credential presented at connection time.
///
/// Read-only: implementations verify, they never mint or record anything.
pub trait AuthGate: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Best-effort durable record of routed messages.
///
/// Called off the delivery path. A failure is returned to the caller, which
/// logs it; it never reverses or delays delivery.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist(&self, message: &Message) -> Result<(), PersistenceError>;
}
