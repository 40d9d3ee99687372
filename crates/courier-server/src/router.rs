use std::sync::Arc;

use courier_core::{DecodeError, Message, MessageStore, Principal, RouteError};
use tracing::{error, warn};

use crate::registry::Registry;

/// Why an inbound frame was not delivered. None of these end the session.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("message has no recipient")]
    EmptyRecipient,
    #[error(transparent)]
    Route(#[from] RouteError),
}

impl RouterError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.error_kind(),
            Self::EmptyRecipient => "empty_recipient",
            Self::Route(e) => e.error_kind(),
        }
    }
}

/// Turns raw inbound frames into routed messages.
pub struct MessageRouter {
    registry: Arc<dyn Registry>,
    store: Option<Arc<dyn MessageStore>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<dyn Registry>, store: Option<Arc<dyn MessageStore>>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Decode `raw` from `sender` and hand it to the registry.
    ///
    /// The sender field is always replaced by the authenticated principal.
    /// Valid messages are submitted to the store on a separate task whether
    /// or not delivery succeeded.
    pub async fn route(&self, sender: &Principal, raw: &[u8]) -> Result<(), RouterError> {
        let mut message = Message::decode(raw).map_err(|e| {
            warn!(%sender, error_kind = e.error_kind(), error = %e, "dropping undecodable frame");
            e
        })?;

        if message.recipient.is_empty() {
            warn!(%sender, message_id = %message.id, "dropping message without recipient");
            return Err(RouterError::EmptyRecipient);
        }
        message.sender = sender.clone();

        let outcome = match &self.store {
            Some(store) => {
                let persisted = message.clone();
                let outcome = self.registry.route(message).await;
                self.persist(Arc::clone(store), persisted);
                outcome
            }
            None => self.registry.route(message).await,
        };
        outcome.map_err(RouterError::from)
    }

    fn persist(&self, store: Arc<dyn MessageStore>, message: Message) {
        tokio::spawn(async move {
            if let Err(e) = store.persist(&message).await {
                error!(
                    message_id = %message.id,
                    sender = %message.sender,
                    recipient = %message.recipient,
                    error_kind = e.error_kind(),
                    error = %e,
                    "failed to persist message"
                );
            }
        });
    }
}
