use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use courier_core::{ConnectionId, Message, Principal, RouteError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::queue::QueueHandle;

/// Principal to live-connection mapping with non-blocking delivery.
///
/// Two implementations exist: [`HubHandle`](crate::hub::HubHandle), a
/// single-writer actor, and [`SharedRegistry`](crate::shared::SharedRegistry),
/// a sharded lock map. Both keep at most one entry per principal, replace on
/// re-registration and never block on a full recipient queue.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Install `queue` for `principal`, closing any queue it replaces.
    async fn register(&self, principal: Principal, queue: QueueHandle) -> Result<(), RouteError>;

    /// Remove the entry only if it still belongs to `connection`.
    /// Returns whether an entry was removed.
    async fn unregister(&self, principal: &Principal, connection: &ConnectionId) -> bool;

    async fn route(&self, message: Message) -> Result<(), RouteError>;

    async fn lookup(&self, principal: &Principal) -> Option<ConnectionId>;

    async fn connection_count(&self) -> usize;

    fn stats(&self) -> RouteStats;
}

/// Delivery counters exposed on `/health`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub delivered: u64,
    pub backpressure_drops: u64,
    pub unavailable: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RouteCounters {
    delivered: AtomicU64,
    backpressure: AtomicU64,
    unavailable: AtomicU64,
}

impl RouteCounters {
    pub(crate) fn snapshot(&self) -> RouteStats {
        RouteStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Result<(), RouteError>) {
        let counter = match outcome {
            Ok(()) => &self.delivered,
            Err(RouteError::Backpressure(_)) => &self.backpressure,
            Err(RouteError::RecipientUnavailable(_)) => &self.unavailable,
            Err(RouteError::RegistryClosed) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Offer `message` to the recipient's queue if there is one, then log and
/// count the outcome. Shared by both registry implementations.
pub(crate) fn deliver(
    entry: Option<&QueueHandle>,
    message: Message,
    counters: &RouteCounters,
) -> Result<(), RouteError> {
    let message_id = message.id.clone();
    let outcome = match entry {
        Some(queue) => {
            let connection_id = queue.id().clone();
            let outcome = queue.offer(message);
            if outcome.is_ok() {
                debug!(%message_id, %connection_id, "message delivered");
            }
            outcome
        }
        None => Err(RouteError::RecipientUnavailable(message.recipient)),
    };

    match &outcome {
        Ok(()) => {}
        Err(err @ RouteError::Backpressure(recipient)) => {
            warn!(%message_id, %recipient, error_kind = err.error_kind(), "outbound queue full, message dropped");
        }
        Err(err @ RouteError::RecipientUnavailable(recipient)) => {
            info!(%message_id, %recipient, error_kind = err.error_kind(), "recipient not connected");
        }
        Err(RouteError::RegistryClosed) => {}
    }
    counters.record(&outcome);
    outcome
}
