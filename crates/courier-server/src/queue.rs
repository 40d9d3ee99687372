use courier_core::{ConnectionId, Message, RouteError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Consumer end of an outbound queue, owned by the session's writer pump.
pub type QueueReceiver = mpsc::Receiver<Message>;

/// Producer end of one connection's outbound queue.
///
/// Not `Clone`: whoever holds the handle is the only producer, and dropping
/// it closes the queue. Sessions hand it to the registry on registration and
/// keep only the [`ConnectionId`].
#[derive(Debug)]
pub struct QueueHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
}

impl QueueHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Non-blocking enqueue. A full queue drops `message`.
    pub(crate) fn offer(&self, message: Message) -> Result<(), RouteError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => Err(RouteError::Backpressure(message.recipient)),
            Err(TrySendError::Closed(message)) => {
                Err(RouteError::RecipientUnavailable(message.recipient))
            }
        }
    }
}

impl PartialEq for QueueHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueueHandle {}

/// Create a bounded queue for a new connection.
pub fn outbound_queue(capacity: usize) -> (QueueHandle, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueHandle {
            id: ConnectionId::new(),
            tx,
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MessageKind;
    use tokio::sync::mpsc::error::TryRecvError;

    fn msg(to: &str) -> Message {
        Message::new("u2", to, "hi", MessageKind::Text)
    }

    #[test]
    fn handles_get_distinct_connection_ids() {
        let (a, _ra) = outbound_queue(4);
        let (b, _rb) = outbound_queue(4);
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("conn_"));
    }

    #[test]
    fn offer_fails_with_backpressure_when_full() {
        let (q, mut rx) = outbound_queue(1);
        q.offer(msg("u1")).unwrap();
        let err = q.offer(msg("u1")).unwrap_err();
        assert_eq!(err, courier_core::RouteError::Backpressure("u1".into()));
        assert_eq!(rx.try_recv().unwrap().content, "hi");
    }

    #[test]
    fn dropping_handle_closes_queue_after_drain() {
        let (q, mut rx) = outbound_queue(4);
        q.offer(msg("u1")).unwrap();
        drop(q);
        assert!(rx.try_recv().is_ok());
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn offer_to_dropped_consumer_is_unavailable() {
        let (q, rx) = outbound_queue(4);
        drop(rx);
        assert!(q.is_closed());
        assert!(matches!(
            q.offer(msg("u1")),
            Err(courier_core::RouteError::RecipientUnavailable(_))
        ));
    }
}
