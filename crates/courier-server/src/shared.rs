//! Lock-based registry variant.
//!
//! Entries live in a [`DashMap`], which splits the map into shards each
//! guarded by its own `RwLock`. Contention behaviour:
//!
//! - `route` and `lookup` take a shard read lock; concurrent routes to
//!   principals in the same shard proceed in parallel.
//! - `register` and `unregister` take the shard write lock and wait for
//!   readers of that shard to finish. Other shards are unaffected.
//! - No lock is held across an `.await`. Delivery under the read lock is a
//!   non-blocking `try_send`, so a full recipient queue never extends the
//!   time a shard stays locked.
//!
//! Unlike the hub, ordering between a route and a concurrent register for
//! the same principal is decided by whichever thread takes the shard lock
//! first.

use async_trait::async_trait;
use courier_core::{ConnectionId, Message, Principal, RouteError};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::queue::QueueHandle;
use crate::registry::{deliver, Registry, RouteCounters, RouteStats};

#[derive(Default)]
pub struct SharedRegistry {
    entries: DashMap<Principal, QueueHandle>,
    counters: RouteCounters,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for SharedRegistry {
    async fn register(&self, principal: Principal, queue: QueueHandle) -> Result<(), RouteError> {
        let connection_id = queue.id().clone();
        // The replaced handle is dropped after the shard lock is released.
        let previous = self.entries.insert(principal.clone(), queue);
        match previous {
            Some(previous) => info!(
                %principal,
                superseded = %previous.id(),
                %connection_id,
                "connection superseded"
            ),
            None => debug!(%principal, %connection_id, "connection registered"),
        }
        Ok(())
    }

    async fn unregister(&self, principal: &Principal, connection: &ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(principal, |_, queue| queue.id() == connection)
            .is_some();
        if removed {
            debug!(%principal, connection_id = %connection, "connection unregistered");
        } else {
            debug!(%principal, connection_id = %connection, "stale unregister ignored");
        }
        removed
    }

    async fn route(&self, message: Message) -> Result<(), RouteError> {
        let entry = self.entries.get(&message.recipient);
        deliver(entry.as_deref(), message, &self.counters)
    }

    async fn lookup(&self, principal: &Principal) -> Option<ConnectionId> {
        self.entries.get(principal).map(|queue| queue.id().clone())
    }

    async fn connection_count(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> RouteStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::outbound_queue;
    use courier_core::MessageKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn msg(from: &str, to: &str, content: &str) -> Message {
        Message::new(from, to, content, MessageKind::Text)
    }

    #[tokio::test]
    async fn register_replace_and_stale_unregister() {
        let registry = SharedRegistry::new();
        let p = Principal::new("u1");

        let (q1, mut rx1) = outbound_queue(4);
        let id1 = q1.id().clone();
        registry.register(p.clone(), q1).await.unwrap();

        let (q2, mut rx2) = outbound_queue(4);
        let id2 = q2.id().clone();
        registry.register(p.clone(), q2).await.unwrap();

        assert_eq!(rx1.recv().await, None);
        assert!(!registry.unregister(&p, &id1).await);
        assert_eq!(registry.lookup(&p).await, Some(id2.clone()));

        registry.route(msg("u2", "u1", "hi")).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().sender, Principal::new("u2"));

        assert!(registry.unregister(&p, &id2).await);
        assert_eq!(
            registry.route(msg("u2", "u1", "gone")).await,
            Err(RouteError::RecipientUnavailable(p))
        );
    }

    #[tokio::test]
    async fn full_queue_is_backpressure() {
        let registry = SharedRegistry::new();
        let (queue, _never_drained) = outbound_queue(1);
        registry.register(Principal::new("slow"), queue).await.unwrap();

        registry.route(msg("u2", "slow", "1")).await.unwrap();
        assert_eq!(
            registry.route(msg("u2", "slow", "2")).await,
            Err(RouteError::Backpressure(Principal::new("slow")))
        );
        assert_eq!(registry.stats().backpressure_drops, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn register_unregister_storm_leaves_one_consistent_entry() {
        let registry = Arc::new(SharedRegistry::new());
        let principal = Principal::new("u1");

        let mut tasks = Vec::new();
        for i in 0..100 {
            let registry = Arc::clone(&registry);
            let principal = principal.clone();
            tasks.push(tokio::spawn(async move {
                let (queue, rx) = outbound_queue(4);
                let id = queue.id().clone();
                registry.register(principal.clone(), queue).await.unwrap();
                if i % 2 == 0 {
                    registry.unregister(&principal, &id).await;
                }
                (id, rx)
            }));
        }

        let mut queues = Vec::new();
        for task in tasks {
            queues.push(task.await.unwrap());
        }

        let current = registry.lookup(&principal).await;
        assert!(registry.connection_count().await <= 1);
        for (id, mut rx) in queues {
            if Some(&id) == current.as_ref() {
                assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
            } else {
                assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn routes_complete_while_same_shard_churns() {
        let registry = Arc::new(SharedRegistry::new());
        let (stable, mut stable_rx) = outbound_queue(1024);
        registry.register(Principal::new("stable"), stable).await.unwrap();

        let churn = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..500 {
                    let (queue, _rx) = outbound_queue(1);
                    let id = queue.id().clone();
                    registry.register(Principal::new("churn"), queue).await.unwrap();
                    registry.unregister(&Principal::new("churn"), &id).await;
                }
            })
        };

        let mut routers = Vec::new();
        for t in 0..4 {
            let registry = Arc::clone(&registry);
            routers.push(tokio::spawn(async move {
                for i in 0..100 {
                    let _ = registry.route(msg("u2", "churn", "x")).await;
                    registry
                        .route(msg("u2", "stable", &format!("{t}-{i}")))
                        .await
                        .unwrap();
                }
            }));
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            churn.await.unwrap();
            for r in routers {
                r.await.unwrap();
            }
        })
        .await
        .expect("routing stalled under contention");

        let mut received = 0;
        while stable_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 400);

        let stats = registry.stats();
        assert_eq!(stats.delivered + stats.backpressure_drops + stats.unavailable, 800);
    }
}
