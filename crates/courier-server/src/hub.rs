//! Single-writer connection registry.
//!
//! The [`Hub`] owns the principal map and is driven by one task consuming a
//! single request channel, so register, unregister and route are applied
//! strictly in arrival order. Everything else talks to it through a
//! [`HubHandle`] and waits for the reply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{ConnectionId, Message, Principal, RouteError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::queue::QueueHandle;
use crate::registry::{deliver, Registry, RouteCounters, RouteStats};

enum HubRequest {
    Register {
        principal: Principal,
        queue: QueueHandle,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        principal: Principal,
        connection: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Route {
        message: Message,
        reply: oneshot::Sender<Result<(), RouteError>>,
    },
    Lookup {
        principal: Principal,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// The dispatch actor in its idle state. Requests sent through a handle
/// queue up until [`Hub::spawn`] starts it.
pub struct Hub {
    requests: mpsc::Receiver<HubRequest>,
    entries: HashMap<Principal, QueueHandle>,
    counters: Arc<RouteCounters>,
}

impl Hub {
    /// `capacity` bounds the number of pending requests.
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(RouteCounters::default());
        let hub = Self {
            requests: rx,
            entries: HashMap::new(),
            counters: Arc::clone(&counters),
        };
        (hub, HubHandle { tx, counters })
    }

    /// Start the dispatch loop. It runs until every handle is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("hub dispatch actor started");
        while let Some(request) = self.requests.recv().await {
            self.handle(request);
        }
        info!(connections = self.entries.len(), "hub dispatch actor stopped");
    }

    fn handle(&mut self, request: HubRequest) {
        // A dropped reply receiver only means the caller stopped waiting.
        match request {
            HubRequest::Register {
                principal,
                queue,
                reply,
            } => {
                let connection_id = queue.id().clone();
                if let Some(previous) = self.entries.insert(principal.clone(), queue) {
                    info!(
                        %principal,
                        superseded = %previous.id(),
                        %connection_id,
                        "connection superseded"
                    );
                    drop(previous);
                } else {
                    debug!(%principal, %connection_id, "connection registered");
                }
                let _ = reply.send(());
            }
            HubRequest::Unregister {
                principal,
                connection,
                reply,
            } => {
                let current = self
                    .entries
                    .get(&principal)
                    .is_some_and(|queue| *queue.id() == connection);
                if current {
                    self.entries.remove(&principal);
                    debug!(%principal, connection_id = %connection, "connection unregistered");
                } else {
                    debug!(%principal, connection_id = %connection, "stale unregister ignored");
                }
                let _ = reply.send(current);
            }
            HubRequest::Route { message, reply } => {
                let entry = self.entries.get(&message.recipient);
                let outcome = deliver(entry, message, &self.counters);
                let _ = reply.send(outcome);
            }
            HubRequest::Lookup { principal, reply } => {
                let _ = reply.send(self.entries.get(&principal).map(|q| q.id().clone()));
            }
            HubRequest::Count { reply } => {
                let _ = reply.send(self.entries.len());
            }
        }
    }
}

/// Cloneable client of the dispatch actor.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubRequest>,
    counters: Arc<RouteCounters>,
}

impl HubHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubRequest,
    ) -> Result<T, RouteError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RouteError::RegistryClosed)?;
        response.await.map_err(|_| RouteError::RegistryClosed)
    }
}

#[async_trait]
impl Registry for HubHandle {
    async fn register(&self, principal: Principal, queue: QueueHandle) -> Result<(), RouteError> {
        self.request(|reply| HubRequest::Register {
            principal,
            queue,
            reply,
        })
        .await
    }

    async fn unregister(&self, principal: &Principal, connection: &ConnectionId) -> bool {
        self.request(|reply| HubRequest::Unregister {
            principal: principal.clone(),
            connection: connection.clone(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    async fn route(&self, message: Message) -> Result<(), RouteError> {
        self.request(|reply| HubRequest::Route { message, reply }).await?
    }

    async fn lookup(&self, principal: &Principal) -> Option<ConnectionId> {
        self.request(|reply| HubRequest::Lookup {
            principal: principal.clone(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    async fn connection_count(&self) -> usize {
        self.request(|reply| HubRequest::Count { reply })
            .await
            .unwrap_or(0)
    }

    fn stats(&self) -> RouteStats {
        self.counters.snapshot()
    }
}
