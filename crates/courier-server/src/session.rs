//! Per-connection reader and writer pumps.
//!
//! Each session registers a fresh outbound queue, then runs two tasks:
//! the reader feeds inbound frames to the [`MessageRouter`], the writer
//! drains the queue onto the transport and sends heartbeat pings. The two
//! share a cancellation token. Whichever stops first runs the teardown,
//! which unregisters the connection and cancels the other pump; the writer
//! closes the transport on its way out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use courier_core::{ConnectionId, Principal, RouteError, TransportError};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::SessionConfig;
use crate::queue::{outbound_queue, QueueReceiver};
use crate::registry::Registry;
use crate::router::MessageRouter;

/// Shared dependencies for every session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<dyn Registry>,
    pub router: Arc<MessageRouter>,
    pub config: SessionConfig,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
}

/// How each pump ended.
#[derive(Debug)]
pub struct SessionReport {
    pub connection_id: ConnectionId,
    pub reader: Result<(), TransportError>,
    pub writer: Result<(), TransportError>,
}

/// Last inbound frame, as an offset from session start.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        self.origin
            .elapsed()
            .saturating_sub(Duration::from_millis(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Runs at most once per session, whichever pump gets there first.
struct Teardown {
    done: AtomicBool,
    registry: Arc<dyn Registry>,
    principal: Principal,
    connection_id: ConnectionId,
    token: CancellationToken,
}

impl Teardown {
    async fn run(&self, pump: &'static str) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        let removed = self
            .registry
            .unregister(&self.principal, &self.connection_id)
            .await;
        debug!(pump, removed, "session teardown");
    }
}

/// Register a connection for `principal` and pump frames until either side
/// stops.
pub async fn run_session<R, W, E>(
    reader: R,
    writer: W,
    principal: Principal,
    ctx: SessionContext,
) -> Result<SessionReport, RouteError>
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    W: Sink<WsMessage> + Unpin + Send + 'static,
    W::Error: std::fmt::Display + Send,
{
    let (queue, rx) = outbound_queue(ctx.config.queue_capacity);
    let connection_id = queue.id().clone();
    let span = tracing::info_span!("session", principal = %principal, connection_id = %connection_id);

    if let Err(e) = ctx.registry.register(principal.clone(), queue).await {
        span.in_scope(|| warn!(error_kind = e.error_kind(), "registration failed"));
        let mut writer = writer;
        let _ = writer.close().await;
        return Err(e);
    }
    span.in_scope(|| info!("session started"));

    let token = ctx.shutdown.child_token();
    let activity = Arc::new(Activity::new());
    let teardown = Arc::new(Teardown {
        done: AtomicBool::new(false),
        registry: Arc::clone(&ctx.registry),
        principal: principal.clone(),
        connection_id: connection_id.clone(),
        token: token.clone(),
    });

    let reader_task = tokio::spawn(
        read_pump(
            reader,
            principal,
            Arc::clone(&ctx.router),
            Arc::clone(&activity),
            token.clone(),
            Arc::clone(&teardown),
        )
        .instrument(span.clone()),
    );
    let writer_task = tokio::spawn(
        write_pump(writer, rx, activity, ctx.config, token, Arc::clone(&teardown))
            .instrument(span.clone()),
    );

    // A pump that panicked never reached its own teardown.
    let reader = async {
        let joined = reader_task.await;
        if joined.is_err() {
            teardown.run("reader").await;
        }
        joined.unwrap_or_else(|e| Err(TransportError::Read(e.to_string())))
    };
    let writer = async {
        let joined = writer_task.await;
        if joined.is_err() {
            teardown.run("writer").await;
        }
        joined.unwrap_or_else(|e| Err(TransportError::Write(e.to_string())))
    };
    let (reader, writer) = tokio::join!(reader, writer);

    span.in_scope(|| match (&reader, &writer) {
        (Ok(()), Ok(())) => info!("session ended"),
        (Err(e), _) | (_, Err(e)) => {
            info!(error_kind = e.error_kind(), error = %e, "session ended with transport error")
        }
    });

    Ok(SessionReport {
        connection_id,
        reader,
        writer,
    })
}

async fn read_pump<R, E>(
    mut reader: R,
    principal: Principal,
    router: Arc<MessageRouter>,
    activity: Arc<Activity>,
    token: CancellationToken,
    teardown: Arc<Teardown>,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    let result = loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            frame = reader.next() => frame,
        };
        let frame = match frame {
            None => break Ok(()),
            Some(Err(e)) => break Err(TransportError::Read(e.to_string())),
            Some(Ok(frame)) => frame,
        };
        activity.touch();
        // Router errors are logged where they happen and never end the session.
        match frame {
            WsMessage::Text(text) => {
                let _ = router.route(&principal, text.as_str().as_bytes()).await;
            }
            WsMessage::Binary(bytes) => {
                let _ = router.route(&principal, &bytes).await;
            }
            WsMessage::Close(_) => break Ok(()),
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    };
    teardown.run("reader").await;
    result
}

async fn write_pump<W>(
    mut writer: W,
    mut rx: QueueReceiver,
    activity: Arc<Activity>,
    config: SessionConfig,
    token: CancellationToken,
    teardown: Arc<Teardown>,
) -> Result<(), TransportError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval(config.heartbeat_interval);
    ping.tick().await;

    let result = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            next = rx.recv() => {
                let Some(message) = next else {
                    debug!("outbound queue closed");
                    break Ok(());
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        let err = TransportError::Encode(e.to_string());
                        warn!(message_id = %message.id, error_kind = err.error_kind(), error = %err, "skipping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = writer.send(WsMessage::Text(text.into())).await {
                    break Err(TransportError::Write(e.to_string()));
                }
            }
            _ = ping.tick() => {
                if activity.idle_for() >= config.heartbeat_timeout {
                    break Err(TransportError::HeartbeatTimeout(config.heartbeat_timeout.as_secs()));
                }
                if let Err(e) = writer.send(WsMessage::Ping(vec![].into())).await {
                    break Err(TransportError::Write(e.to_string()));
                }
                tracing::trace!("sent ping");
            }
        }
    };
    let _ = writer.close().await;
    teardown.run("writer").await;
    result
}
