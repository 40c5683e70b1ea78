//! Per-connection task runner.
//!
//! Four tasks share one [`ConnectionSession`]:
//!
//! | Task | Reads | Writes |
//! |------|-------|--------|
//! | reader | transport frames | ingress queue, session control |
//! | feeder | ingress queue | recognizer (callbacks into the session) |
//! | writer | outbound merge queue | transport |
//! | dispatcher | running generation audio | outbound merge queue |
//!
//! The first task to finish tears the others down and shuts the session down.

use crate::dispatcher::run_dispatcher;
use crate::ingress::{AudioFrame, AudioIngressQueue, IngressReceiver, IngressSender};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{ConnectionSession, SessionDeps};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Transport-neutral inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// A connection whose session exists but whose tasks have not started yet.
pub struct Connection {
    session: Arc<ConnectionSession>,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
    ingress_tx: IngressSender,
    ingress_rx: IngressReceiver,
}

impl Connection {
    pub fn open(session_id: impl Into<String>, deps: &SessionDeps) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(session_id, deps, tx);
        let (ingress_tx, ingress_rx) = AudioIngressQueue::bounded(deps.config.ingress_capacity, Arc::clone(&deps.metrics));
        Self {
            session,
            outbound,
            ingress_tx,
            ingress_rx,
        }
    }

    pub fn session(&self) -> Arc<ConnectionSession> {
        Arc::clone(&self.session)
    }

    /// Run until the client goes away or a task fails.
    pub async fn run<S, K>(self, inbound: S, sink: K)
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
        K: Sink<String> + Send + Unpin + 'static,
        K::Error: Display + Send,
    {
        let Connection {
            session,
            outbound,
            ingress_tx,
            ingress_rx,
        } = self;
        let session_id = session.id().to_string();
        info!(target: "realtalk::ws", session_id = %session_id, "🔌 Connection opened");
        session.emit(ServerMessage::status("ready", "Connected"));

        let mut reader = tokio::spawn(read_inbound(Arc::clone(&session), inbound, ingress_tx));
        let mut feeder = tokio::spawn(feed_recognizer(Arc::clone(&session), ingress_rx));
        let mut writer = tokio::spawn(write_outbound(session_id.clone(), outbound, sink));
        let mut dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&session)));

        let finished = tokio::select! {
            r = &mut reader => ("reader", r),
            r = &mut feeder => ("feeder", r),
            r = &mut writer => ("writer", r),
            r = &mut dispatcher => ("dispatcher", r),
        };
        match finished {
            (task, Ok(())) => debug!(target: "realtalk::ws", session_id = %session_id, "{} task ended", task),
            (task, Err(e)) => error!(target: "realtalk::ws", session_id = %session_id, "{} task failed: {}", task, e),
        }

        for handle in [&reader, &feeder, &writer, &dispatcher] {
            handle.abort();
        }
        session.shutdown();
        info!(target: "realtalk::ws", session_id = %session_id, "🔌 Connection closed");
    }
}

/// Open a connection and run it to completion.
pub async fn run_connection<S, K>(session_id: impl Into<String>, deps: &SessionDeps, inbound: S, sink: K)
where
    S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    K: Sink<String> + Send + Unpin + 'static,
    K::Error: Display + Send,
{
    Connection::open(session_id, deps).run(inbound, sink).await
}

async fn read_inbound<S>(session: Arc<ConnectionSession>, mut inbound: S, ingress: IngressSender)
where
    S: Stream<Item = InboundFrame> + Unpin,
{
    while let Some(frame) = inbound.next().await {
        match frame {
            InboundFrame::Binary(bytes) => match AudioFrame::parse(&bytes) {
                Ok(frame) => {
                    ingress.offer(frame);
                }
                Err(e) => warn!(target: "realtalk::ingress", session_id = %session.id(), "Dropping frame: {}", e),
            },
            InboundFrame::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => session.handle_client_message(message),
                Err(e) => warn!(target: "realtalk::ws", session_id = %session.id(), "Ignoring malformed message: {}", e),
            },
            InboundFrame::Close => break,
        }
    }
    if ingress.dropped() > 0 {
        info!(target: "realtalk::ingress", session_id = %session.id(), dropped = ingress.dropped(), "Ingress overflow total");
    }
}

async fn feed_recognizer(session: Arc<ConnectionSession>, mut ingress: IngressReceiver) {
    let recognizer = session.recognizer();
    while let Some(frame) = ingress.recv().await {
        if !session.accepts_audio() {
            continue;
        }
        if let Err(e) = recognizer.feed(&frame, &*session).await {
            warn!(target: "realtalk::recognizer", session_id = %session.id(), "Recognizer error: {}", e);
        }
    }
}

async fn write_outbound<K>(session_id: String, mut outbound: mpsc::UnboundedReceiver<ServerMessage>, mut sink: K)
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(target: "realtalk::ws", session_id = %session_id, "Failed to encode {}: {}", message.kind(), e);
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            warn!(target: "realtalk::ws", session_id = %session_id, "Send failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}
