//! Live Sessions
//!
//! One session is one client connection running one live view at a time.
//!
//! # Architecture
//!
//! ```text
//! transport ──Text/Binary──┐
//! timers ──────Info────────┼──► mpsc ──► SessionActor ──► dispatch ──► render ──► diff ──► transport
//! pubsub ──────Info────────┘                  │
//!                                             └── SessionState (view, socket, components, previous tree)
//! ```
//!
//! Everything that can change a session's state arrives as a [`SessionMsg`]
//! on a single queue, and the actor handles one message to completion before
//! taking the next. Render, diff and send therefore never interleave.
//!
//! The tree a diff is computed against is the last one the transport
//! accepted, so a failed send never leaves the client and server out of step.

pub mod dispatch;
pub mod message;
pub mod schedule;
pub mod upload;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use url::Url;

use crate::auth::{AuthError, Signer, resolve_secret};
use crate::component::lifecycle::render_pass;
use crate::component::{ComponentRegistry, LifecycleError};
use crate::config::LumenConfig;
use crate::instrument::{Instrumentation, NoopInstrumentation, names};
use crate::pubsub::{Delivery, InMemoryPubSub, PubSub, Subscriber, SubscriberId};
use crate::render::wire::{EVENTS, TITLE, encode_rendered, encode_rendered_patch};
use crate::render::{Rendered, diff_rendered};
use crate::view::{InfoEvent, LiveRoutes, LiveSocket, LiveView, Params, ViewMeta};

pub use message::{Envelope, Inbound, ProtocolError};
use schedule::Scheduler;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a session can be woken up by.
#[derive(Debug)]
pub enum SessionMsg {
    Text(String),
    Binary(Vec<u8>),
    /// A timer fire or broadcast. `generation` is the join that asked for it.
    Info { generation: u64, event: InfoEvent },
    /// The transport went away.
    Disconnected,
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    Socket(String),
}

/// Outbound half of a connection. Inbound frames arrive as [`SessionMsg`]s.
pub trait Transport: Send + 'static {
    fn send(&mut self, text: String) -> Result<(), TransportError>;

    fn close(&mut self);
}

// ============================================================================
// Errors
// ============================================================================

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("join rejected: {0}")]
    Credential(#[from] AuthError),

    #[error(transparent)]
    Cycle(LifecycleError),

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no frame received within {0:?}")]
    HeartbeatTimeout(Duration),
}

impl SessionError {
    /// Classify an error returned by view or component code.
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<LifecycleError>() {
            Ok(cycle) => Self::Cycle(cycle),
            Err(err) => Self::Handler(err),
        }
    }

    /// Short reason sent to the client when its join is refused.
    fn join_reason(&self) -> &'static str {
        match self {
            Self::Credential(_) => "unauthorized",
            Self::Protocol(ProtocolError::UnknownRoute(_)) => "not_found",
            _ => "join_failed",
        }
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// What every session on a server shares.
pub struct Endpoint {
    pub routes: LiveRoutes,
    pub signer: Signer,
    pub pubsub: Arc<dyn PubSub>,
    pub instrumentation: Arc<dyn Instrumentation>,
    pub config: Arc<LumenConfig>,
}

impl Endpoint {
    pub fn new(routes: LiveRoutes, config: Arc<LumenConfig>) -> Self {
        let secret = resolve_secret(config.security.secret.as_deref());
        Self {
            routes,
            signer: Signer::new(&secret, config.security.token_max_age()),
            pubsub: Arc::new(InMemoryPubSub::new()),
            instrumentation: Arc::new(NoopInstrumentation),
            config,
        }
    }

    pub fn with_signer(mut self, signer: Signer) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }
}

/// Forwards pub/sub deliveries into a session's queue without blocking.
struct QueueSubscriber {
    tx: mpsc::Sender<SessionMsg>,
    generation: u64,
}

impl Subscriber for QueueSubscriber {
    fn deliver(&self, event: InfoEvent) -> Delivery {
        let msg = SessionMsg::Info {
            generation: self.generation,
            event,
        };
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

/// The joined view and everything it owns.
pub struct SessionState {
    /// Which join of this connection created the state.
    generation: u64,
    topic: String,
    view: Box<dyn LiveView>,
    socket: LiveSocket,
    meta: ViewMeta,
    url: Url,
    registry: ComponentRegistry,
    /// Last tree the transport accepted.
    previous: Option<Rendered>,
    scheduler: Scheduler,
}

impl SessionState {
    fn new(
        generation: u64,
        topic: String,
        view: Box<dyn LiveView>,
        url: Url,
        tx: mpsc::Sender<SessionMsg>,
    ) -> Self {
        Self {
            generation,
            socket: LiveSocket::new(topic.clone()),
            meta: ViewMeta {
                topic: topic.clone(),
                path: url.path().to_string(),
            },
            topic,
            view,
            url,
            registry: ComponentRegistry::new(),
            previous: None,
            scheduler: Scheduler::new(tx, generation),
        }
    }

    fn set_url(&mut self, url: Url) {
        self.meta.path = url.path().to_string();
        self.url = url;
    }

    async fn render(&mut self, max_iterations: usize) -> Result<Rendered, SessionError> {
        let Self {
            view,
            registry,
            meta,
            ..
        } = self;
        let meta = &*meta;
        render_pass(registry, meta, max_iterations, |ctx| view.render(ctx, meta))
            .await
            .map_err(SessionError::from_handler)
    }

    /// Render and encode against the last sent tree (in full when there is
    /// none), carrying the pending title and client events along.
    ///
    /// `previous` is left alone; the caller commits the returned tree once
    /// it has been sent.
    async fn render_diff(&mut self, max_iterations: usize) -> Result<(Value, Rendered), SessionError> {
        let rendered = self.render(max_iterations).await?;
        let mut wire = match &self.previous {
            Some(previous) => encode_rendered_patch(&diff_rendered(previous, &rendered)),
            None => encode_rendered(&rendered),
        };
        self.attach_side_channel(&mut wire);
        Ok((wire, rendered))
    }

    fn attach_side_channel(&mut self, wire: &mut Value) {
        let outbox = self.registry.take_outbox();
        for (name, _) in &outbox.parent_events {
            crate::warn!("component"; "send_parent('{}') from a lifecycle hook is ignored", name);
        }
        let mut events = self.socket.take_events();
        events.extend(outbox.push_events);

        let Value::Object(map) = wire else {
            return;
        };
        if let Some(title) = self.socket.take_title() {
            map.insert(TITLE.into(), Value::String(title));
        }
        if !events.is_empty() {
            let events = events
                .into_iter()
                .map(|(name, value)| json!([name, value]))
                .collect();
            map.insert(EVENTS.into(), Value::Array(events));
        }
    }
}

/// Query parameters overlaid with the route's path parameters.
fn route_params(url: &Url, path_params: Params) -> Params {
    let mut params = Params::from_query(url.query().unwrap_or(""));
    params.merge(path_params);
    params
}

// ============================================================================
// Actor
// ============================================================================

pub struct SessionActor<T: Transport> {
    id: SubscriberId,
    endpoint: Arc<Endpoint>,
    transport: T,
    rx: mpsc::Receiver<SessionMsg>,
    tx: mpsc::Sender<SessionMsg>,
    /// Joins seen so far; the current state carries the latest.
    joins: u64,
    state: Option<SessionState>,
}

impl<T: Transport> SessionActor<T> {
    /// Create the actor and the sender its connection feeds.
    pub fn new(endpoint: Arc<Endpoint>, transport: T) -> (Self, mpsc::Sender<SessionMsg>) {
        let (tx, rx) = mpsc::channel(endpoint.config.session.channel_buffer.max(1));
        let actor = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            transport,
            rx,
            tx: tx.clone(),
            joins: 0,
            state: None,
        };
        (actor, tx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    fn max_iterations(&self) -> usize {
        self.endpoint.config.session.max_component_iterations
    }

    /// Run until the connection ends or a fatal error, then release
    /// everything the session owns and close the transport.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let heartbeat = self.endpoint.config.session.heartbeat_timeout();
        let mut deadline = Instant::now() + heartbeat;
        let instrumentation = Arc::clone(&self.endpoint.instrumentation);
        instrumentation.update_updown_counter(names::ACTIVE_SESSIONS, 1, &[]);

        let result = loop {
            let msg = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(None) | Ok(Some(SessionMsg::Disconnected)) => break Ok(()),
                Ok(Some(msg)) => msg,
                Err(_) => break Err(SessionError::HeartbeatTimeout(heartbeat)),
            };
            if matches!(msg, SessionMsg::Text(_) | SessionMsg::Binary(_)) {
                deadline = Instant::now() + heartbeat;
            }
            if let Err(e) = self.handle(msg).await {
                break Err(e);
            }
        };

        self.release().await;
        self.transport.close();
        instrumentation.update_updown_counter(names::ACTIVE_SESSIONS, -1, &[]);
        match &result {
            Ok(()) => crate::debug!("session"; "session {} closed", self.id),
            Err(e) => crate::log!("session"; "session {} terminated: {}", self.id, e),
        }
        result
    }

    async fn handle(&mut self, msg: SessionMsg) -> Result<(), SessionError> {
        match msg {
            SessionMsg::Text(text) => {
                let envelope = Envelope::parse(&text)?;
                self.dispatch(envelope).await
            }
            SessionMsg::Binary(data) => {
                let frame = upload::BinaryFrame::decode(&data).map_err(ProtocolError::from)?;
                let (envelope, chunk) = Envelope::from_binary(frame);
                self.on_chunk(&envelope, &chunk)
            }
            SessionMsg::Info { generation, event } => self.on_info(generation, event).await,
            SessionMsg::Disconnected => Ok(()),
        }
    }

    /// Render and diff `state`, timing both.
    async fn render_diff(&mut self, state: &mut SessionState) -> Result<(Value, Rendered), SessionError> {
        let started = Instant::now();
        let result = state.render_diff(self.max_iterations()).await;
        self.endpoint
            .instrumentation
            .record_duration(names::RENDER_TIME, started.elapsed(), &[]);
        result
    }

    fn send(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        self.transport.send(envelope.to_json())?;
        Ok(())
    }

    /// Drop the joined view: timers, subscriptions, uploads, components.
    async fn release(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        state.scheduler.cancel_all();
        self.endpoint.pubsub.unsubscribe_all(self.id);
        state.socket.uploads.close();
        state.registry.clear();
        state.view.disconnect(&mut state.socket).await;
        crate::debug!("session"; "released {}", state.topic);
    }
}
