//! Live Views
//!
//! A [`LiveView`] owns the state of one page. The session calls its hooks in
//! response to client messages, timers and broadcasts, then re-renders it.
//!
//! ```text
//! join ──► mount ──► handle_params ──► render ─┐
//!                                              ▼
//!    event / info / live_patch ──► handler ──► render ──► diff ──► send
//! ```
//!
//! Side effects a handler wants (titles, client events, subscriptions,
//! timers, navigation) are queued on the [`LiveSocket`] and carried out by the
//! session after the handler returns.

pub mod params;
pub mod routes;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use url::Url;

use crate::component::RenderContext;
use crate::render::RenderTree;
use crate::session::upload::{UploadConfig, UploadConstraints, UploadManager};

pub use params::{BindingError, EventPayload, Params};
pub use routes::LiveRoutes;

/// Verified session data handed to `mount`.
pub type Session = Map<String, Value>;

/// A server-side message: a timer fire or a pub/sub delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoEvent {
    pub name: String,
    pub payload: Value,
}

impl InfoEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Read-only facts about the view being rendered.
#[derive(Debug, Clone, Default)]
pub struct ViewMeta {
    pub topic: String,
    pub path: String,
}

#[async_trait]
pub trait LiveView: Send + 'static {
    async fn mount(&mut self, _socket: &mut LiveSocket, _session: &Session) -> Result<()> {
        Ok(())
    }

    async fn handle_params(
        &mut self,
        _url: &Url,
        _params: &Params,
        _socket: &mut LiveSocket,
    ) -> Result<()> {
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &str,
        _payload: &EventPayload,
        _socket: &mut LiveSocket,
    ) -> Result<()> {
        crate::warn!("session"; "unhandled event '{}'", event);
        Ok(())
    }

    async fn handle_info(&mut self, _info: &InfoEvent, _socket: &mut LiveSocket) -> Result<()> {
        Ok(())
    }

    /// Called once when the session is released, whatever the cause.
    async fn disconnect(&mut self, _socket: &mut LiveSocket) {}

    fn render(&mut self, ctx: &mut RenderContext<'_>, meta: &ViewMeta) -> RenderTree;
}

// ============================================================================
// Event handler tables
// ============================================================================

pub type EventHandler<V> = fn(&mut V, &EventPayload, &mut LiveSocket) -> Result<()>;

/// Event name to handler, resolved once per view type.
///
/// ```ignore
/// static HANDLERS: LazyLock<EventHandlers<Counter>> = LazyLock::new(|| {
///     EventHandlers::new()
///         .on("inc", Counter::inc)
///         .on("dec", Counter::dec)
/// });
/// ```
pub struct EventHandlers<V> {
    table: FxHashMap<&'static str, EventHandler<V>>,
}

impl<V> Default for EventHandlers<V> {
    fn default() -> Self {
        Self {
            table: FxHashMap::default(),
        }
    }
}

impl<V> EventHandlers<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, name: &'static str, handler: EventHandler<V>) -> Self {
        self.table.insert(name, handler);
        self
    }

    /// Run the handler for `event`. Returns `false` when none is registered.
    pub fn dispatch(
        &self,
        view: &mut V,
        event: &str,
        payload: &EventPayload,
        socket: &mut LiveSocket,
    ) -> Result<bool> {
        match self.table.get(event) {
            Some(handler) => handler(view, payload, socket).map(|()| true),
            None => {
                crate::warn!("session"; "unhandled event '{}'", event);
                Ok(false)
            }
        }
    }

    pub fn handles(&self, event: &str) -> bool {
        self.table.contains_key(event)
    }
}

// ============================================================================
// Socket
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavKind {
    Push,
    Replace,
}

impl NavKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Replace => "replace",
        }
    }
}

/// Work a handler asked for, carried out by the session in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Subscribe(String),
    Broadcast { topic: String, message: Value },
    ScheduleInfo { event: InfoEvent, every: Duration },
    ScheduleOnce { event: InfoEvent, after: Duration },
    PushPatch { to: String },
    Navigate { kind: NavKind, to: String },
    Redirect { to: String },
}

/// The view's handle on its connection.
#[derive(Debug)]
pub struct LiveSocket {
    topic: String,
    title: Option<String>,
    events: Vec<(String, Value)>,
    commands: Vec<SocketCommand>,
    pub uploads: UploadManager,
}

impl LiveSocket {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            title: None,
            events: Vec::new(),
            commands: Vec::new(),
            uploads: UploadManager::default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Sent with the next render, then forgotten.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    /// Queue a client-side event, flushed with the next reply.
    pub fn push_event(&mut self, name: impl Into<String>, value: Value) {
        self.events.push((name.into(), value));
    }

    pub fn subscribe(&mut self, topic: impl Into<String>) {
        self.commands.push(SocketCommand::Subscribe(topic.into()));
    }

    pub fn broadcast(&mut self, topic: impl Into<String>, message: Value) {
        self.commands.push(SocketCommand::Broadcast {
            topic: topic.into(),
            message,
        });
    }

    /// Deliver `event` to `handle_info` every `every`, until the session ends.
    pub fn schedule_info(&mut self, event: InfoEvent, every: Duration) {
        self.commands
            .push(SocketCommand::ScheduleInfo { event, every });
    }

    pub fn schedule_info_once(&mut self, event: InfoEvent, after: Duration) {
        self.commands
            .push(SocketCommand::ScheduleOnce { event, after });
    }

    /// Change the URL without leaving the view; `handle_params` runs again.
    pub fn push_patch(&mut self, path: &str, params: &Params) {
        self.commands.push(SocketCommand::PushPatch {
            to: with_query(path, params),
        });
    }

    pub fn push_navigate(&mut self, path: &str, params: &Params) {
        self.navigate(NavKind::Push, path, params);
    }

    pub fn replace_navigate(&mut self, path: &str, params: &Params) {
        self.navigate(NavKind::Replace, path, params);
    }

    fn navigate(&mut self, kind: NavKind, path: &str, params: &Params) {
        self.commands.push(SocketCommand::Navigate {
            kind,
            to: with_query(path, params),
        });
    }

    /// Full page load elsewhere.
    pub fn redirect(&mut self, path: &str, params: &Params) {
        self.commands.push(SocketCommand::Redirect {
            to: with_query(path, params),
        });
    }

    pub fn allow_upload(
        &mut self,
        name: impl Into<String>,
        constraints: UploadConstraints,
    ) -> &UploadConfig {
        self.uploads.allow(name, constraints)
    }

    pub(crate) fn take_title(&mut self) -> Option<String> {
        self.title.take()
    }

    pub(crate) fn take_events(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn take_commands(&mut self) -> Vec<SocketCommand> {
        std::mem::take(&mut self.commands)
    }
}

fn with_query(path: &str, params: &Params) -> String {
    if params.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", params.to_query())
    }
}

// ============================================================================
// Tests
// ============================================================================
