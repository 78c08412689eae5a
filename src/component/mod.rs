//! Live Components
//!
//! A component is a stateful piece of a view with its own event handlers.
//! Views (and other components) place one with
//! [`RenderContext::live_component`], which yields a [`Dynamic::Component`]
//! slot holding the instance's cid.
//!
//! # Architecture
//!
//! ```text
//! ComponentRegistry
//!   instances: cid ──► Instance { component, slots }      (arena)
//!   ledger:    (type, id) ──► cid, pending mounts/updates, seen set
//!
//! render pass:  begin ─► view.render ─► resolve (lifecycle + nested renders) ─► prune
//! ```
//!
//! A component's state is the component value itself; the registry only
//! hands it back to its own hooks.
//!
//! [`Dynamic::Component`]: crate::render::Dynamic::Component

pub mod lifecycle;
pub mod registry;


use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::render::{Cid, RenderTree};
use crate::view::{EventPayload, ViewMeta};

pub use lifecycle::{LifecycleError, MAX_COMPONENT_ITERATIONS, resolve_components};
pub use registry::{ComponentRegistry, RenderContext};

/// Values passed from the parent template on every registration.
pub type Props = Map<String, Value>;

/// Named markup supplied by the parent, re-supplied on every registration.
pub type Slots = FxHashMap<String, RenderTree>;

#[async_trait]
pub trait LiveComponent: Send + 'static {
    /// First registration only; `update` follows immediately with the same props.
    async fn mount(&mut self, _socket: &mut ComponentSocket, _props: &Props) -> Result<()> {
        Ok(())
    }

    async fn update(&mut self, _socket: &mut ComponentSocket, _props: &Props) -> Result<()> {
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &str,
        _payload: &EventPayload,
        socket: &mut ComponentSocket,
    ) -> Result<()> {
        crate::warn!("component"; "cid={} has no handler for '{}'", socket.cid(), event);
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, meta: &ComponentMeta<'_>) -> RenderTree;
}

/// How to identify and build one component type.
#[derive(Clone, Copy)]
pub struct ComponentType {
    pub name: &'static str,
    pub construct: fn() -> Box<dyn LiveComponent>,
}

impl ComponentType {
    pub fn of<C: LiveComponent + Default>() -> Self {
        Self {
            name: std::any::type_name::<C>(),
            construct: construct::<C>,
        }
    }
}

fn construct<C: LiveComponent + Default>() -> Box<dyn LiveComponent> {
    Box::new(C::default())
}

impl std::fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// What a component sees while rendering.
#[derive(Debug, Clone, Copy)]
pub struct ComponentMeta<'a> {
    pub cid: Cid,
    pub slots: &'a Slots,
    pub parent: &'a ViewMeta,
}

impl ComponentMeta<'_> {
    /// The slot's tree, or an empty literal when the parent left it out.
    pub fn slot(&self, name: &str) -> RenderTree {
        self.slots
            .get(name)
            .cloned()
            .unwrap_or_else(|| RenderTree::literal(""))
    }
}

/// A component's handle during its hooks.
#[derive(Debug, Default)]
pub struct ComponentSocket {
    cid: Cid,
    pub(crate) parent_events: Vec<(String, Value)>,
    pub(crate) push_events: Vec<(String, Value)>,
}

impl ComponentSocket {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            ..Self::default()
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// Deliver an event to the owning view's `handle_event` once this hook returns.
    pub fn send_parent(&mut self, event: impl Into<String>, payload: Value) {
        self.parent_events.push((event.into(), payload));
    }

    /// Queue a client-side event, flushed with the next reply.
    pub fn push_event(&mut self, name: impl Into<String>, value: Value) {
        self.push_events.push((name.into(), value));
    }
}

/// Messages components queued for the session.
#[derive(Debug, Default, PartialEq)]
pub struct Outbox {
    pub parent_events: Vec<(String, Value)>,
    pub push_events: Vec<(String, Value)>,
}

impl Outbox {
    pub fn absorb(&mut self, socket: ComponentSocket) {
        self.parent_events.extend(socket.parent_events);
        self.push_events.extend(socket.push_events);
    }

    pub fn is_empty(&self) -> bool {
        self.parent_events.is_empty() && self.push_events.is_empty()
    }
}
