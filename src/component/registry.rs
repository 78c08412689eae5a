//! Component registry: identity, lifecycle queues and the instance arena.
//!
//! Instance state machine:
//!
//! ```text
//! unregistered ─register─► pending mount ─► (mount + update) ─► mounted
//!                                              ▲                  │
//!                                              └── pending update ◄┘ register again
//! mounted ─(not seen in a pass / client teardown)─► unregistered
//! ```
//!
//! Registration happens while something is rendering, so it goes through a
//! [`Ledger`] that is borrowed separately from the instances. New instances
//! and slot changes recorded in the ledger are moved into the arena as soon as
//! the render call returns.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{ComponentMeta, ComponentSocket, ComponentType, LiveComponent, Outbox, Props, Slots};
use crate::render::{Cid, Dynamic, RenderTree};
use crate::view::{EventPayload, ViewMeta};

type IdentityKey = (&'static str, String);

struct Instance {
    key: IdentityKey,
    component: Box<dyn LiveComponent>,
    slots: Slots,
}

/// Identity map and queues, mutated while views and components render.
pub struct Ledger {
    by_key: FxHashMap<IdentityKey, Cid>,
    next_cid: Cid,
    pending_mounts: VecDeque<(Cid, Props)>,
    pending_updates: VecDeque<(Cid, Props)>,
    seen: FxHashSet<Cid>,
    spawned: Vec<(Cid, Instance)>,
    slot_updates: Vec<(Cid, Slots)>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            by_key: FxHashMap::default(),
            next_cid: 1,
            pending_mounts: VecDeque::new(),
            pending_updates: VecDeque::new(),
            seen: FxHashSet::default(),
            spawned: Vec::new(),
            slot_updates: Vec::new(),
        }
    }
}

impl Ledger {
    fn register(&mut self, ty: ComponentType, id: String, props: Props, slots: Slots) -> Cid {
        let key = (ty.name, id);
        if let Some(&cid) = self.by_key.get(&key) {
            self.slot_updates.push((cid, slots));
            self.pending_updates.push_back((cid, props));
            self.seen.insert(cid);
            crate::debug!("component"; "{}:{} (cid={}) queued for update", ty.name, key.1, cid);
            return cid;
        }

        let cid = self.next_cid;
        self.next_cid += 1;
        self.by_key.insert(key.clone(), cid);
        crate::debug!("component"; "{}:{} (cid={}) queued for mount", ty.name, key.1, cid);
        self.spawned.push((
            cid,
            Instance {
                key,
                component: (ty.construct)(),
                slots,
            },
        ));
        self.pending_mounts.push_back((cid, props));
        self.seen.insert(cid);
        cid
    }
}

/// Handed to `render` so views and components can place child components.
pub struct RenderContext<'a> {
    ledger: &'a mut Ledger,
}

impl RenderContext<'_> {
    /// Place component `C` with identity `id`; same type and id keep the same cid.
    pub fn live_component<C>(&mut self, id: impl Into<String>, props: Props) -> Dynamic
    where
        C: LiveComponent + Default,
    {
        self.live_component_with_slots::<C>(id, props, Slots::default())
    }

    pub fn live_component_with_slots<C>(
        &mut self,
        id: impl Into<String>,
        props: Props,
        slots: Slots,
    ) -> Dynamic
    where
        C: LiveComponent + Default,
    {
        let cid = self.register(ComponentType::of::<C>(), id, props, slots);
        Dynamic::Component(cid)
    }

    pub fn register(
        &mut self,
        ty: ComponentType,
        id: impl Into<String>,
        props: Props,
        slots: Slots,
    ) -> Cid {
        self.ledger.register(ty, id.into(), props, slots)
    }
}

/// All live components of one session.
#[derive(Default)]
pub struct ComponentRegistry {
    instances: BTreeMap<Cid, Instance>,
    ledger: Ledger,
    outbox: Outbox,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the instance for `(ty, id)` and queue its lifecycle.
    pub fn register(
        &mut self,
        ty: ComponentType,
        id: impl Into<String>,
        props: Props,
        slots: Slots,
    ) -> Cid {
        let cid = self.ledger.register(ty, id.into(), props, slots);
        self.absorb();
        cid
    }

    /// Run `f` with a render context, then take in whatever it registered.
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut RenderContext<'_>) -> R) -> R {
        let out = f(&mut RenderContext {
            ledger: &mut self.ledger,
        });
        self.absorb();
        out
    }

    fn absorb(&mut self) {
        for (cid, instance) in self.ledger.spawned.drain(..) {
            self.instances.insert(cid, instance);
        }
        for (cid, slots) in self.ledger.slot_updates.drain(..) {
            if let Some(instance) = self.instances.get_mut(&cid) {
                instance.slots = slots;
            }
        }
    }

    pub fn has_pending_lifecycle(&self) -> bool {
        !self.ledger.pending_mounts.is_empty() || !self.ledger.pending_updates.is_empty()
    }

    /// Cids with a mount or update waiting.
    pub fn pending_cids(&self) -> impl Iterator<Item = Cid> + '_ {
        self.ledger
            .pending_mounts
            .iter()
            .chain(&self.ledger.pending_updates)
            .map(|(cid, _)| *cid)
    }

    /// Drain queued mounts (each followed by an update), then queued updates.
    pub async fn run_pending_lifecycle(&mut self) -> Result<()> {
        while let Some((cid, props)) = self.ledger.pending_mounts.pop_front() {
            let Some(instance) = self.instances.get_mut(&cid) else {
                crate::warn!("component"; "cannot mount cid={}: not found", cid);
                continue;
            };
            let mut socket = ComponentSocket::new(cid);
            instance
                .component
                .mount(&mut socket, &props)
                .await
                .with_context(|| format!("mount of {} (cid={cid}) failed", instance.key.0))?;
            instance
                .component
                .update(&mut socket, &props)
                .await
                .with_context(|| format!("update of {} (cid={cid}) failed", instance.key.0))?;
            self.outbox.absorb(socket);
        }

        while let Some((cid, props)) = self.ledger.pending_updates.pop_front() {
            let Some(instance) = self.instances.get_mut(&cid) else {
                crate::warn!("component"; "cannot update cid={}: not found", cid);
                continue;
            };
            let mut socket = ComponentSocket::new(cid);
            instance
                .component
                .update(&mut socket, &props)
                .await
                .with_context(|| format!("update of {} (cid={cid}) failed", instance.key.0))?;
            self.outbox.absorb(socket);
        }
        Ok(())
    }

    /// Render one instance. Does not run lifecycle hooks.
    pub fn render(&mut self, cid: Cid, parent: &ViewMeta) -> Option<RenderTree> {
        let Some(instance) = self.instances.get_mut(&cid) else {
            crate::warn!("component"; "cannot render cid={}: not found", cid);
            return None;
        };
        let meta = ComponentMeta {
            cid,
            slots: &instance.slots,
            parent,
        };
        let mut ctx = RenderContext {
            ledger: &mut self.ledger,
        };
        let tree = instance.component.render(&mut ctx, &meta);
        self.absorb();
        Some(tree)
    }

    /// Route an event to one instance.
    ///
    /// An unknown cid is not an error: the client may target a component that
    /// was just pruned. Returns whether an instance handled it.
    pub async fn handle_event(
        &mut self,
        cid: Cid,
        event: &str,
        payload: &EventPayload,
    ) -> Result<bool> {
        let Some(instance) = self.instances.get_mut(&cid) else {
            crate::warn!("component"; "event '{}' targeted unknown cid={}", event, cid);
            return Ok(false);
        };
        let mut socket = ComponentSocket::new(cid);
        let result = instance
            .component
            .handle_event(event, payload, &mut socket)
            .await;
        // Messages queued before a failure are still delivered.
        self.outbox.absorb(socket);
        result.map(|()| true)
    }

    /// Start tracking which cids the next render references.
    pub fn begin_render_pass(&mut self) {
        self.ledger.seen.clear();
    }

    pub fn seen(&self) -> &FxHashSet<Cid> {
        &self.ledger.seen
    }

    /// Unregister every instance not referenced since `begin_render_pass`.
    pub fn prune_stale(&mut self) -> Vec<Cid> {
        let stale: Vec<Cid> = self
            .instances
            .keys()
            .filter(|cid| !self.ledger.seen.contains(cid))
            .copied()
            .collect();
        for cid in &stale {
            self.unregister(*cid);
        }
        if !stale.is_empty() {
            crate::debug!("component"; "pruned stale cids {:?}", stale);
        }
        stale
    }

    /// Drop an instance and its identity; a later registration gets a new cid.
    pub fn unregister(&mut self, cid: Cid) -> bool {
        let Some(instance) = self.instances.remove(&cid) else {
            return false;
        };
        self.ledger.by_key.remove(&instance.key);
        self.ledger.pending_mounts.retain(|(c, _)| *c != cid);
        self.ledger.pending_updates.retain(|(c, _)| *c != cid);
        self.ledger.seen.remove(&cid);
        crate::debug!("component"; "cid={} unregistered", cid);
        true
    }

    /// Release everything; used when the session ends.
    pub fn clear(&mut self) {
        self.instances.clear();
        self.ledger = Ledger::default();
        self.outbox = Outbox::default();
    }

    pub fn contains(&self, cid: Cid) -> bool {
        self.instances.contains_key(&cid)
    }

    pub fn cids(&self) -> impl Iterator<Item = Cid> + '_ {
        self.instances.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Take the events components queued since the last call.
    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }
}
