//! Diff Engine - minimal patches between render trees.
//!
//! Pure functions: nothing here touches session state. The caller decides
//! when the new tree becomes the baseline (only after the patch was sent).
//!
//! # Rules (per dynamic slot, keyed by index)
//!
//! | old \ new            | Text / Component | Tree                         | Comprehension                  |
//! |----------------------|------------------|------------------------------|--------------------------------|
//! | absent               | full             | full                         | full                           |
//! | same kind            | value if changed | recurse (full if statics differ) | rows / statics / stream ops |
//! | other kind           | value if changed | full                         | full                           |
//!
//! A stream-backed comprehension with no pending operations emits nothing,
//! whatever the old slot held: the client already retains those rows.

use std::collections::BTreeMap;

use super::{Cid, Comprehension, Dynamic, RenderTree, Rendered, StreamOp};

/// A partial render tree: only the slots that changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    /// Set when the tree's statics changed; every slot is then present.
    pub statics: Option<Vec<String>>,
    pub entries: BTreeMap<usize, PatchValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchValue {
    /// Replace the slot with this value.
    Full(Dynamic),
    /// Apply a nested patch to the tree already in the slot.
    Nested(Patch),
    /// Update a comprehension in place.
    Rows(RowsPatch),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowsPatch {
    pub statics: Option<Vec<String>>,
    pub rows: Vec<Vec<Dynamic>>,
    pub stream: Option<StreamOp>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.statics.is_none() && self.entries.is_empty()
    }

    /// A patch that replaces the whole tree.
    pub fn full(tree: &RenderTree) -> Self {
        Self {
            statics: Some(tree.statics.clone()),
            entries: tree
                .dynamics
                .iter()
                .enumerate()
                .map(|(i, d)| (i, PatchValue::Full(d.clone())))
                .collect(),
        }
    }
}

/// Compute the patch that turns `old` into `new`.
pub fn diff(old: &RenderTree, new: &RenderTree) -> Patch {
    if old.statics != new.statics {
        return Patch::full(new);
    }

    let mut patch = Patch::default();
    for (i, new_value) in new.dynamics.iter().enumerate() {
        let entry = match old.dynamics.get(i) {
            None => Some(PatchValue::Full(new_value.clone())),
            Some(old_value) => diff_dynamic(old_value, new_value),
        };
        if let Some(entry) = entry {
            patch.entries.insert(i, entry);
        }
    }
    patch
}

fn diff_dynamic(old: &Dynamic, new: &Dynamic) -> Option<PatchValue> {
    match (old, new) {
        (_, Dynamic::Comprehension(n)) if n.stream.is_some() => diff_stream(old, n),
        (Dynamic::Comprehension(o), Dynamic::Comprehension(n)) => diff_rows(o, n),
        (Dynamic::Tree(o), Dynamic::Tree(n)) => {
            if o.statics != n.statics {
                return Some(PatchValue::Full(new.clone()));
            }
            let nested = diff(o, n);
            (!nested.is_empty()).then_some(PatchValue::Nested(nested))
        }
        (o, n) if o == n => None,
        _ => Some(PatchValue::Full(new.clone())),
    }
}

fn diff_stream(old: &Dynamic, new: &Comprehension) -> Option<PatchValue> {
    let op = new.stream.as_ref()?;
    if op.is_empty() {
        // Client keeps its rows; nothing to say.
        return None;
    }
    let Dynamic::Comprehension(old) = old else {
        return Some(PatchValue::Full(Dynamic::Comprehension(new.clone())));
    };

    let statics = (old.statics != new.statics && !new.rows.is_empty())
        .then(|| new.statics.clone());
    Some(PatchValue::Rows(RowsPatch {
        statics,
        rows: new.rows.clone(),
        stream: Some(op.clone()),
    }))
}

fn diff_rows(old: &Comprehension, new: &Comprehension) -> Option<PatchValue> {
    if old.statics != new.statics {
        return Some(PatchValue::Rows(RowsPatch {
            statics: Some(new.statics.clone()),
            rows: new.rows.clone(),
            stream: None,
        }));
    }
    (old.rows != new.rows).then(|| {
        PatchValue::Rows(RowsPatch {
            statics: None,
            rows: new.rows.clone(),
            stream: None,
        })
    })
}

// ============================================================================
// Root + components
// ============================================================================

/// Change to one component's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentPatch {
    /// First time this cid is sent.
    Full(RenderTree),
    Partial(Patch),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedPatch {
    pub root: Patch,
    pub components: BTreeMap<Cid, ComponentPatch>,
}

impl RenderedPatch {
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.components.is_empty()
    }
}

/// Diff a whole render. Components missing from `new` are not mentioned;
/// the client learns about removals through its own teardown messages.
pub fn diff_rendered(old: &Rendered, new: &Rendered) -> RenderedPatch {
    let components = new
        .components
        .iter()
        .filter_map(|(cid, tree)| match old.components.get(cid) {
            None => Some((*cid, ComponentPatch::Full(tree.clone()))),
            Some(prev) => {
                let patch = diff(prev, tree);
                (!patch.is_empty()).then_some((*cid, ComponentPatch::Partial(patch)))
            }
        })
        .collect();

    RenderedPatch {
        root: diff(&old.root, &new.root),
        components,
    }
}

// ============================================================================
// Tests
// ============================================================================
