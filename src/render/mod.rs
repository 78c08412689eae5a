//! Render Trees
//!
//! A render produces a [`RenderTree`]: the literal text of a markup unit split
//! into `statics`, with the interpolated values between them in `dynamics`.
//!
//! ```text
//! <div>Count: {count}</div>
//!   statics  = ["<div>Count: ", "</div>"]
//!   dynamics = [Text("0")]
//! ```
//!
//! Dynamic slots hold one of:
//!
//! | Variant          | Produced by                          |
//! |------------------|--------------------------------------|
//! | `Text`           | an interpolated value (escaped)      |
//! | `Tree`           | a nested markup unit / conditional   |
//! | `Comprehension`  | a loop, optionally backed by a stream |
//! | `Component(cid)` | a live component reference           |
//!
//! # Submodules
//!
//! - [`stream`] - flush-once operation log for client-retained collections
//! - [`diff`] - minimal patch between two trees
//! - [`wire`] - JSON encoding of trees and patches

pub mod diff;
pub mod stream;
pub mod wire;

#[cfg(test)]
pub mod client;

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::Serialize;

pub use diff::{diff, diff_rendered};
pub use stream::{Stream, StreamOp};

/// Integer identity of a live component, unique within one session.
pub type Cid = u32;

/// One render pass of one markup unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderTree {
    pub statics: Vec<String>,
    pub dynamics: Vec<Dynamic>,
}

/// A value interpolated between two statics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dynamic {
    Text(String),
    Tree(RenderTree),
    Comprehension(Comprehension),
    Component(Cid),
}

/// The render of a loop body over a collection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Comprehension {
    /// Literal segments shared by every row.
    pub statics: Vec<String>,
    /// One dynamics row per iteration.
    pub rows: Vec<Vec<Dynamic>>,
    /// Present when the rows come from a [`Stream`].
    pub stream: Option<StreamOp>,
}

impl RenderTree {
    pub fn build() -> TreeBuilder {
        TreeBuilder::default()
    }

    /// A tree with no dynamics.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            statics: vec![text.into()],
            dynamics: Vec::new(),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.dynamics.is_empty() && self.statics.len() <= 1
    }

    /// Render to text, resolving component references through `components`.
    ///
    /// Unknown cids render as nothing.
    pub fn to_html(&self, components: &BTreeMap<Cid, RenderTree>) -> String {
        let mut out = String::new();
        self.write_html(components, &mut out);
        out
    }

    fn write_html(&self, components: &BTreeMap<Cid, RenderTree>, out: &mut String) {
        interleave(&self.statics, &self.dynamics, components, out);
    }
}

fn interleave(
    statics: &[String],
    dynamics: &[Dynamic],
    components: &BTreeMap<Cid, RenderTree>,
    out: &mut String,
) {
    for (i, s) in statics.iter().enumerate() {
        out.push_str(s);
        if let Some(d) = dynamics.get(i) {
            d.write_html(components, out);
        }
    }
}

impl Dynamic {
    fn write_html(&self, components: &BTreeMap<Cid, RenderTree>, out: &mut String) {
        match self {
            Self::Text(s) => out.push_str(s),
            Self::Tree(t) => t.write_html(components, out),
            Self::Comprehension(c) => {
                for row in &c.rows {
                    interleave(&c.statics, row, components, out);
                }
            }
            Self::Component(cid) => {
                if let Some(tree) = components.get(cid) {
                    tree.write_html(components, out);
                }
            }
        }
    }

    /// Escaped text value.
    pub fn value(v: impl Display) -> Self {
        Self::Text(escape_html(&v.to_string()))
    }
}

impl From<RenderTree> for Dynamic {
    /// Collapses a literal tree to its text.
    fn from(tree: RenderTree) -> Self {
        if tree.is_literal() {
            Self::Text(tree.statics.into_iter().next().unwrap_or_default())
        } else {
            Self::Tree(tree)
        }
    }
}

impl From<Comprehension> for Dynamic {
    fn from(c: Comprehension) -> Self {
        Self::Comprehension(c)
    }
}

impl From<String> for Dynamic {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Dynamic {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl Comprehension {
    /// Build a plain loop from per-item trees.
    ///
    /// Every tree is expected to come from the same loop body; the first one
    /// supplies the shared statics. An empty collection collapses to `""`.
    pub fn collect(items: impl IntoIterator<Item = RenderTree>) -> Dynamic {
        let mut statics = None;
        let mut rows = Vec::new();
        for tree in items {
            debug_assert!(
                statics.as_ref().is_none_or(|s| *s == tree.statics),
                "comprehension rows must share statics"
            );
            statics.get_or_insert(tree.statics);
            rows.push(tree.dynamics);
        }
        match statics {
            Some(statics) => Dynamic::Comprehension(Self {
                statics,
                rows,
                stream: None,
            }),
            None => Dynamic::Text(String::new()),
        }
    }

    /// Render the pending items of a stream and take its operations.
    ///
    /// Always yields a stream-backed comprehension, possibly idle, so that a
    /// render without pending work is distinguishable from an empty loop.
    pub fn stream<T, F>(stream: &mut Stream<T>, mut render_item: F) -> Dynamic
    where
        T: Serialize + Clone,
        F: FnMut(&str, &T) -> RenderTree,
    {
        let mut statics = Vec::new();
        let rows = stream
            .iter()
            .map(|(dom_id, item)| {
                let tree = render_item(dom_id, item);
                if statics.is_empty() {
                    statics = tree.statics;
                }
                tree.dynamics
            })
            .collect();
        let op = stream
            .extract_wire_ops()
            .unwrap_or_else(|| StreamOp::idle(stream.name()));

        Dynamic::Comprehension(Self {
            statics,
            rows,
            stream: Some(op),
        })
    }

    /// Stream-backed with nothing to tell the client.
    pub fn is_idle_stream(&self) -> bool {
        self.stream.as_ref().is_some_and(StreamOp::is_empty) && self.rows.is_empty()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Incremental construction of a [`RenderTree`].
///
/// ```ignore
/// let tree = RenderTree::build()
///     .text("<div>Count: ")
///     .value(count)
///     .text("</div>")
///     .finish();
/// ```
#[derive(Debug, Default)]
pub struct TreeBuilder {
    statics: Vec<String>,
    dynamics: Vec<Dynamic>,
    current: String,
}

impl TreeBuilder {
    /// Append literal markup.
    pub fn text(mut self, s: &str) -> Self {
        self.current.push_str(s);
        self
    }

    /// Append an escaped value slot.
    pub fn value(self, v: impl Display) -> Self {
        self.dynamic(Dynamic::value(v))
    }

    /// Append a raw (unescaped) text slot.
    pub fn raw(self, s: impl Into<String>) -> Self {
        self.dynamic(Dynamic::Text(s.into()))
    }

    pub fn component(self, cid: Cid) -> Self {
        self.dynamic(Dynamic::Component(cid))
    }

    pub fn dynamic(mut self, d: impl Into<Dynamic>) -> Self {
        self.statics.push(std::mem::take(&mut self.current));
        self.dynamics.push(d.into());
        self
    }

    pub fn finish(mut self) -> RenderTree {
        self.statics.push(self.current);
        RenderTree {
            statics: self.statics,
            dynamics: self.dynamics,
        }
    }
}

// ============================================================================
// Whole render (root + components)
// ============================================================================

/// The root tree of a view plus every component tree it references.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rendered {
    pub root: RenderTree,
    pub components: BTreeMap<Cid, RenderTree>,
}

impl Rendered {
    pub fn new(root: RenderTree) -> Self {
        Self {
            root,
            components: BTreeMap::new(),
        }
    }

    pub fn to_html(&self) -> String {
        self.root.to_html(&self.components)
    }
}

/// Escape text for interpolation into markup.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
