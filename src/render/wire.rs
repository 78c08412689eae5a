//! Wire Encoding
//!
//! Trees and patches travel as nested JSON objects:
//!
//! ```text
//! {"0": "1", "1": {...}, "s": ["<div>", "</div>", ""]}   tree / patch
//! {"d": [["a"], ["b"]], "s": ["<li>", "</li>"]}           comprehension
//! {"d": [...], "stream": [[["users-2", 0, null]], ["users-1"]]}   stream ops
//! {"0": 3}                                                component ref
//! {"c": {"3": {"0": "x", "s": [...], "r": 1}}}             component trees
//! ```
//!
//! Stream inserts are `[dom_id, at, limit]` triples in the order they were
//! made, one per `"d"` row. A trailing `true` marks a reset.
//!
//! Within one component batch, a full component tree whose statics equal an
//! earlier one's replaces its `"s"` array with that component's cid. This is
//! encoding only: diffing always compares the real statics.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};

use super::diff::{ComponentPatch, Patch, PatchValue, RenderedPatch, RowsPatch};
use super::{Cid, Comprehension, Dynamic, RenderTree, Rendered, StreamOp};

pub const STATICS: &str = "s";
pub const ROWS: &str = "d";
pub const STREAM: &str = "stream";
pub const COMPONENTS: &str = "c";
pub const ROOT: &str = "r";
pub const TITLE: &str = "t";
pub const EVENTS: &str = "e";

// ============================================================================
// Full trees
// ============================================================================

pub fn encode_tree(tree: &RenderTree) -> Value {
    let mut map = Map::new();
    for (i, d) in tree.dynamics.iter().enumerate() {
        map.insert(i.to_string(), encode_dynamic(d));
    }
    map.insert(STATICS.into(), json!(tree.statics));
    Value::Object(map)
}

pub fn encode_dynamic(d: &Dynamic) -> Value {
    match d {
        Dynamic::Text(s) => Value::String(s.clone()),
        Dynamic::Tree(t) => encode_tree(t),
        Dynamic::Comprehension(c) => encode_comprehension(c),
        Dynamic::Component(cid) => json!(cid),
    }
}

fn encode_comprehension(c: &Comprehension) -> Value {
    let op = c.stream.as_ref().filter(|op| !op.is_empty());
    if c.rows.is_empty() && c.statics.is_empty() && op.is_none() {
        return Value::String(String::new());
    }

    let mut map = Map::new();
    map.insert(ROWS.into(), encode_rows(&c.rows));
    map.insert(STATICS.into(), json!(c.statics));
    if let Some(op) = op {
        map.insert(STREAM.into(), encode_stream(op));
    }
    Value::Object(map)
}

fn encode_rows(rows: &[Vec<Dynamic>]) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| Value::Array(row.iter().map(encode_dynamic).collect()))
            .collect(),
    )
}

pub fn encode_stream(op: &StreamOp) -> Value {
    let inserts = op
        .inserts
        .iter()
        .map(|ins| json!([ins.dom_id, ins.at, ins.limit]))
        .collect();

    let mut out = vec![Value::Array(inserts), json!(op.deletes)];
    if op.reset {
        out.push(Value::Bool(true));
    }
    Value::Array(out)
}

// ============================================================================
// Patches
// ============================================================================

pub fn encode_patch(patch: &Patch) -> Value {
    let mut map = Map::new();
    for (i, entry) in &patch.entries {
        let value = match entry {
            PatchValue::Full(d) => encode_dynamic(d),
            PatchValue::Nested(p) => encode_patch(p),
            PatchValue::Rows(rows) => encode_rows_patch(rows),
        };
        map.insert(i.to_string(), value);
    }
    if let Some(statics) = &patch.statics {
        map.insert(STATICS.into(), json!(statics));
    }
    Value::Object(map)
}

fn encode_rows_patch(p: &RowsPatch) -> Value {
    let mut map = Map::new();
    map.insert(ROWS.into(), encode_rows(&p.rows));
    if let Some(statics) = &p.statics {
        map.insert(STATICS.into(), json!(statics));
    }
    if let Some(op) = &p.stream {
        map.insert(STREAM.into(), encode_stream(op));
    }
    Value::Object(map)
}

// ============================================================================
// Component batches
// ============================================================================

/// Encodes the components of one outbound message, sharing statics between
/// same-shaped full renders.
#[derive(Debug, Default)]
pub struct ComponentBatch {
    seen: FxHashMap<Vec<String>, Cid>,
    out: Map<String, Value>,
}

impl ComponentBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_full(&mut self, cid: Cid, tree: &RenderTree) {
        let mut encoded = encode_tree(tree);
        if let Value::Object(map) = &mut encoded {
            match self.seen.get(&tree.statics) {
                Some(first) => {
                    map.insert(STATICS.into(), json!(first));
                }
                None => {
                    self.seen.insert(tree.statics.clone(), cid);
                }
            }
            map.insert(ROOT.into(), json!(1));
        }
        self.out.insert(cid.to_string(), encoded);
    }

    pub fn push_patch(&mut self, cid: Cid, patch: &Patch) {
        self.out.insert(cid.to_string(), encode_patch(patch));
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn finish(self) -> Value {
        Value::Object(self.out)
    }
}

/// A full render: root tree plus every component under `"c"`.
pub fn encode_rendered(rendered: &Rendered) -> Value {
    let mut root = encode_tree(&rendered.root);
    let mut batch = ComponentBatch::new();
    for (cid, tree) in &rendered.components {
        batch.push_full(*cid, tree);
    }
    attach_components(&mut root, batch);
    root
}

pub fn encode_rendered_patch(patch: &RenderedPatch) -> Value {
    let mut root = encode_patch(&patch.root);
    let mut batch = ComponentBatch::new();
    for (cid, p) in &patch.components {
        match p {
            ComponentPatch::Full(tree) => batch.push_full(*cid, tree),
            ComponentPatch::Partial(p) => batch.push_patch(*cid, p),
        }
    }
    attach_components(&mut root, batch);
    root
}

fn attach_components(root: &mut Value, batch: ComponentBatch) {
    if batch.is_empty() {
        return;
    }
    if let Value::Object(map) = root {
        map.insert(COMPONENTS.into(), batch.finish());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::stream::{InsertOptions, StreamInsert};
    use crate::render::{Stream, diff, diff_rendered};
    use serde::Serialize;

    fn counter(count: i64) -> RenderTree {
        RenderTree::build()
            .text("<div>Count: ")
            .value(count)
            .text("</div>")
            .finish()
    }

    #[derive(Clone, Serialize)]
    struct Item {
        id: u32,
    }

    #[test]
    fn test_full_counter_shape() {
        assert_eq!(
            encode_tree(&counter(0)),
            json!({"0": "0", "s": ["<div>Count: ", "</div>"]})
        );
    }

    #[test]
    fn test_counter_patch_has_no_statics() {
        let patch = diff(&counter(0), &counter(1));
        assert_eq!(encode_patch(&patch), json!({"0": "1"}));
    }

    #[test]
    fn test_stream_insert_positions() {
        let mut s = Stream::new("items").unwrap();
        s.insert(&Item { id: 1 }).unwrap();
        s.insert_at(&Item { id: 2 }, 0).unwrap();

        let op = s.extract_wire_ops().unwrap();
        assert_eq!(
            encode_stream(&op),
            json!([[["items-1", -1, null], ["items-2", 0, null]], []])
        );
    }

    #[test]
    fn test_stream_limit_and_reset() {
        let op = StreamOp {
            reference: "items".into(),
            inserts: vec![StreamInsert {
                dom_id: "items-9".into(),
                at: 0,
                limit: Some(-20),
                update_only: false,
            }],
            deletes: vec!["items-1".into()],
            reset: true,
        };
        assert_eq!(
            encode_stream(&op),
            json!([[["items-9", 0, -20]], ["items-1"], true])
        );
    }

    #[test]
    fn test_stream_with_options_limit() {
        let mut s = Stream::new("items").unwrap();
        s.insert_with(
            &Item { id: 3 },
            InsertOptions {
                at: -1,
                limit: Some(5),
                update_only: false,
            },
        )
        .unwrap();
        let op = s.extract_wire_ops().unwrap();
        assert_eq!(encode_stream(&op), json!([[["items-3", -1, 5]], []]));
    }

    #[test]
    fn test_idle_stream_encodes_empty() {
        let mut s = Stream::<Item>::new("items").unwrap();
        let d = Comprehension::stream(&mut s, |_, _| RenderTree::literal("x"));
        assert_eq!(encode_dynamic(&d), json!(""));
    }

    #[test]
    fn test_component_ref_is_integer() {
        let tree = RenderTree::build().text("<main>").component(4).text("</main>").finish();
        assert_eq!(encode_tree(&tree)["0"], json!(4));
    }

    #[test]
    fn test_same_shape_components_share_statics() {
        let mut rendered = Rendered::new(
            RenderTree::build()
                .text("")
                .component(1)
                .text("")
                .component(2)
                .text("")
                .finish(),
        );
        rendered.components.insert(1, counter(1));
        rendered.components.insert(2, counter(7));

        let wire = encode_rendered(&rendered);
        let c = &wire["c"];
        assert!(c["1"]["s"].is_array());
        assert_eq!(c["2"]["s"], json!(1));
        assert_eq!(c["2"]["0"], json!("7"));
        assert_eq!(c["1"]["r"], json!(1));
        assert_eq!(c["2"]["r"], json!(1));
    }

    #[test]
    fn test_different_shapes_keep_statics() {
        let mut rendered = Rendered::new(RenderTree::literal(""));
        rendered.components.insert(1, counter(1));
        rendered
            .components
            .insert(2, RenderTree::build().text("<p>").value("x").text("</p>").finish());

        let wire = encode_rendered(&rendered);
        assert!(wire["c"]["1"]["s"].is_array());
        assert!(wire["c"]["2"]["s"].is_array());
    }

    #[test]
    fn test_component_partial_patch() {
        let mut old = Rendered::new(RenderTree::build().text("").component(1).text("").finish());
        old.components.insert(1, counter(0));
        let mut new = old.clone();
        new.components.insert(1, counter(1));

        let wire = encode_rendered_patch(&diff_rendered(&old, &new));
        assert_eq!(wire, json!({"c": {"1": {"0": "1"}}}));
    }

    #[test]
    fn test_unchanged_render_is_empty_object() {
        let r = Rendered::new(counter(2));
        assert_eq!(encode_rendered_patch(&diff_rendered(&r, &r)), json!({}));
    }
}
