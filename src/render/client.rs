//! Virtual client for tests.
//!
//! Holds the JSON a browser would hold, merges diffs into it the same way,
//! and renders the result to text. Stream rows are retained across diffs
//! and keyed by dom id, so a test can check what the user actually sees.

use serde_json::{Map, Value, json};

use super::wire::{COMPONENTS, EVENTS, ROWS, STATICS, STREAM, TITLE};

/// Client-side dom ids of retained stream rows.
const KEYS: &str = "k";

#[derive(Debug, Default)]
pub struct VirtualClient {
    root: Value,
    components: Map<String, Value>,
    pub title: Option<String>,
    pub events: Vec<Value>,
}

impl VirtualClient {
    /// Start from the `rendered` payload of a join reply.
    pub fn join(rendered: &Value) -> Self {
        let mut client = Self {
            root: Value::Object(Map::new()),
            ..Self::default()
        };
        client.apply(rendered);
        client
    }

    pub fn apply(&mut self, diff: &Value) {
        let Some(diff) = diff.as_object() else {
            return;
        };

        if let Some(Value::Object(components)) = diff.get(COMPONENTS) {
            self.merge_components(components);
        }
        if let Some(Value::String(title)) = diff.get(TITLE) {
            self.title = Some(title.clone());
        }
        if let Some(Value::Array(events)) = diff.get(EVENTS) {
            self.events.extend(events.iter().cloned());
        }

        let tree: Map<String, Value> = diff
            .iter()
            .filter(|(k, _)| ![COMPONENTS, TITLE, EVENTS].contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merge(&mut self.root, &Value::Object(tree));
    }

    fn merge_components(&mut self, batch: &Map<String, Value>) {
        for (cid, patch) in batch {
            let mut patch = patch.clone();
            // Shared statics point at another component's array.
            if let Some(shared) = patch.get(STATICS).and_then(Value::as_u64) {
                if let Some(statics) = self
                    .components
                    .get(&shared.to_string())
                    .and_then(|c| c.get(STATICS))
                    .cloned()
                {
                    patch[STATICS] = statics;
                }
            }
            let slot = self.components.entry(cid.clone()).or_insert(Value::Null);
            merge(slot, &patch);
        }
    }

    pub fn html(&self) -> String {
        let mut out = String::new();
        self.render(&self.root, &mut out);
        out
    }

    fn render(&self, value: &Value, out: &mut String) {
        match value {
            Value::String(s) => out.push_str(s),
            Value::Number(n) => {
                if let Some(c) = self.components.get(&n.to_string()) {
                    self.render(c, out);
                }
            }
            Value::Object(map) if map.contains_key(ROWS) => {
                let statics = strings(map.get(STATICS));
                for row in map[ROWS].as_array().into_iter().flatten() {
                    let row = row.as_array().map(Vec::as_slice).unwrap_or_default();
                    for (i, s) in statics.iter().enumerate() {
                        out.push_str(s);
                        if let Some(d) = row.get(i) {
                            self.render(d, out);
                        }
                    }
                }
            }
            Value::Object(map) => {
                for (i, s) in strings(map.get(STATICS)).iter().enumerate() {
                    out.push_str(s);
                    if let Some(d) = map.get(&i.to_string()) {
                        self.render(d, out);
                    }
                }
            }
            _ => {}
        }
    }
}

fn strings(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .map(|s| s.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) if p.contains_key(ROWS) => {
            let is_rows = target.as_object().is_some_and(|t| t.contains_key(ROWS));
            if !is_rows {
                *target = json!({ROWS: [], STATICS: [], KEYS: []});
            }
            merge_rows(target, p);
        }
        Value::Object(p) => {
            if p.contains_key(STATICS) || !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(t) = target {
                for (k, v) in p {
                    merge(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn merge_rows(target: &mut Value, patch: &Map<String, Value>) {
    if let Some(statics) = patch.get(STATICS) {
        target[STATICS] = statics.clone();
    }
    let new_rows = patch[ROWS].as_array().cloned().unwrap_or_default();

    let Some(Value::Array(op)) = patch.get(STREAM) else {
        target[ROWS] = Value::Array(new_rows);
        target[KEYS] = json!([]);
        return;
    };

    let mut rows = target[ROWS].as_array().cloned().unwrap_or_default();
    let mut keys: Vec<String> = strings(target.get(KEYS));

    if op.get(2).and_then(Value::as_bool).unwrap_or(false) {
        rows.clear();
        keys.clear();
    }
    for deleted in strings(op.get(1)) {
        if let Some(pos) = keys.iter().position(|k| *k == deleted) {
            keys.remove(pos);
            rows.remove(pos);
        }
    }

    let inserts = op.first().and_then(Value::as_array).cloned().unwrap_or_default();
    for (insert, row) in inserts.iter().zip(new_rows) {
        let Some(dom_id) = insert.get(0).and_then(Value::as_str) else {
            continue;
        };
        let at = insert.get(1).and_then(Value::as_i64).unwrap_or(-1);
        let limit = insert.get(2).and_then(Value::as_i64);

        if let Some(pos) = keys.iter().position(|k| k == dom_id) {
            rows[pos] = row;
        } else {
            let pos = if at < 0 { keys.len() } else { (at as usize).min(keys.len()) };
            keys.insert(pos, dom_id.to_string());
            rows.insert(pos, row);
        }

        match limit {
            Some(n) if n >= 0 => {
                keys.truncate(n as usize);
                rows.truncate(n as usize);
            }
            Some(n) => {
                let keep = n.unsigned_abs() as usize;
                let excess = keys.len().saturating_sub(keep);
                keys.drain(..excess);
                rows.drain(..excess);
            }
            None => {}
        }
    }

    target[ROWS] = Value::Array(rows);
    target[KEYS] = json!(keys);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::wire::{encode_rendered, encode_rendered_patch};
    use crate::render::{
        Comprehension, Dynamic, RenderTree, Rendered, Stream, diff_rendered,
    };
    use serde::Serialize;

    /// Apply `diff(old, new)` on top of `old` and compare with `new` rendered directly.
    fn assert_converges(old: &Rendered, new: &Rendered) {
        let mut client = VirtualClient::join(&encode_rendered(old));
        assert_eq!(client.html(), old.to_html());
        client.apply(&encode_rendered_patch(&diff_rendered(old, new)));
        assert_eq!(client.html(), new.to_html());
    }

    fn page(title: &str, show: bool, items: &[&str]) -> Rendered {
        let banner = if show {
            Dynamic::Tree(
                RenderTree::build()
                    .text("<b>")
                    .value(title)
                    .text("</b>")
                    .finish(),
            )
        } else {
            Dynamic::Text(String::new())
        };
        let rows = items.iter().map(|i| {
            RenderTree::build()
                .text("<li>")
                .value(i)
                .text("</li>")
                .finish()
        });
        Rendered::new(
            RenderTree::build()
                .text("<h1>")
                .value(title)
                .text("</h1>")
                .dynamic(banner)
                .text("<ul>")
                .dynamic(Comprehension::collect(rows))
                .text("</ul>")
                .finish(),
        )
    }

    #[test]
    fn test_converges_on_scalar_change() {
        assert_converges(&page("a", false, &[]), &page("b", false, &[]));
    }

    #[test]
    fn test_converges_on_branch_toggle() {
        assert_converges(&page("a", false, &["x"]), &page("a", true, &["x"]));
        assert_converges(&page("a", true, &["x"]), &page("a", false, &["x"]));
    }

    #[test]
    fn test_converges_on_loop_changes() {
        assert_converges(&page("a", false, &[]), &page("a", false, &["x", "y"]));
        assert_converges(&page("a", false, &["x", "y"]), &page("a", false, &["y"]));
        assert_converges(&page("a", false, &["x"]), &page("a", false, &[]));
    }

    #[test]
    fn test_converges_on_statics_change() {
        let other = Rendered::new(RenderTree::build().text("<p>").value(1).text("</p>").finish());
        assert_converges(&page("a", true, &["x"]), &other);
    }

    #[test]
    fn test_converges_with_components() {
        let card = |n: i64| {
            RenderTree::build()
                .text("<div class=\"card\">")
                .value(n)
                .text("</div>")
                .finish()
        };
        let root = RenderTree::build()
            .text("")
            .component(1)
            .text("")
            .component(2)
            .text("")
            .finish();

        let mut old = Rendered::new(root.clone());
        old.components.insert(1, card(1));
        old.components.insert(2, card(2));

        let mut new = Rendered::new(root);
        new.components.insert(1, card(1));
        new.components.insert(2, card(20));

        assert_converges(&old, &new);
    }

    #[derive(Clone, Serialize)]
    struct Msg {
        id: u32,
        text: &'static str,
    }

    fn messages(stream: &mut Stream<Msg>) -> Rendered {
        Rendered::new(
            RenderTree::build()
                .text("<ol>")
                .dynamic(Comprehension::stream(stream, |dom_id, m| {
                    RenderTree::build()
                        .text("<li id=\"")
                        .raw(dom_id)
                        .text("\">")
                        .value(m.text)
                        .text("</li>")
                        .finish()
                }))
                .text("</ol>")
                .finish(),
        )
    }

    #[test]
    fn test_stream_rows_are_retained() {
        let mut s = Stream::new("m").unwrap();
        s.insert(&Msg { id: 1, text: "one" }).unwrap();
        let mut prev = messages(&mut s);
        let mut client = VirtualClient::join(&encode_rendered(&prev));

        let mut step = |s: &mut Stream<Msg>, client: &mut VirtualClient| {
            let next = messages(s);
            client.apply(&encode_rendered_patch(&diff_rendered(&prev, &next)));
            prev = next;
        };

        s.insert_at(&Msg { id: 2, text: "two" }, 0).unwrap();
        step(&mut s, &mut client);
        assert_eq!(
            client.html(),
            "<ol><li id=\"m-2\">two</li><li id=\"m-1\">one</li></ol>"
        );

        // idle render changes nothing
        step(&mut s, &mut client);
        assert_eq!(
            client.html(),
            "<ol><li id=\"m-2\">two</li><li id=\"m-1\">one</li></ol>"
        );

        s.delete_by_id("m-2");
        step(&mut s, &mut client);
        assert_eq!(client.html(), "<ol><li id=\"m-1\">one</li></ol>");

        s.insert(&Msg { id: 1, text: "uno" }).unwrap();
        step(&mut s, &mut client);
        assert_eq!(client.html(), "<ol><li id=\"m-1\">uno</li></ol>");

        s.reset(&[Msg { id: 3, text: "three" }]).unwrap();
        step(&mut s, &mut client);
        assert_eq!(client.html(), "<ol><li id=\"m-3\">three</li></ol>");
    }

    #[test]
    fn test_stream_limit_trims() {
        let mut s = Stream::new("m").unwrap();
        let mut prev = messages(&mut s);
        let mut client = VirtualClient::join(&encode_rendered(&prev));

        for id in 1..=3 {
            s.insert_with(
                &Msg { id, text: "x" },
                crate::render::stream::InsertOptions {
                    limit: Some(-2),
                    ..Default::default()
                },
            )
            .unwrap();
            let next = messages(&mut s);
            client.apply(&encode_rendered_patch(&diff_rendered(&prev, &next)));
            prev = next;
        }
        assert_eq!(
            client.html(),
            "<ol><li id=\"m-2\">x</li><li id=\"m-3\">x</li></ol>"
        );
    }

    #[test]
    fn test_stream_duplicate_insert_in_one_turn() {
        let mut s = Stream::new("m").unwrap();
        let prev = messages(&mut s);
        let mut client = VirtualClient::join(&encode_rendered(&prev));

        s.insert(&Msg { id: 1, text: "old" }).unwrap();
        s.insert(&Msg { id: 1, text: "new" }).unwrap();
        s.insert(&Msg { id: 2, text: "bob" }).unwrap();
        let next = messages(&mut s);
        client.apply(&encode_rendered_patch(&diff_rendered(&prev, &next)));

        assert_eq!(
            client.html(),
            "<ol><li id=\"m-1\">new</li><li id=\"m-2\">bob</li></ol>"
        );
    }

    #[test]
    fn test_title_and_events_are_not_tree_keys() {
        let r = page("a", false, &[]);
        let mut client = VirtualClient::join(&encode_rendered(&r));
        client.apply(&json!({"t": "Hello", "e": [["saved", {"ok": true}]]}));
        assert_eq!(client.title.as_deref(), Some("Hello"));
        assert_eq!(client.events.len(), 1);
        assert_eq!(client.html(), r.to_html());
    }
}
