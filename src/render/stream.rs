//! Streams - flush-once operation logs for client-retained collections.
//!
//! A [`Stream`] never holds the full collection. It records what changed since
//! the last render (inserts, deletes, a reset) and hands those operations to
//! the renderer exactly once via [`Stream::extract_wire_ops`]. The client keeps
//! every item it has seen, keyed by dom id.
//!
//! ```ignore
//! let mut users = Stream::new("users")?;
//! users.insert(&User { id: 1, name: "Alice".into() })?;       // "users-1", at -1
//! users.insert_at(&User { id: 2, name: "Bob".into() }, 0)?;   // "users-2", at 0
//! let ops = users.extract_wire_ops();                          // Some(..)
//! assert!(users.extract_wire_ops().is_none());                 // flushed
//! ```

use serde::Serialize;
use thiserror::Error;

/// Append position for [`Stream::insert_at`].
pub const APPEND: i64 = -1;

/// Errors raised synchronously to the caller of a stream operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream name must not be empty")]
    EmptyName,

    #[error("cannot derive a dom id for an item of stream '{stream}': no `id` field and no dom_id function")]
    MissingIdentity { stream: String },
}

type DomIdFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

/// Options for a single insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOptions {
    /// -1 appends, 0 prepends, N inserts before position N.
    pub at: i64,
    /// Positive keeps the first N items, negative keeps the last N.
    pub limit: Option<i64>,
    /// Only update an item the client already holds.
    pub update_only: bool,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            at: APPEND,
            limit: None,
            update_only: false,
        }
    }
}

/// One pending insert as it travels to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInsert {
    pub dom_id: String,
    pub at: i64,
    pub limit: Option<i64>,
    pub update_only: bool,
}

/// Operations accumulated on a stream between two renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOp {
    pub reference: String,
    pub inserts: Vec<StreamInsert>,
    pub deletes: Vec<String>,
    pub reset: bool,
}

impl StreamOp {
    /// An op carrying nothing, used when a stream renders without pending work.
    pub fn idle(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            inserts: Vec::new(),
            deletes: Vec::new(),
            reset: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty() && !self.reset
    }
}

/// An ordered operation log over keyed items.
pub struct Stream<T> {
    name: String,
    dom_id_fn: Option<DomIdFn<T>>,
    ops: StreamOp,
    /// Items inserted since the last flush; this is what templates iterate.
    pending: Vec<(String, T)>,
}

impl<T: Serialize + Clone> Stream<T> {
    pub fn new(name: impl Into<String>) -> Result<Self, StreamError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StreamError::EmptyName);
        }
        Ok(Self {
            ops: StreamOp::idle(name.clone()),
            name,
            dom_id_fn: None,
            pending: Vec::new(),
        })
    }

    /// Create a stream and append `items` as its first batch.
    pub fn with_items<'a>(
        name: impl Into<String>,
        items: impl IntoIterator<Item = &'a T>,
    ) -> Result<Self, StreamError>
    where
        T: 'a,
    {
        let mut stream = Self::new(name)?;
        stream.insert_many(items, APPEND, None)?;
        Ok(stream)
    }

    /// Use a custom dom id function instead of the item's `id` field.
    pub fn with_dom_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.dom_id_fn = Some(Box::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compute the dom id an item would get in this stream.
    pub fn dom_id(&self, item: &T) -> Result<String, StreamError> {
        if let Some(f) = &self.dom_id_fn {
            return Ok(f(item));
        }
        let missing = || StreamError::MissingIdentity {
            stream: self.name.clone(),
        };
        let value = serde_json::to_value(item).map_err(|_| missing())?;
        let id = match value.get("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(missing()),
        };
        Ok(format!("{}-{}", self.name, id))
    }

    /// Append an item.
    pub fn insert(&mut self, item: &T) -> Result<String, StreamError> {
        self.insert_with(item, InsertOptions::default())
    }

    /// Insert an item at a position (-1 appends, 0 prepends).
    pub fn insert_at(&mut self, item: &T, at: i64) -> Result<String, StreamError> {
        self.insert_with(
            item,
            InsertOptions {
                at,
                ..InsertOptions::default()
            },
        )
    }

    pub fn insert_with(&mut self, item: &T, opts: InsertOptions) -> Result<String, StreamError> {
        let dom_id = self.dom_id(item)?;
        self.ops.inserts.push(StreamInsert {
            dom_id: dom_id.clone(),
            at: opts.at,
            limit: opts.limit,
            update_only: opts.update_only,
        });
        self.pending.push((dom_id.clone(), item.clone()));
        Ok(dom_id)
    }

    /// Insert a batch; each item gets the same position and limit.
    ///
    /// Ids are derived before anything is recorded, so a failing item leaves
    /// the stream untouched.
    pub fn insert_many<'a>(
        &mut self,
        items: impl IntoIterator<Item = &'a T>,
        at: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, StreamError>
    where
        T: 'a,
    {
        let items: Vec<&T> = items.into_iter().collect();
        let ids = items
            .iter()
            .map(|item| self.dom_id(item))
            .collect::<Result<Vec<_>, _>>()?;

        for (dom_id, item) in ids.iter().zip(items) {
            self.ops.inserts.push(StreamInsert {
                dom_id: dom_id.clone(),
                at,
                limit,
                update_only: false,
            });
            self.pending.push((dom_id.clone(), item.clone()));
        }
        Ok(ids)
    }

    pub fn delete(&mut self, item: &T) -> Result<String, StreamError> {
        let dom_id = self.dom_id(item)?;
        Ok(self.delete_by_id(dom_id))
    }

    pub fn delete_by_id(&mut self, dom_id: impl Into<String>) -> String {
        let dom_id = dom_id.into();
        self.ops.deletes.push(dom_id.clone());
        dom_id
    }

    /// Tell the client to drop everything, then append `items` (if any).
    pub fn reset<'a>(&mut self, items: impl IntoIterator<Item = &'a T>) -> Result<(), StreamError>
    where
        T: 'a,
    {
        self.ops.reset = true;
        self.ops.inserts.clear();
        self.pending.clear();
        self.insert_many(items, APPEND, None)?;
        Ok(())
    }

    /// `(dom_id, item)` pairs inserted since the last flush.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.pending.iter().map(|(id, item)| (id.as_str(), item))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn has_operations(&self) -> bool {
        !self.ops.is_empty()
    }

    /// Take the pending operations, leaving the log empty.
    ///
    /// Returns `None` when nothing happened since the last call.
    pub fn extract_wire_ops(&mut self) -> Option<StreamOp> {
        if self.ops.is_empty() {
            return None;
        }
        self.pending.clear();
        Some(std::mem::replace(
            &mut self.ops,
            StreamOp::idle(self.name.clone()),
        ))
    }
}

impl<T> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("ops", &self.ops)
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
