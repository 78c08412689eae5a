//! Nested component discovery.
//!
//! Rendering a component may register further components, whose lifecycle
//! then has to run before they can render, which may register more. This runs
//! that loop to a fixed point, bounded by an iteration cap so a component that
//! keeps spawning fresh children fails loudly instead of spinning.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use thiserror::Error;

use super::{ComponentRegistry, RenderContext};
use crate::render::{Cid, RenderTree, Rendered};
use crate::view::ViewMeta;

/// Default bound on lifecycle rounds per render pass.
pub const MAX_COMPONENT_ITERATIONS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("component lifecycle exceeded {limit} iterations; check for components that keep registering new children")]
    CycleExceeded { limit: usize },
}

/// Run pending lifecycle and render every component seen in this pass.
///
/// A component whose lifecycle runs again (its parent re-registered it with
/// new props) is rendered again so the returned tree reflects the new state.
pub async fn resolve_components(
    registry: &mut ComponentRegistry,
    parent: &ViewMeta,
    max_iterations: usize,
) -> Result<BTreeMap<Cid, RenderTree>> {
    registry.run_pending_lifecycle().await?;

    let mut rendered = BTreeMap::new();
    let mut visited = BTreeSet::new();
    let mut iterations = 0;

    loop {
        let mut fresh: Vec<Cid> = registry
            .seen()
            .iter()
            .copied()
            .filter(|cid| !visited.contains(cid))
            .collect();
        fresh.sort_unstable();

        if fresh.is_empty() && !registry.has_pending_lifecycle() {
            break;
        }

        for cid in fresh {
            visited.insert(cid);
            if let Some(tree) = registry.render(cid, parent) {
                rendered.insert(cid, tree);
            }
        }

        if registry.has_pending_lifecycle() {
            if iterations >= max_iterations {
                return Err(LifecycleError::CycleExceeded {
                    limit: max_iterations,
                }
                .into());
            }
            let touched: Vec<Cid> = registry.pending_cids().collect();
            registry.run_pending_lifecycle().await?;
            for cid in touched {
                visited.remove(&cid);
                rendered.remove(&cid);
            }
            iterations += 1;
        }
    }

    Ok(rendered)
}

/// One complete render: root, nested components, then pruning of the
/// components the root no longer references.
pub async fn render_pass<F>(
    registry: &mut ComponentRegistry,
    parent: &ViewMeta,
    max_iterations: usize,
    render_root: F,
) -> Result<Rendered>
where
    F: FnOnce(&mut RenderContext<'_>) -> RenderTree + Send,
{
    registry.begin_render_pass();
    let root = registry.with_context(render_root);
    let components = resolve_components(registry, parent, max_iterations).await?;
    let pruned = registry.prune_stale();
    if !pruned.is_empty() {
        crate::debug!("component"; "render pass dropped {} component(s)", pruned.len());
    }
    Ok(Rendered { root, components })
}
