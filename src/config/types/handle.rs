//! Process-wide config handle.
//!
//! Uses `arc-swap` for lock-free reads. The config is installed once at
//! startup; code that runs per session receives its own `Arc` instead of
//! reading the global.

use crate::config::LumenConfig;
use arc_swap::ArcSwap;
use std::sync::{Arc, LazyLock};

static CONFIG: LazyLock<ArcSwap<LumenConfig>> =
    LazyLock::new(|| ArcSwap::from_pointee(LumenConfig::default()));

#[inline]
pub fn cfg() -> Arc<LumenConfig> {
    CONFIG.load_full()
}

/// Install `config` and return the shared handle to it.
#[inline]
pub fn init_config(config: LumenConfig) -> Arc<LumenConfig> {
    let arc = Arc::new(config);
    CONFIG.store(Arc::clone(&arc));
    arc
}
