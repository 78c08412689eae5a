//! `[session]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [session]
//! protocol_version = "2.0.0"        # echoed in join replies
//! max_component_iterations = 10     # nested component discovery cap
//! heartbeat_timeout_secs = 60       # close sessions silent for this long
//! channel_buffer = 64               # inbound queue depth per session
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::types::{ConfigDiagnostics, FieldPath};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Client protocol version reported on join.
    pub protocol_version: String,

    /// Render passes allowed to discover new nested components.
    pub max_component_iterations: usize,

    pub heartbeat_timeout_secs: u64,

    /// Pending messages a session queues before broadcasts to it are dropped.
    pub channel_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: "2.0.0".to_string(),
            max_component_iterations: 10,
            heartbeat_timeout_secs: 60,
            channel_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.max_component_iterations == 0 {
            diag.error(
                FieldPath::new("session.max_component_iterations"),
                "must be at least 1",
            );
        }
        if self.heartbeat_timeout_secs == 0 {
            diag.error(
                FieldPath::new("session.heartbeat_timeout_secs"),
                "must be at least 1",
            );
        }
        if self.channel_buffer == 0 {
            diag.error(FieldPath::new("session.channel_buffer"), "must be at least 1");
        }
        if self.protocol_version.trim().is_empty() {
            diag.error(FieldPath::new("session.protocol_version"), "must not be empty");
        }
    }
}
