//! `[security]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [security]
//! secret = "change me"          # LUMEN_SECRET overrides this
//! token_max_age_secs = 3600     # join token lifetime
//! ```
//!
//! Without a secret a random one is generated at startup, so tokens issued
//! by a previous run stop validating.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::types::{ConfigDiagnostics, FieldPath};

/// Secrets shorter than this get a warning.
const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret: Option<String>,
    pub token_max_age_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_max_age_secs: 3600,
        }
    }
}

impl SecurityConfig {
    pub fn token_max_age(&self) -> Duration {
        Duration::from_secs(self.token_max_age_secs)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.token_max_age_secs == 0 {
            diag.error(
                FieldPath::new("security.token_max_age_secs"),
                "must be at least 1",
            );
        }
        if let Some(secret) = &self.secret
            && secret.len() < MIN_SECRET_LEN
        {
            diag.warn(
                FieldPath::new("security.secret"),
                format!("shorter than {MIN_SECRET_LEN} characters"),
            );
        }
    }
}
