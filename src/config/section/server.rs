//! `[server]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [server]
//! interface = "127.0.0.1"     # Network interface (127.0.0.1 = localhost only)
//! port = 5300                 # Websocket port
//! ```
//!
//! When the port is taken the server tries the next ones before giving up.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config::types::{ConfigDiagnostics, FieldPath};

/// Websocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network interface to bind.
    /// - `127.0.0.1` (default): localhost only
    /// - `0.0.0.0`: all interfaces (LAN accessible)
    pub interface: IpAddr,

    /// Websocket port number.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 5300,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.port == 0 {
            diag.error_with_hint(
                FieldPath::new("server.port"),
                "port must not be 0",
                "pick a fixed port such as 5300",
            );
        }
    }
}
