//! Websocket server.
//!
//! # Architecture
//!
//! ```text
//! accept thread ──TcpStream──► connection thread ──SessionMsg──► SessionActor (tokio task)
//!                                     ▲                                │
//!                                     └──────── crossbeam outbound ◄───┘
//! ```
//!
//! Sockets are plain blocking `tungstenite` sockets switched to non-blocking
//! after the handshake. Each connection gets one thread that forwards inbound
//! frames into its session's queue and writes whatever the session sends back.

mod connection;


use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use crate::session::Endpoint;

/// Maximum port retry attempts
const MAX_PORT_RETRIES: u16 = 10;

/// Sleep between polls of the non-blocking listener.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Sessions get this long to release after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Server {
    /// Bind `interface:port`, trying the following ports if it is taken.
    pub fn bind(interface: IpAddr, port: u16) -> Result<Self> {
        let (listener, addr) = try_bind_port(interface, port, MAX_PORT_RETRIES)?;
        listener.set_nonblocking(true)?;
        if addr.port() != port && port != 0 {
            crate::warn!("serve"; "port {} is busy, using {}", port, addr.port());
        }
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept connections until `stop` returns true.
    ///
    /// Sessions are spawned onto `runtime`; connection threads are detached.
    pub fn accept_loop(&self, endpoint: &Arc<Endpoint>, runtime: &Handle, stop: impl Fn() -> bool) {
        while !stop() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    crate::debug!("serve"; "client connected: {}", peer);
                    // Handshake and frame reads block until the bridge flips the socket.
                    if let Err(e) = stream.set_nonblocking(false) {
                        crate::log!("serve"; "failed to configure socket for {}: {}", peer, e);
                        continue;
                    }
                    connection::spawn(stream, peer, Arc::clone(endpoint), runtime.clone());
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    crate::log!("serve"; "accept error: {}", e);
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

/// Run the server in the foreground until Ctrl+C.
pub fn serve(endpoint: Arc<Endpoint>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("lumen-session")
        .build()
        .context("failed to start the session runtime")?;

    let server_config = &endpoint.config.server;
    let server = Server::bind(server_config.interface, server_config.port)?;
    crate::log!("serve"; "listening on ws://{}", server.local_addr());
    for pattern in endpoint.routes.patterns() {
        crate::debug!("serve"; "route {}", pattern);
    }

    crate::core::set_listening(true);
    server.accept_loop(&endpoint, runtime.handle(), crate::core::is_shutdown);
    crate::core::set_listening(false);

    runtime.shutdown_timeout(DRAIN_TIMEOUT);
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

/// Try binding to port, retry with incremented port if in use
fn try_bind_port(interface: IpAddr, base_port: u16, max_retries: u16) -> Result<(TcpListener, SocketAddr)> {
    let mut last_error = None;

    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        match TcpListener::bind(SocketAddr::new(interface, port)) {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                return Ok((listener, addr));
            }
            Err(e) => {
                last_error = Some(e);
            }
        }
    }

    Err(anyhow::anyhow!(
        "failed to bind websocket server after {} attempts: {}",
        max_retries,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
