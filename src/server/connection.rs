//! One websocket connection: handshake, session spawn, frame bridge.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tungstenite::WebSocket;
use tungstenite::protocol::Message;

use crate::session::{Endpoint, SessionActor, SessionMsg, Transport, TransportError};

/// How long the bridge waits for outbound frames before polling the socket again.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

enum Outbound {
    Text(String),
    Close,
}

/// Session side of a connection: frames go to the connection's thread.
pub struct SocketTransport {
    outbound: Sender<Outbound>,
}

impl Transport for SocketTransport {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

pub(super) fn spawn(stream: TcpStream, peer: SocketAddr, endpoint: Arc<Endpoint>, runtime: Handle) {
    let spawned = std::thread::Builder::new()
        .name(format!("ws-{peer}"))
        .spawn(move || {
            if let Err(e) = run(stream, endpoint, &runtime) {
                crate::debug!("ws"; "{} closed: {:#}", peer, e);
            }
        });
    if let Err(e) = spawned {
        crate::log!("ws"; "failed to spawn connection thread: {}", e);
    }
}

fn run(stream: TcpStream, endpoint: Arc<Endpoint>, runtime: &Handle) -> Result<()> {
    // Keep blocking mode during handshake, switch to non-blocking after
    let mut ws = tungstenite::accept(stream).map_err(|e| anyhow!("handshake failed: {e}"))?;
    ws.get_ref().set_nonblocking(true)?;

    let (out_tx, out_rx) = channel::unbounded();
    let (actor, inbox) = SessionActor::new(endpoint, SocketTransport { outbound: out_tx });
    let id = actor.id();
    runtime.spawn(async move {
        // The actor logs its own outcome.
        let _ = actor.run().await;
    });
    crate::debug!("ws"; "session {} started", id);

    let result = Bridge { ws, inbox, out_rx }.run();
    crate::debug!("ws"; "session {} connection finished", id);
    result
}

struct Bridge {
    ws: WebSocket<TcpStream>,
    inbox: mpsc::Sender<SessionMsg>,
    out_rx: Receiver<Outbound>,
}

impl Bridge {
    fn run(mut self) -> Result<()> {
        let result = self.pump();
        // Whatever ended the loop, the session must hear about it.
        let _ = self.inbox.blocking_send(SessionMsg::Disconnected);
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
        result
    }

    fn pump(&mut self) -> Result<()> {
        loop {
            if !self.drain_outbound()? {
                return Ok(());
            }

            match self.ws.read() {
                Ok(Message::Text(text)) => {
                    if !self.forward(SessionMsg::Text(text.to_string())) {
                        return Ok(());
                    }
                }
                Ok(Message::Binary(data)) => {
                    if !self.forward(SessionMsg::Binary(data.to_vec())) {
                        return Ok(());
                    }
                }
                Ok(Message::Close(_)) => return Ok(()),
                // Pings are answered by tungstenite on the next write.
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {
                    if !self.wait_outbound()? {
                        return Ok(());
                    }
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hand a frame to the session; false once the session is gone.
    fn forward(&self, msg: SessionMsg) -> bool {
        self.inbox.blocking_send(msg).is_ok()
    }

    /// Write every queued outbound frame. False when the session closed.
    fn drain_outbound(&mut self) -> Result<bool> {
        loop {
            match self.out_rx.try_recv() {
                Ok(msg) => {
                    if !self.write(msg)? {
                        return Ok(false);
                    }
                }
                Err(TryRecvError::Empty) => return self.flush().map(|()| true),
                Err(TryRecvError::Disconnected) => return Ok(false),
            }
        }
    }

    /// Idle until the session has something to send or the poll interval passes.
    fn wait_outbound(&mut self) -> Result<bool> {
        match self.out_rx.recv_timeout(POLL_INTERVAL) {
            Ok(msg) => self.write(msg),
            Err(RecvTimeoutError::Timeout) => Ok(true),
            Err(RecvTimeoutError::Disconnected) => Ok(false),
        }
    }

    fn write(&mut self, msg: Outbound) -> Result<bool> {
        match msg {
            Outbound::Text(text) => {
                match self.ws.send(Message::Text(text.into())) {
                    Ok(()) => {}
                    // Queued inside tungstenite; flushed on a later pass.
                    Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(true)
            }
            Outbound::Close => Ok(false),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self.ws.flush() {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(ref e)) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
