//! Server-driven updates: a timer ticks the view and retitles the page.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::component::RenderContext;
use crate::render::RenderTree;
use crate::view::{EventPayload, InfoEvent, LiveSocket, LiveView, Session, ViewMeta};

const TICK: &str = "tick";

#[derive(Debug)]
pub struct ClockView {
    elapsed: u64,
    running: bool,
    period: Duration,
}

impl Default for ClockView {
    fn default() -> Self {
        Self {
            elapsed: 0,
            running: true,
            period: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl LiveView for ClockView {
    async fn mount(&mut self, socket: &mut LiveSocket, _session: &Session) -> Result<()> {
        socket.schedule_info(InfoEvent::new(TICK), self.period);
        socket.set_title("0s");
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &str,
        _payload: &EventPayload,
        _socket: &mut LiveSocket,
    ) -> Result<()> {
        if event == "toggle" {
            self.running = !self.running;
        }
        Ok(())
    }

    async fn handle_info(&mut self, info: &InfoEvent, socket: &mut LiveSocket) -> Result<()> {
        if info.name == TICK && self.running {
            self.elapsed += 1;
            socket.set_title(format!("{}s", self.elapsed));
        }
        Ok(())
    }

    async fn disconnect(&mut self, _socket: &mut LiveSocket) {
        crate::debug!("demo"; "clock stopped after {}s", self.elapsed);
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        RenderTree::build()
            .text("<time>")
            .value(self.elapsed)
            .text("s</time><button phx-click=\"toggle\">")
            .value(if self.running { "pause" } else { "resume" })
            .text("</button>")
            .finish()
    }
}
