//! Counter shared across tabs through pub/sub.

use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use url::Url;

use crate::component::RenderContext;
use crate::render::RenderTree;
use crate::view::{
    EventHandlers, EventPayload, InfoEvent, LiveSocket, LiveView, Params, Session, ViewMeta,
};

const TOPIC: &str = "demo:counter";

static HANDLERS: LazyLock<EventHandlers<CounterView>> = LazyLock::new(|| {
    EventHandlers::new()
        .on("inc", CounterView::inc)
        .on("dec", CounterView::dec)
        .on("reset", CounterView::reset)
        .on("share", CounterView::share)
});

#[derive(Debug, Default)]
pub struct CounterView {
    count: i64,
    step: i64,
}

impl CounterView {
    fn inc(&mut self, payload: &EventPayload, _socket: &mut LiveSocket) -> Result<()> {
        self.count += payload.params.parse_or("by", self.step)?;
        Ok(())
    }

    fn dec(&mut self, payload: &EventPayload, _socket: &mut LiveSocket) -> Result<()> {
        self.count -= payload.params.parse_or("by", self.step)?;
        Ok(())
    }

    fn reset(&mut self, _payload: &EventPayload, socket: &mut LiveSocket) -> Result<()> {
        self.count = 0;
        socket.push_patch("/", &Params::new());
        Ok(())
    }

    /// Push the current count to every session on the counter page.
    fn share(&mut self, _payload: &EventPayload, socket: &mut LiveSocket) -> Result<()> {
        socket.broadcast(TOPIC, json!({ "count": self.count }));
        Ok(())
    }
}

#[async_trait]
impl LiveView for CounterView {
    async fn mount(&mut self, socket: &mut LiveSocket, session: &Session) -> Result<()> {
        self.count = session.get("count").and_then(Value::as_i64).unwrap_or(0);
        self.step = 1;
        socket.subscribe(TOPIC);
        Ok(())
    }

    async fn handle_params(&mut self, _url: &Url, params: &Params, _socket: &mut LiveSocket) -> Result<()> {
        self.step = params.parse_or("step", 1)?;
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &str,
        payload: &EventPayload,
        socket: &mut LiveSocket,
    ) -> Result<()> {
        HANDLERS.dispatch(self, event, payload, socket).map(|_| ())
    }

    async fn handle_info(&mut self, info: &InfoEvent, _socket: &mut LiveSocket) -> Result<()> {
        if info.name == TOPIC
            && let Some(count) = info.payload.get("count").and_then(Value::as_i64)
        {
            self.count = count;
        }
        Ok(())
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        RenderTree::build()
            .text("<section><h1>")
            .value(self.count)
            .text("</h1><button phx-click=\"dec\">-")
            .value(self.step)
            .text("</button><button phx-click=\"inc\">+")
            .value(self.step)
            .text("</button></section>")
            .finish()
    }
}
