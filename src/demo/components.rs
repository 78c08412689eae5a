//! Collapsible cards: one stateful component per card, body passed as a slot.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::component::{ComponentMeta, ComponentSocket, LiveComponent, Props, RenderContext, Slots};
use crate::render::{Comprehension, RenderTree};
use crate::view::{EventPayload, LiveSocket, LiveView, ViewMeta};

const CARDS: [(&str, &str); 3] = [
    ("render", "Templates split into statics and dynamics."),
    ("diff", "Only changed dynamics travel to the client."),
    ("components", "Each card keeps its own open state."),
];

/// A card that opens and closes on click and tells its parent about it.
#[derive(Debug, Default)]
pub struct Card {
    title: String,
    open: bool,
}

#[async_trait]
impl LiveComponent for Card {
    async fn mount(&mut self, _socket: &mut ComponentSocket, props: &Props) -> Result<()> {
        self.open = props.get("open").and_then(Value::as_bool).unwrap_or(false);
        Ok(())
    }

    async fn update(&mut self, _socket: &mut ComponentSocket, props: &Props) -> Result<()> {
        if let Some(title) = props.get("title").and_then(Value::as_str) {
            self.title = title.to_string();
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &str,
        _payload: &EventPayload,
        socket: &mut ComponentSocket,
    ) -> Result<()> {
        if event == "toggle" {
            self.open = !self.open;
            socket.send_parent("card_toggled", json!({ "title": self.title, "open": self.open }));
        }
        Ok(())
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, meta: &ComponentMeta<'_>) -> RenderTree {
        let body = if self.open {
            meta.slot("body")
        } else {
            RenderTree::literal("")
        };
        RenderTree::build()
            .text("<article phx-click=\"toggle\" phx-target=\"")
            .value(meta.cid)
            .text("\"><h3>")
            .value(&self.title)
            .text("</h3>")
            .dynamic(body)
            .text("</article>")
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ComponentsView {
    open: Vec<String>,
}

#[async_trait]
impl LiveView for ComponentsView {
    async fn handle_event(
        &mut self,
        event: &str,
        payload: &EventPayload,
        socket: &mut LiveSocket,
    ) -> Result<()> {
        if event != "card_toggled" {
            return Ok(());
        }
        let title = payload.params.require("title")?.to_string();
        self.open.retain(|t| *t != title);
        if payload.value.get("open").and_then(Value::as_bool).unwrap_or(false) {
            socket.push_event("opened", json!({ "title": title }));
            self.open.push(title);
        }
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        let cards = CARDS.iter().map(|(title, body)| {
            let mut props = Props::new();
            props.insert("title".into(), json!(title));
            let mut slots = Slots::default();
            slots.insert(
                "body".into(),
                RenderTree::build().text("<p>").value(body).text("</p>").finish(),
            );
            RenderTree::build()
                .dynamic(ctx.live_component_with_slots::<Card>(*title, props, slots))
                .finish()
        });
        let cards = Comprehension::collect(cards.collect::<Vec<_>>());
        RenderTree::build()
            .text("<p>open: ")
            .value(self.open.join(", "))
            .text("</p>")
            .dynamic(cards)
            .finish()
    }
}
