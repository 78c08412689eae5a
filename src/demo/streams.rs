//! A message log kept on the client through a stream.
//!
//! The server only holds messages until they have been rendered once; after
//! that the client owns them and the view sends inserts and deletes.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::component::RenderContext;
use crate::render::stream::{InsertOptions, Stream};
use crate::render::{Comprehension, RenderTree};
use crate::view::{BindingError, EventPayload, LiveSocket, LiveView, Params, Session, ViewMeta};

/// Most recent messages the client keeps.
const KEEP: i64 = 50;

#[derive(Debug, Clone, Serialize)]
struct Message {
    id: u64,
    body: String,
}

#[derive(Default)]
pub struct StreamView {
    room: String,
    next_id: u64,
    messages: Option<Stream<Message>>,
}

impl StreamView {
    fn messages(&mut self) -> Result<&mut Stream<Message>> {
        if self.messages.is_none() {
            self.messages = Some(Stream::new("messages")?);
        }
        self.messages
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("message stream unavailable"))
    }

    fn post(&mut self, body: &str) -> Result<()> {
        let body = body.trim();
        if body.is_empty() {
            return Err(BindingError::MissingField("body").into());
        }
        self.next_id += 1;
        let message = Message {
            id: self.next_id,
            body: body.to_string(),
        };
        self.messages()?.insert_with(
            &message,
            InsertOptions {
                limit: Some(-KEEP),
                ..InsertOptions::default()
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl LiveView for StreamView {
    async fn mount(&mut self, _socket: &mut LiveSocket, _session: &Session) -> Result<()> {
        let welcome = Message {
            id: 0,
            body: "welcome".into(),
        };
        self.messages = Some(Stream::with_items("messages", [&welcome])?);
        Ok(())
    }

    async fn handle_params(&mut self, _url: &Url, params: &Params, socket: &mut LiveSocket) -> Result<()> {
        self.room = params.get("id").unwrap_or("lobby").to_string();
        socket.set_title(format!("#{}", self.room));
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: &str,
        payload: &EventPayload,
        _socket: &mut LiveSocket,
    ) -> Result<()> {
        match event {
            "post" => self.post(payload.params.require("body")?),
            "delete" => {
                let id: u64 = payload.require("id")?;
                self.messages()?.delete_by_id(format!("messages-{id}"));
                Ok(())
            }
            "clear" => {
                self.messages()?.reset(std::iter::empty::<&Message>())?;
                Ok(())
            }
            other => {
                crate::warn!("demo"; "stream view ignores '{}'", other);
                Ok(())
            }
        }
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        let rows = match self.messages.as_mut() {
            Some(stream) => Comprehension::stream(stream, |dom_id, message| {
                RenderTree::build()
                    .text("<li id=\"")
                    .value(dom_id)
                    .text("\">")
                    .value(&message.body)
                    .text("</li>")
                    .finish()
            }),
            None => "".into(),
        };
        RenderTree::build()
            .text("<h2>")
            .value(&self.room)
            .text("</h2><ul id=\"messages\" phx-update=\"stream\">")
            .dynamic(rows)
            .text("</ul>")
            .finish()
    }
}
