//! Inbound message handlers.
//!
//! | event               | effect                                        | reply                          |
//! |---------------------|-----------------------------------------------|--------------------------------|
//! | `phx_join`          | check credential, mount, full render          | `{rendered, liveview_version}` |
//! | `phx_join` (`lvu:`) | open an upload channel                        | `{}`                           |
//! | `heartbeat`         | none                                          | `{}`                           |
//! | `event`             | view or component handler, re-render          | `{diff}`                       |
//! | `live_patch`        | `handle_params`, re-render                    | `{diff}`                       |
//! | `allow_upload`      | validate entries, hand out tokens, re-render  | `{config, entries, diff}`      |
//! | `progress`          | update entry progress, re-render              | `{diff}`                       |
//! | `cids_will_destroy` | none                                          | `{}`                           |
//! | `cids_destroyed`    | unregister components                         | `{cids}`                       |
//! | `phx_leave`         | release the view                              | `{}`                           |
//! | binary frame        | append an upload chunk                        | `{}`                           |

use std::sync::Arc;

use serde_json::{Map, Value, json};
use url::Url;

use super::upload::UploadError;
use super::{
    Envelope, Inbound, ProtocolError, QueueSubscriber, SessionActor, SessionError, SessionState,
    Transport, route_params,
};
use crate::instrument::{finish_span, names};
use crate::render::Cid;
use crate::view::{BindingError, EventPayload, InfoEvent, LiveView, Params, Session, SocketCommand};

/// A join whose credential, session and route all checked out.
struct PreparedJoin {
    view: Box<dyn LiveView>,
    url: Url,
    params: Params,
    session: Session,
}

impl<T: Transport> SessionActor<T> {
    pub(super) async fn dispatch(&mut self, env: Envelope) -> Result<(), SessionError> {
        crate::debug!("session"; "<- {} {}", env.topic, env.event);

        match env.kind() {
            Inbound::Heartbeat => return self.send(env.reply(json!({}))),
            Inbound::Join if !env.is_upload_topic() => return self.on_join(&env).await,
            Inbound::Leave if !env.is_upload_topic() => {
                self.release().await;
                return self.send(env.reply(json!({})));
            }
            _ => {}
        }

        let Some(mut state) = self.state.take() else {
            crate::warn!("session"; "'{}' on {} before any join", env.event, env.topic);
            return self.send(env.reply_error(json!({ "reason": "unmatched topic" })));
        };
        let result = if !env.is_upload_topic() && env.topic != state.topic {
            crate::warn!("session"; "'{}' on {} but joined {}", env.event, env.topic, state.topic);
            self.send(env.reply_error(json!({ "reason": "unmatched topic" })))
        } else {
            self.dispatch_joined(&mut state, &env).await
        };
        self.state = Some(state);
        result
    }

    async fn dispatch_joined(
        &mut self,
        state: &mut SessionState,
        env: &Envelope,
    ) -> Result<(), SessionError> {
        match env.kind() {
            Inbound::Join => self.on_upload_join(state, env),
            Inbound::Leave => self.send(env.reply(json!({}))),
            Inbound::Event => self.on_event(state, env).await,
            Inbound::LivePatch => self.on_live_patch(state, env).await,
            Inbound::AllowUpload => self.on_allow_upload(state, env).await,
            Inbound::Progress => self.on_progress(state, env).await,
            Inbound::CidsWillDestroy => self.send(env.reply(json!({}))),
            Inbound::CidsDestroyed => self.on_cids_destroyed(state, env),
            Inbound::Chunk | Inbound::Heartbeat | Inbound::Unknown => {
                crate::warn!("session"; "ignoring '{}' on {}", env.event, env.topic);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------------

    async fn on_join(&mut self, env: &Envelope) -> Result<(), SessionError> {
        if self.state.is_some() {
            crate::debug!("session"; "rejoin on {}, replacing the current view", env.topic);
            self.release().await;
        }

        let instrumentation = Arc::clone(&self.endpoint.instrumentation);
        let span = instrumentation.start_span(names::JOIN_SPAN, &[("topic", env.topic.as_str())]);
        let result = self.join_view(env).await;
        finish_span(span, &result);
        if result.is_ok() {
            instrumentation.increment_counter(names::JOINS, 1, &[]);
        }
        result
    }

    async fn join_view(&mut self, env: &Envelope) -> Result<(), SessionError> {
        let join = match self.prepare_join(env) {
            Ok(join) => join,
            Err(e) => {
                // Best effort; the session ends regardless.
                let _ = self.send(env.reply_error(json!({ "reason": e.join_reason() })));
                return Err(e);
            }
        };

        let PreparedJoin {
            view,
            url,
            params,
            session,
        } = join;
        self.joins += 1;
        let mut state = SessionState::new(self.joins, env.topic.clone(), view, url, self.tx.clone());
        let result = self.mount(&mut state, env, &session, &params).await;
        self.state = Some(state);
        result
    }

    fn prepare_join(&self, env: &Envelope) -> Result<PreparedJoin, SessionError> {
        let missing = |field: &'static str| ProtocolError::MissingField {
            event: env.event.clone(),
            field,
        };

        let token = env
            .payload
            .pointer("/params/_csrf_token")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("params._csrf_token"))?;
        self.endpoint.signer.validate_token(token, &env.topic)?;

        let session = match env.payload.get("session").and_then(Value::as_str) {
            Some(signed) if !signed.is_empty() => self.endpoint.signer.verify_session(signed)?,
            _ => Session::new(),
        };

        let raw = env
            .payload
            .get("url")
            .or_else(|| env.payload.get("redirect"))
            .and_then(Value::as_str)
            .ok_or_else(|| missing("url"))?;
        let url = Url::parse(raw).map_err(|_| ProtocolError::BadUrl(raw.to_string()))?;
        let route = self
            .endpoint
            .routes
            .lookup(url.path())
            .ok_or_else(|| ProtocolError::UnknownRoute(url.path().to_string()))?;
        crate::debug!("session"; "{} routed to {}", url.path(), route.pattern);

        let view = (route.factory)();
        let params = route_params(&url, route.params);
        Ok(PreparedJoin {
            view,
            url,
            params,
            session,
        })
    }

    async fn mount(
        &mut self,
        state: &mut SessionState,
        env: &Envelope,
        session: &Session,
        params: &Params,
    ) -> Result<(), SessionError> {
        state
            .view
            .mount(&mut state.socket, session)
            .await
            .map_err(SessionError::from_handler)?;
        state
            .view
            .handle_params(&state.url, params, &mut state.socket)
            .await
            .map_err(SessionError::from_handler)?;
        self.run_commands(state).await?;

        let (rendered, tree) = self.render_diff(state).await?;
        let version = self.endpoint.config.session.protocol_version.clone();
        self.send(env.reply(json!({ "rendered": rendered, "liveview_version": version })))?;
        state.previous = Some(tree);
        crate::log!("session"; "{} joined {}", state.topic, state.meta.path);
        Ok(())
    }

    fn on_upload_join(&mut self, state: &mut SessionState, env: &Envelope) -> Result<(), SessionError> {
        let join_ref = env.join_ref.as_deref().unwrap_or_default();
        match state.socket.uploads.join(join_ref, &env.payload) {
            Ok(()) => self.send(env.reply(json!({}))),
            Err(e) => {
                crate::warn!("upload"; "refusing {}: {}", env.topic, e);
                self.send(env.reply_error(json!({ "reason": e.to_string() })))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    async fn on_event(&mut self, state: &mut SessionState, env: &Envelope) -> Result<(), SessionError> {
        let (event, payload) = match EventPayload::from_json(&env.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                crate::warn!("session"; "dropping malformed event: {}", e);
                return self.send(env.reply(json!({})));
            }
        };
        if let Some(uploads) = &payload.uploads {
            state.socket.uploads.register_entries(uploads);
        }

        self.endpoint
            .instrumentation
            .increment_counter(names::EVENTS, 1, &[("event", event.as_str())]);
        let handled = match payload.cid {
            Some(cid) => state.component_event(cid, &event, &payload).await,
            None => {
                state
                    .view
                    .handle_event(&event, &payload, &mut state.socket)
                    .await
            }
        };
        if let Err(e) = handled {
            if let Some(binding) = e.downcast_ref::<BindingError>() {
                crate::warn!("session"; "'{}' rejected its payload: {}", event, binding);
                return self.send(env.reply(json!({})));
            }
            return Err(SessionError::from_handler(e));
        }

        self.reply_with_diff(state, env, Map::new()).await
    }

    async fn on_live_patch(&mut self, state: &mut SessionState, env: &Envelope) -> Result<(), SessionError> {
        let raw = env.field("url")?;
        let url = Url::parse(raw).map_err(|_| ProtocolError::BadUrl(raw.to_string()))?;
        let path_params = self
            .endpoint
            .routes
            .lookup(url.path())
            .map(|route| route.params)
            .ok_or_else(|| ProtocolError::UnknownRoute(url.path().to_string()))?;
        self.patch_url(state, url, path_params).await?;
        self.reply_with_diff(state, env, Map::new()).await
    }

    async fn patch_url(
        &mut self,
        state: &mut SessionState,
        url: Url,
        path_params: Params,
    ) -> Result<(), SessionError> {
        let params = route_params(&url, path_params);
        state.set_url(url);
        state
            .view
            .handle_params(&state.url, &params, &mut state.socket)
            .await
            .map_err(SessionError::from_handler)
    }

    async fn on_allow_upload(&mut self, state: &mut SessionState, env: &Envelope) -> Result<(), SessionError> {
        let response = match state.socket.uploads.process_allow(&env.payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                crate::warn!("upload"; "bad allow_upload: {}", e);
                return self.send(env.reply_error(json!({ "reason": e.to_string() })));
            }
        };
        self.reply_with_diff(state, env, response).await
    }

    async fn on_progress(&mut self, state: &mut SessionState, env: &Envelope) -> Result<(), SessionError> {
        if let Err(e) = state.socket.uploads.update_progress(&env.payload) {
            crate::warn!("upload"; "bad progress: {}", e);
        }
        self.reply_with_diff(state, env, Map::new()).await
    }

    fn on_cids_destroyed(&mut self, state: &mut SessionState, env: &Envelope) -> Result<(), SessionError> {
        let cids = env.cids()?;
        let removed = cids.iter().filter(|cid| state.registry.unregister(**cid)).count();
        crate::debug!("component"; "client destroyed {} of {} cid(s)", removed, cids.len());
        self.send(env.reply(json!({ "cids": cids })))
    }

    pub(super) fn on_chunk(&mut self, env: &Envelope, chunk: &[u8]) -> Result<(), SessionError> {
        let join_ref = env.join_ref.as_deref().unwrap_or_default();
        let received = match self.state.as_mut() {
            Some(state) => state.socket.uploads.add_chunk(join_ref, chunk),
            None => Err(UploadError::UnknownUpload(join_ref.to_string())),
        };
        match received {
            Ok(total) => {
                crate::debug!("upload"; "{}: {} bytes so far", join_ref, total);
                self.send(env.reply(json!({})))
            }
            Err(e) => {
                crate::warn!("upload"; "dropping chunk: {}", e);
                self.send(env.reply_error(json!({ "reason": e.to_string() })))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Info (timers, broadcasts)
    // ------------------------------------------------------------------------

    pub(super) async fn on_info(&mut self, generation: u64, event: InfoEvent) -> Result<(), SessionError> {
        let Some(mut state) = self.state.take() else {
            crate::debug!("session"; "no view joined; dropping info '{}'", event.name);
            return Ok(());
        };
        if state.generation != generation {
            crate::debug!("session"; "dropping info '{}' left over from a previous join", event.name);
            self.state = Some(state);
            return Ok(());
        }
        self.endpoint
            .instrumentation
            .increment_counter(names::INFOS, 1, &[("info", event.name.as_str())]);
        let result = self.push_info(&mut state, &event).await;
        self.state = Some(state);
        result
    }

    async fn push_info(&mut self, state: &mut SessionState, event: &InfoEvent) -> Result<(), SessionError> {
        state
            .view
            .handle_info(event, &mut state.socket)
            .await
            .map_err(SessionError::from_handler)?;
        self.run_commands(state).await?;

        let (diff, rendered) = self.render_diff(state).await?;
        if diff.as_object().is_some_and(|map| !map.is_empty()) {
            self.send(Envelope::push(&state.topic, "diff", diff))?;
        }
        state.previous = Some(rendered);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Shared tail
    // ------------------------------------------------------------------------

    /// Carry out queued socket commands, render, and answer `env` with the diff.
    async fn reply_with_diff(
        &mut self,
        state: &mut SessionState,
        env: &Envelope,
        mut response: Map<String, Value>,
    ) -> Result<(), SessionError> {
        self.run_commands(state).await?;
        let (diff, rendered) = self.render_diff(state).await?;
        response.insert("diff".into(), diff);
        self.send(env.reply(Value::Object(response)))?;
        state.previous = Some(rendered);
        Ok(())
    }

    /// Commands run in the order they were queued; a patch's `handle_params`
    /// may queue more, which run in the same turn.
    async fn run_commands(&mut self, state: &mut SessionState) -> Result<(), SessionError> {
        loop {
            let commands = state.socket.take_commands();
            if commands.is_empty() {
                return Ok(());
            }
            for command in commands {
                match command {
                    SocketCommand::Subscribe(topic) => {
                        let subscriber = Arc::new(QueueSubscriber {
                            tx: self.tx.clone(),
                            generation: state.generation,
                        });
                        self.endpoint.pubsub.subscribe(&topic, self.id, subscriber);
                    }
                    SocketCommand::Broadcast { topic, message } => {
                        let reached = self.endpoint.pubsub.publish(&topic, &message);
                        crate::debug!("session"; "broadcast on '{}' reached {}", topic, reached);
                    }
                    SocketCommand::ScheduleInfo { event, every } => state.scheduler.every(event, every),
                    SocketCommand::ScheduleOnce { event, after } => state.scheduler.once(event, after),
                    SocketCommand::PushPatch { to } => {
                        let url = state
                            .url
                            .join(&to)
                            .map_err(|_| ProtocolError::BadUrl(to.clone()))?;
                        let path_params = self
                            .endpoint
                            .routes
                            .lookup(url.path())
                            .map(|route| route.params)
                            .unwrap_or_default();
                        self.patch_url(state, url, path_params).await?;
                        let patch = json!({ "kind": "push", "to": to });
                        self.send(Envelope::push(&state.topic, "live_patch", patch))?;
                    }
                    SocketCommand::Navigate { kind, to } => {
                        let redirect = json!({ "kind": kind.as_str(), "to": to });
                        self.send(Envelope::push(&state.topic, "live_redirect", redirect))?;
                    }
                    SocketCommand::Redirect { to } => {
                        self.send(Envelope::push(&state.topic, "redirect", json!({ "to": to })))?;
                    }
                }
            }
        }
    }
}

impl SessionState {
    /// Route an event to component `cid`, then hand whatever it sent its
    /// parent to the view.
    async fn component_event(&mut self, cid: Cid, event: &str, payload: &EventPayload) -> anyhow::Result<()> {
        let result = self.registry.handle_event(cid, event, payload).await;
        let outbox = self.registry.take_outbox();
        for (name, value) in outbox.push_events {
            self.socket.push_event(name, value);
        }
        result?;

        for (name, value) in outbox.parent_events {
            let payload = EventPayload::from_value(value);
            self.view.handle_event(&name, &payload, &mut self.socket).await?;
        }
        Ok(())
    }
}
