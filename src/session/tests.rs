use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::upload::UploadConstraints;
use super::*;
use crate::component::{ComponentMeta, ComponentSocket, LiveComponent, Props, RenderContext};
use crate::render::RenderTree;
use crate::render::client::VirtualClient;
use crate::view::{EventPayload, Session};

const TOPIC: &str = "lv:phx-test";
const SECRET: &str = "session-test-secret";

fn signer() -> Signer {
    Signer::new(SECRET, Duration::from_secs(3600))
}

// ============================================================================
// Views under test
// ============================================================================

#[derive(Default)]
struct Counter {
    count: i64,
}

#[async_trait]
impl LiveView for Counter {
    async fn mount(&mut self, socket: &mut LiveSocket, session: &Session) -> Result<()> {
        self.count = session.get("count").and_then(Value::as_i64).unwrap_or(0);
        socket.subscribe("counter");
        Ok(())
    }

    async fn handle_params(&mut self, _url: &Url, params: &Params, _socket: &mut LiveSocket) -> Result<()> {
        if params.contains("start") {
            self.count = params.parse("start")?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: &str, payload: &EventPayload, socket: &mut LiveSocket) -> Result<()> {
        match event {
            "inc" => self.count += payload.params.parse_or::<i64>("by", 1)?,
            "broadcast" => socket.broadcast("counter", json!({ "count": 42 })),
            "title" => {
                socket.set_title("Counter!");
                socket.push_event("flash", json!({ "ok": true }));
            }
            "tick" => socket.schedule_info_once(InfoEvent::new("tick"), Duration::from_millis(10)),
            "go" => socket.push_navigate("/other", &Params::new()),
            "patch" => {
                let mut params = Params::new();
                params.insert("start", "7");
                socket.push_patch("/", &params);
            }
            "crash" => anyhow::bail!("counter exploded"),
            _ => {}
        }
        Ok(())
    }

    async fn handle_info(&mut self, info: &InfoEvent, _socket: &mut LiveSocket) -> Result<()> {
        match info.name.as_str() {
            "tick" => self.count += 1,
            "counter" => self.count = info.payload["count"].as_i64().unwrap_or_default(),
            _ => {}
        }
        Ok(())
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        RenderTree::build()
            .text("<p>count: ")
            .value(self.count)
            .text("</p>")
            .finish()
    }
}

#[derive(Default)]
struct Clicker {
    clicks: u32,
}

#[async_trait]
impl LiveComponent for Clicker {
    async fn handle_event(&mut self, _event: &str, _payload: &EventPayload, socket: &mut ComponentSocket) -> Result<()> {
        self.clicks += 1;
        socket.send_parent("child_clicked", json!({ "clicks": self.clicks }));
        socket.push_event("clicked", json!({}));
        Ok(())
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, _meta: &ComponentMeta<'_>) -> RenderTree {
        RenderTree::build()
            .text("<button>")
            .value(self.clicks)
            .text("</button>")
            .finish()
    }
}

#[derive(Default)]
struct Panel {
    heard: u64,
}

#[async_trait]
impl LiveView for Panel {
    async fn handle_event(&mut self, event: &str, payload: &EventPayload, _socket: &mut LiveSocket) -> Result<()> {
        if event == "child_clicked" {
            self.heard = payload.require("clicks")?;
        }
        Ok(())
    }

    fn render(&mut self, ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        RenderTree::build()
            .text("<div>")
            .value(self.heard)
            .text("|")
            .dynamic(ctx.live_component::<Clicker>("clicker", Props::new()))
            .text("</div>")
            .finish()
    }
}

#[derive(Default)]
struct Uploader {
    reference: String,
    saved: Vec<String>,
}

#[async_trait]
impl LiveView for Uploader {
    async fn mount(&mut self, socket: &mut LiveSocket, _session: &Session) -> Result<()> {
        self.reference = socket
            .allow_upload("avatar", UploadConstraints::default())
            .reference
            .clone();
        Ok(())
    }

    async fn handle_event(&mut self, event: &str, _payload: &EventPayload, socket: &mut LiveSocket) -> Result<()> {
        if event == "save" {
            self.saved = socket
                .uploads
                .consume("avatar")
                .into_iter()
                .map(|u| format!("{}:{}", u.entry.name, String::from_utf8_lossy(&u.data)))
                .collect();
        }
        Ok(())
    }

    fn render(&mut self, _ctx: &mut RenderContext<'_>, _meta: &ViewMeta) -> RenderTree {
        RenderTree::build()
            .text("<form data-ref=\"")
            .value(&self.reference)
            .text("\">")
            .value(self.saved.join(","))
            .text("</form>")
            .finish()
    }
}

fn routes() -> LiveRoutes {
    LiveRoutes::new()
        .add("/", || Box::new(Counter::default()))
        .add("/other", || Box::new(Counter::default()))
        .add("/panel", || Box::new(Panel::default()))
        .add("/upload", || Box::new(Uploader::default()))
}

fn endpoint(config: LumenConfig) -> Arc<Endpoint> {
    Arc::new(Endpoint::new(routes(), Arc::new(config)).with_signer(signer()))
}

// ============================================================================
// In-memory transport and client
// ============================================================================

struct MemoryTransport {
    out: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.out.send(text).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct Client {
    tx: mpsc::Sender<SessionMsg>,
    frames: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<Result<(), SessionError>>,
    next_ref: u32,
}

impl Client {
    fn start() -> Self {
        Self::connect(endpoint(LumenConfig::default()))
    }

    fn connect(endpoint: Arc<Endpoint>) -> Self {
        let (out, frames) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = MemoryTransport {
            out,
            closed: Arc::clone(&closed),
        };
        let (actor, tx) = SessionActor::new(endpoint, transport);
        Self {
            tx,
            frames,
            closed,
            task: tokio::spawn(actor.run()),
            next_ref: 0,
        }
    }

    async fn push(&mut self, frame: Value) {
        self.tx.send(SessionMsg::Text(frame.to_string())).await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("no frame within 5s")
            .expect("transport dropped");
        serde_json::from_str(&text).unwrap()
    }

    /// Send `event` on the view topic and return the whole reply frame.
    async fn request(&mut self, event: &str, payload: Value) -> Value {
        self.next_ref += 1;
        let msg_ref = self.next_ref.to_string();
        self.push(json!(["1", &msg_ref, TOPIC, event, payload])).await;
        let reply = self.next().await;
        assert_eq!(reply[1], json!(msg_ref), "unexpected frame {reply}");
        assert_eq!(reply[3], "phx_reply");
        reply
    }

    /// Like [`Client::request`], asserting an ok reply and returning its response.
    async fn call(&mut self, event: &str, payload: Value) -> Value {
        let reply = self.request(event, payload).await;
        assert_eq!(reply[4]["status"], "ok", "{reply}");
        reply[4]["response"].clone()
    }

    async fn join(&mut self, path: &str) -> Value {
        self.call("phx_join", join_payload(path, &signer().issue_token(TOPIC)))
            .await
    }

    async fn event(&mut self, event: &str, value: Value) -> Value {
        self.call("event", json!({ "type": "click", "event": event, "value": value }))
            .await
    }

    async fn finish(self) -> Result<(), SessionError> {
        self.tx.send(SessionMsg::Disconnected).await.unwrap();
        self.task.await.unwrap()
    }
}

fn join_payload(path: &str, token: &str) -> Value {
    json!({
        "url": format!("http://localhost{path}"),
        "params": { "_csrf_token": token },
        "session": "",
        "static": null,
    })
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test]
async fn test_join_renders_full_tree() {
    let mut client = Client::start();
    let response = client.join("/").await;

    assert_eq!(response["rendered"], json!({ "0": "0", "s": ["<p>count: ", "</p>"] }));
    assert_eq!(response["liveview_version"], "2.0.0");
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_join_applies_session_and_query() {
    let mut client = Client::start();
    let Value::Object(session) = json!({ "count": 3 }) else {
        unreachable!()
    };
    let mut payload = join_payload("/", &signer().issue_token(TOPIC));
    payload["session"] = json!(signer().sign_session(&session));
    let response = client.call("phx_join", payload).await;
    assert_eq!(response["rendered"]["0"], "3");

    let mut client = Client::start();
    let response = client.join("/?start=9").await;
    assert_eq!(response["rendered"]["0"], "9");
}

#[tokio::test]
async fn test_bad_token_closes_connection() {
    let mut client = Client::start();
    let token = signer().issue_token("lv:someone-else");
    let reply = client.request("phx_join", join_payload("/", &token)).await;
    assert_eq!(reply[4]["status"], "error");
    assert_eq!(reply[4]["response"]["reason"], "unauthorized");

    let result = client.task.await.unwrap();
    assert!(matches!(result, Err(SessionError::Credential(AuthError::BadSignature))));
    assert!(client.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_missing_token_is_protocol_error() {
    let mut client = Client::start();
    let reply = client
        .request("phx_join", json!({ "url": "http://localhost/", "params": {} }))
        .await;
    assert_eq!(reply[4]["status"], "error");
    let result = client.task.await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::Protocol(ProtocolError::MissingField { .. }))
    ));
}

#[tokio::test]
async fn test_unknown_route_rejected() {
    let mut client = Client::start();
    let reply = client
        .request("phx_join", join_payload("/nope", &signer().issue_token(TOPIC)))
        .await;
    assert_eq!(reply[4]["response"]["reason"], "not_found");
    let result = client.task.await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::Protocol(ProtocolError::UnknownRoute(_)))
    ));
}

#[tokio::test]
async fn test_rejoin_replaces_view() {
    let mut client = Client::start();
    client.join("/").await;
    client.event("inc", json!({})).await;

    let response = client.join("/other").await;
    assert_eq!(response["rendered"], json!({ "0": "0", "s": ["<p>count: ", "</p>"] }));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_rejoin_drops_info_queued_for_old_view() {
    let mut client = Client::start();
    client.join("/").await;

    let token = signer().issue_token(TOPIC);
    client
        .push(json!(["2", "join", TOPIC, "phx_join", join_payload("/other", &token)]))
        .await;
    let stale = SessionMsg::Info {
        generation: 1,
        event: InfoEvent::new("tick"),
    };
    client.tx.send(stale).await.unwrap();

    let reply = client.next().await;
    assert_eq!(reply[1], "join");
    assert_eq!(reply[4]["status"], "ok");

    client.push(json!([null, "hb", "phoenix", "heartbeat", {}])).await;
    let reply = client.next().await;
    assert_eq!(reply[1], "hb", "old view's tick reached the new view: {reply}");

    let current = SessionMsg::Info {
        generation: 2,
        event: InfoEvent::new("tick"),
    };
    client.tx.send(current).await.unwrap();
    assert_eq!(
        client.next().await,
        json!([null, null, TOPIC, "diff", { "0": "1" }])
    );
    client.finish().await.unwrap();
}

// ============================================================================
// Instrumentation
// ============================================================================

#[derive(Default)]
struct Recorder {
    counters: parking_lot::Mutex<Vec<(String, i64, String)>>,
    histograms: parking_lot::Mutex<Vec<String>>,
}

impl Recorder {
    fn total(&self, name: &str) -> i64 {
        self.counters
            .lock()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| v)
            .sum()
    }
}

impl crate::instrument::Instrumentation for Recorder {
    fn increment_counter(&self, name: &str, value: u64, attrs: crate::instrument::Attributes<'_>) {
        let tag = attrs.first().map(|(_, v)| v.to_string()).unwrap_or_default();
        self.counters.lock().push((name.to_string(), value as i64, tag));
    }

    fn update_updown_counter(&self, name: &str, delta: i64, _attrs: crate::instrument::Attributes<'_>) {
        self.counters.lock().push((name.to_string(), delta, String::new()));
    }

    fn record_histogram(&self, name: &str, _value: f64, _attrs: crate::instrument::Attributes<'_>) {
        self.histograms.lock().push(name.to_string());
    }
}

#[tokio::test]
async fn test_session_reports_instrumentation() {
    use crate::instrument::names;

    let recorder = Arc::new(Recorder::default());
    let endpoint = Endpoint::new(routes(), Arc::new(LumenConfig::default()))
        .with_signer(signer())
        .with_instrumentation(recorder.clone());
    let mut client = Client::connect(Arc::new(endpoint));

    client.join("/").await;
    client.event("inc", json!({})).await;
    assert_eq!(recorder.total(names::ACTIVE_SESSIONS), 1);

    client.finish().await.unwrap();
    assert_eq!(recorder.total(names::ACTIVE_SESSIONS), 0);
    assert_eq!(recorder.total(names::JOINS), 1);
    assert!(
        recorder
            .counters
            .lock()
            .iter()
            .any(|(n, v, tag)| n == names::EVENTS && *v == 1 && tag == "inc")
    );
    // one render for the join, one for the event
    let renders = recorder.histograms.lock();
    assert_eq!(renders.iter().filter(|n| *n == names::RENDER_TIME).count(), 2);
}

// ============================================================================
// Events and control messages
// ============================================================================

#[tokio::test]
async fn test_event_sends_minimal_diff() {
    let mut client = Client::start();
    client.join("/").await;

    let response = client.event("inc", json!({})).await;
    assert_eq!(response["diff"], json!({ "0": "1" }));

    let response = client.event("inc", json!({ "by": 5 })).await;
    assert_eq!(response["diff"], json!({ "0": "6" }));

    // Nothing changed, nothing to send.
    let response = client.event("noop", json!({})).await;
    assert_eq!(response["diff"], json!({}));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_reply() {
    let mut client = Client::start();
    client.push(json!([null, "9", "phoenix", "heartbeat", {}])).await;
    assert_eq!(
        client.next().await,
        json!([null, "9", "phoenix", "phx_reply", { "response": {}, "status": "ok" }])
    );
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_binding_error_is_recovered() {
    let mut client = Client::start();
    client.join("/").await;

    let response = client.event("inc", json!({ "by": "lots" })).await;
    assert_eq!(response, json!({}));

    let response = client.call("event", json!({ "type": "click" })).await;
    assert_eq!(response, json!({}));

    let response = client.event("inc", json!({})).await;
    assert_eq!(response["diff"], json!({ "0": "1" }));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_terminates_session() {
    let mut client = Client::start();
    client.join("/").await;
    client
        .push(json!(["1", "2", TOPIC, "event", { "type": "click", "event": "crash", "value": {} }]))
        .await;

    let result = client.task.await.unwrap();
    assert!(matches!(result, Err(SessionError::Handler(_))));
    assert!(client.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_title_and_events_ride_along() {
    let mut client = Client::start();
    client.join("/").await;

    let response = client.event("title", json!({})).await;
    assert_eq!(response["diff"]["t"], "Counter!");
    assert_eq!(response["diff"]["e"], json!([["flash", { "ok": true }]]));

    let response = client.event("inc", json!({})).await;
    assert_eq!(response["diff"], json!({ "0": "1" }));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_leave_releases_view() {
    let mut client = Client::start();
    client.join("/").await;
    assert_eq!(client.call("phx_leave", json!({})).await, json!({}));

    let reply = client
        .request("event", json!({ "type": "click", "event": "inc", "value": {} }))
        .await;
    assert_eq!(reply[4]["status"], "error");

    // The connection survives a leave.
    client.join("/").await;
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_wrong_topic_is_refused() {
    let mut client = Client::start();
    client.join("/").await;
    client
        .push(json!(["1", "5", "lv:elsewhere", "event", { "type": "click", "event": "inc", "value": {} }]))
        .await;
    let reply = client.next().await;
    assert_eq!(reply[4]["status"], "error");
    assert_eq!(reply[4]["response"]["reason"], "unmatched topic");
    client.finish().await.unwrap();
}

// ============================================================================
// Navigation
// ============================================================================

#[tokio::test]
async fn test_live_patch_runs_handle_params() {
    let mut client = Client::start();
    client.join("/").await;

    let response = client
        .call("live_patch", json!({ "url": "http://localhost/?start=5" }))
        .await;
    assert_eq!(response["diff"], json!({ "0": "5" }));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_push_patch_command() {
    let mut client = Client::start();
    client.join("/").await;
    client
        .push(json!(["1", "2", TOPIC, "event", { "type": "click", "event": "patch", "value": {} }]))
        .await;

    assert_eq!(
        client.next().await,
        json!([null, null, TOPIC, "live_patch", { "kind": "push", "to": "/?start=7" }])
    );
    let reply = client.next().await;
    assert_eq!(reply[4]["response"]["diff"], json!({ "0": "7" }));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_navigate_command() {
    let mut client = Client::start();
    client.join("/").await;
    client
        .push(json!(["1", "2", TOPIC, "event", { "type": "click", "event": "go", "value": {} }]))
        .await;

    assert_eq!(
        client.next().await,
        json!([null, null, TOPIC, "live_redirect", { "kind": "push", "to": "/other" }])
    );
    assert_eq!(client.next().await[3], "phx_reply");
    client.finish().await.unwrap();
}

// ============================================================================
// Timers and pub/sub
// ============================================================================

#[tokio::test]
async fn test_scheduled_info_pushes_diff() {
    let mut client = Client::start();
    client.join("/").await;

    let response = client.event("tick", json!({})).await;
    assert_eq!(response["diff"], json!({}));

    assert_eq!(
        client.next().await,
        json!([null, null, TOPIC, "diff", { "0": "1" }])
    );
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_subscribers() {
    let shared = endpoint(LumenConfig::default());
    let mut watcher = Client::connect(Arc::clone(&shared));
    let mut sender = Client::connect(shared);
    watcher.join("/").await;
    sender.join("/").await;

    let response = sender.event("broadcast", json!({})).await;
    assert_eq!(response["diff"], json!({}));

    let pushed = json!([null, null, TOPIC, "diff", { "0": "42" }]);
    assert_eq!(sender.next().await, pushed);
    assert_eq!(watcher.next().await, pushed);

    watcher.finish().await.unwrap();
    sender.finish().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_closes_session() {
    let mut config = LumenConfig::default();
    config.session.heartbeat_timeout_secs = 1;
    let client = Client::connect(endpoint(config));

    let result = client.task.await.unwrap();
    assert!(matches!(result, Err(SessionError::HeartbeatTimeout(_))));
    assert!(client.closed.load(Ordering::SeqCst));
}

// ============================================================================
// Components
// ============================================================================

#[tokio::test]
async fn test_component_event_reaches_parent() {
    let mut client = Client::start();
    let response = client.join("/panel").await;
    let mut browser = VirtualClient::join(&response["rendered"]);
    assert_eq!(browser.html(), "<div>0|<button>0</button></div>");

    let response = client
        .call("event", json!({ "type": "click", "event": "press", "value": {}, "cid": 1 }))
        .await;
    browser.apply(&response["diff"]);
    assert_eq!(browser.html(), "<div>1|<button>1</button></div>");
    assert_eq!(browser.events, vec![json!(["clicked", {}])]);
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_event_for_unknown_cid_is_ignored() {
    let mut client = Client::start();
    client.join("/panel").await;
    let response = client
        .call("event", json!({ "type": "click", "event": "press", "value": {}, "cid": 77 }))
        .await;
    assert_eq!(response["diff"], json!({}));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_cids_destroyed() {
    let mut client = Client::start();
    client.join("/panel").await;

    assert_eq!(client.call("cids_will_destroy", json!({ "cids": [1] })).await, json!({}));
    assert_eq!(
        client.call("cids_destroyed", json!({ "cids": [1] })).await,
        json!({ "cids": [1] })
    );
    client.finish().await.unwrap();
}

// ============================================================================
// Uploads
// ============================================================================

fn binary_frame(join_ref: &str, msg_ref: &str, topic: &str, payload: &[u8]) -> Vec<u8> {
    let event = "chunk";
    let mut out = vec![
        0,
        join_ref.len() as u8,
        msg_ref.len() as u8,
        topic.len() as u8,
        event.len() as u8,
    ];
    for part in [join_ref, msg_ref, topic, event] {
        out.extend_from_slice(part.as_bytes());
    }
    out.extend_from_slice(payload);
    out
}

#[tokio::test]
async fn test_upload_flow() {
    let mut client = Client::start();
    let response = client.join("/upload").await;
    let reference = response["rendered"]["0"].as_str().unwrap().to_string();

    let response = client
        .call(
            "allow_upload",
            json!({
                "ref": reference,
                "entries": [{ "ref": "0", "name": "a.png", "size": 3, "type": "image/png" }],
            }),
        )
        .await;
    let token = response["entries"]["0"].clone();
    assert_eq!(token["path"], "avatar");
    assert_eq!(response["diff"], json!({}));

    client.push(json!(["9", "9", "lvu:0", "phx_join", { "token": token }])).await;
    assert_eq!(client.next().await[4]["status"], "ok");

    client
        .tx
        .send(SessionMsg::Binary(binary_frame("9", "10", "lvu:0", b"abc")))
        .await
        .unwrap();
    assert_eq!(
        client.next().await,
        json!(["9", "10", "lvu:0", "phx_reply", { "response": {}, "status": "ok" }])
    );

    client
        .call("progress", json!({ "ref": reference, "entry_ref": "0", "progress": 100 }))
        .await;

    let response = client.event("save", json!({})).await;
    assert_eq!(response["diff"], json!({ "1": "a.png:abc" }));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_allow_upload_reports_violations() {
    let mut client = Client::start();
    let response = client.join("/upload").await;
    let reference = response["rendered"]["0"].as_str().unwrap().to_string();

    let response = client
        .call(
            "allow_upload",
            json!({
                "ref": reference,
                "entries": [{ "ref": "0", "name": "huge.png", "size": 1u64 << 40, "type": "image/png" }],
            }),
        )
        .await;
    assert_eq!(response["error"], json!([["0", "too_large"]]));
    client.finish().await.unwrap();
}

#[tokio::test]
async fn test_chunk_for_unknown_upload_is_refused() {
    let mut client = Client::start();
    client.join("/upload").await;
    client
        .tx
        .send(SessionMsg::Binary(binary_frame("4", "5", "lvu:9", b"x")))
        .await
        .unwrap();
    assert_eq!(client.next().await[4]["status"], "error");
    client.finish().await.unwrap();
}
