//! Push subscriptions against a realtime key/value store.
//!
//! A store hands out one [`Subscription`] per path. Every message is the full
//! current value at that path; `null` means nothing is stored there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SourceError;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Live handle on one path. `unsubscribe()` (or dropping the handle) is the
/// only teardown path; `close()` also waits for the store's feeding task.
pub struct Subscription {
    path: String,
    rx: Option<mpsc::UnboundedReceiver<Value>>,
    cancel_token: CancellationToken,
    feeder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        path: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Value>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            path: path.into(),
            rx: Some(rx),
            cancel_token,
            feeder: None,
        }
    }

    /// Attach the task that feeds this subscription so `close()` can join it.
    pub fn with_feeder(mut self, feeder: JoinHandle<()>) -> Self {
        self.feeder = Some(feeder);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next value pushed at the path. `None` once the store ended the stream
    /// or the subscription was cancelled.
    pub async fn next(&mut self) -> Option<Value> {
        let rx = self.rx.as_mut()?;
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => None,
            value = rx.recv() => value,
        }
    }

    /// A value that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<Value> {
        self.rx.as_mut()?.try_recv().ok()
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self) {
        self.cancel_token.cancel();
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }

    /// Unsubscribe and wait until the feeding task has finished, so nothing it
    /// publishes on the way out can reach a later subscription.
    pub async fn close(&mut self) {
        self.unsubscribe();
        if let Some(feeder) = self.feeder.take() {
            if let Err(err) = feeder.await {
                log_warn!("feeder for '{}' failed to join: {err}", self.path);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some() && !self.cancel_token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

pub trait RealtimeStore: Send + Sync + 'static {
    fn subscribe(&self, path: &str) -> Result<Subscription, SourceError>;
}

impl<T: RealtimeStore + ?Sized> RealtimeStore for Arc<T> {
    fn subscribe(&self, path: &str) -> Result<Subscription, SourceError> {
        (**self).subscribe(path)
    }
}

#[derive(Default)]
struct Topic {
    value: Value,
    subscribers: Vec<(mpsc::UnboundedSender<Value>, CancellationToken)>,
}

impl Topic {
    fn prune(&mut self) {
        self.subscribers
            .retain(|(tx, token)| !token.is_cancelled() && !tx.is_closed());
    }
}

/// In-process store. New subscribers get the current value right away, the
/// way a realtime database delivers its first snapshot.
#[derive(Clone, Default)]
pub struct LocalRealtimeHub {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl LocalRealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the value at `path` and push it to every live subscriber.
    pub fn publish(&self, path: &str, value: Value) {
        let mut topics = self.topics();
        let topic = topics.entry(normalize_path(path)).or_default();
        topic.prune();
        topic.value = value;
        for (tx, _) in &topic.subscribers {
            let _ = tx.send(topic.value.clone());
        }
    }

    pub fn value(&self, path: &str) -> Value {
        self.topics()
            .get(&normalize_path(path))
            .map(|topic| topic.value.clone())
            .unwrap_or(Value::Null)
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        let mut topics = self.topics();
        match topics.get_mut(&normalize_path(path)) {
            Some(topic) => {
                topic.prune();
                topic.subscribers.len()
            }
            None => 0,
        }
    }
}

impl RealtimeStore for LocalRealtimeHub {
    fn subscribe(&self, path: &str) -> Result<Subscription, SourceError> {
        let path = normalize_path(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let mut topics = self.topics();
        let topic = topics.entry(path.clone()).or_default();
        topic.prune();
        let _ = tx.send(topic.value.clone());
        topic.subscribers.push((tx, cancel_token.clone()));

        Ok(Subscription::new(path, rx, cancel_token))
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Client for a realtime database's REST streaming endpoint
/// (`GET <base>/<path>.json` with `Accept: text/event-stream`).
///
/// The server sends `put`/`patch` deltas; the client mirrors the record and
/// pushes the whole value after each change. HTTP has no connection-state
/// path, so liveness is derived: `true` while a stream is open, `false` once
/// it ends or fails to open. Subscribing to `liveness_path` returns that
/// signal.
pub struct EventStreamStore {
    base_url: String,
    client: reqwest::Client,
    liveness_path: String,
    liveness: LocalRealtimeHub,
}

impl EventStreamStore {
    pub fn new(base_url: impl Into<String>, liveness_path: impl Into<String>) -> Self {
        let liveness_path = normalize_path(&liveness_path.into());
        let liveness = LocalRealtimeHub::new();
        liveness.publish(&liveness_path, Value::Bool(false));
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            liveness_path,
            liveness,
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path)
    }
}

impl RealtimeStore for EventStreamStore {
    fn subscribe(&self, path: &str) -> Result<Subscription, SourceError> {
        let path = normalize_path(path);
        if path == self.liveness_path {
            return self.liveness.subscribe(&path);
        }

        let request = self
            .client
            .get(self.url_for(&path))
            .header(ACCEPT, "text/event-stream");
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let liveness = self.liveness.clone();
        let liveness_path = self.liveness_path.clone();
        let stream_path = path.clone();
        let token = cancel_token.clone();
        let feeder = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = stream_record(request, &stream_path, &tx, &liveness, &liveness_path) => {
                    if let Err(err) = result {
                        log_warn!("{err}");
                    }
                }
            }
            liveness.publish(&liveness_path, Value::Bool(false));
            log_info!("event stream for '{stream_path}' closed");
        });

        Ok(Subscription::new(path, rx, cancel_token).with_feeder(feeder))
    }
}

async fn stream_record(
    request: reqwest::RequestBuilder,
    path: &str,
    tx: &mpsc::UnboundedSender<Value>,
    liveness: &LocalRealtimeHub,
    liveness_path: &str,
) -> Result<(), SourceError> {
    let stream_error = |reason: String| SourceError::StreamError {
        path: path.to_string(),
        reason,
    };

    let mut response = request
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| stream_error(err.to_string()))?;

    log_info!("event stream for '{path}' open");
    liveness.publish(liveness_path, Value::Bool(true));

    let mut parser = EventStreamParser::default();
    let mut mirror = RecordMirror::default();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| stream_error(err.to_string()))?
    {
        for event in parser.push(&chunk) {
            match mirror.apply(&event).map_err(stream_error)? {
                MirrorChange::Changed => {
                    if tx.send(mirror.value().clone()).is_err() {
                        return Ok(());
                    }
                }
                MirrorChange::Unchanged => {}
                MirrorChange::Closed(reason) => return Err(stream_error(reason)),
            }
        }
    }

    Err(stream_error("server ended the stream".to_string()))
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(StreamEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[derive(Debug, PartialEq)]
enum MirrorChange {
    Changed,
    Unchanged,
    Closed(String),
}

/// Local copy of the streamed record, rebuilt from `put`/`patch` deltas.
#[derive(Debug, Default)]
struct RecordMirror {
    value: Value,
}

impl RecordMirror {
    fn value(&self) -> &Value {
        &self.value
    }

    fn apply(&mut self, event: &StreamEvent) -> Result<MirrorChange, String> {
        match event.event.as_str() {
            "put" | "patch" => {
                let delta: Value = serde_json::from_str(&event.data)
                    .map_err(|err| format!("bad {} payload: {err}", event.event))?;
                let path = delta.get("path").and_then(Value::as_str).unwrap_or("/");
                let data = delta.get("data").cloned().unwrap_or(Value::Null);
                log_debug!("{} at '{path}'", event.event);

                if event.event == "put" {
                    set_at(&mut self.value, path, data);
                } else if let Value::Object(children) = data {
                    for (key, child) in children {
                        set_at(&mut self.value, &format!("{path}/{key}"), child);
                    }
                } else {
                    return Err("patch payload is not an object".to_string());
                }
                Ok(MirrorChange::Changed)
            }
            "keep-alive" => Ok(MirrorChange::Unchanged),
            "cancel" => Ok(MirrorChange::Closed(format!(
                "server cancelled the stream: {}",
                event.data
            ))),
            "auth_revoked" => Ok(MirrorChange::Closed("credential revoked".to_string())),
            _ => Ok(MirrorChange::Unchanged),
        }
    }
}

/// Write `data` at a slash-separated path; `null` removes the entry.
fn set_at(root: &mut Value, path: &str, data: Value) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = data;
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            if data.is_null() {
                return;
            }
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if data.is_null() {
        if let Value::Object(map) = node {
            map.remove(*last);
        }
        return;
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), data);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn hub_delivers_current_value_then_updates() {
        let hub = LocalRealtimeHub::new();
        hub.publish("voc_readings/latest", json!({"air_quality": 150}));

        let mut sub = hub.subscribe("/voc_readings/latest/").unwrap();
        assert_eq!(sub.next().await, Some(json!({"air_quality": 150})));

        hub.publish("voc_readings/latest", json!({"air_quality": 210}));
        assert_eq!(sub.next().await, Some(json!({"air_quality": 210})));
    }

    #[tokio::test]
    async fn empty_path_starts_with_null() {
        let hub = LocalRealtimeHub::new();
        let mut sub = hub.subscribe("voc_readings/latest").unwrap();
        assert_eq!(sub.next().await, Some(Value::Null));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_detaches() {
        let hub = LocalRealtimeHub::new();
        let mut sub = hub.subscribe("a").unwrap();
        assert_eq!(hub.subscriber_count("a"), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(sub.next().await, None);
        assert_eq!(hub.subscriber_count("a"), 0);

        let other = hub.subscribe("a").unwrap();
        drop(other);
        assert_eq!(hub.subscriber_count("a"), 0);
    }

    #[test]
    fn parser_handles_split_events_and_comments() {
        let mut parser = EventStreamParser::default();
        assert!(parser.push(b": hello\nevent: put\nda").is_empty());

        let events = parser.push(b"ta: {\"path\":\"/\",\"data\":1}\r\n\r\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(
            events,
            vec![
                StreamEvent {
                    event: "put".into(),
                    data: "{\"path\":\"/\",\"data\":1}".into(),
                },
                StreamEvent {
                    event: "keep-alive".into(),
                    data: "null".into(),
                },
            ]
        );
    }

    fn event(name: &str, data: Value) -> StreamEvent {
        StreamEvent {
            event: name.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn mirror_applies_put_and_patch() {
        let mut mirror = RecordMirror::default();

        let put = event("put", json!({"path": "/", "data": {"mq135": 150, "mq7": 5}}));
        assert_eq!(mirror.apply(&put), Ok(MirrorChange::Changed));

        let patch = event("patch", json!({"path": "/", "data": {"mq135": 210, "mq3": 9}}));
        mirror.apply(&patch).unwrap();
        assert_eq!(mirror.value(), &json!({"mq135": 210, "mq7": 5, "mq3": 9}));

        let nested = event("put", json!({"path": "/mq7", "data": 6}));
        mirror.apply(&nested).unwrap();
        assert_eq!(mirror.value()["mq7"], json!(6));

        let removal = event("put", json!({"path": "/mq3", "data": null}));
        mirror.apply(&removal).unwrap();
        assert!(mirror.value().get("mq3").is_none());

        let cleared = event("put", json!({"path": "/", "data": null}));
        mirror.apply(&cleared).unwrap();
        assert!(mirror.value().is_null());
    }

    #[test]
    fn mirror_reports_keep_alive_and_cancel() {
        let mut mirror = RecordMirror::default();
        assert_eq!(
            mirror.apply(&event("keep-alive", Value::Null)),
            Ok(MirrorChange::Unchanged)
        );
        assert!(matches!(
            mirror.apply(&StreamEvent {
                event: "cancel".into(),
                data: "permission denied".into(),
            }),
            Ok(MirrorChange::Closed(_))
        ));
        assert!(mirror
            .apply(&StreamEvent {
                event: "put".into(),
                data: "{not json".into(),
            })
            .is_err());
    }

    #[tokio::test]
    async fn try_next_only_returns_queued_values() {
        let hub = LocalRealtimeHub::new();
        let mut sub = hub.subscribe("a").unwrap();
        assert_eq!(sub.try_next(), Some(Value::Null));
        assert_eq!(sub.try_next(), None);

        hub.publish("a", json!(1));
        hub.publish("a", json!(2));
        assert_eq!(sub.try_next(), Some(json!(1)));
        assert_eq!(sub.try_next(), Some(json!(2)));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn close_waits_for_the_feeder_to_finish() {
        let hub = LocalRealtimeHub::new();
        hub.publish("flag", json!(true));

        let (_tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let feeder = tokio::spawn({
            let hub = hub.clone();
            let token = token.clone();
            async move {
                token.cancelled().await;
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                hub.publish("flag", json!(false));
            }
        });
        let mut sub = Subscription::new("data", rx, token).with_feeder(feeder);

        sub.close().await;
        assert_eq!(hub.value("flag"), json!(false));
        // Second close has nothing left to join.
        sub.close().await;
    }

    #[tokio::test]
    async fn closed_event_stream_has_already_reported_offline() {
        let store = EventStreamStore::new("http://127.0.0.1:9", ".info/connected");
        let mut readings = store.subscribe("voc_readings/latest").unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), readings.close())
            .await
            .expect("stream task did not stop");
        assert_eq!(store.liveness.value(".info/connected"), json!(false));
    }

    #[tokio::test]
    async fn event_stream_liveness_starts_false() {
        let store = EventStreamStore::new("http://127.0.0.1:9", ".info/connected");
        let mut liveness = store.subscribe(".info/connected").unwrap();
        assert_eq!(liveness.next().await, Some(Value::Bool(false)));
    }
}
