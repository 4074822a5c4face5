//! Outbound side of a connection.
//!
//! The transport assigns correlation ids, encodes arguments, parks a
//! oneshot per in-flight request and completes it when the reader loop
//! routes back the matching response. Inbound requests never pass through
//! here; the reader hands them straight to the dispatcher, so they are
//! served while local callers are still waiting.

use super::protocol::{Action, Message, Request, Response, Tag};
use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::runtime::SyncBridge;
use crate::shutdown::ShutdownSignal;
use crate::table::ReferenceTable;
use crate::value::{lock, Kwargs, PathKey, Value};
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub struct Transport {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    closed: ShutdownSignal,
    table: Arc<ReferenceTable>,
    bridge: SyncBridge,
}

impl Transport {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Message>,
        table: Arc<ReferenceTable>,
        bridge: SyncBridge,
    ) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: ShutdownSignal::new(),
            table,
            bridge,
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Returns the response tag and raw value; an `error` response becomes
    /// [`BridgeError::RemoteError`].
    pub async fn request(
        &self,
        action: Action,
        handle: u64,
        path: Vec<PathKey>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<(Tag, Json)> {
        if self.closed.is_triggered() {
            return Err(BridgeError::TransportClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let access = access_text(action, &path);

        let result = self.exchange(id, action, handle, path, args, kwargs).await;
        let reclaimed = self.table.reclaim(id);
        if reclaimed > 0 {
            debug!("Reclaimed {} unacknowledged argument handles of #{}", reclaimed, id);
        }

        let response = result?;
        match response.tag {
            Tag::Error => Err(BridgeError::RemoteError {
                access,
                message: response.error.unwrap_or_default(),
            }),
            tag => Ok((tag, response.value)),
        }
    }

    /// Blocking form of [`Transport::request`] for synchronous call sites.
    pub fn request_blocking(
        self: &Arc<Self>,
        action: Action,
        handle: u64,
        path: Vec<PathKey>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<(Tag, Json)> {
        let transport = self.clone();
        self.bridge
            .block_on(async move { transport.request(action, handle, path, args, kwargs).await })
    }

    async fn exchange(
        &self,
        id: u64,
        action: Action,
        handle: u64,
        path: Vec<PathKey>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Response> {
        let mut tokens = 0;
        let args = args
            .iter()
            .map(|arg| self.encode(arg, id, &mut tokens, 0))
            .collect::<Result<Vec<_>>>()?;
        let mut encoded_kwargs = serde_json::Map::new();
        for (key, value) in kwargs.iter() {
            encoded_kwargs.insert(key.clone(), self.encode(value, id, &mut tokens, 0)?);
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        // close() drains pending after setting the flag, so one of the two
        // sides always sees the other.
        if self.closed.is_triggered() {
            lock(&self.pending).remove(&id);
            return Err(BridgeError::TransportClosed);
        }

        debug!(
            "-> #{} {} ffid={} key={:?}",
            id,
            action.as_str(),
            handle,
            path
        );
        let request = Request {
            id,
            action,
            handle,
            path,
            args,
            kwargs: encoded_kwargs,
        };
        if self.outbound.send(Message::Request(request)).is_err() {
            lock(&self.pending).remove(&id);
            return Err(BridgeError::TransportClosed);
        }

        rx.await.map_err(|_| BridgeError::TransportClosed)
    }

    /// Encode one outbound argument.
    ///
    /// Proxies of this connection travel as their handle. Other referenced
    /// values get a provisional handle here and a create-reference marker
    /// on the wire.
    fn encode(&self, value: &Value, request: u64, tokens: &mut u64, depth: usize) -> Result<Json> {
        if depth > ProtocolConfig::MAX_VALUE_DEPTH {
            return Err(BridgeError::TypeError(format!(
                "argument nesting exceeds maximum depth of {}",
                ProtocolConfig::MAX_VALUE_DEPTH
            )));
        }
        Ok(match value {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::List(list) => Json::Array(
                list.snapshot()
                    .iter()
                    .map(|item| self.encode(item, request, tokens, depth + 1))
                    .collect::<Result<Vec<_>>>()?,
            ),
            // A mapping with an "ffid" key would read as a marker.
            Value::Map(map) if map.get("ffid").is_none() => {
                let mut out = serde_json::Map::new();
                for (k, v) in map.snapshot() {
                    out.insert(k, self.encode(&v, request, tokens, depth + 1)?);
                }
                Json::Object(out)
            }
            Value::Remote(proxy) if proxy.belongs_to(self) && proxy.wire_handle().is_some() => {
                json!({ "ffid": proxy.wire_handle() })
            }
            other => {
                let token = *tokens;
                *tokens += 1;
                let handle = self.table.allocate_provisional(request, token, other.clone());
                json!({ "ffid": "", "r": token, "src": handle })
            }
        })
    }

    /// Ask the peer to drop `handle`. Never fails.
    pub fn free(&self, handle: u64) {
        if self.closed.is_triggered() {
            return;
        }
        if self.outbound.send(Message::Free(vec![handle])).is_ok() {
            debug!("-> free {}", handle);
        }
    }

    pub(crate) fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_triggered() {
            return Err(BridgeError::TransportClosed);
        }
        self.outbound
            .send(message)
            .map_err(|_| BridgeError::TransportClosed)
    }

    /// Route a response to its waiter.
    pub(crate) fn complete(&self, response: Response) {
        let waiter = lock(&self.pending).remove(&response.id);
        match waiter {
            Some(tx) => {
                debug!("<- #{} {}", response.id, response.tag.as_str());
                let _ = tx.send(response);
            }
            None => warn!("Response for unknown request #{}", response.id),
        }
    }

    /// Fail pending request `id` with `message`. Unknown ids are ignored.
    pub(crate) fn fail(&self, id: u64, message: String) {
        let waiter = lock(&self.pending).remove(&id);
        if let Some(tx) = waiter {
            debug!("<- #{} malformed response", id);
            let _ = tx.send(Response::error(id, message));
        }
    }

    /// Keep the argument handles the peer registered for request `id`.
    pub(crate) fn acknowledge(&self, id: u64, handles: Vec<(u64, u64)>) {
        debug!("<- pre #{} {:?}", id, handles);
        self.table
            .acknowledge(id, handles.into_iter().map(|(token, _)| token));
    }

    /// Fail every pending request and refuse new ones.
    pub(crate) fn close(&self) {
        if self.closed.is_triggered() {
            return;
        }
        self.closed.trigger();
        let pending = std::mem::take(&mut *lock(&self.pending));
        if !pending.is_empty() {
            debug!("Failing {} pending requests on close", pending.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    pub(crate) fn closed_signal(&self) -> &ShutdownSignal {
        &self.closed
    }

    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }

    pub(crate) fn table(&self) -> &Arc<ReferenceTable> {
        &self.table
    }
}

fn access_text(action: Action, path: &[PathKey]) -> String {
    if path.is_empty() {
        return action.as_str().to_string();
    }
    path.iter()
        .map(PathKey::display_name)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::IoRuntime;
    use crate::value::Module;

    fn transport(runtime: &IoRuntime) -> (Arc<Transport>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let table = Arc::new(ReferenceTable::new(Value::Module(Module::new("root"))));
        (Arc::new(Transport::new(tx, table, runtime.bridge())), rx)
    }

    #[test]
    fn test_request_completes_with_matching_response() {
        let runtime = IoRuntime::start().unwrap();
        let (transport, mut rx) = transport(&runtime);

        let responder = transport.clone();
        runtime.bridge().spawn(async move {
            if let Some(Message::Request(req)) = rx.recv().await {
                responder.complete(Response::new(req.id, Tag::Number, json!(42), None));
            }
        });

        let (tag, value) = transport
            .request_blocking(Action::Get, 0, vec![PathKey::from("x")], vec![], Kwargs::new())
            .unwrap();
        assert_eq!(tag, Tag::Number);
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_error_response_becomes_remote_error() {
        let runtime = IoRuntime::start().unwrap();
        let (transport, mut rx) = transport(&runtime);

        let responder = transport.clone();
        runtime.bridge().spawn(async move {
            if let Some(Message::Request(req)) = rx.recv().await {
                responder.complete(Response::error(req.id, "boom".into()));
            }
        });

        let err = transport
            .request_blocking(Action::Call, 0, vec![PathKey::from("f")], vec![], Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::RemoteError { ref message, .. } if message == "boom"));
    }

    #[test]
    fn test_close_fails_pending_and_later_requests() {
        let runtime = IoRuntime::start().unwrap();
        let (transport, _rx) = transport(&runtime);

        let closer = transport.clone();
        runtime.bridge().spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            closer.close();
        });

        let err = transport
            .request_blocking(Action::Get, 0, vec![], vec![], Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportClosed));

        let err = transport
            .request_blocking(Action::Get, 0, vec![], vec![], Kwargs::new())
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportClosed));
    }

    #[test]
    fn test_referenced_arguments_are_provisional_until_acknowledged() {
        let runtime = IoRuntime::start().unwrap();
        let (transport, mut rx) = transport(&runtime);

        let responder = transport.clone();
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        runtime.bridge().spawn(async move {
            if let Some(Message::Request(req)) = rx.recv().await {
                let _ = seen_tx.send(req.args.clone());
                responder.acknowledge(req.id, vec![(0, 100)]);
                responder.complete(Response::new(req.id, Tag::Void, Json::Null, None));
            }
        });

        let kept = Value::list(vec![]);
        let callback = Value::Module(Module::new("cb"));
        transport
            .request_blocking(
                Action::Call,
                0,
                vec![],
                vec![callback, Value::Int(1), Value::map([("a", kept)])],
                Kwargs::new(),
            )
            .unwrap();

        let args = seen_rx.recv().unwrap();
        assert_eq!(args[0]["ffid"], json!(""));
        assert_eq!(args[0]["r"], json!(0));
        assert_eq!(args[1], json!(1));
        assert_eq!(args[2], json!({"a": []}));

        let handle = args[0]["src"].as_u64().unwrap();
        assert!(transport.table().contains(handle));
    }

    #[test]
    fn test_out_of_order_responses_reach_their_callers() {
        let runtime = IoRuntime::start().unwrap();
        let (transport, mut rx) = transport(&runtime);

        // Answer each request with its own key, newest first.
        let responder = transport.clone();
        runtime.bridge().spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                match rx.recv().await {
                    Some(Message::Request(req)) => {
                        let key = req.path.first().map(PathKey::display_name).unwrap_or_default();
                        seen.push((req.id, key));
                    }
                    Some(_) => {}
                    None => return,
                }
            }
            seen.sort_unstable_by_key(|(id, _)| std::cmp::Reverse(*id));
            for (id, key) in seen {
                responder.complete(Response::new(id, Tag::String, json!(key), None));
            }
        });

        let callers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let transport = transport.clone();
                let caller = std::thread::spawn(move || {
                    transport.request_blocking(
                        Action::Get,
                        0,
                        vec![PathKey::from(name)],
                        vec![],
                        Kwargs::new(),
                    )
                });
                (name, caller)
            })
            .collect();

        for (name, caller) in callers {
            let (tag, value) = caller.join().unwrap().unwrap();
            assert_eq!(tag, Tag::String);
            assert_eq!(value, json!(name));
        }
    }

    #[test]
    fn test_access_text() {
        assert_eq!(access_text(Action::Call, &[]), "call");
        let path = vec![PathKey::from("a"), PathKey::from("~~b")];
        assert_eq!(access_text(Action::Get, &path), "a.b");
    }
}
