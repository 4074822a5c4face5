//! Client-side stand-ins for remote values.
//!
//! A [`Proxy`] names a handle in the peer's table. Attribute access, calls,
//! indexing, length and iteration become requests on the connection's
//! [`Transport`]. The synchronous methods block the calling thread (never
//! the I/O scheduler) until the response arrives; the `_async` variants
//! await it instead.
//!
//! Cloning a proxy is cheap. When the last clone of a proxy obtained from
//! the peer is dropped, a `free` notice releases the remote handle.

use crate::error::{BridgeError, Result};
use crate::ipc::protocol::{Action, Tag};
use crate::ipc::transport::Transport;
use crate::value::{Kwargs, PathKey, Value};
use serde_json::Value as Json;
use std::fmt;
use std::sync::{Arc, Weak};

pub(crate) struct RemoteHandle {
    id: u64,
    transport: Arc<Transport>,
    owned: bool,
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        if self.owned {
            self.transport.free(self.id);
        }
    }
}

/// Where a member proxy came from: a parent handle plus the path below it.
#[derive(Clone)]
struct Binding {
    parent: Arc<RemoteHandle>,
    path: Vec<PathKey>,
}

/// Proxy for a value on the other side of a connection.
#[derive(Clone)]
pub struct Proxy {
    handle: Arc<RemoteHandle>,
    binding: Option<Binding>,
    constructor: bool,
}

pub(crate) struct WeakProxy {
    handle: Weak<RemoteHandle>,
    binding: Option<Binding>,
    constructor: bool,
}

impl WeakProxy {
    pub(crate) fn upgrade(&self) -> Option<Proxy> {
        Some(Proxy {
            handle: self.handle.upgrade()?,
            binding: self.binding.clone(),
            constructor: self.constructor,
        })
    }
}

impl Proxy {
    /// Proxy for remote handle `id`. Owned proxies free it when dropped.
    pub(crate) fn new(transport: &Arc<Transport>, id: u64, owned: bool) -> Self {
        Self {
            handle: Arc::new(RemoteHandle {
                id,
                transport: transport.clone(),
                owned,
            }),
            binding: None,
            constructor: false,
        }
    }

    /// Remote handle this proxy holds.
    pub fn handle(&self) -> u64 {
        self.handle.id
    }

    /// Whether calling this proxy constructs (sends `init`).
    pub fn is_constructor(&self) -> bool {
        self.constructor
    }

    /// Member proxies built with [`Proxy::member`] hold no handle of their
    /// own; they resolve through the parent on every use.
    fn is_unfetched(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| Arc::ptr_eq(&b.parent, &self.handle))
    }

    /// Handle to put on the wire when passing this proxy back to its owner.
    pub(crate) fn wire_handle(&self) -> Option<u64> {
        (!self.is_unfetched()).then_some(self.handle.id)
    }

    pub(crate) fn belongs_to(&self, transport: &Transport) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.handle.transport), transport)
    }

    pub(crate) fn downgrade(&self) -> WeakProxy {
        WeakProxy {
            handle: Arc::downgrade(&self.handle),
            binding: self.binding.clone(),
            constructor: self.constructor,
        }
    }

    fn transport(&self) -> &Arc<Transport> {
        &self.handle.transport
    }

    /// Handle and path addressing this proxy's value, extended by `extra`.
    fn target(&self, extra: Vec<PathKey>) -> (Arc<RemoteHandle>, Vec<PathKey>) {
        match &self.binding {
            Some(binding) if self.is_unfetched() => {
                let mut path = binding.path.clone();
                path.extend(extra);
                (binding.parent.clone(), path)
            }
            _ => (self.handle.clone(), extra),
        }
    }

    /// Handle and path a call is sent to: the parent and member name when
    /// known, so the callee binds the receiver; the value itself otherwise.
    fn call_target(&self) -> (u64, Vec<PathKey>) {
        match &self.binding {
            Some(binding) => (binding.parent.id, binding.path.clone()),
            None => (self.handle.id, Vec::new()),
        }
    }

    fn request(
        &self,
        action: Action,
        handle: u64,
        path: Vec<PathKey>,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<(Tag, Json)> {
        self.transport()
            .request_blocking(action, handle, path, args, kwargs)
    }

    fn wrap(&self, tag: Tag, value: Json, binding: Option<Binding>) -> Result<Value> {
        wrap_response(self.transport(), tag, value, binding)
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    /// Read attribute `name`. Callables come back bound to this proxy.
    pub fn get(&self, name: &str) -> Result<Value> {
        let (parent, path) = self.target(vec![PathKey::from(name)]);
        let (tag, value) = self.request(Action::Get, parent.id, path.clone(), Vec::new(), Kwargs::new())?;
        self.wrap(tag, value, Some(Binding { parent, path }))
    }

    pub async fn get_async(&self, name: &str) -> Result<Value> {
        let (parent, path) = self.target(vec![PathKey::from(name)]);
        let (tag, value) = self
            .transport()
            .request(Action::Get, parent.id, path.clone(), Vec::new(), Kwargs::new())
            .await?;
        self.wrap(tag, value, Some(Binding { parent, path }))
    }

    /// Proxy for member `name` without a round trip.
    pub fn member(&self, name: &str) -> Proxy {
        let (parent, path) = self.target(vec![PathKey::from(name)]);
        Proxy {
            handle: parent.clone(),
            binding: Some(Binding { parent, path }),
            constructor: false,
        }
    }

    /// Assign attribute `name`. Always a round trip.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let (owner, path) = self.target(Vec::new());
        self.request(
            Action::Set,
            owner.id,
            path,
            vec![Value::from(name), value.into()],
            Kwargs::new(),
        )
        .map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------------

    pub fn get_item(&self, key: impl Into<PathKey>) -> Result<Value> {
        let (owner, path) = self.target(vec![key.into()]);
        let (tag, value) = self.request(Action::Get, owner.id, path, Vec::new(), Kwargs::new())?;
        self.wrap(tag, value, None)
    }

    pub fn set_item(&self, key: impl Into<PathKey>, value: impl Into<Value>) -> Result<()> {
        let key = match key.into() {
            PathKey::Index(i) => Value::Int(i),
            PathKey::Name(s) => Value::Str(s),
        };
        let (owner, path) = self.target(Vec::new());
        self.request(
            Action::Set,
            owner.id,
            path,
            vec![key, value.into(), Value::Bool(true)],
            Kwargs::new(),
        )
        .map(|_| ())
    }

    /// `key in proxy`: the key resolves to something other than None.
    pub fn contains(&self, key: impl Into<PathKey>) -> Result<bool> {
        match self.get_item(key) {
            Ok(value) => Ok(!value.is_none()),
            Err(BridgeError::RemoteError { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_with(args, Kwargs::new())
    }

    /// Call with keyword arguments. Constructor-like proxies construct.
    pub fn call_with(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let action = if self.constructor { Action::Init } else { Action::Call };
        let (handle, path) = self.call_target();
        let (tag, value) = self.request(action, handle, path, args, kwargs)?;
        self.wrap(tag, value, None)
    }

    pub async fn call_async(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let action = if self.constructor { Action::Init } else { Action::Call };
        let (handle, path) = self.call_target();
        let (tag, value) = self
            .transport()
            .request(action, handle, path, args, kwargs)
            .await?;
        self.wrap(tag, value, None)
    }

    /// Call method `name` in a single round trip.
    pub fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.member(name).call(args)
    }

    /// Explicit construction, whatever the proxy's tag was.
    pub fn construct(&self, args: Vec<Value>) -> Result<Value> {
        self.construct_with(args, Kwargs::new())
    }

    pub fn construct_with(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let (handle, path) = self.call_target();
        let (tag, value) = self.request(Action::Init, handle, path, args, kwargs)?;
        self.wrap(tag, value, None)
    }

    // ------------------------------------------------------------------------
    // Length, keys, iteration
    // ------------------------------------------------------------------------

    /// Sequence length, `None` when the remote value has none.
    pub fn len(&self) -> Result<Option<usize>> {
        let (owner, path) = self.target(Vec::new());
        let (tag, value) = self.request(Action::Length, owner.id, path, Vec::new(), Kwargs::new())?;
        match tag {
            Tag::Number => value
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| BridgeError::invalid(format!("bad length {}", value))),
            _ => Ok(None),
        }
    }

    pub fn keys(&self) -> Result<Vec<Value>> {
        let (owner, path) = self.target(Vec::new());
        let (_, value) = self.request(Action::Keys, owner.id, path, Vec::new(), Kwargs::new())?;
        match value {
            Json::Array(keys) => Ok(keys.iter().map(Value::from_json).collect()),
            Json::Null => Ok(Vec::new()),
            other => Err(BridgeError::invalid(format!("bad key list {}", other))),
        }
    }

    /// Iterate by index when the value has a length, else over its keys.
    pub fn iter(&self) -> Result<ProxyIter> {
        let cursor = match self.len()? {
            Some(len) => Cursor::Indexed { next: 0, len },
            None => Cursor::Keys(self.keys()?.into_iter()),
        };
        Ok(ProxyIter {
            proxy: self.clone(),
            cursor,
        })
    }

    // ------------------------------------------------------------------------
    // Text and materialization
    // ------------------------------------------------------------------------

    /// Human-facing text of the remote value.
    pub fn inspect(&self) -> Result<String> {
        self.inspect_as("str")
    }

    /// Developer representation of the remote value.
    pub fn repr(&self) -> Result<String> {
        self.inspect_as("repr")
    }

    fn inspect_as(&self, flavor: &str) -> Result<String> {
        let (owner, path) = self.target(Vec::new());
        let (_, value) = self.request(
            Action::Inspect,
            owner.id,
            path,
            vec![Value::from(flavor)],
            Kwargs::new(),
        )?;
        match value {
            Json::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    /// Plain structural copy of the remote value.
    pub fn value(&self) -> Result<Json> {
        let (owner, path) = self.target(Vec::new());
        let (_, value) = self.request(Action::Value, owner.id, path, Vec::new(), Kwargs::new())?;
        Ok(value)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inspect() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding {
            Some(binding) if self.is_unfetched() => {
                let path: Vec<String> = binding.path.iter().map(PathKey::as_name).collect();
                write!(f, "<remote #{}.{}>", binding.parent.id, path.join("."))
            }
            _ => write!(f, "<remote #{}>", self.handle.id),
        }
    }
}

enum Cursor {
    Indexed { next: usize, len: usize },
    Keys(std::vec::IntoIter<Value>),
}

/// Iterator over a remote value. Each indexed step is a round trip.
pub struct ProxyIter {
    proxy: Proxy,
    cursor: Cursor,
}

impl Iterator for ProxyIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.cursor {
            Cursor::Indexed { next, len } => {
                if *next >= *len {
                    return None;
                }
                let index = *next;
                *next += 1;
                Some(self.proxy.get_item(index))
            }
            Cursor::Keys(keys) => keys.next().map(Ok),
        }
    }
}

fn handle_of(value: &Json) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| BridgeError::invalid(format!("expected a handle, got {}", value)))
}

/// Turn a tagged response value into a local value.
pub(crate) fn from_response(transport: &Arc<Transport>, tag: Tag, value: Json) -> Result<Value> {
    wrap_response(transport, tag, value, None)
}

fn wrap_response(
    transport: &Arc<Transport>,
    tag: Tag,
    value: Json,
    binding: Option<Binding>,
) -> Result<Value> {
    let proxy = |id: u64| Proxy::new(transport, id, true);
    Ok(match tag {
        Tag::String | Tag::Number | Tag::Void | Tag::Serialized => Value::from_json(&value),
        Tag::Fn => {
            let mut fetched = proxy(handle_of(&value)?);
            fetched.binding = binding;
            Value::Remote(fetched)
        }
        Tag::Class => {
            let mut class = proxy(handle_of(&value)?);
            class.constructor = true;
            Value::Remote(class)
        }
        Tag::Obj | Tag::List => Value::Remote(proxy(handle_of(&value)?)),
        Tag::Inst => match &value {
            Json::Array(handles) => Value::list(
                handles
                    .iter()
                    .map(|h| handle_of(h).map(|id| Value::Remote(proxy(id))))
                    .collect::<Result<Vec<_>>>()?,
            ),
            single => Value::Remote(proxy(handle_of(single)?)),
        },
        Tag::Error => {
            return Err(BridgeError::RemoteError {
                access: String::new(),
                message: value.to_string(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointOptions;
    use crate::endpoint::Endpoint;
    use crate::namespace::Namespace;
    use crate::runtime::IoRuntime;
    use crate::value::{Function, Module};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn connect(runtime: &IoRuntime, served: Namespace) -> (Endpoint, Endpoint) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let bridge = runtime.bridge();
        (
            Endpoint::attach(&bridge, a, served, EndpointOptions::new()),
            Endpoint::attach(&bridge, b, Namespace::new(), EndpointOptions::new()),
        )
    }

    fn served() -> Namespace {
        Namespace::new()
            .with_value("items", Value::list(vec![10.into(), 20.into(), 30.into()]))
            .with_value("config", Value::map([("name", "demo"), ("mode", "fast")]))
            .with_module(Module::new("tools").function("map", |args, _| {
                let f = args.first().cloned().unwrap_or(Value::None);
                let items = args.get(1).map(Value::items).transpose()?.unwrap_or_default();
                let mapped = items
                    .into_iter()
                    .map(|item| f.call(vec![item], Kwargs::new()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::list(mapped))
            }))
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_iteration_length_and_contains() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = connect(&runtime, served());

        let items = client.root().get("items").unwrap();
        let items = items.as_proxy().unwrap();
        assert_eq!(items.len().unwrap(), Some(3));
        let collected: Vec<i64> = items
            .iter()
            .unwrap()
            .map(|item| item.unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(collected, vec![10, 20, 30]);
        assert_eq!(items.get_item(-1i64).unwrap().as_i64(), Some(30));

        let config = client.root().get("config").unwrap();
        let config = config.as_proxy().unwrap();
        assert_eq!(config.len().unwrap(), None);
        let keys: Vec<String> = config.iter().unwrap().map(|k| k.unwrap().display()).collect();
        assert_eq!(keys, vec!["name", "mode"]);
        assert!(config.contains("name").unwrap());
        assert!(!config.contains("missing").unwrap());
    }

    #[test]
    fn test_set_and_value() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = connect(&runtime, served());

        let config = client.root().get("config").unwrap();
        let config = config.as_proxy().unwrap();
        config.set_item("mode", "slow").unwrap();
        config.set("extra", 1).unwrap();
        assert_eq!(
            config.value().unwrap(),
            json!({"name": "demo", "mode": "slow", "extra": 1})
        );
        assert_eq!(config.value().unwrap(), config.value().unwrap());
    }

    #[test]
    fn test_callback_runs_while_caller_waits() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = connect(&runtime, served());

        let double = Function::new("double", |args, _| {
            Ok(Value::Int(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
        });
        let tools = client.import("tools").unwrap();
        let mapped = tools
            .call_method(
                "map",
                vec![Value::Function(double), Value::list(vec![1.into(), 2.into(), 3.into()])],
            )
            .unwrap();
        assert_eq!(mapped.as_proxy().unwrap().value().unwrap(), json!([2, 4, 6]));
    }

    #[test]
    fn test_member_has_no_handle_of_its_own() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = connect(&runtime, served());

        let member = client.root().member("items");
        assert_eq!(format!("{:?}", member), "<remote #0.items>");
        assert_eq!(member.wire_handle(), None);
        assert_eq!(member.len().unwrap(), Some(3));
    }

    #[test]
    fn test_inspect_and_display() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = connect(&runtime, served());

        let items = client.root().get("items").unwrap();
        let items = items.as_proxy().unwrap();
        assert_eq!(items.inspect().unwrap(), "[10, 20, 30]");
        assert_eq!(items.to_string(), "[10, 20, 30]");
        assert!(format!("{:?}", items).starts_with("<remote #"));
    }

    #[test]
    fn test_dropping_last_proxy_frees_remote_handle() {
        let runtime = IoRuntime::start().unwrap();
        let (server, client) = connect(&runtime, served());

        let items = client.root().get("items").unwrap();
        let handle = items.as_proxy().unwrap().handle();
        assert!(server.table().contains(handle));

        let copy = items.clone();
        drop(items);
        assert!(server.table().contains(handle));
        drop(copy);
        assert!(wait_until(|| !server.table().contains(handle)));
    }

    #[test]
    fn test_missing_property_reports_access_path() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = connect(&runtime, served());

        match client.root().get("nothing") {
            Err(BridgeError::RemoteError { access, message }) => {
                assert_eq!(access, "nothing");
                assert!(message.starts_with("Property 'nothing' does not exist on"));
            }
            other => panic!("unexpected {:?}", other.map(|v| v.repr())),
        }
    }
}
