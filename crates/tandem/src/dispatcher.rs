//! Inbound request handling.
//!
//! Every request the peer sends is decoded, resolved against this
//! endpoint's reference table and answered with a classified result. The
//! reader loop spawns one task per request, so a request that calls back
//! into the peer never holds up the responses that call is waiting for.
//!
//! Action bodies run host code (functions, class constructors, user
//! objects) which may itself block on proxy calls. They therefore run on
//! the runtime's blocking pool; only settling an async function's result
//! happens on the I/O thread.

use crate::class_bridge::{define_class, BaseSpec};
use crate::classify::{classify, Classified, DisplayMode};
use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::ipc::protocol::{Action, Message, Request, Response, Tag};
use crate::ipc::transport::Transport;
use crate::proxy::Proxy;
use crate::resolver::{resolve, ResolveMode};
use crate::table::ReferenceTable;
use crate::value::{Kwargs, Map, PathKey, Value};
use async_trait::async_trait;
use serde_json::{json, Value as Json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves requests arriving on a connection.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Handle one request and produce its response. Never fails; errors
    /// travel back as `error` responses.
    async fn dispatch(&self, request: Request) -> Response;

    /// The peer released these handles.
    fn release(&self, handles: &[u64]);
}

/// Default dispatcher over a reference table.
pub struct Dispatcher {
    transport: Arc<Transport>,
    display: DisplayMode,
}

impl Dispatcher {
    pub fn new(transport: Arc<Transport>, display: DisplayMode) -> Self {
        Self { transport, display }
    }

    fn table(&self) -> &Arc<ReferenceTable> {
        self.transport.table()
    }

    async fn handle(&self, request: Request) -> Result<Classified> {
        let Request {
            id,
            action,
            handle,
            path,
            args,
            kwargs,
        } = request;

        let mut created = Vec::new();
        let args = args
            .iter()
            .map(|arg| self.decode(arg, &mut created, 0))
            .collect::<Result<Vec<_>>>()?;
        let mut decoded_kwargs = Kwargs::new();
        for (key, value) in kwargs.iter() {
            decoded_kwargs.insert(key.clone(), self.decode(value, &mut created, 0)?);
        }
        // Must reach the peer before the response does.
        if !created.is_empty() {
            self.transport.send(Message::Pre {
                id,
                handles: created,
            })?;
        }

        let target = self.table().get(handle)?;
        let table = self.table().clone();
        let display = self.display.is_active();

        match action {
            Action::Get => {
                blocking(move || {
                    let value = resolve(target, &path, ResolveMode::PlainGet)?;
                    Ok(classify(value, false, &table, display))
                })
                .await
            }
            Action::Call => self.invoke(target, path, args, decoded_kwargs, false).await,
            Action::Init => self.invoke(target, path, args, decoded_kwargs, true).await,
            Action::Set => {
                blocking(move || assign(target, &path, args)).await?;
                Ok(Classified::void())
            }
            Action::Length => {
                let length =
                    blocking(move || resolve(target, &path, ResolveMode::PlainGet)?.length()).await?;
                Ok(match length {
                    Some(n) => Classified::inline(Tag::Number, Json::from(n)),
                    None => Classified::void(),
                })
            }
            Action::Inspect => {
                let repr = matches!(args.first().and_then(Value::as_str), Some("repr"));
                let text = blocking(move || {
                    let value = resolve(target, &path, ResolveMode::PlainGet)?;
                    Ok(if repr { value.repr() } else { value.display() })
                })
                .await?;
                Ok(Classified::inline(Tag::String, Json::String(text)))
            }
            Action::Value => {
                let json =
                    blocking(move || resolve(target, &path, ResolveMode::PlainGet)?.to_json()).await?;
                Ok(Classified::inline(Tag::Serialized, json))
            }
            Action::Keys => {
                let keys = blocking(move || {
                    let value = resolve(target, &path, ResolveMode::PlainGet)?;
                    value
                        .keys()?
                        .iter()
                        .map(Value::to_json)
                        .collect::<Result<Vec<_>>>()
                })
                .await?;
                Ok(Classified::inline(Tag::Serialized, Json::Array(keys)))
            }
            Action::MakeClass => blocking(move || make_class(args, &table)).await,
            Action::Free => Err(BridgeError::invalid("'free' is a notice, not a request")),
        }
    }

    async fn invoke(
        &self,
        target: Value,
        path: Vec<PathKey>,
        args: Vec<Value>,
        kwargs: Kwargs,
        construct: bool,
    ) -> Result<Classified> {
        let access = access_text(&path);
        let (value, invoked_class) = blocking(move || {
            let callee = resolve(target, &path, ResolveMode::Invoke)?;
            let invoked_class = matches!(callee, Value::Class(_));
            let value = callee
                .call(args, kwargs)
                .map_err(|err| invocation_failure(&access, err))?;
            Ok((value, invoked_class))
        })
        .await?;

        let value = match value {
            Value::Deferred(deferred) => deferred.settle().await?,
            other => other,
        };

        let table = self.table().clone();
        let display = self.display.is_active();
        let mut classified =
            blocking(move || Ok(classify(value, invoked_class || construct, &table, display))).await?;
        if construct && classified.tag.is_reference() {
            classified.tag = Tag::Inst;
        }
        Ok(classified)
    }

    /// Decode one argument, turning reference markers into values.
    ///
    /// Values created for create-reference markers are registered weakly
    /// under fresh handles and reported in `created` as (token, handle).
    fn decode(&self, json: &Json, created: &mut Vec<(u64, u64)>, depth: usize) -> Result<Value> {
        if depth > ProtocolConfig::MAX_VALUE_DEPTH {
            return Err(BridgeError::TypeError(format!(
                "argument nesting exceeds maximum depth of {}",
                ProtocolConfig::MAX_VALUE_DEPTH
            )));
        }
        match json {
            Json::Object(entries) => match entries.get("ffid") {
                Some(Json::Number(n)) => {
                    let handle = n
                        .as_u64()
                        .ok_or_else(|| BridgeError::invalid(format!("bad handle {}", n)))?;
                    self.table().get(handle)
                }
                Some(Json::String(_)) => {
                    let token = entries
                        .get("r")
                        .and_then(Json::as_u64)
                        .ok_or_else(|| BridgeError::invalid("reference marker without 'r'"))?;
                    let value = if let Some(handle) = entries.get("extend").and_then(Json::as_u64) {
                        self.table().get(handle)?
                    } else if let Some(handle) = entries.get("src").and_then(Json::as_u64) {
                        Value::Remote(Proxy::new(&self.transport, handle, true))
                    } else {
                        return Err(BridgeError::invalid(
                            "reference marker needs 'src' or 'extend'",
                        ));
                    };
                    let handle = self.table().reserve();
                    self.table().retain_weak(handle, &value);
                    created.push((token, handle));
                    Ok(value)
                }
                _ => {
                    let map = Map::default();
                    for (key, item) in entries {
                        map.insert(key.clone(), self.decode(item, created, depth + 1)?);
                    }
                    Ok(Value::Map(map))
                }
            },
            Json::Array(items) => Ok(Value::list(
                items
                    .iter()
                    .map(|item| self.decode(item, created, depth + 1))
                    .collect::<Result<Vec<_>>>()?,
            )),
            other => Ok(Value::from_json(other)),
        }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, request: Request) -> Response {
        let id = request.id;
        let action = request.action;
        let handle = request.handle;
        let path = request.path.clone();
        debug!("<- #{} {} ffid={} key={:?}", id, action.as_str(), handle, path);

        match self.handle(request).await {
            Ok(classified) => Response::new(id, classified.tag, classified.value, classified.signature),
            Err(err) => {
                warn!("{} on ffid {} failed: {}", action.as_str(), handle, err);
                Response::error(id, failure_text(&err, action, handle, &path))
            }
        }
    }

    fn release(&self, handles: &[u64]) {
        debug!("<- free {:?}", handles);
        for handle in handles {
            self.table().free(*handle);
        }
    }
}

/// Run an action body on the blocking pool.
async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(BridgeError::Shutdown),
        Err(e) => Err(BridgeError::Other(format!("action panicked: {}", e))),
    }
}

/// Connection failures pass through untouched; anything else a callee
/// raised is reported as a failed call of `access`.
fn invocation_failure(access: &str, err: BridgeError) -> BridgeError {
    if err.is_connection_fatal() || matches!(err, BridgeError::SchedulerReentry) {
        return err;
    }
    BridgeError::ConstructionFailure {
        target: access.to_string(),
        message: err.to_string(),
    }
}

/// Assignment for `set`: args are `[key, value, item?]`.
///
/// Integer keys and keys on containers (or with the item flag) assign an
/// item; anything else assigns an attribute.
fn assign(target: Value, path: &[PathKey], args: Vec<Value>) -> Result<()> {
    let mut args = args.into_iter();
    let key = args
        .next()
        .ok_or_else(|| BridgeError::TypeError("set requires a key".into()))?;
    let value = args.next().unwrap_or(Value::None);
    let item = args.next().is_some_and(|flag| flag.is_truthy());

    let owner = resolve(target, path, ResolveMode::PlainGet)?;
    match key {
        Value::Int(index) => owner.set_item(&PathKey::Index(index), value),
        Value::Str(name) if item || owner.is_container() => owner.set_item(&PathKey::Name(name), value),
        Value::Str(name) => owner.set_attr(&name, value),
        other => Err(BridgeError::TypeError(format!(
            "keys must be str or int, not {}",
            other.type_name()
        ))),
    }
}

/// `makeClass`: args are `[name, delegate, bases, overridden]`.
///
/// Each base is a class, or `[class, args?, kwargs?]`. Answers with the
/// handles of the new class and of its single instance.
fn make_class(args: Vec<Value>, table: &ReferenceTable) -> Result<Classified> {
    let mut args = args.into_iter();
    let name = match args.next() {
        Some(Value::Str(name)) => name,
        _ => return Err(BridgeError::TypeError("makeClass requires a class name".into())),
    };
    let delegate = args.next().unwrap_or(Value::None);
    let bases = match args.next() {
        Some(Value::List(list)) => list
            .snapshot()
            .into_iter()
            .map(|base| base_spec(base, table))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::None) | None => Vec::new(),
        Some(other) => vec![base_spec(other, table)?],
    };
    let overridden = match args.next() {
        Some(Value::List(list)) => list
            .snapshot()
            .iter()
            .filter_map(|name| name.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    let instance = define_class(&name, delegate, bases, overridden)?;
    let class_handle = table.allocate(Value::Class(instance.class().clone()));
    let instance_handle = table.allocate(Value::Instance(instance));
    debug!("Defined bridged class '{}' as #{}", name, class_handle);
    Ok(Classified::inline(Tag::Inst, json!([class_handle, instance_handle])))
}

fn base_spec(base: Value, table: &ReferenceTable) -> Result<BaseSpec> {
    let class_of = |value: Value| match value {
        Value::Class(class) => Ok(class),
        Value::Int(handle) if handle >= 0 => match table.get(handle as u64)? {
            Value::Class(class) => Ok(class),
            other => Err(BridgeError::TypeError(format!(
                "base #{} is {}, not a class",
                handle,
                other.type_name()
            ))),
        },
        other => Err(BridgeError::TypeError(format!(
            "bases must be classes, not {}",
            other.type_name()
        ))),
    };

    match base {
        Value::List(parts) => {
            let mut parts = parts.snapshot().into_iter();
            let class = class_of(parts.next().unwrap_or(Value::None))?;
            let args = match parts.next() {
                Some(Value::List(args)) => args.snapshot(),
                _ => Vec::new(),
            };
            let kwargs = match parts.next() {
                Some(Value::Map(kwargs)) => kwargs.snapshot(),
                _ => Kwargs::new(),
            };
            Ok(BaseSpec {
                class,
                args,
                kwargs,
            })
        }
        other => Ok(BaseSpec::new(class_of(other)?)),
    }
}

fn access_text(path: &[PathKey]) -> String {
    if path.is_empty() {
        return "<target>".to_string();
    }
    path.iter()
        .map(PathKey::display_name)
        .collect::<Vec<_>>()
        .join(".")
}

/// Error text sent to the peer: the message, its causes, then where it
/// happened.
fn failure_text(err: &BridgeError, action: Action, handle: u64, path: &[PathKey]) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(&format!("\ncaused by: {}", cause));
        source = std::error::Error::source(cause);
    }
    let key = path
        .iter()
        .map(PathKey::display_name)
        .collect::<Vec<_>>()
        .join(".");
    text.push_str(&format!(
        "\n  at {} {} (ffid {}, key '{}')",
        err.kind(),
        action.as_str(),
        handle,
        key
    ));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::IoRuntime;
    use crate::value::{Class, Function, Module};
    use tokio::sync::mpsc;

    struct Harness {
        _runtime: IoRuntime,
        dispatcher: Arc<Dispatcher>,
        outbound: mpsc::UnboundedReceiver<Message>,
        bridge: crate::runtime::SyncBridge,
    }

    fn harness(root: Module) -> Harness {
        let runtime = IoRuntime::start().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let table = Arc::new(ReferenceTable::new(Value::Module(root)));
        let transport = Arc::new(Transport::new(tx, table, runtime.bridge()));
        Harness {
            bridge: runtime.bridge(),
            _runtime: runtime,
            dispatcher: Arc::new(Dispatcher::new(transport, DisplayMode::new(false))),
            outbound: rx,
        }
    }

    impl Harness {
        fn run(&self, action: Action, handle: u64, path: &[&str], args: Vec<Json>) -> Response {
            let dispatcher = self.dispatcher.clone();
            let request = Request {
                id: 1,
                action,
                handle,
                path: path.iter().map(|k| PathKey::from(*k)).collect(),
                args,
                kwargs: serde_json::Map::new(),
            };
            self.bridge
                .block_on(async move { Ok(dispatcher.dispatch(request).await) })
                .unwrap()
        }
    }

    fn root() -> Module {
        Module::new("root")
            .with("config", Value::map([("keys", Value::from("k")), ("n", Value::from(1))]))
            .function("double", |args, _| {
                Ok(Value::Int(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
            })
            .with(
                "Point",
                Class::new("Point").method("__init__", |this, args, _| {
                    this.set_attr("x", args.first().cloned().unwrap_or(Value::None))?;
                    Ok(Value::None)
                }),
            )
    }

    #[test]
    fn test_get_and_call() {
        let h = harness(root());
        let resp = h.run(Action::Get, 0, &["config", "n"], vec![]);
        assert_eq!((resp.tag, resp.value), (Tag::Number, json!(1)));

        let resp = h.run(Action::Call, 0, &["double"], vec![json!(21)]);
        assert_eq!((resp.tag, resp.value), (Tag::Number, json!(42)));
    }

    #[test]
    fn test_missing_key_error_text() {
        let h = harness(root());
        let resp = h.run(Action::Get, 0, &["nope"], vec![]);
        assert_eq!(resp.tag, Tag::Error);
        let text = resp.error.unwrap();
        assert!(text.starts_with("Property 'nope' does not exist on"), "{}", text);
        assert!(text.ends_with("at PropertyNotFound get (ffid 0, key 'nope')"), "{}", text);
    }

    #[test]
    fn test_init_returns_instance_tag() {
        let h = harness(root());
        let resp = h.run(Action::Init, 0, &["Point"], vec![json!(3)]);
        assert_eq!(resp.tag, Tag::Inst);
        let handle = resp.value.as_u64().unwrap();

        let resp = h.run(Action::Get, handle, &["x"], vec![]);
        assert_eq!(resp.value, json!(3));
    }

    #[test]
    fn test_set_rules() {
        let h = harness(root());
        h.run(Action::Set, 0, &["config"], vec![json!("added"), json!(5)]);
        let resp = h.run(Action::Value, 0, &["config"], vec![]);
        assert_eq!(resp.value["added"], json!(5));

        h.run(Action::Set, 0, &[], vec![json!("flag"), json!(true)]);
        let resp = h.run(Action::Get, 0, &["flag"], vec![]);
        assert_eq!(resp.value, json!(true));
    }

    #[test]
    fn test_plain_get_prefers_items_on_containers() {
        let h = harness(root());
        let resp = h.run(Action::Value, 0, &["config", "keys"], vec![]);
        assert_eq!((resp.tag, resp.value), (Tag::Serialized, json!("k")));

        let resp = h.run(Action::Get, 0, &["config", "keys"], vec![]);
        assert_eq!((resp.tag, resp.value), (Tag::String, json!("k")));

        // Calls still see the mapping method.
        let resp = h.run(Action::Call, 0, &["config", "keys"], vec![]);
        assert_eq!(resp.tag, Tag::List);

        let resp = h.run(Action::Keys, 0, &["config"], vec![]);
        assert_eq!(resp.value, json!(["keys", "n"]));

        let resp = h.run(Action::Length, 0, &["config"], vec![]);
        assert_eq!(resp.tag, Tag::Void);
    }

    #[test]
    fn test_value_is_idempotent() {
        let h = harness(root());
        let first = h.run(Action::Value, 0, &["config"], vec![]);
        let second = h.run(Action::Value, 0, &["config"], vec![]);
        assert_eq!(first.value, second.value);
    }

    #[test]
    fn test_create_reference_marker_sends_pre() {
        let mut h = harness(root());
        let marker = json!({"ffid": "", "r": 0, "src": 17});
        let resp = h.run(Action::Call, 0, &["repr"], vec![marker]);
        // `repr` is not on this root; the call fails but the marker was decoded.
        assert_eq!(resp.tag, Tag::Error);

        match h.outbound.try_recv() {
            Ok(Message::Pre { id, handles }) => {
                assert_eq!(id, 1);
                assert_eq!(handles.len(), 1);
                assert_eq!(handles[0].0, 0);
            }
            other => panic!("expected pre notice, got {:?}", other),
        }
    }

    #[test]
    fn test_freed_handle_is_not_found() {
        let h = harness(root());
        let resp = h.run(Action::Get, 0, &["double"], vec![]);
        assert_eq!(resp.tag, Tag::Fn);
        let handle = resp.value.as_u64().unwrap();

        h.dispatcher.release(&[handle]);
        let resp = h.run(Action::Call, handle, &[], vec![json!(1)]);
        assert_eq!(resp.tag, Tag::Error);
        assert!(resp.error.unwrap().contains(&format!("Handle not found: {}", handle)));
        assert!(!h.dispatcher.table().contains(handle));
    }

    #[test]
    fn test_async_function_result_is_settled() {
        let root = Module::new("root").with(
            "later",
            Function::new_async("later", |_, _| async { Ok(Value::from("done")) }),
        );
        let h = harness(root);
        let resp = h.run(Action::Call, 0, &["later"], vec![]);
        assert_eq!((resp.tag, resp.value), (Tag::String, json!("done")));
    }

    #[test]
    fn test_make_class() {
        let animal = Class::new("Animal").method("walk", |_, _, _| Ok(Value::from("walks")));
        let h = harness(Module::new("root"));
        let base = h.dispatcher.table().allocate(Value::Class(animal));

        let resp = h.run(
            Action::MakeClass,
            0,
            &[],
            vec![json!("Dog"), json!(null), json!([[base, [], {}]]), json!([])],
        );
        assert_eq!(resp.tag, Tag::Inst);
        let instance = resp.value[1].as_u64().unwrap();
        let resp = h.run(Action::Call, instance, &["walk"], vec![]);
        assert_eq!(resp.value, json!("walks"));
    }

    #[test]
    fn test_assign_rejects_bad_key() {
        let err = assign(Value::map([("a", 1)]), &[], vec![Value::Float(1.5), Value::None]).unwrap_err();
        assert!(matches!(err, BridgeError::TypeError(_)));
    }
}
