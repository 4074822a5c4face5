//! Host value model.
//!
//! Rust has no ambient object model, so the bridge carries its own: a closed
//! [`Value`] enum covering scalars, shared containers, callables, classes and
//! instances, modules, opaque host objects, deferred (async) results and
//! proxies for values living on the other side of a connection.
//!
//! Containers and objects are reference types: cloning a `Value` clones a
//! handle to the same underlying storage, the way two names can refer to
//! one object in a dynamic language.

mod builtins;
mod class;

pub use class::{Class, Instance};

use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::proxy::{Proxy, WeakProxy};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Keyword arguments, in call order.
pub type Kwargs = IndexMap<String, Value>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Path keys
// ============================================================================

/// One segment of an access path: an attribute/key name or an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(i64),
    Name(String),
}

impl PathKey {
    /// The segment as an attribute name.
    pub fn as_name(&self) -> String {
        match self {
            PathKey::Index(i) => i.to_string(),
            PathKey::Name(s) => s.clone(),
        }
    }

    /// The segment with the class bridge bypass prefix removed.
    pub fn display_name(&self) -> String {
        let name = self.as_name();
        match name.strip_prefix(ProtocolConfig::BYPASS_PREFIX) {
            Some(stripped) => stripped.to_string(),
            None => name,
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Index(i) => write!(f, "{}", i),
            PathKey::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for PathKey {
    fn from(s: &str) -> Self {
        PathKey::Name(s.to_string())
    }
}

impl From<String> for PathKey {
    fn from(s: String) -> Self {
        PathKey::Name(s)
    }
}

impl From<i64> for PathKey {
    fn from(i: i64) -> Self {
        PathKey::Index(i)
    }
}

impl From<usize> for PathKey {
    fn from(i: usize) -> Self {
        PathKey::Index(i as i64)
    }
}

// ============================================================================
// Containers
// ============================================================================

/// Shared, mutable list.
#[derive(Clone, Default)]
pub struct List(Arc<RwLock<Vec<Value>>>);

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    /// Get an item; negative indices count from the end.
    pub fn get(&self, index: i64) -> Option<Value> {
        let items = read(&self.0);
        let index = normalize_index(index, items.len())?;
        items.get(index).cloned()
    }

    /// Replace an item; negative indices count from the end.
    pub fn set(&self, index: i64, value: Value) -> Result<()> {
        let mut items = write(&self.0);
        let len = items.len();
        match normalize_index(index, len) {
            Some(i) if i < len => {
                items[i] = value;
                Ok(())
            }
            _ => Err(BridgeError::TypeError(
                "list assignment index out of range".into(),
            )),
        }
    }

    pub fn push(&self, value: Value) {
        write(&self.0).push(value);
    }

    /// Copy of the current items.
    pub fn snapshot(&self) -> Vec<Value> {
        read(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn inner(&self) -> &RwLock<Vec<Value>> {
        &self.0
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    if index < 0 || index >= len {
        None
    } else {
        Some(index as usize)
    }
}

/// Shared, mutable string-keyed mapping that keeps insertion order.
#[derive(Clone, Default)]
pub struct Map(Arc<RwLock<IndexMap<String, Value>>>);

impl Map {
    pub fn new(entries: IndexMap<String, Value>) -> Self {
        Self(Arc::new(RwLock::new(entries)))
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.0).get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        write(&self.0).insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        write(&self.0).shift_remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        read(&self.0).keys().cloned().collect()
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        read(&self.0).clone()
    }

    pub fn ptr_eq(&self, other: &Map) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn inner(&self) -> &RwLock<IndexMap<String, Value>> {
        &self.0
    }
}

// ============================================================================
// Callables, modules, host objects, deferred results
// ============================================================================

type NativeFn = dyn Fn(Vec<Value>, Kwargs) -> Result<Value> + Send + Sync;

pub(crate) struct FunctionInner {
    name: String,
    bound: bool,
    call: Box<NativeFn>,
}

/// A native callable.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    /// Wrap a closure as a callable value.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner {
                name: name.into(),
                bound: false,
                call: Box::new(f),
            }),
        }
    }

    /// Wrap an async closure. Calling it returns a [`Value::Deferred`]; the
    /// dispatcher awaits it before classifying the result.
    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(name, move |args, kwargs| {
            Ok(Value::Deferred(Deferred::new(f(args, kwargs))))
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound
    }

    pub fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        (self.inner.call)(args, kwargs)
    }

    /// Bind a receiver as the first positional argument.
    pub fn bind(&self, receiver: Value, owner: &str) -> Function {
        let target = self.clone();
        Self {
            inner: Arc::new(FunctionInner {
                name: format!("{}.{}", owner, self.inner.name),
                bound: true,
                call: Box::new(move |mut args, kwargs| {
                    args.insert(0, receiver.clone());
                    target.call(args, kwargs)
                }),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

pub(crate) struct ModuleInner {
    name: String,
    members: RwLock<IndexMap<String, Value>>,
}

/// A named namespace of members.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                name: name.into(),
                members: RwLock::new(IndexMap::new()),
            }),
        }
    }

    /// Add a member and return the module.
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Add a native function member and return the module.
    pub fn function<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        let function = Function::new(name, f);
        self.with(name, function)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        read(&self.inner.members).get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        write(&self.inner.members).insert(name.into(), value.into());
    }

    pub fn names(&self) -> Vec<String> {
        read(&self.inner.members).keys().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Extension point for embedder-defined values.
///
/// Every method has a default, so an implementation only overrides the
/// protocols its object supports.
pub trait HostObject: Send + Sync {
    fn type_name(&self) -> &str;

    fn get_attr(&self, _name: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    fn set_attr(&self, name: &str, _value: Value) -> Result<()> {
        Err(BridgeError::TypeError(format!(
            "'{}' object attribute '{}' is read-only",
            self.type_name(),
            name
        )))
    }

    /// Index/key lookup. `None` when absent or unsupported.
    fn get_item(&self, _key: &PathKey) -> Result<Option<Value>> {
        Ok(None)
    }

    fn set_item(&self, _key: &PathKey, _value: Value) -> Result<()> {
        Err(BridgeError::TypeError(format!(
            "'{}' object does not support item assignment",
            self.type_name()
        )))
    }

    fn is_callable(&self) -> bool {
        false
    }

    fn call(&self, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value> {
        Err(BridgeError::TypeError(format!(
            "'{}' object is not callable",
            self.type_name()
        )))
    }

    fn len(&self) -> Option<usize> {
        None
    }

    fn keys(&self) -> Vec<Value> {
        Vec::new()
    }

    fn repr(&self) -> String {
        format!("<{} object>", self.type_name())
    }
}

/// A pending async result produced by an async [`Function`].
#[derive(Clone)]
pub struct Deferred {
    future: Arc<Mutex<Option<BoxFuture<'static, Result<Value>>>>>,
}

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            future: Arc::new(Mutex::new(Some(Box::pin(future)))),
        }
    }

    /// Await the result. A deferred value can be settled once.
    pub async fn settle(self) -> Result<Value> {
        let future = lock(&self.future).take();
        match future {
            Some(future) => future.await,
            None => Err(BridgeError::TypeError(
                "deferred value was already awaited".into(),
            )),
        }
    }
}

// ============================================================================
// Value
// ============================================================================

/// A host value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(List),
    Map(Map),
    Function(Function),
    Class(Class),
    Instance(Instance),
    Module(Module),
    Object(Arc<dyn HostObject>),
    Deferred(Deferred),
    Remote(Proxy),
}

impl Value {
    /// Wrap an embedder-defined object.
    pub fn object<T: HostObject + 'static>(object: T) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(List::new(items))
    }

    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(Map::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Map(_) => "dict".into(),
            Value::Function(_) => "function".into(),
            Value::Class(_) => "type".into(),
            Value::Instance(inst) => inst.class().name().to_string(),
            Value::Module(_) => "module".into(),
            Value::Object(obj) => obj.type_name().to_string(),
            Value::Deferred(_) => "deferred".into(),
            Value::Remote(_) => "proxy".into(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(list) => !list.is_empty(),
            Value::Map(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Lists and mappings.
    pub fn is_container(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }

    pub fn is_callable(&self) -> bool {
        match self {
            Value::Function(_) | Value::Class(_) | Value::Remote(_) => true,
            Value::Instance(inst) => inst.class().lookup("__call__").is_some(),
            Value::Object(obj) => obj.is_callable(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Value::Remote(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Class> {
        match self {
            Value::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Instance(inst) => Some(inst),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Attribute protocol
    // ------------------------------------------------------------------------

    /// Attribute lookup. `Ok(None)` when the attribute does not exist.
    ///
    /// Proxies turn this into a round trip.
    pub fn get_attr(&self, name: &str) -> Result<Option<Value>> {
        match self {
            Value::List(list) => Ok(builtins::list_method(list, name)),
            Value::Map(map) => Ok(builtins::map_method(map, name)),
            Value::Function(f) => Ok(match name {
                "__name__" => Some(Value::Str(f.name().to_string())),
                _ => None,
            }),
            Value::Class(class) => Ok(match name {
                "__name__" => Some(Value::Str(class.name().to_string())),
                _ => class.lookup(name),
            }),
            Value::Instance(inst) => inst.get_attr(name),
            Value::Module(module) => Ok(match name {
                "__name__" => Some(Value::Str(module.name().to_string())),
                _ => module.get(name),
            }),
            Value::Object(obj) => obj.get_attr(name),
            Value::Remote(proxy) => proxy.get(name).map(Some),
            _ => Ok(None),
        }
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<()> {
        match self {
            Value::Instance(inst) => {
                inst.set_attr(name, value);
                Ok(())
            }
            Value::Class(class) => {
                class.set_member(name, value);
                Ok(())
            }
            Value::Module(module) => {
                module.set(name, value);
                Ok(())
            }
            Value::Object(obj) => obj.set_attr(name, value),
            Value::Remote(proxy) => proxy.set(name, value),
            other => Err(BridgeError::TypeError(format!(
                "'{}' object has no writable attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Item protocol
    // ------------------------------------------------------------------------

    /// Index/key lookup. `Ok(None)` when the key is absent or the value is
    /// not subscriptable.
    pub fn get_item(&self, key: &PathKey) -> Result<Option<Value>> {
        match (self, key) {
            (Value::List(list), PathKey::Index(i)) => Ok(list.get(*i)),
            (Value::List(_), PathKey::Name(_)) => Ok(None),
            (Value::Map(map), key) => Ok(map.get(&key.as_name())),
            (Value::Str(s), PathKey::Index(i)) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(normalize_index(*i, chars.len()).map(|i| Value::Str(chars[i].to_string())))
            }
            (Value::Instance(inst), key) => match inst.get_local("__getitem__") {
                Some(getter) => getter.call(vec![key_value(key)], Kwargs::new()).map(Some),
                None => Ok(None),
            },
            (Value::Object(obj), key) => obj.get_item(key),
            (Value::Remote(proxy), key) => proxy.get_item(key.clone()).map(Some),
            _ => Ok(None),
        }
    }

    pub fn set_item(&self, key: &PathKey, value: Value) -> Result<()> {
        match (self, key) {
            (Value::List(list), PathKey::Index(i)) => list.set(*i, value),
            (Value::Map(map), key) => {
                map.insert(key.as_name(), value);
                Ok(())
            }
            (Value::Instance(inst), key) => match inst.get_local("__setitem__") {
                Some(setter) => setter
                    .call(vec![key_value(key), value], Kwargs::new())
                    .map(|_| ()),
                None => Err(BridgeError::TypeError(format!(
                    "'{}' object does not support item assignment",
                    self.type_name()
                ))),
            },
            (Value::Object(obj), key) => obj.set_item(key, value),
            (Value::Remote(proxy), key) => proxy.set_item(key.clone(), value),
            _ => Err(BridgeError::TypeError(format!(
                "'{}' object does not support item assignment",
                self.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Call, length, keys, iteration
    // ------------------------------------------------------------------------

    pub fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        match self {
            Value::Function(f) => f.call(args, kwargs),
            Value::Class(class) => class.instantiate(args, kwargs),
            Value::Instance(inst) => match inst.get_local("__call__") {
                Some(call) => call.call(args, kwargs),
                None => Err(not_callable(self)),
            },
            Value::Object(obj) => obj.call(args, kwargs),
            Value::Remote(proxy) => proxy.call_with(args, kwargs),
            _ => Err(not_callable(self)),
        }
    }

    /// Sequence length. Mappings, modules and plain objects have none.
    pub fn length(&self) -> Result<Option<usize>> {
        match self {
            Value::List(list) => Ok(Some(list.len())),
            Value::Str(s) => Ok(Some(s.chars().count())),
            Value::Instance(inst) => match inst.get_local("__len__") {
                Some(len) => {
                    let n = len.call(Vec::new(), Kwargs::new())?;
                    match n.as_i64() {
                        Some(n) if n >= 0 => Ok(Some(n as usize)),
                        _ => Err(BridgeError::TypeError(
                            "__len__ should return a non-negative integer".into(),
                        )),
                    }
                }
                None => Ok(None),
            },
            Value::Object(obj) => Ok(obj.len()),
            Value::Remote(proxy) => proxy.len(),
            _ => Ok(None),
        }
    }

    /// Enumerable keys: mapping keys, module and instance member names,
    /// list indices.
    pub fn keys(&self) -> Result<Vec<Value>> {
        Ok(match self {
            Value::Map(map) => map.keys().into_iter().map(Value::Str).collect(),
            Value::List(list) => (0..list.len() as i64).map(Value::Int).collect(),
            Value::Module(module) => module.names().into_iter().map(Value::Str).collect(),
            Value::Instance(inst) => inst.field_names().into_iter().map(Value::Str).collect(),
            Value::Class(class) => class.member_names().into_iter().map(Value::Str).collect(),
            Value::Object(obj) => obj.keys(),
            Value::Remote(proxy) => proxy.keys()?,
            _ => Vec::new(),
        })
    }

    /// The values produced by iterating this value.
    pub fn items(&self) -> Result<Vec<Value>> {
        match self {
            Value::List(list) => Ok(list.snapshot()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Map(_) | Value::Module(_) | Value::Object(_) => self.keys(),
            Value::Instance(inst) => match inst.get_local("__iter__") {
                Some(iter) => iter.call(Vec::new(), Kwargs::new())?.items(),
                None => Err(not_iterable(self)),
            },
            Value::Remote(proxy) => proxy.iter()?.collect(),
            _ => Err(not_iterable(self)),
        }
    }

    // ------------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------------

    /// Developer representation. Never performs a round trip.
    pub fn repr(&self) -> String {
        repr_at(self, 0)
    }

    /// Human-facing text: strings unquoted, `__str__` honored.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Instance(inst) => match inst.get_local("__str__") {
                Some(to_str) => match to_str.call(Vec::new(), Kwargs::new()) {
                    Ok(Value::Str(s)) => s,
                    _ => self.repr(),
                },
                None => self.repr(),
            },
            other => other.repr(),
        }
    }

    // ------------------------------------------------------------------------
    // JSON
    // ------------------------------------------------------------------------

    /// Materialize as plain JSON. Values with no structural form become null.
    pub fn to_json(&self) -> Result<Json> {
        to_json_at(self, 0)
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => number_value(n),
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json).collect()),
            Json::Object(entries) => Value::Map(Map::new(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            )),
        }
    }

    /// Non-owning reference to this value's storage, if it has any.
    pub(crate) fn downgrade(&self) -> Option<WeakValue> {
        Some(match self {
            Value::List(list) => WeakValue::List(Arc::downgrade(&list.0)),
            Value::Map(map) => WeakValue::Map(Arc::downgrade(&map.0)),
            Value::Function(f) => WeakValue::Function(Arc::downgrade(&f.inner)),
            Value::Class(class) => WeakValue::Class(class.downgrade()),
            Value::Instance(inst) => WeakValue::Instance(inst.downgrade()),
            Value::Module(module) => WeakValue::Module(Arc::downgrade(&module.inner)),
            Value::Object(obj) => WeakValue::Object(Arc::downgrade(obj)),
            Value::Deferred(d) => WeakValue::Deferred(Arc::downgrade(&d.future)),
            Value::Remote(proxy) => WeakValue::Remote(proxy.downgrade()),
            _ => return None,
        })
    }
}

pub(crate) fn number_value(n: &serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else if let Some(u) = n.as_u64() {
        Value::Float(u as f64)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn key_value(key: &PathKey) -> Value {
    match key {
        PathKey::Index(i) => Value::Int(*i),
        PathKey::Name(s) => Value::Str(s.clone()),
    }
}

fn not_callable(value: &Value) -> BridgeError {
    BridgeError::TypeError(format!("'{}' object is not callable", value.type_name()))
}

fn not_iterable(value: &Value) -> BridgeError {
    BridgeError::TypeError(format!("'{}' object is not iterable", value.type_name()))
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn repr_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        format!("{:?}", f)
    }
}

fn repr_at(value: &Value, depth: usize) -> String {
    if depth > ProtocolConfig::MAX_VALUE_DEPTH {
        return "...".into();
    }
    match value {
        Value::None => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => repr_float(*f),
        Value::Str(s) => repr_str(s),
        Value::List(list) => {
            let parts: Vec<String> = list
                .snapshot()
                .iter()
                .map(|v| repr_at(v, depth + 1))
                .collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Map(map) => {
            let parts: Vec<String> = map
                .snapshot()
                .iter()
                .map(|(k, v)| format!("{}: {}", repr_str(k), repr_at(v, depth + 1)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Function(f) if f.is_bound() => format!("<bound method {}>", f.name()),
        Value::Function(f) => format!("<function {}>", f.name()),
        Value::Class(class) => format!("<class '{}'>", class.name()),
        Value::Instance(inst) => match inst.get_local("__repr__") {
            Some(repr) => match repr.call(Vec::new(), Kwargs::new()) {
                Ok(Value::Str(s)) => s,
                _ => format!("<{} object>", inst.class().name()),
            },
            None => format!("<{} object>", inst.class().name()),
        },
        Value::Module(module) => format!("<module '{}'>", module.name()),
        Value::Object(obj) => obj.repr(),
        Value::Deferred(_) => "<deferred>".into(),
        Value::Remote(proxy) => format!("{:?}", proxy),
    }
}

fn to_json_at(value: &Value, depth: usize) -> Result<Json> {
    if depth > ProtocolConfig::MAX_VALUE_DEPTH {
        return Err(BridgeError::TypeError(format!(
            "value nesting exceeds maximum depth of {}",
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
                .map(|v| to_json_at(v, depth + 1))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.snapshot() {
                out.insert(k, to_json_at(&v, depth + 1)?);
            }
            Json::Object(out)
        }
        Value::Instance(inst) => {
            let mut out = serde_json::Map::new();
            for (k, v) in inst.fields() {
                out.insert(k, to_json_at(&v, depth + 1)?);
            }
            Json::Object(out)
        }
        _ => Json::Null,
    })
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

// ============================================================================
// Weak values
// ============================================================================

/// Non-owning counterpart of [`Value`], used for weak table retention.
pub(crate) enum WeakValue {
    List(Weak<RwLock<Vec<Value>>>),
    Map(Weak<RwLock<IndexMap<String, Value>>>),
    Function(Weak<FunctionInner>),
    Class(class::WeakClass),
    Instance(class::WeakInstance),
    Module(Weak<ModuleInner>),
    Object(Weak<dyn HostObject>),
    Deferred(Weak<Mutex<Option<BoxFuture<'static, Result<Value>>>>>),
    Remote(WeakProxy),
}

impl WeakValue {
    pub(crate) fn upgrade(&self) -> Option<Value> {
        Some(match self {
            WeakValue::List(w) => Value::List(List(w.upgrade()?)),
            WeakValue::Map(w) => Value::Map(Map(w.upgrade()?)),
            WeakValue::Function(w) => Value::Function(Function { inner: w.upgrade()? }),
            WeakValue::Class(w) => Value::Class(w.upgrade()?),
            WeakValue::Instance(w) => Value::Instance(w.upgrade()?),
            WeakValue::Module(w) => Value::Module(Module { inner: w.upgrade()? }),
            WeakValue::Object(w) => Value::Object(w.upgrade()?),
            WeakValue::Deferred(w) => Value::Deferred(Deferred { future: w.upgrade()? }),
            WeakValue::Remote(w) => Value::Remote(w.upgrade()?),
        })
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<List> for Value {
    fn from(list: List) -> Self {
        Value::List(list)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Class> for Value {
    fn from(class: Class) -> Self {
        Value::Class(class)
    }
}

impl From<Instance> for Value {
    fn from(inst: Instance) -> Self {
        Value::Instance(inst)
    }
}

impl From<Module> for Value {
    fn from(module: Module) -> Self {
        Value::Module(module)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Value::Remote(proxy)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::Int(3).is_truthy());
        assert!(Value::Module(Module::new("m")).is_truthy());
    }

    #[test]
    fn test_repr() {
        let value = Value::map([
            ("a", Value::Int(1)),
            ("b", Value::list(vec![Value::from("x"), Value::None, Value::Bool(true)])),
        ]);
        assert_eq!(value.repr(), "{'a': 1, 'b': ['x', None, True]}");
        assert_eq!(Value::Float(1.0).repr(), "1.0");
        assert_eq!(Value::from("it's").repr(), "'it\\'s'");
    }

    #[test]
    fn test_display_unquotes_strings() {
        assert_eq!(Value::from("hello").display(), "hello");
        assert_eq!(Value::Int(5).display(), "5");
    }

    #[test]
    fn test_json_conversion() {
        let json = json!({"a": [1, 2.5, "s", null, true], "b": {"c": -4}});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_json_depth_limit() {
        let mut value = Value::Int(0);
        for _ in 0..(ProtocolConfig::MAX_VALUE_DEPTH + 5) {
            value = Value::list(vec![value]);
        }
        assert!(matches!(value.to_json(), Err(BridgeError::TypeError(_))));
    }

    #[test]
    fn test_list_negative_index() {
        let list = List::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(list.get(-1).and_then(|v| v.as_i64()), Some(3));
        assert!(list.get(3).is_none());
        assert!(list.get(-4).is_none());
        assert!(list.set(5, Value::None).is_err());
    }

    #[test]
    fn test_containers_share_storage() {
        let value = Value::list(vec![]);
        let alias = value.clone();
        value.as_list().unwrap().push(Value::Int(1));
        assert_eq!(alias.as_list().unwrap().len(), 1);
    }

    #[test]
    fn test_map_methods_are_attributes() {
        let value = Value::map([("a", 1)]);
        let keys = value.get_attr("keys").unwrap().unwrap();
        let result = keys.call(vec![], Kwargs::new()).unwrap();
        assert_eq!(result.to_json().unwrap(), json!(["a"]));
        assert!(value.get_attr("missing").unwrap().is_none());
    }

    #[test]
    fn test_get_item() {
        let value = Value::map([("k", "v")]);
        let found = value.get_item(&PathKey::from("k")).unwrap();
        assert_eq!(found.unwrap().as_str(), Some("v"));
        assert!(value.get_item(&PathKey::from("x")).unwrap().is_none());

        let text = Value::from("abc");
        let c = text.get_item(&PathKey::Index(1)).unwrap().unwrap();
        assert_eq!(c.as_str(), Some("b"));
    }

    #[test]
    fn test_function_call_and_bind() {
        let add = Function::new("add", |args, _| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(Value::Int(a + b))
        });
        let bound = add.bind(Value::Int(10), "Adder");
        assert!(bound.is_bound());
        let result = bound.call(vec![Value::Int(5)], Kwargs::new()).unwrap();
        assert_eq!(result.as_i64(), Some(15));
        assert_eq!(Value::Function(bound).repr(), "<bound method Adder.add>");
    }

    #[test]
    fn test_not_callable() {
        let err = Value::Int(1).call(vec![], Kwargs::new()).unwrap_err();
        assert!(err.to_string().contains("not callable"));
    }

    #[test]
    fn test_length_protocol() {
        assert_eq!(Value::from("héllo").length().unwrap(), Some(5));
        assert_eq!(Value::list(vec![Value::None]).length().unwrap(), Some(1));
        assert_eq!(Value::map([("a", 1)]).length().unwrap(), None);
    }

    #[test]
    fn test_weak_value_expires() {
        let value = Value::list(vec![]);
        let weak = value.downgrade().unwrap();
        assert!(weak.upgrade().is_some());
        drop(value);
        assert!(weak.upgrade().is_none());
        assert!(Value::Int(1).downgrade().is_none());
    }

    #[tokio::test]
    async fn test_deferred_settles_once() {
        let deferred = Deferred::new(async { Ok(Value::Int(7)) });
        let again = deferred.clone();
        assert_eq!(deferred.settle().await.unwrap().as_i64(), Some(7));
        assert!(again.settle().await.is_err());
    }

    #[test]
    fn test_async_function_returns_deferred() {
        let f = Function::new_async("later", |_, _| async { Ok(Value::Int(1)) });
        let out = f.call(vec![], Kwargs::new()).unwrap();
        assert!(matches!(out, Value::Deferred(_)));
    }
}
