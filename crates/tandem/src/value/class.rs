//! Classes and instances.
//!
//! A [`Class`] holds members and bases; its method resolution order is the
//! C3 linearization, computed once when the class is created. Calling a
//! class builds an [`Instance`] and runs the first `__init__` found along
//! the MRO. Functions found on the class are bound to the instance when
//! read through it.

use super::{read, write, Function, Kwargs, Value};
use crate::class_bridge::{Bridge, Intercept};
use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use indexmap::IndexMap;
use std::sync::{Arc, RwLock, Weak};

pub(crate) struct ClassInner {
    name: String,
    bases: Vec<Class>,
    /// MRO without the class itself.
    mro_tail: Vec<Class>,
    members: RwLock<IndexMap<String, Value>>,
    bridge: Option<Bridge>,
}

/// A class value.
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

pub(crate) struct WeakClass(Weak<ClassInner>);

impl WeakClass {
    pub(crate) fn upgrade(&self) -> Option<Class> {
        self.0.upgrade().map(|inner| Class { inner })
    }
}

impl Class {
    /// Create a class with no bases.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), Vec::new(), Vec::new(), None)
    }

    /// Create a class deriving from `bases`.
    ///
    /// Fails when the bases admit no consistent linearization.
    pub fn with_bases(name: impl Into<String>, bases: Vec<Class>) -> Result<Self> {
        Self::derive(name.into(), bases, None)
    }

    pub(crate) fn derive(name: String, bases: Vec<Class>, bridge: Option<Bridge>) -> Result<Self> {
        let mut sequences: Vec<Vec<Class>> = bases.iter().map(Class::mro).collect();
        sequences.push(bases.clone());
        let mro_tail = c3_merge(sequences).ok_or_else(|| {
            let names: Vec<&str> = bases.iter().map(Class::name).collect();
            BridgeError::TypeError(format!(
                "Cannot create a consistent method resolution order (MRO) for bases {}",
                names.join(", ")
            ))
        })?;
        Ok(Self::build(name, bases, mro_tail, bridge))
    }

    fn build(name: String, bases: Vec<Class>, mro_tail: Vec<Class>, bridge: Option<Bridge>) -> Self {
        Self {
            inner: Arc::new(ClassInner {
                name,
                bases,
                mro_tail,
                members: RwLock::new(IndexMap::new()),
                bridge,
            }),
        }
    }

    /// Add a method. The closure receives the instance first.
    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>, Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        let method_name = name.to_string();
        let function = Function::new(name, move |mut args, kwargs| {
            if args.is_empty() {
                return Err(BridgeError::TypeError(format!(
                    "{}() missing required argument 'self'",
                    method_name
                )));
            }
            let this = args.remove(0);
            f(this, args, kwargs)
        });
        self.set_member(name, Value::Function(function));
        self
    }

    /// Add a class attribute.
    pub fn attr(self, name: &str, value: impl Into<Value>) -> Self {
        self.set_member(name, value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn bases(&self) -> &[Class] {
        &self.inner.bases
    }

    /// Method resolution order, starting with this class.
    pub fn mro(&self) -> Vec<Class> {
        std::iter::once(self.clone())
            .chain(self.inner.mro_tail.iter().cloned())
            .collect()
    }

    /// Find a member along the MRO.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = read(&self.inner.members).get(name) {
            return Some(value.clone());
        }
        self.inner
            .mro_tail
            .iter()
            .find_map(|class| read(&class.inner.members).get(name).cloned())
    }

    pub fn set_member(&self, name: &str, value: Value) {
        write(&self.inner.members).insert(name.to_string(), value);
    }

    /// Member names along the MRO, nearest first, without duplicates.
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for class in self.mro() {
            for name in read(&class.inner.members).keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.ptr_eq(other) || self.inner.mro_tail.iter().any(|c| c.ptr_eq(other))
    }

    pub fn ptr_eq(&self, other: &Class) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn bridge(&self) -> Option<&Bridge> {
        self.inner.bridge.as_ref()
    }

    pub(crate) fn downgrade(&self) -> WeakClass {
        WeakClass(Arc::downgrade(&self.inner))
    }

    /// Construct an instance.
    pub fn instantiate(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        let instance = Instance::new(self.clone());
        let this = Value::Instance(instance.clone());

        if let Some(bridge) = self.bridge() {
            for base in bridge.init_chain() {
                if let Some(init) = base.class.lookup("__init__") {
                    let mut init_args = Vec::with_capacity(base.args.len() + 1);
                    init_args.push(this.clone());
                    init_args.extend(base.args.iter().cloned());
                    init.call(init_args, base.kwargs.clone())?;
                }
            }
            return Ok(this);
        }

        match self.lookup("__init__") {
            Some(init) => {
                let mut init_args = Vec::with_capacity(args.len() + 1);
                init_args.push(this.clone());
                init_args.extend(args);
                init.call(init_args, kwargs)?;
            }
            None if !args.is_empty() || !kwargs.is_empty() => {
                return Err(BridgeError::TypeError(format!(
                    "{}() takes no arguments",
                    self.name()
                )));
            }
            None => {}
        }
        Ok(this)
    }
}

fn c3_merge(mut sequences: Vec<Vec<Class>>) -> Option<Vec<Class>> {
    let mut merged = Vec::new();
    loop {
        sequences.retain(|seq| !seq.is_empty());
        if sequences.is_empty() {
            return Some(merged);
        }
        let candidate = sequences
            .iter()
            .map(|seq| &seq[0])
            .find(|head| {
                !sequences
                    .iter()
                    .any(|seq| seq[1..].iter().any(|c| c.ptr_eq(head)))
            })?
            .clone();
        for seq in sequences.iter_mut() {
            if seq[0].ptr_eq(&candidate) {
                seq.remove(0);
            }
        }
        merged.push(candidate);
    }
}

pub(crate) struct InstanceInner {
    class: Class,
    fields: RwLock<IndexMap<String, Value>>,
}

/// An instance of a [`Class`].
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

pub(crate) struct WeakInstance(Weak<InstanceInner>);

impl WeakInstance {
    pub(crate) fn upgrade(&self) -> Option<Instance> {
        self.0.upgrade().map(|inner| Instance { inner })
    }
}

impl Instance {
    pub fn new(class: Class) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                class,
                fields: RwLock::new(IndexMap::new()),
            }),
        }
    }

    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    /// Attribute lookup, routed through the class bridge when the class has one.
    pub fn get_attr(&self, name: &str) -> Result<Option<Value>> {
        let name = match self.inner.class.bridge() {
            Some(bridge) => match bridge.intercept(name)? {
                Intercept::Remote(value) => return Ok(Some(value)),
                Intercept::Local(local) => local,
            },
            None => name,
        };
        Ok(self.get_local(name))
    }

    /// Attribute lookup on the instance and its class only.
    pub fn get_local(&self, name: &str) -> Option<Value> {
        if name == "__class__" {
            return Some(Value::Class(self.inner.class.clone()));
        }
        if let Some(value) = read(&self.inner.fields).get(name) {
            return Some(value.clone());
        }
        match self.inner.class.lookup(name)? {
            Value::Function(f) => Some(Value::Function(
                f.bind(Value::Instance(self.clone()), self.inner.class.name()),
            )),
            other => Some(other),
        }
    }

    /// Write instance storage. A bypass prefix on `name` is dropped so that
    /// `~~x` and `x` share one slot.
    pub fn set_attr(&self, name: &str, value: Value) {
        let name = name
            .strip_prefix(ProtocolConfig::BYPASS_PREFIX)
            .unwrap_or(name);
        write(&self.inner.fields).insert(name.to_string(), value);
    }

    pub fn field_names(&self) -> Vec<String> {
        read(&self.inner.fields).keys().cloned().collect()
    }

    pub fn fields(&self) -> IndexMap<String, Value> {
        read(&self.inner.fields).clone()
    }

    pub fn is_instance_of(&self, class: &Class) -> bool {
        self.inner.class.is_subclass_of(class)
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakInstance {
        WeakInstance(Arc::downgrade(&self.inner))
    }
}
