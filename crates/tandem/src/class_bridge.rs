//! Class bridge: local classes that extend remote ones.
//!
//! The peer describes a class it wants to define on our side: a name, a
//! proxy to its own half of the object, the local base classes (with
//! constructor arguments) and the member names it overrides. The bridge
//! synthesizes a local class whose instances
//!
//! - send lookups of overridden members to the peer's half,
//! - resolve every other member (and every dunder) locally along the MRO,
//! - skip interception for names starting with `~~`, so the peer can still
//!   reach the local base implementation of a member it overrides.

use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::value::{Class, Instance, Kwargs, Value};
use std::collections::HashSet;

/// A local base class and the arguments its `__init__` receives.
#[derive(Clone)]
pub struct BaseSpec {
    pub class: Class,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl BaseSpec {
    pub fn new(class: Class) -> Self {
        Self {
            class,
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Override table attached to a bridged class.
pub(crate) struct Bridge {
    delegate: Value,
    overridden: HashSet<String>,
    init_chain: Vec<BaseSpec>,
}

pub(crate) enum Intercept<'a> {
    /// The member lives on the delegate.
    Remote(Value),
    /// Resolve this name locally.
    Local(&'a str),
}

impl Bridge {
    pub(crate) fn intercept<'a>(&self, name: &'a str) -> Result<Intercept<'a>> {
        if let Some(local) = name.strip_prefix(ProtocolConfig::BYPASS_PREFIX) {
            return Ok(Intercept::Local(local));
        }
        if name.starts_with("__") || !self.overridden.contains(name) {
            return Ok(Intercept::Local(name));
        }
        let member = match &self.delegate {
            // No round trip: the member proxy resolves on first use.
            Value::Remote(proxy) => Value::Remote(proxy.member(name)),
            other => other
                .get_attr(name)?
                .ok_or_else(|| BridgeError::PropertyNotFound {
                    key: name.to_string(),
                    repr: other.repr(),
                })?,
        };
        Ok(Intercept::Remote(member))
    }

    pub(crate) fn init_chain(&self) -> &[BaseSpec] {
        &self.init_chain
    }
}

/// Define a bridged class named `name` and construct its instance.
///
/// Base constructors run in the listed order with their captured arguments.
pub fn define_class(
    name: &str,
    delegate: Value,
    bases: Vec<BaseSpec>,
    overridden: impl IntoIterator<Item = String>,
) -> Result<Instance> {
    let base_classes = bases.iter().map(|base| base.class.clone()).collect();
    let bridge = Bridge {
        delegate,
        overridden: overridden.into_iter().collect(),
        init_chain: bases,
    };
    let class = Class::derive(name.to_string(), base_classes, Some(bridge))?;
    match class.instantiate(Vec::new(), Kwargs::new())? {
        Value::Instance(instance) => Ok(instance),
        other => Err(BridgeError::ConstructionFailure {
            target: name.to_string(),
            message: format!("expected an instance, got {}", other.type_name()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Module;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn animal() -> Class {
        Class::new("Animal")
            .method("__init__", |this, args, _| {
                let name = args.first().cloned().unwrap_or(Value::None);
                this.set_attr("name", name)?;
                Ok(Value::None)
            })
            .method("speak", |_, _, _| Ok(Value::from("...")))
            .method("walk", |this, _, _| {
                let name = this.get_attr("name")?.map(|v| v.display()).unwrap_or_default();
                Ok(Value::from(format!("{} walks", name)))
            })
    }

    fn delegate(calls: Arc<AtomicUsize>) -> Value {
        let module = Module::new("dog_half").function("speak", move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from("woof"))
        });
        Value::Module(module)
    }

    fn call(value: Value) -> Value {
        value.call(vec![], Kwargs::new()).unwrap()
    }

    #[test]
    fn test_overridden_member_goes_to_delegate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let base = BaseSpec::new(animal()).with_args(vec![Value::from("Rex")]);
        let dog = define_class("Dog", delegate(calls.clone()), vec![base], ["speak".to_string()]).unwrap();

        let speak = dog.get_attr("speak").unwrap().unwrap();
        assert_eq!(call(speak).as_str(), Some("woof"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let walk = dog.get_attr("walk").unwrap().unwrap();
        assert_eq!(call(walk).as_str(), Some("Rex walks"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bypass_prefix_reaches_local_base() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dog = define_class(
            "Dog",
            delegate(calls.clone()),
            vec![BaseSpec::new(animal())],
            ["speak".to_string()],
        )
        .unwrap();

        let speak = dog.get_attr("~~speak").unwrap().unwrap();
        assert_eq!(call(speak).as_str(), Some("..."));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dunders_resolve_locally() {
        let dog = define_class(
            "Dog",
            Value::Module(Module::new("half")),
            vec![BaseSpec::new(animal())],
            ["__init__".to_string()],
        )
        .unwrap();
        assert!(dog.get_attr("__init__").unwrap().is_some());
        assert!(dog.is_instance_of(dog.class()));
    }

    #[test]
    fn test_assignment_is_visible_through_bypass() {
        let dog = define_class(
            "Dog",
            Value::Module(Module::new("half")),
            vec![BaseSpec::new(animal())],
            ["name".to_string()],
        )
        .unwrap();
        dog.set_attr("name", Value::from("Fido"));
        assert_eq!(dog.get_attr("~~name").unwrap().unwrap().as_str(), Some("Fido"));
    }

    #[test]
    fn test_init_chain_runs_in_order() {
        let first = Class::new("First").method("__init__", |this, _, _| {
            this.set_attr("order", Value::from("first"))?;
            Ok(Value::None)
        });
        let second = Class::new("Second").method("__init__", |this, _, _| {
            let seen = this.get_attr("order")?.map(|v| v.display()).unwrap_or_default();
            this.set_attr("order", Value::from(format!("{},second", seen)))?;
            Ok(Value::None)
        });
        let both = define_class(
            "Both",
            Value::None,
            vec![BaseSpec::new(first), BaseSpec::new(second)],
            Vec::<String>::new(),
        )
        .unwrap();
        assert_eq!(both.get_local("order").unwrap().as_str(), Some("first,second"));
    }
}
