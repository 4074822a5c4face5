//! Path resolution against a root value.
//!
//! Two policies exist because the same path means slightly different things
//! depending on what the caller is about to do with the result:
//!
//! - [`ResolveMode::Invoke`]: attribute first. A missing *or falsy*
//!   attribute falls through to index/key lookup.
//! - [`ResolveMode::PlainGet`]: lists and mappings prefer index/key lookup
//!   so that a key named like a built-in method (`"keys"`) yields the stored
//!   value; other values try the attribute first, then index/key.

use crate::error::{BridgeError, Result};
use crate::value::{PathKey, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Invoke,
    PlainGet,
}

/// Walk `path` from `root`.
///
/// An empty path yields the root itself.
pub fn resolve(root: Value, path: &[PathKey], mode: ResolveMode) -> Result<Value> {
    path.iter()
        .try_fold(root, |current, key| step(&current, key, mode))
}

fn step(current: &Value, key: &PathKey, mode: ResolveMode) -> Result<Value> {
    let found = match mode {
        ResolveMode::Invoke => match current.get_attr(&key.as_name())? {
            Some(value) if value.is_truthy() => Some(value),
            _ => current.get_item(key)?,
        },
        ResolveMode::PlainGet if current.is_container() => match current.get_item(key)? {
            Some(value) => Some(value),
            None => current.get_attr(&key.as_name())?,
        },
        ResolveMode::PlainGet => match current.get_attr(&key.as_name())? {
            Some(value) => Some(value),
            None => current.get_item(key)?,
        },
    };
    found.ok_or_else(|| BridgeError::PropertyNotFound {
        key: key.display_name(),
        repr: current.repr(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Class, Kwargs, Module};

    fn path(keys: &[&str]) -> Vec<PathKey> {
        keys.iter().map(|k| PathKey::from(*k)).collect()
    }

    #[test]
    fn test_empty_path_returns_root() {
        let root = Value::Int(3);
        let value = resolve(root, &[], ResolveMode::Invoke).unwrap();
        assert_eq!(value.as_i64(), Some(3));
    }

    #[test]
    fn test_nested_path() {
        let module = Module::new("m").with("data", Value::map([("items", Value::list(vec![Value::from("a"), Value::from("b")]))]));
        let keys = vec![PathKey::from("data"), PathKey::from("items"), PathKey::Index(1)];
        let value = resolve(Value::Module(module), &keys, ResolveMode::PlainGet).unwrap();
        assert_eq!(value.as_str(), Some("b"));
    }

    #[test]
    fn test_key_named_like_builtin_method() {
        let root = Value::map([("keys", 7)]);

        let plain = resolve(root.clone(), &path(&["keys"]), ResolveMode::PlainGet).unwrap();
        assert_eq!(plain.as_i64(), Some(7));

        let invoked = resolve(root, &path(&["keys"]), ResolveMode::Invoke).unwrap();
        assert!(matches!(invoked, Value::Function(_)));
    }

    #[test]
    fn test_falsy_attribute_falls_through_to_index() {
        let class = Class::new("Box").method("__getitem__", |_, args, _| {
            Ok(Value::from(format!("item:{}", args[0].display())))
        });
        let inst = class.instantiate(vec![], Kwargs::new()).unwrap();
        inst.set_attr("flag", Value::Int(0)).unwrap();

        let invoked = resolve(inst.clone(), &path(&["flag"]), ResolveMode::Invoke).unwrap();
        assert_eq!(invoked.as_str(), Some("item:flag"));

        let plain = resolve(inst, &path(&["flag"]), ResolveMode::PlainGet).unwrap();
        assert_eq!(plain.as_i64(), Some(0));
    }

    #[test]
    fn test_missing_key_error_names_key_and_repr() {
        let root = Value::map([("a", 1)]);
        let err = resolve(root, &path(&["missing"]), ResolveMode::PlainGet).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Property 'missing' does not exist on {'a': 1}"
        );
    }

    #[test]
    fn test_bypass_prefix_stripped_from_error() {
        let root = Value::Module(Module::new("m"));
        let err = resolve(root, &path(&["~~hidden"]), ResolveMode::Invoke).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Property 'hidden' does not exist on <module 'm'>"
        );
    }
}
