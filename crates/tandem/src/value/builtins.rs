//! Built-in methods of lists and mappings.

use super::{write, Function, Kwargs, List, Map, Value};
use crate::error::{BridgeError, Result};

fn arg(args: &[Value], index: usize, method: &str) -> Result<Value> {
    args.get(index).cloned().ok_or_else(|| {
        BridgeError::TypeError(format!("{}() missing required argument {}", method, index + 1))
    })
}

fn index_arg(args: &[Value], index: usize, method: &str) -> Result<i64> {
    arg(args, index, method)?.as_i64().ok_or_else(|| {
        BridgeError::TypeError(format!("{}() index must be an integer", method))
    })
}

pub(super) fn list_method(list: &List, name: &str) -> Option<Value> {
    let list = list.clone();
    let function = match name {
        "append" => Function::new("append", move |args, _| {
            list.push(arg(&args, 0, "append")?);
            Ok(Value::None)
        }),
        "extend" => Function::new("extend", move |args, _| {
            let items = arg(&args, 0, "extend")?.items()?;
            write(list.inner()).extend(items);
            Ok(Value::None)
        }),
        "insert" => Function::new("insert", move |args, _| {
            let index = index_arg(&args, 0, "insert")?;
            let value = arg(&args, 1, "insert")?;
            let mut items = write(list.inner());
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, value);
            Ok(Value::None)
        }),
        "pop" => Function::new("pop", move |args, _| {
            let index = match args.first() {
                Some(v) => v.as_i64().ok_or_else(|| {
                    BridgeError::TypeError("pop() index must be an integer".into())
                })?,
                None => -1,
            };
            let mut items = write(list.inner());
            let len = items.len() as i64;
            let at = if index < 0 { index + len } else { index };
            if at < 0 || at >= len {
                return Err(BridgeError::TypeError("pop index out of range".into()));
            }
            Ok(items.remove(at as usize))
        }),
        "clear" => Function::new("clear", move |_, _| {
            write(list.inner()).clear();
            Ok(Value::None)
        }),
        "copy" => Function::new("copy", move |_, _| Ok(Value::list(list.snapshot()))),
        "index" => Function::new("index", move |args, _| {
            let needle = arg(&args, 0, "index")?.repr();
            list.snapshot()
                .iter()
                .position(|v| v.repr() == needle)
                .map(Value::from)
                .ok_or_else(|| BridgeError::TypeError(format!("{} is not in list", needle)))
        }),
        _ => return None,
    };
    Some(Value::Function(function))
}

pub(super) fn map_method(map: &Map, name: &str) -> Option<Value> {
    let map = map.clone();
    let function = match name {
        "keys" => Function::new("keys", move |_, _| {
            Ok(Value::list(map.keys().into_iter().map(Value::Str).collect()))
        }),
        "values" => Function::new("values", move |_, _| {
            Ok(Value::list(map.snapshot().into_values().collect()))
        }),
        "items" => Function::new("items", move |_, _| {
            Ok(Value::list(
                map.snapshot()
                    .into_iter()
                    .map(|(k, v)| Value::list(vec![Value::Str(k), v]))
                    .collect(),
            ))
        }),
        "get" => Function::new("get", move |args, _| {
            let key = arg(&args, 0, "get")?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            Ok(map.get(&key.display()).unwrap_or(default))
        }),
        "pop" => Function::new("pop", move |args, _| {
            let key = arg(&args, 0, "pop")?.display();
            match (map.remove(&key), args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(BridgeError::PropertyNotFound {
                    key,
                    repr: "dict".into(),
                }),
            }
        }),
        "update" => Function::new("update", move |args, kwargs: Kwargs| {
            if let Some(other) = args.first() {
                let other = other.as_map().ok_or_else(|| {
                    BridgeError::TypeError("update() argument must be a mapping".into())
                })?;
                write(map.inner()).extend(other.snapshot());
            }
            write(map.inner()).extend(kwargs);
            Ok(Value::None)
        }),
        "clear" => Function::new("clear", move |_, _| {
            write(map.inner()).clear();
            Ok(Value::None)
        }),
        "copy" => Function::new("copy", move |_, _| Ok(Value::Map(Map::new(map.snapshot())))),
        _ => return None,
    };
    Some(Value::Function(function))
}
