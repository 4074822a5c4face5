//! Value classification.
//!
//! Decides how a local value travels in a response: inline (strings,
//! numbers, void) or by reference (a handle in this endpoint's table plus a
//! tag telling the peer what kind of proxy to build).

use crate::ipc::protocol::Tag;
use crate::table::ReferenceTable;
use crate::value::Value;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome of classifying one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub tag: Tag,
    pub value: Json,
    pub signature: Option<String>,
}

impl Classified {
    pub fn void() -> Self {
        Self::inline(Tag::Void, Json::Null)
    }

    pub fn inline(tag: Tag, value: Json) -> Self {
        Self {
            tag,
            value,
            signature: None,
        }
    }
}

/// Whether referenced values get a human-readable signature.
///
/// Shared by the dispatcher and the capability namespace: the peer can
/// toggle it with `sendInspect`, and every live iteration helper suspends
/// it until the helper is exhausted or dropped.
#[derive(Debug, Clone)]
pub struct DisplayMode {
    state: Arc<DisplayState>,
}

#[derive(Debug)]
struct DisplayState {
    enabled: AtomicBool,
    suspended: AtomicUsize,
}

impl DisplayMode {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: Arc::new(DisplayState {
                enabled: AtomicBool::new(enabled),
                suspended: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Enabled and not suspended by an iteration.
    pub fn is_active(&self) -> bool {
        self.is_enabled() && self.state.suspended.load(Ordering::SeqCst) == 0
    }

    /// Suspend signatures until the returned guard is dropped.
    pub fn suspend(&self) -> DisplayGuard {
        self.state.suspended.fetch_add(1, Ordering::SeqCst);
        DisplayGuard {
            state: self.state.clone(),
        }
    }
}

/// Keeps display mode suspended while alive.
#[derive(Debug)]
pub struct DisplayGuard {
    state: Arc<DisplayState>,
}

impl Drop for DisplayGuard {
    fn drop(&mut self) {
        self.state.suspended.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Classify `value`, registering it in `table` when it travels by reference.
///
/// `invoked_class` is set when `value` is the result of calling a class.
/// The first matching rule wins:
///
/// 1. text
/// 2. numbers and booleans inline; None as void
/// 3. classes
/// 4. callables (functions, bound methods, callable objects, proxies)
/// 5. mappings, modules and freshly constructed instances as `obj`
/// 6. lists
/// 7. anything else with attribute structure as `class`
/// 8. unawaited deferred values as void
pub fn classify(value: Value, invoked_class: bool, table: &ReferenceTable, display: bool) -> Classified {
    let tag = match &value {
        Value::Str(s) => return Classified::inline(Tag::String, Json::String(s.clone())),
        Value::Bool(b) => return Classified::inline(Tag::Number, Json::Bool(*b)),
        Value::Int(i) => return Classified::inline(Tag::Number, Json::from(*i)),
        Value::Float(f) => {
            let number = serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null);
            return Classified::inline(Tag::Number, number);
        }
        Value::None => return Classified::void(),
        Value::Class(_) => Tag::Class,
        v if v.is_callable() => Tag::Fn,
        Value::Map(_) | Value::Module(_) => Tag::Obj,
        Value::Instance(_) if invoked_class => Tag::Obj,
        Value::List(_) => Tag::List,
        Value::Instance(_) | Value::Object(_) => Tag::Class,
        Value::Function(_) | Value::Remote(_) | Value::Deferred(_) => return Classified::void(),
    };

    let signature = display.then(|| value.repr());
    let handle = table.allocate(value);
    Classified {
        tag,
        value: Json::from(handle),
        signature,
    }
}
