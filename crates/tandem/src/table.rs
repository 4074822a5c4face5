//! Per-connection reference table.
//!
//! Maps integer handles to live local values. Handle 0 holds the capability
//! namespace and is never freed. Besides ordinary (strong) entries the table
//! keeps:
//!
//! - weakly retained entries, for values created while decoding a request's
//!   arguments; they live as long as something else holds them;
//! - provisional entries, allocated by the caller for its own outbound
//!   arguments; they are kept if the peer acknowledges them with a `pre`
//!   notice and reclaimed when the request completes otherwise.

use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::value::{lock, Value, WeakValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct TableState {
    strong: HashMap<u64, Value>,
    weak: HashMap<u64, WeakValue>,
    /// Outbound request id -> (argument token -> handle).
    provisional: HashMap<u64, HashMap<u64, u64>>,
}

/// Handle registry for one endpoint.
pub struct ReferenceTable {
    state: Mutex<TableState>,
    next_handle: AtomicU64,
}

impl ReferenceTable {
    /// Create a table with `root` registered under handle 0.
    pub fn new(root: Value) -> Self {
        let mut state = TableState::default();
        state.strong.insert(ProtocolConfig::ROOT_HANDLE, root);
        Self {
            state: Mutex::new(state),
            next_handle: AtomicU64::new(ProtocolConfig::ROOT_HANDLE + 1),
        }
    }

    /// Take the next handle without storing anything under it.
    pub fn reserve(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    /// Store `value` under a fresh handle.
    pub fn allocate(&self, value: Value) -> u64 {
        let handle = self.reserve();
        lock(&self.state).strong.insert(handle, value);
        handle
    }

    /// Look up a handle, strong entries first, then live weak entries.
    pub fn get(&self, handle: u64) -> Result<Value> {
        let mut state = lock(&self.state);
        if let Some(value) = state.strong.get(&handle) {
            return Ok(value.clone());
        }
        match state.weak.get(&handle).map(WeakValue::upgrade) {
            Some(Some(value)) => Ok(value),
            Some(None) => {
                state.weak.remove(&handle);
                Err(BridgeError::HandleNotFound(handle))
            }
            None => Err(BridgeError::HandleNotFound(handle)),
        }
    }

    /// Drop the entry for `handle`. Absent handles and the root are ignored.
    pub fn free(&self, handle: u64) {
        if handle == ProtocolConfig::ROOT_HANDLE {
            return;
        }
        let mut state = lock(&self.state);
        let removed = state.strong.remove(&handle).is_some() | state.weak.remove(&handle).is_some();
        if !removed {
            debug!("Free of unknown handle {}", handle);
        }
    }

    /// Register `value` under an existing handle without keeping it alive.
    ///
    /// Values without shared storage cannot be held weakly and are kept
    /// strongly instead.
    ///
    /// Entries whose referent has died are pruned on the way in, so the
    /// weak map tracks live arguments rather than every argument ever seen.
    pub fn retain_weak(&self, handle: u64, value: &Value) {
        let live = {
            let mut state = lock(&self.state);
            let live = prune_weak(&mut state.weak);
            match value.downgrade() {
                Some(weak) => {
                    state.weak.insert(handle, weak);
                }
                None => {
                    state.strong.insert(handle, value.clone());
                }
            }
            live
        };
        // Upgraded referents are released outside the lock.
        drop(live);
    }

    /// Allocate a handle for an argument of outbound request `request`.
    pub fn allocate_provisional(&self, request: u64, token: u64, value: Value) -> u64 {
        let handle = self.reserve();
        let mut state = lock(&self.state);
        state.strong.insert(handle, value);
        state
            .provisional
            .entry(request)
            .or_default()
            .insert(token, handle);
        handle
    }

    /// Promote the provisional entries the peer acknowledged.
    pub fn acknowledge(&self, request: u64, tokens: impl IntoIterator<Item = u64>) {
        let mut state = lock(&self.state);
        if let Some(pending) = state.provisional.get_mut(&request) {
            for token in tokens {
                pending.remove(&token);
            }
        }
    }

    /// Free every provisional entry of `request` that was never acknowledged.
    ///
    /// Returns the number of entries freed.
    pub fn reclaim(&self, request: u64) -> usize {
        let mut state = lock(&self.state);
        let Some(pending) = state.provisional.remove(&request) else {
            return 0;
        };
        for handle in pending.values() {
            state.strong.remove(handle);
        }
        pending.len()
    }

    /// Drop every entry except the root. Used when the connection closes.
    pub fn clear(&self) {
        let (strong, weak) = {
            let mut state = lock(&self.state);
            let root = state.strong.remove(&ProtocolConfig::ROOT_HANDLE);
            let strong = std::mem::take(&mut state.strong);
            if let Some(root) = root {
                state.strong.insert(ProtocolConfig::ROOT_HANDLE, root);
            }
            state.provisional.clear();
            (strong, std::mem::take(&mut state.weak))
        };
        // Dropped outside the lock: values may hold proxies whose drop
        // reaches back into this table's connection.
        drop(strong);
        drop(weak);
    }

    pub fn contains(&self, handle: u64) -> bool {
        let state = lock(&self.state);
        state.strong.contains_key(&handle)
            || state
                .weak
                .get(&handle)
                .is_some_and(|w| w.upgrade().is_some())
    }

    /// Number of live entries, root included.
    pub fn len(&self) -> usize {
        let state = lock(&self.state);
        state.strong.len() + state.weak.values().filter(|w| w.upgrade().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop dead weak entries, returning the referents upgraded while checking.
fn prune_weak(weak: &mut HashMap<u64, WeakValue>) -> Vec<Value> {
    let mut live = Vec::new();
    weak.retain(|_, entry| match entry.upgrade() {
        Some(value) => {
            live.push(value);
            true
        }
        None => false,
    });
    live
}
