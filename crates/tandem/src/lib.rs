//! Tandem - remote references between two cooperating runtimes.
//!
//! Each side of a connection serves a namespace of host values and can
//! operate on the other side's values through proxies: read attributes,
//! call functions, construct classes, index, iterate and assign. Values
//! cross the wire by copy when they are plain data and by reference
//! otherwise; references are integer handles into a per-connection table.
//! Calls may nest arbitrarily: a remote function can call back into a
//! local function it was handed while the original caller is still
//! waiting.
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem::{Endpoint, EndpointOptions, IoRuntime, Module, Namespace, Value};
//!
//! fn main() -> tandem::Result<()> {
//!     let runtime = IoRuntime::start()?;
//!     let bridge = runtime.bridge();
//!
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!     let math = Module::new("math").function("add", |args, _| {
//!         Ok(Value::Int(args.iter().filter_map(Value::as_i64).sum()))
//!     });
//!     let _server = Endpoint::attach(&bridge, a, Namespace::new().with_module(math), EndpointOptions::new());
//!     let client = Endpoint::attach(&bridge, b, Namespace::new(), EndpointOptions::new());
//!
//!     let math = client.import("math")?;
//!     let sum = math.call_method("add", vec![2.into(), 3.into()])?;
//!     assert_eq!(sum.as_i64(), Some(5));
//!     Ok(())
//! }
//! ```

pub mod class_bridge;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod ipc;
pub mod namespace;
pub mod proxy;
pub mod resolver;
pub mod runtime;
pub mod shutdown;
pub mod table;
pub mod value;

pub use class_bridge::{define_class, BaseSpec};
pub use classify::{classify, Classified, DisplayMode};
pub use config::{EndpointOptions, ProtocolConfig, RuntimeConfig, WireConfig};
pub use dispatcher::{Dispatch, Dispatcher};
pub use endpoint::{Endpoint, EndpointServer, RemoteBase, ServerHandle};
pub use error::{BridgeError, Result};
pub use ipc::{Action, Tag};
pub use namespace::{CodeRunner, Modules, Namespace, PathEvaluator};
pub use proxy::{Proxy, ProxyIter};
pub use resolver::{resolve, ResolveMode};
pub use runtime::{IoRuntime, SyncBridge};
pub use shutdown::ShutdownSignal;
pub use table::ReferenceTable;
pub use value::{
    Class, Deferred, Function, HostObject, Instance, Kwargs, List, Map, Module, PathKey, Value,
};
