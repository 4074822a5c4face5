//! Capability namespace served under handle 0.
//!
//! The peer's root proxy resolves against this module. It exposes:
//!
//! - `import(name)`: module loader backed by registered modules and an
//!   optional loader callback
//! - `eval(code, globals?, locals?)` / `exec(...)`: delegated to a
//!   [`CodeRunner`]; the default runner evaluates dotted access paths
//!   and literals and refuses `exec`
//! - `getattr`, `setattr`, `repr`
//! - `Iterate(value)`: pull-style iteration helper whose `Next()` returns
//!   the next item or the `$$STOPITER` sentinel
//! - `tuple`, `set`, `enumerate`: materialize iterables as lists
//! - `sendInspect(flag)`: toggle signatures on responses

use crate::classify::{DisplayGuard, DisplayMode};
use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::proxy::ProxyIter;
use crate::resolver::{resolve, ResolveMode};
use crate::value::{lock, read, write, Function, HostObject, Kwargs, Map, Module, PathKey, Value};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, RwLock};

type Loader = dyn Fn(&str) -> Option<Module> + Send + Sync;

/// Importable modules.
#[derive(Clone, Default)]
pub struct Modules {
    loaded: Arc<RwLock<IndexMap<String, Module>>>,
    loader: Option<Arc<Loader>>,
}

impl Modules {
    pub fn register(&self, module: Module) {
        write(&self.loaded).insert(module.name().to_string(), module);
    }

    /// Return a registered module, asking the loader on first use.
    pub fn import(&self, name: &str) -> Result<Module> {
        if let Some(module) = read(&self.loaded).get(name) {
            return Ok(module.clone());
        }
        let module = self
            .loader
            .as_ref()
            .and_then(|load| load(name))
            .ok_or_else(|| BridgeError::ModuleNotFound(name.to_string()))?;
        self.register(module.clone());
        Ok(module)
    }
}

/// Evaluates source text sent by the peer.
pub trait CodeRunner: Send + Sync {
    fn eval(&self, code: &str, scope: &Map, modules: &Modules) -> Result<Value>;

    fn exec(&self, code: &str, scope: &Map, modules: &Modules) -> Result<Value>;
}

/// Default runner: literals and access paths such as `os.path` or
/// `config['items'][0]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathEvaluator;

impl CodeRunner for PathEvaluator {
    fn eval(&self, code: &str, scope: &Map, modules: &Modules) -> Result<Value> {
        let code = code.trim();
        if let Some(literal) = parse_literal(code) {
            return Ok(literal);
        }
        let (head, path) = parse_access_path(code)?;
        let root = match scope.get(&head) {
            Some(value) => value,
            None => Value::Module(modules.import(&head)?),
        };
        resolve(root, &path, ResolveMode::PlainGet)
    }

    fn exec(&self, _code: &str, _scope: &Map, _modules: &Modules) -> Result<Value> {
        Err(BridgeError::TypeError(
            "exec is not supported by the path evaluator".into(),
        ))
    }
}

fn parse_literal(code: &str) -> Option<Value> {
    match code {
        "None" => return Some(Value::None),
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(i) = code.parse::<i64>() {
        return Some(Value::Int(i));
    }
    if let Ok(f) = code.parse::<f64>() {
        return Some(Value::Float(f));
    }
    unquote(code).map(Value::from)
}

fn unquote(s: &str) -> Option<&str> {
    let first = s.chars().next()?;
    if (first == '\'' || first == '"') && s.len() >= 2 && s.ends_with(first) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn parse_access_path(code: &str) -> Result<(String, Vec<PathKey>)> {
    let invalid = || BridgeError::TypeError(format!("invalid expression: {}", code));
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';

    let head_end = code.find(|c: char| !is_ident(c)).unwrap_or(code.len());
    let head = &code[..head_end];
    if head.is_empty() || head.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let mut path = Vec::new();
    let mut rest = &code[head_end..];
    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(|c: char| !is_ident(c)).unwrap_or(after_dot.len());
            if end == 0 {
                return Err(invalid());
            }
            path.push(PathKey::from(&after_dot[..end]));
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket.find(']').ok_or_else(invalid)?;
            let inner = after_bracket[..close].trim();
            let key = match inner.parse::<i64>() {
                Ok(i) => PathKey::Index(i),
                Err(_) => PathKey::from(unquote(inner).ok_or_else(invalid)?),
            };
            path.push(key);
            rest = &after_bracket[close + 1..];
        } else {
            return Err(invalid());
        }
    }
    Ok((head.to_string(), path))
}

/// Builder for the handle-0 namespace of an endpoint.
#[derive(Clone)]
pub struct Namespace {
    modules: Modules,
    globals: IndexMap<String, Value>,
    runner: Arc<dyn CodeRunner>,
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            modules: Modules::default(),
            globals: IndexMap::new(),
            runner: Arc::new(PathEvaluator),
        }
    }

    /// Make `module` importable by name.
    pub fn with_module(self, module: Module) -> Self {
        self.modules.register(module);
        self
    }

    /// Fallback for imports of unregistered modules.
    pub fn with_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&str) -> Option<Module> + Send + Sync + 'static,
    {
        self.modules.loader = Some(Arc::new(loader));
        self
    }

    /// Expose a value directly on the namespace.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }

    /// Replace the runner behind `eval` and `exec`.
    pub fn with_code_runner<R: CodeRunner + 'static>(mut self, runner: R) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn modules(&self) -> &Modules {
        &self.modules
    }

    /// Build the root module.
    pub(crate) fn into_root(self, display: DisplayMode) -> Value {
        let Namespace {
            modules,
            globals,
            runner,
        } = self;

        let import_modules = modules.clone();
        let eval_modules = modules.clone();
        let eval_runner = runner.clone();
        let exec_modules = modules;
        let exec_runner = runner;
        let eval_globals = globals.clone();
        let exec_globals = globals.clone();
        let iterate_display = display.clone();

        let mut root = Module::new("builtins")
            .function("import", move |args, _| {
                let name = string_arg(&args, 0, "import")?;
                Ok(Value::Module(import_modules.import(&name)?))
            })
            .function("eval", move |args, _| {
                let code = string_arg(&args, 0, "eval")?;
                eval_runner.eval(&code, &scope_of(&eval_globals, &args), &eval_modules)
            })
            .function("exec", move |args, _| {
                let code = string_arg(&args, 0, "exec")?;
                exec_runner.exec(&code, &scope_of(&exec_globals, &args), &exec_modules)
            })
            .function("getattr", |args, _| {
                let target = arg(&args, 0, "getattr")?;
                let name = string_arg(&args, 1, "getattr")?;
                match (target.get_attr(&name)?, args.get(2)) {
                    (Some(value), _) => Ok(value),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(BridgeError::PropertyNotFound {
                        key: name,
                        repr: target.repr(),
                    }),
                }
            })
            .function("setattr", |args, _| {
                let target = arg(&args, 0, "setattr")?;
                let name = string_arg(&args, 1, "setattr")?;
                target.set_attr(&name, arg(&args, 2, "setattr")?)?;
                Ok(Value::None)
            })
            .function("Iterate", move |args, _| {
                let source = match arg(&args, 0, "Iterate")? {
                    Value::Remote(proxy) => Source::Remote(proxy.iter()?),
                    local => Source::Local(local.items()?.into_iter()),
                };
                Ok(Value::object(IterationHelper::new(source, &iterate_display)))
            })
            .function("tuple", |args, _| Ok(Value::list(arg(&args, 0, "tuple")?.items()?)))
            .function("set", |args, _| {
                let mut seen: Vec<String> = Vec::new();
                let mut unique = Vec::new();
                for item in arg(&args, 0, "set")?.items()? {
                    let key = item.repr();
                    if !seen.contains(&key) {
                        seen.push(key);
                        unique.push(item);
                    }
                }
                Ok(Value::list(unique))
            })
            .function("enumerate", |args, _| {
                let items = arg(&args, 0, "enumerate")?.items()?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| Value::list(vec![Value::from(i), item]))
                        .collect(),
                ))
            })
            .function("repr", |args, _| Ok(Value::from(arg(&args, 0, "repr")?.repr())))
            .function("sendInspect", move |args, _| {
                display.set(arg(&args, 0, "sendInspect")?.is_truthy());
                Ok(Value::None)
            });

        for (name, value) in globals {
            root = root.with(name, value);
        }
        Value::Module(root)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

fn arg(args: &[Value], index: usize, function: &str) -> Result<Value> {
    args.get(index).cloned().ok_or_else(|| {
        BridgeError::TypeError(format!(
            "{}() missing required argument {}",
            function,
            index + 1
        ))
    })
}

fn string_arg(args: &[Value], index: usize, function: &str) -> Result<String> {
    match arg(args, index, function)? {
        Value::Str(s) => Ok(s),
        other => Err(BridgeError::TypeError(format!(
            "{}() argument {} must be str, not {}",
            function,
            index + 1,
            other.type_name()
        ))),
    }
}

/// Namespace values overlaid with the optional globals and locals mappings
/// of `eval`/`exec`.
fn scope_of(globals: &IndexMap<String, Value>, args: &[Value]) -> Map {
    let scope = Map::new(globals.clone());
    for extra in args.iter().skip(1) {
        if let Value::Map(map) = extra {
            for (k, v) in map.snapshot() {
                scope.insert(k, v);
            }
        }
    }
    scope
}

/// Where `Next()` pulls from. Remote iterables are read one item per call.
enum Source {
    Local(std::vec::IntoIter<Value>),
    Remote(ProxyIter),
}

impl Source {
    fn next(&mut self) -> Result<Option<Value>> {
        match self {
            Source::Local(items) => Ok(items.next()),
            Source::Remote(items) => items.next().transpose(),
        }
    }
}

struct IterationState {
    source: Source,
    guard: Option<DisplayGuard>,
}

/// Pull-style iterator handed to the peer by `Iterate`.
struct IterationHelper {
    state: Arc<Mutex<IterationState>>,
}

impl IterationHelper {
    fn new(source: Source, display: &DisplayMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(IterationState {
                source,
                guard: Some(display.suspend()),
            })),
        }
    }
}

impl HostObject for IterationHelper {
    fn type_name(&self) -> &str {
        "Iterate"
    }

    fn get_attr(&self, name: &str) -> Result<Option<Value>> {
        if name != "Next" {
            return Ok(None);
        }
        let state = self.state.clone();
        Ok(Some(Value::Function(Function::new(
            "Next",
            move |_, _: Kwargs| {
                let mut state = lock(&state);
                match state.source.next()? {
                    Some(item) => Ok(item),
                    None => {
                        state.guard = None;
                        Ok(Value::from(ProtocolConfig::STOP_ITERATION))
                    }
                }
            },
        ))))
    }
}
