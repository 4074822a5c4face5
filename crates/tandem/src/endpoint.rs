//! Connection endpoints.
//!
//! An [`Endpoint`] owns one side of a connection: its reference table, the
//! outbound [`Transport`], and two tasks on the I/O runtime. The reader
//! routes each frame (requests to the dispatcher, responses to their
//! waiters, `pre` and `free` notices to the tables); the writer drains the
//! outbound queue. Both sides of a connection are symmetric, so either may
//! call into the other at any time.
//!
//! [`EndpointServer`] accepts TCP connections and attaches an endpoint to
//! each; [`Endpoint::connect`] dials one.

use crate::classify::DisplayMode;
use crate::config::{EndpointOptions, ProtocolConfig, WireConfig};
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{BridgeError, Result};
use crate::ipc::protocol::{read_frame, write_frame, Action, Envelope, Message, Response};
use crate::ipc::transport::Transport;
use crate::namespace::Namespace;
use crate::proxy::{from_response, Proxy};
use crate::runtime::SyncBridge;
use crate::shutdown::ShutdownSignal;
use crate::table::ReferenceTable;
use crate::value::{Kwargs, Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A remote base class for [`Endpoint::extend_class`], with the arguments
/// its constructor receives.
pub struct RemoteBase {
    pub class: Proxy,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl RemoteBase {
    pub fn new(class: Proxy) -> Self {
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

/// One side of a bridged connection.
///
/// Proxies obtained from an endpoint stay usable until the endpoint is
/// closed or dropped; afterwards every request fails with
/// [`BridgeError::TransportClosed`].
pub struct Endpoint {
    transport: Arc<Transport>,
    display: DisplayMode,
}

impl Endpoint {
    /// Attach an endpoint to an established byte stream.
    ///
    /// `namespace` becomes handle 0 of this side.
    pub fn attach<S>(
        bridge: &SyncBridge,
        stream: S,
        namespace: Namespace,
        options: EndpointOptions,
    ) -> Endpoint
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let display = DisplayMode::new(options.display());
        let table = Arc::new(ReferenceTable::new(namespace.into_root(display.clone())));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::new(outbound_tx, table, bridge.clone()));
        let dispatcher: Arc<dyn Dispatch> =
            Arc::new(Dispatcher::new(transport.clone(), display.clone()));

        let (reader, writer) = tokio::io::split(stream);
        let shutdown = bridge.shutdown_signal().clone();
        bridge.spawn(write_loop(writer, outbound_rx, transport.clone(), shutdown.clone()));
        bridge.spawn(read_loop(reader, transport.clone(), dispatcher, shutdown));

        Endpoint { transport, display }
    }

    /// Dial `addr` and attach an endpoint to the connection.
    pub fn connect(
        bridge: &SyncBridge,
        addr: SocketAddr,
        namespace: Namespace,
        options: EndpointOptions,
    ) -> Result<Endpoint> {
        let stream = bridge.block_on(async move {
            let stream = tokio::time::timeout(WireConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| BridgeError::Io {
                    message: format!("Connection to {} timed out", addr),
                    source: None,
                })?
                .map_err(|e| BridgeError::Io {
                    message: format!("Failed to connect to {}", addr),
                    source: Some(e),
                })?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })?;
        debug!("Connected to {}", addr);
        Ok(Self::attach(bridge, stream, namespace, options))
    }

    /// Proxy for the peer's namespace (its handle 0).
    pub fn root(&self) -> Proxy {
        Proxy::new(&self.transport, ProtocolConfig::ROOT_HANDLE, false)
    }

    /// Import a module on the peer.
    pub fn import(&self, name: &str) -> Result<Proxy> {
        match self.root().call_method("import", vec![Value::from(name)])? {
            Value::Remote(module) => Ok(module),
            other => Err(BridgeError::TypeError(format!(
                "import of '{}' returned {}",
                name,
                other.type_name()
            ))),
        }
    }

    /// Define a class on the peer that extends `bases` there and forwards
    /// `overridden` members to `local_half` here.
    ///
    /// Returns proxies for the new class and for its instance.
    pub fn extend_class(
        &self,
        name: &str,
        local_half: Value,
        bases: Vec<RemoteBase>,
        overridden: &[&str],
    ) -> Result<(Proxy, Proxy)> {
        let bases = bases
            .into_iter()
            .map(|base| {
                Value::list(vec![
                    Value::Remote(base.class),
                    Value::list(base.args),
                    Value::Map(Map::new(base.kwargs)),
                ])
            })
            .collect();
        let overridden = overridden.iter().map(|name| Value::from(*name)).collect();

        let (tag, value) = self.transport.request_blocking(
            Action::MakeClass,
            ProtocolConfig::ROOT_HANDLE,
            Vec::new(),
            vec![
                Value::from(name),
                local_half,
                Value::list(bases),
                Value::list(overridden),
            ],
            Kwargs::new(),
        )?;

        let pair = from_response(&self.transport, tag, value)?;
        let mut parts = pair.as_list().map(|list| list.snapshot()).unwrap_or_default().into_iter();
        match (parts.next(), parts.next()) {
            (Some(Value::Remote(class)), Some(Value::Remote(instance))) => Ok((class, instance)),
            _ => Err(BridgeError::invalid("makeClass did not return a class and instance")),
        }
    }

    /// This side's reference table.
    pub fn table(&self) -> &Arc<ReferenceTable> {
        self.transport.table()
    }

    pub fn display(&self) -> &DisplayMode {
        &self.display
    }

    pub fn bridge(&self) -> &SyncBridge {
        self.transport.bridge()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Close the connection. Pending requests fail with
    /// [`BridgeError::TransportClosed`].
    pub fn close(&self) {
        self.transport.close();
        self.table().clear();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(
    mut reader: R,
    transport: Arc<Transport>,
    dispatcher: Arc<dyn Dispatch>,
    shutdown: ShutdownSignal,
) where
    R: AsyncRead + Unpin + Send,
{
    let closed = transport.closed_signal().clone();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closed.wait() => break,
            _ = shutdown.wait() => break,
        };
        match frame {
            Ok(Some(payload)) => route(&payload, &transport, &dispatcher),
            Ok(None) => {
                debug!("Peer closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection read failed: {}", e);
                break;
            }
        }
    }
    transport.close();
}

fn route(payload: &[u8], transport: &Arc<Transport>, dispatcher: &Arc<dyn Dispatch>) {
    let envelope = match Envelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping undecodable frame: {}", e);
            return;
        }
    };
    let reply_to = envelope.reply_target();
    let correlation = envelope.pre.is_none().then_some(envelope.r).flatten();

    match Message::try_from(envelope) {
        Ok(Message::Request(request)) => {
            let transport = transport.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let response = dispatcher.dispatch(request).await;
                if transport.send(Message::Response(response)).is_err() {
                    debug!("Connection closed before a response could be sent");
                }
            });
        }
        Ok(Message::Response(response)) => transport.complete(response),
        Ok(Message::Pre { id, handles }) => transport.acknowledge(id, handles),
        Ok(Message::Free(handles)) => dispatcher.release(&handles),
        Err(e) => {
            warn!("Invalid message: {}", e);
            match (reply_to, correlation) {
                (Some(id), _) => {
                    let _ = transport.send(Message::Response(Response::error(id, e.to_string())));
                }
                // A malformed response still settles the request it answers.
                (None, Some(id)) => transport.fail(id, e.to_string()),
                (None, None) => {}
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    transport: Arc<Transport>,
    shutdown: ShutdownSignal,
) where
    W: AsyncWrite + Unpin + Send,
{
    let closed = transport.closed_signal().clone();
    loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = closed.wait() => break,
            _ = shutdown.wait() => break,
        };

        let (request_id, response_id) = match &message {
            Message::Request(request) => (Some(request.id), None),
            Message::Response(response) => (None, Some(response.id)),
            _ => (None, None),
        };
        let written = match message.encode() {
            Ok(payload) => write_frame(&mut writer, &payload).await,
            Err(e) => Err(e),
        };
        let Err(e) = written else { continue };

        if e.is_connection_fatal() {
            warn!("Connection write failed: {}", e);
            break;
        }
        // Frame rejected before any byte went out; the stream is intact.
        warn!("Dropping outbound message: {}", e);
        if let Some(id) = request_id {
            transport.complete(Response::error(id, e.to_string()));
        }
        if let Some(id) = response_id {
            let _ = transport.send(Message::Response(Response::error(id, e.to_string())));
        }
    }
    transport.close();
    let _ = writer.shutdown().await;
}

/// Handle to a running [`EndpointServer`]. Dropping it stops the server and
/// closes every connection it accepted.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and close all connections.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            // Aborting drops the accepted endpoints, which closes them.
            task.abort();
        }
    }
}

/// TCP listener that serves a fresh namespace to every connection.
pub struct EndpointServer;

impl EndpointServer {
    /// Bind `addr` (port 0 picks a free port) and start accepting.
    pub fn start<F>(
        bridge: &SyncBridge,
        addr: SocketAddr,
        make_namespace: F,
        options: EndpointOptions,
    ) -> Result<ServerHandle>
    where
        F: Fn() -> Namespace + Send + Sync + 'static,
    {
        let listener = bridge.block_on(async move { Ok(TcpListener::bind(addr).await?) })?;
        let addr = listener.local_addr()?;
        info!("Endpoint server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = bridge.spawn(accept_loop(
            listener,
            bridge.clone(),
            make_namespace,
            options,
            shutdown_rx,
        ));

        Ok(ServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Start on `WireConfig::DEFAULT_HOST:DEFAULT_PORT`.
    pub fn start_default<F>(
        bridge: &SyncBridge,
        make_namespace: F,
        options: EndpointOptions,
    ) -> Result<ServerHandle>
    where
        F: Fn() -> Namespace + Send + Sync + 'static,
    {
        let host: IpAddr = WireConfig::DEFAULT_HOST
            .parse()
            .map_err(|e| BridgeError::Other(format!("Invalid default host: {}", e)))?;
        Self::start(
            bridge,
            SocketAddr::new(host, WireConfig::DEFAULT_PORT),
            make_namespace,
            options,
        )
    }
}

async fn accept_loop<F>(
    listener: TcpListener,
    bridge: SyncBridge,
    make_namespace: F,
    options: EndpointOptions,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    F: Fn() -> Namespace + Send + Sync + 'static,
{
    let mut connections: Vec<Endpoint> = Vec::new();
    let runtime_shutdown = bridge.shutdown_signal().clone();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Endpoint server shutting down");
                break;
            }
            _ = runtime_shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    connections.retain(|endpoint| !endpoint.is_closed());
                    if connections.len() >= WireConfig::MAX_CONNECTIONS {
                        warn!(
                            "Rejecting connection from {}: at max capacity ({})",
                            peer_addr,
                            WireConfig::MAX_CONNECTIONS
                        );
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", peer_addr, e);
                    }
                    debug!("Connection from {}", peer_addr);
                    connections.push(Endpoint::attach(&bridge, stream, make_namespace(), options));
                }
                Err(e) => error!("Accept error: {}", e),
            },
        }
    }
    for endpoint in &connections {
        endpoint.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::IoRuntime;
    use crate::value::Module;

    fn pair(runtime: &IoRuntime, left: Namespace, right: Namespace) -> (Endpoint, Endpoint) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let bridge = runtime.bridge();
        (
            Endpoint::attach(&bridge, a, left, EndpointOptions::new()),
            Endpoint::attach(&bridge, b, right, EndpointOptions::new()),
        )
    }

    #[test]
    fn test_import_and_call() {
        let runtime = IoRuntime::start().unwrap();
        let math = Module::new("math").function("add", |args, _| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::Int(sum))
        });
        let (_server, client) = pair(&runtime, Namespace::new().with_module(math), Namespace::new());

        let math = client.import("math").unwrap();
        let sum = math.call_method("add", vec![2.into(), 3.into()]).unwrap();
        assert_eq!(sum.as_i64(), Some(5));
    }

    #[test]
    fn test_import_missing_module_is_remote_error() {
        let runtime = IoRuntime::start().unwrap();
        let (_server, client) = pair(&runtime, Namespace::new(), Namespace::new());
        let err = client.import("nope").unwrap_err();
        match err {
            BridgeError::RemoteError { message, .. } => {
                assert!(message.contains("No module named 'nope'"), "{}", message)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_close_fails_later_requests() {
        let runtime = IoRuntime::start().unwrap();
        let (server, client) = pair(&runtime, Namespace::new(), Namespace::new());
        let root = client.root();
        drop(server);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !client.is_closed() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(client.is_closed());
        assert!(matches!(root.get("import"), Err(BridgeError::TransportClosed)));
    }

    #[test]
    fn test_tcp_server_round_trip() {
        let runtime = IoRuntime::start().unwrap();
        let bridge = runtime.bridge();
        let server = EndpointServer::start(
            &bridge,
            "127.0.0.1:0".parse().unwrap(),
            || Namespace::new().with_value("greeting", "hello"),
            EndpointOptions::new(),
        )
        .unwrap();
        assert_ne!(server.port(), 0);

        let client = Endpoint::connect(&bridge, server.addr(), Namespace::new(), EndpointOptions::new()).unwrap();
        let greeting = client.root().get("greeting").unwrap();
        assert_eq!(greeting.as_str(), Some("hello"));
    }

    #[test]
    fn test_malformed_response_fails_its_request() {
        let runtime = IoRuntime::start().unwrap();
        let bridge = runtime.bridge();
        let (a, mut peer) = tokio::io::duplex(64 * 1024);
        let client = Endpoint::attach(&bridge, a, Namespace::new(), EndpointOptions::new());

        bridge.spawn(async move {
            let Ok(Some(payload)) = read_frame(&mut peer).await else {
                return;
            };
            let Ok(request) = Envelope::decode(&payload) else {
                return;
            };
            let reply = serde_json::json!({"r": request.r, "key": "bogus", "val": 1});
            let _ = write_frame(&mut peer, reply.to_string().as_bytes()).await;
            // Keep the stream open so only the reply can settle the request.
            let _ = read_frame(&mut peer).await;
        });

        match client.root().get("x") {
            Err(BridgeError::RemoteError { message, .. }) => {
                assert!(message.contains("bogus"), "{}", message)
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!client.is_closed());
    }
}
