//! Dedicated I/O runtime and the synchronous bridge onto it.
//!
//! All socket I/O, routing and response delivery run on one
//! single-threaded Tokio runtime owned by a named OS thread. Application
//! threads reach it through a [`SyncBridge`]: `block_on` submits a future
//! and parks the caller on a std channel until the result is back. Calling
//! `block_on` from the runtime thread itself would stall the reader that
//! must deliver the response, so it fails with
//! [`BridgeError::SchedulerReentry`] instead.

use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result};
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::thread::{JoinHandle, ThreadId};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Owner of the I/O runtime thread. Dropping it shuts the runtime down.
pub struct IoRuntime {
    bridge: SyncBridge,
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IoRuntime {
    /// Spawn the runtime thread and wait until it is ready.
    pub fn start() -> Result<Self> {
        let shutdown = ShutdownSignal::new();
        let (init_tx, init_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let signal = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(RuntimeConfig::THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async move {
                    // A dropped sender counts as a stop request.
                    let _ = stop_rx.await;
                    signal.trigger();
                    tokio::task::yield_now().await;
                });
                runtime.shutdown_timeout(RuntimeConfig::SHUTDOWN_GRACE);
                debug!("I/O runtime stopped");
            })
            .map_err(|e| BridgeError::Io {
                message: "Failed to spawn I/O runtime thread".to_string(),
                source: Some(e),
            })?;

        let handle = match init_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(BridgeError::Io {
                    message: "Failed to build I/O runtime".to_string(),
                    source: Some(e),
                })
            }
            Err(_) => {
                return Err(BridgeError::Other(
                    "I/O runtime thread exited during startup".to_string(),
                ))
            }
        };

        info!("I/O runtime started on thread '{}'", RuntimeConfig::THREAD_NAME);
        Ok(Self {
            bridge: SyncBridge {
                handle,
                thread: thread.thread().id(),
                shutdown,
            },
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn bridge(&self) -> SyncBridge {
        self.bridge.clone()
    }

    /// Stop the runtime and wait for its thread.
    ///
    /// Blocked callers and in-flight requests fail with
    /// [`BridgeError::Shutdown`]. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            // Joining from the runtime thread would deadlock.
            if std::thread::current().id() == thread.thread().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("I/O runtime thread panicked");
            }
        }
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable access to the I/O runtime from any thread.
#[derive(Clone)]
pub struct SyncBridge {
    handle: Handle,
    thread: ThreadId,
    shutdown: ShutdownSignal,
}

impl SyncBridge {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Fires when the runtime begins shutting down.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Whether the current thread is the runtime thread.
    pub fn is_scheduler_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// Run `future` on the runtime and block until it finishes.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::SchedulerReentry`] when called on the runtime thread
    /// - [`BridgeError::Shutdown`] when the runtime stops first
    pub fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_scheduler_thread() {
            return Err(BridgeError::SchedulerReentry);
        }
        self.shutdown.check()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let shutdown = self.shutdown.clone();
        self.handle.spawn(async move {
            let result = tokio::select! {
                result = future => result,
                _ = shutdown.wait() => Err(BridgeError::Shutdown),
            };
            let _ = tx.send(result);
        });

        // The sender is dropped without a value if the runtime discards the task.
        rx.recv().map_err(|_| BridgeError::Shutdown)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_block_on_returns_result() {
        let runtime = IoRuntime::start().unwrap();
        let value = runtime.bridge().block_on(async { Ok(21 * 2) }).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_block_on_from_runtime_thread_is_rejected() {
        let runtime = IoRuntime::start().unwrap();
        let bridge = runtime.bridge();
        let inner = bridge.clone();
        let result = bridge
            .block_on(async move {
                let nested = inner.block_on(async { Ok(()) });
                Ok(matches!(nested, Err(BridgeError::SchedulerReentry)))
            })
            .unwrap();
        assert!(result);
    }

    #[test]
    fn test_blocking_pool_may_block_on() {
        let runtime = IoRuntime::start().unwrap();
        let bridge = runtime.bridge();
        let inner = bridge.clone();
        let value = bridge
            .block_on(async move {
                tokio::task::spawn_blocking(move || inner.block_on(async { Ok(7) }))
                    .await
                    .map_err(|e| BridgeError::Other(e.to_string()))?
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_shutdown_fails_blocked_callers() {
        let mut runtime = IoRuntime::start().unwrap();
        let bridge = runtime.bridge();

        let waiter = std::thread::spawn(move || {
            bridge.block_on(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        runtime.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(BridgeError::Shutdown)));
        assert!(matches!(
            runtime.bridge().block_on(async { Ok(()) }),
            Err(BridgeError::Shutdown)
        ));
    }
}
