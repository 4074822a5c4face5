//! Centralized configuration for the bridge.
//!
//! Wire limits, protocol constants and runtime parameters live here as
//! associated constants. Per-endpoint switches are in [`EndpointOptions`].

use std::time::Duration;

/// Wire and socket configuration.
pub struct WireConfig;

impl WireConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8768;
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 64;
}

/// Protocol-level constants shared by both endpoints.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Handle of the capability namespace. Never freed.
    pub const ROOT_HANDLE: u64 = 0;
    /// Value returned by the `Iterate` helper once the sequence is exhausted.
    pub const STOP_ITERATION: &'static str = "$$STOPITER";
    /// Member names with this prefix skip class bridge interception.
    pub const BYPASS_PREFIX: &'static str = "~~";
    /// Maximum nesting when materializing or encoding structured values.
    pub const MAX_VALUE_DEPTH: usize = 100;
}

/// I/O runtime configuration.
pub struct RuntimeConfig;

impl RuntimeConfig {
    pub const THREAD_NAME: &'static str = "tandem-io";
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
}

/// Options for a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointOptions {
    display: bool,
}

impl EndpointOptions {
    /// Create options with the defaults.
    pub fn new() -> Self {
        Self { display: true }
    }

    /// Attach human-readable signatures to referenced values in responses.
    ///
    /// The peer can flip this later through the `sendInspect` capability.
    ///
    /// Default: `true`
    pub fn with_display(mut self, enable: bool) -> Self {
        self.display = enable;
        self
    }

    pub fn display(&self) -> bool {
        self.display
    }
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self::new()
    }
}
