//! Wire protocol and the outbound half of a connection.
//!
//! # Architecture
//!
//! ```text
//! Endpoint A                                     Endpoint B
//! ┌──────────────┐   length-prefixed JSON    ┌──────────────┐
//! │ Transport    │ ────── requests ───────▶  │ Dispatcher   │
//! │ (pending ids)│ ◀───── responses ───────  │ (table)      │
//! │ Dispatcher   │ ◀───── requests ────────  │ Transport    │
//! └──────────────┘ ────── responses ──────▶  └──────────────┘
//! ```
//!
//! Both directions share one stream. Each frame is a 4-byte big-endian
//! length followed by a JSON envelope; see [`protocol`].

pub mod protocol;
pub mod transport;

pub use protocol::{Action, Envelope, Message, Request, Response, Tag};
pub use transport::Transport;
