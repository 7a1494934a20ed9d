//! # Match Channel
//!
//! Everything websocket: the wire protocol (`events`), the in-process
//! connection registry (`manager`) and the per-connection runtime (`pvp`).

pub mod events;
pub mod manager;
pub mod pvp;

pub use events::{ClientMessage, ErrorCode, ServerEvent};
pub use manager::{ConnectionRegistry, EventSink, SinkClosed};
pub use pvp::{finalize_and_broadcast, match_channel};
