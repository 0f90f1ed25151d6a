//! Terminal buffer engine.
//!
//! Provides:
//! - `TerminalManager` - One headless terminal per session, fed from its transcript
//! - `FlowControl` - Watermark-driven backpressure between reader and emulator
//! - `encode_snapshot` / `decode_snapshot` - Compact binary screen encoding

pub mod codec;
pub mod emulator;
pub mod flow;
pub mod manager;
pub mod snapshot;
pub mod stream;

pub use codec::{DecodeError, decode_snapshot, encode_snapshot};
pub use flow::{FlowControl, FlowControlConfig, FlowStats};
pub use manager::{BufferConfig, BufferError, BufferStats, BufferSubscription, SessionTerminal, TerminalManager};
pub use snapshot::{BufferCell, BufferSnapshot, Color};
pub use stream::{StreamError, TranscriptRecord};
