//! Core abstractions shared by every termhub component.
//!
//! This crate provides the fundamental building blocks:
//! - `ControlDir` - Layout of the on-disk control directory
//! - `SessionMetadata` - Parsed `session.json` contents
//! - `ShutdownState` - Process-wide shutdown flag, passed explicitly
//! - `PtyManager` - Collaborator trait for session existence checks

pub mod control_dir;
pub mod shutdown;
pub mod traits;

pub use control_dir::{ControlDir, SessionMetadata};
pub use shutdown::ShutdownState;
pub use traits::{PtyManager, SessionError, SessionId};
