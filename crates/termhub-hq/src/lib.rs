//! Distributed routing between HQ and its Remotes.
//!
//! Provides:
//! - `RemoteRegistry` - HQ's map of remotes, their sessions and health
//! - `HqClient` - A Remote's registration handle with HQ
//! - `ControlDirWatcher` - Session discovery from the control directory

pub mod client;
pub mod registry;
pub mod watcher;

pub use client::{HqClient, HqError, SessionAction};
pub use registry::{
    HealthCheckConfig, RegistryError, RegistryEvent, RemoteRegistration, RemoteRegistry,
    RemoteServer,
};
pub use watcher::{
    ChangeOutcome, ControlDirWatcher, SessionChange, WatcherConfig, WatcherError, WatcherMode,
};
