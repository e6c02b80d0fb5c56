//! Core types for keeping agent approval state in sync across clients.
//!
//! This crate provides the fundamental building blocks:
//! - `PendingAction` / `ActionStatus` - The approval model
//! - `ActionStore` - Identity-keyed, insertion-ordered view with change stream
//! - `SyncError` - Error taxonomy for the control connection
//! - `SyncConfig` - Client configuration
//! - `CursorStore` and `ActionSource` traits

pub mod action;
pub mod action_store;
pub mod config;
pub mod error;
pub mod state;
pub mod traits;

pub use action::{ActionId, ActionStatus, BatchItemResult, BatchOutcome, PendingAction, TrackedAction};
pub use action_store::{ActionChange, ActionStore, Merge};
pub use config::{ConfigError, SyncConfig};
pub use error::{Result, SyncError};
pub use state::ConnectionState;
pub use traits::{ActionSource, CursorStore, SessionId, SourceError, StorageError};
