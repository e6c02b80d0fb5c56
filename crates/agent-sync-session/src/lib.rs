//! Session replay for agent sync clients.
//!
//! Provides:
//! - `ReplayTracker` - Per-session cursors and the resume handshake
//! - Cursor storage implementations (memory, JSON file)

pub mod replay;
pub mod storage;

pub use replay::{ReplayError, ReplayTracker};

#[cfg(feature = "memory")]
pub use storage::MemoryCursorStore;

#[cfg(feature = "file")]
pub use storage::FileCursorStore;
