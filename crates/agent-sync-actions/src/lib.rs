//! Pending-action reconciliation for agent sync clients.
//!
//! Provides:
//! - `Reconciler` - One identity-keyed merge for inline, broadcast and sync reports
//! - `FallbackPoller` - Polls the action source while the connection is down
//! - `RestActionSource` - HTTP client for the authoritative action ledger
//! - `ControlPlane` - All of the above wired to one connection

pub mod control_plane;
pub mod poller;
pub mod reconciler;
pub mod rest;

pub use control_plane::{ControlPlane, ControlPlaneBuilder};
pub use poller::{FallbackPoller, PollOutcome};
pub use reconciler::{ActionUpdate, Origin, Reconciler};
pub use rest::RestActionSource;
