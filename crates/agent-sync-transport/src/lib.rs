//! Realtime control channel for agent sync clients.
//!
//! Provides:
//! - Wire protocol (JSON frames tagged by `type`)
//! - `ConnectionManager` - lazy connect, heartbeat, capped backoff reconnect
//! - `Correlator` - request/response matching with deadlines
//! - `Registry` - per-session and global event fan-out
//! - WebSocket connector (feature: websocket)

pub mod connection;
pub mod connector;
pub mod correlator;
pub mod fanout;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{ConnectionManager, reconnect_delay};
pub use connector::{Connector, TransportParts};
pub use correlator::{Correlator, ProgressHandler, RequestId, RequestTable};
pub use fanout::{Handler, Registry, Subscription};
pub use protocol::{ActionEvent, ClientMessage, Command, CommandKind, Envelope};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
