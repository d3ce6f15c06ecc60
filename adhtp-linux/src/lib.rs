//! Ad-hoc peer sync on Linux: socket setup, the readiness dispatcher and the `Network`
//! facade the game loop drives.

pub mod config;
pub mod dispatcher;
pub mod net;
pub mod transport;

pub use config::{ConfigError, Endpoints, NetConfig};
pub use dispatcher::{DispatchError, DispatchEvent, Dispatcher};
pub use net::{BroadcastKind, NetError, Network};
pub use transport::{Transport, TransportError};
