pub mod codec;
pub mod config;
pub mod server;
pub mod session;
pub mod table;
pub mod tunnel;


pub use codec::{Atyp, Cmd, CodecError, Header, InitBody};
pub use config::{Config, ConfigError};
pub use table::SessionTable;

/// Error returned by most functions.
///
/// As with most binary protocol servers, the hot path (frame codec,
/// session state machine) uses its own narrow error enums so a single bad
/// peer never forces an allocation-heavy error path. This boxed type is
/// reserved for the outer layers: listener setup, config loading, and
/// anything propagated out of `main`.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for tunnel server operations.
pub type Result<T> = std::result::Result<T, Error>;
