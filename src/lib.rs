//! dbuslink - message bus client core
//!
//! Crate ini dibagi menjadi empat layer:
//! - [`protocol`]: type signature, aligned cursor, marshalling nilai, framing pesan
//! - [`network`]: parsing alamat, transport, handshake SASL, event loop worker
//! - [`binder`]: pemetaan bertipe antara nilai Rust dan nilai wire
//! - [`core`]: building block bersama (memoizing cache)
//!
//! ```no_run
//! use dbuslink::{Connector, Message};
//!
//! # fn main() -> dbuslink::Result<()> {
//! let connector = Connector::new()?;
//! let connection = connector.connect("unix:path=/run/dbus/system_bus_socket")?.wait()?;
//! let hello = Message::method_call(
//!     Some("org.freedesktop.DBus"),
//!     "/org/freedesktop/DBus",
//!     Some("org.freedesktop.DBus"),
//!     "Hello",
//! )?;
//! connection.send(&hello)?;
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::ConnectorConfig;
pub use error::{AddressError, BinderError, CodecError, Error, Result, SignatureError};
pub use network::{
    BusAddress, Connection, ConnectionState, Connector, MessageConsumer, PendingConnection,
};
pub use protocol::{BasicType, DbusValue, Message, MessageType, TypeSignature};
