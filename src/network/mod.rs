//! Network Layer: connection bootstrap and message delivery
//!
//! Menggunakan mio untuk non-blocking I/O (epoll/kqueue), satu `Poll` per
//! worker thread.
//!
//! Alur koneksi:
//! 1. Resolve alamat bus, connect socket di thread pemanggil
//! 2. Serahkan channel ke worker dengan pembacaan masih mati
//! 3. Pasang authenticator, nyalakan pembacaan, jalankan handshake SASL
//! 4. Lepas authenticator, pasang stage pesan, selesaikan connect

mod address;
mod auth;
mod channel;
mod completion;
mod connection;
mod connector;
mod dispatch;
mod pipeline;
mod transport;
mod worker;

pub use address::{parse_address, parse_addresses, BusAddress, UnixAddress};
pub use auth::{Authenticator, MAX_LINE_LENGTH};
pub use completion::PendingConnection;
pub use connection::{Connection, ConnectionState};
pub use connector::Connector;
pub use dispatch::{Discard, MessageConsumer, MessageStage, SwappableConsumer};
pub use pipeline::{Inbound, Pipeline, Stage, StageContext, StageEvent, WireTap};
