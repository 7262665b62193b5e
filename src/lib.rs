//! Native rust implementation of the D-Bus wire protocol and session
//! engine.  Supports TCP and UDS transports, the EXTERNAL,
//! DBUS_COOKIE_SHA1 and ANONYMOUS authentication mechanisms, method calls
//! with reply correlation, signal routing with refcounted match rules,
//! introspection-driven proxies and service export.
//!
//! The layering follows the wire: [`signature`] parses type strings,
//! [`marshal`] and [`demarshal`] move value trees through the wire format,
//! [`message`] frames whole messages, [`connection`] owns an authenticated
//! stream, and [`session`] multiplexes it into calls, replies and signals.

pub mod address;
pub mod auth;
pub mod connection;
pub mod demarshal;
pub mod introspect;
pub mod marshal;
pub mod message;
pub mod service;
pub mod session;
pub mod signature;
pub mod types;

pub use connection::{Connection, Error, Transport};
pub use message::{DBusError, Message, MessageType};
pub use service::{Access, InterfaceDescription, InterfaceHandler};
pub use session::{Proxy, ProxyInterface, Session, SessionConfig, SubscriptionId};
pub use types::{BasicValue, Value};
