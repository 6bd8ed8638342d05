//! bellhop
//!
//! Composable request brokers and an origin-keyed connection cache for
//! outbound HTTP.
//!
//! A request travels down a chain of brokers at three altitudes: a
//! [`RequestBroker`] dispatches request heads, a [`ConnectionBroker`]
//! supplies live framed connections, and a [`StreamBroker`] produces
//! connected byte streams (plain TCP, TLS, or a proxy tunnel). The
//! [`broker::ConnectionCache`] in the middle keeps fan-out per origin
//! bounded and reuses idle or pipelinable connections transparently.
//!
//! [`broker::default_request_broker`] wires up the canonical pipeline;
//! [`broker::MockConnectionBroker`] swaps the network out for in-memory
//! pipes in tests.

pub mod broker;
pub mod conn;
mod dns;
pub mod error;
mod signal;
pub mod stream;
pub mod uri;

pub use broker::{
    default_request_broker, BrokerOptions, Brokers, ConnectionBroker, RequestBroker, StreamBroker,
};
pub use conn::{ClientConnection, ClientRequest, RequestHead, ResponseHead};
pub use error::Error;
