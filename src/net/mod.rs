//! Connections, pools, and the primitives they share.

pub mod cancel;
pub mod connection;
pub mod pool;

use std::fmt;

pub use cancel::CancelToken;
pub use connection::{
    CompletionReceiver, CompletionSender, Connection, ConnectionFactory, ConnectionInitializer,
    NoopInitializer, TcpConnectionFactory, completion_channel,
};
pub use pool::{ConnectionPool, PoolFreeze, SendRequest};

/// Network endpoint a connection targets, as "host:port".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<String> for Endpoint {
    fn from(addr: String) -> Self {
        Self::new(addr)
    }
}
