//! PROXY Protocol Listener
//!
//! Accepts TCP connections, strips an HAProxy PROXY protocol v1/v2 header sent
//! by trusted load balancers, and exposes the original client address while
//! delivering the rest of the stream untouched.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod header;
pub mod listener;
pub mod relay;
pub mod security;
pub mod stream;

#[cfg(test)]
mod test_util;

// Re-export commonly used types and functions
pub use acceptor::ProxyAcceptor;
pub use config::{Config, ListenConfig, ProxyProtocolConfig, SendProxy, TargetConfig, load_config};
pub use error::{ConfigError, Error};
pub use header::{Header, OriginalEndpoint, ProtocolVersion};
pub use listener::ProxyProtocolListener;
pub use relay::handle_connection;
pub use security::AllowList;
pub use stream::{ProxyStream, Transport};
