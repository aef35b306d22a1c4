//! Line-protocol front ends. Both parse one request line, hand it to the
//! shared [`crate::router::RequestRouter`], and answer with one response line.
//!
//! - [`tcp`]: a connection carries any number of newline-terminated requests.
//! - [`udp`]: one datagram is one request, answered with one datagram.
//!
//! Request handling runs on a [`crate::pool::WorkerPool`]; a bad request or a
//! broken connection only affects itself, never the listener.

use std::time::Duration;

use crate::pool::PoolConfig;

pub mod tcp;
pub mod udp;

pub use tcp::TcpGateway;
pub use udp::UdpGateway;

/// How long a stopping gateway waits for in-flight requests.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn tcp_defaults() -> Self {
        Self {
            pool: PoolConfig {
                idle_timeout: Duration::from_secs(30),
                ..PoolConfig::default()
            },
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn udp_defaults() -> Self {
        Self {
            pool: PoolConfig {
                idle_timeout: Duration::from_secs(60),
                ..PoolConfig::default()
            },
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
