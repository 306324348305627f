//! RPC Messenger Runtime
//!
//! Transport runtime for cluster RPC: a messenger multiplexes TCP connections
//! over a small fixed pool of single-threaded reactors, dispatches inbound
//! calls to registered services, tracks outbound calls to exactly one terminal
//! outcome and schedules cancellable delayed tasks.
//!
//! Payloads are opaque [`bytes::Bytes`]; request and response schemas belong
//! to the services built on top.

pub(crate) mod acceptor;
pub mod call;
pub mod config;
pub mod error;
pub mod frame;
pub mod latch;
pub mod messenger;
pub mod metrics;
pub(crate) mod reactor;
pub mod scheduler;
pub mod service;

// Re-export commonly used types
pub use call::{
    CallState, ConnectionId, InboundCall, OutboundCall, OutboundCallPtr, RemoteMethod,
    RpcCallInProgress, RpcConnectionDump, RunningRpcsDump,
};
pub use config::MessengerConfig;
pub use error::{ErrorCode, Result, RpcError};
pub use latch::CountDownLatch;
pub use messenger::{route_to_reactor, Messenger, MessengerBuilder, ServerEventListener};
pub use metrics::{MessengerMetrics, MetricsSnapshot};
pub use scheduler::{IoThreadPool, ScheduledTaskId, Scheduler};
pub use service::{RpcService, ServiceRegistry};

// Constants for configuration
pub const DEFAULT_NUM_REACTORS: usize = 4;
pub const DEFAULT_KEEPALIVE_MS: u64 = 65_000;
pub const DEFAULT_CONNECTIONS_TO_SERVER: usize = 8;
