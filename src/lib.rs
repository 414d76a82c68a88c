//! A generic TCP connection server framework.
//!
//! `frameserver` accepts inbound streams, frames requests with a fixed-size
//! header followed by a variable-length body, and dispatches parsed requests
//! to an application-supplied [`Handler`]. Each connection is driven by two
//! cooperating tasks — a receiver running the framing state machine and a
//! multiplexer serializing all handler callbacks and outbound writes — so
//! handlers see strictly sequential calls per connection while connections
//! run fully concurrently.
//!
//! The body length of every request is derived from its header by the
//! handler, keeping the engine protocol-agnostic. Outbound writes and
//! internal messages are queued; a connection whose queues stay full is
//! evicted instead of buffered without bound. [`Server::stop`] tears
//! everything down gracefully and returns only when no connection task
//! remains.

mod network;
mod service;

pub use network::{BufferPool, Handler, IpcMessage, Session, DEFAULT_BUFFER_LEN};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, LogGuard, Server, ServerConfig,
    SessionRegistry, Shutdown,
};
