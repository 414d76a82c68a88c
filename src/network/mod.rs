//! Connection-level building blocks.
//!
//! This module implements the per-connection machinery of the framework:
//!
//! - `Session`: the actor owning one accepted stream, its four bounded
//!   queues, and the two tasks (receiver and multiplexer) that drive it
//! - `Handler`: the application-supplied callback contract
//! - `BufferPool`: recycled read buffers shared by all sessions
//!
//! The framing protocol is a fixed-size header followed by a
//! variable-length body; the handler alone decides the body length from the
//! header bytes, keeping the engine protocol-agnostic.

pub use buffer_pool::{BufferPool, DEFAULT_BUFFER_LEN};
pub use handler::{Handler, IpcMessage};
pub use session::Session;
pub(crate) use session::SessionContext;

mod buffer_pool;
mod handler;
mod receiver;
mod session;
