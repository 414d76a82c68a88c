use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::Session;
use crate::AppResult;

/// An application-originated message injected into a session's event stream
/// outside the wire protocol.
pub type IpcMessage = Box<dyn Any + Send>;

/// Objects implementing `Handler` are registered with a [`Server`] to handle
/// client requests.
///
/// `on_connected` and `on_closed` are called once per accepted connection,
/// and every other callback is called between those two, which allows for
/// straightforward resource management in handler implementations. All
/// callbacks for one connection are invoked sequentially from that
/// connection's multiplexer task; callbacks for different connections run
/// concurrently.
///
/// Header and body slices are borrowed: the backing buffer is recycled after
/// the callback returns, so implementations must copy anything they need to
/// retain.
///
/// Returning an error from any callback closes the connection.
///
/// [`Server`]: crate::Server
pub trait Handler: Send + Sync + 'static {
    /// Called when a connection is made. The session argument represents the
    /// connection; store a clone of the `Arc` if you need it later.
    fn on_connected(&self, session: &Arc<Session>, peer_addr: SocketAddr) -> AppResult<()>;

    /// Called when a request header has been read. Returns the size of the
    /// request body that follows; the framing reader reads exactly that many
    /// bytes before the next header.
    fn on_request_header(&self, session: &Arc<Session>, header: &[u8]) -> AppResult<usize>;

    /// Called when a request body has been read. The slice length equals the
    /// value returned by the preceding `on_request_header` call.
    fn on_request_body(&self, session: &Arc<Session>, body: &[u8]) -> AppResult<()>;

    /// Called when an internal message sent via [`Session::send_ipc`] is
    /// dequeued.
    fn on_ipc(&self, session: &Arc<Session>, message: IpcMessage) -> AppResult<()>;

    /// Called exactly once when the connection is lost or closed.
    fn on_closed(&self, session: &Arc<Session>);
}
