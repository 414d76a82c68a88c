use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::network::buffer_pool::BufferPool;
use crate::network::receiver::Receiver;
use crate::network::{Handler, IpcMessage};
use crate::service::SessionRegistry;
use crate::ServerConfig;
use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a new session needs from its server: configuration, the
/// application handler, the live-session registry, and the shared buffer
/// pool.
pub(crate) struct SessionContext {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) pool: Arc<BufferPool>,
}

/// The actor owning one accepted connection for its entire lifetime.
///
/// A session runs two cooperating tasks: a receiver driving the framing
/// state machine against the stream, and a multiplexer serializing all
/// handler callbacks and outbound writes. The `Session` value itself is the
/// handle exposed to handlers and the application; it holds only the
/// thread-safe entry points into the multiplexer.
#[derive(Debug)]
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    out_tx: mpsc::Sender<Bytes>,
    ipc_tx: mpsc::Sender<IpcMessage>,
    cancel: CancellationToken,
}

impl Session {
    /// Registers a new session and spawns its receiver and multiplexer
    /// tasks. The session enters the registry before either task starts.
    pub(crate) fn spawn<S>(
        stream: S,
        peer_addr: SocketAddr,
        ctx: Arc<SessionContext>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(ctx.config.out_queue_size);
        let (ipc_tx, ipc_rx) = mpsc::channel(ctx.config.ipc_queue_size);
        let (head_tx, head_rx) = mpsc::channel(1);
        let (body_tx, body_rx) = mpsc::channel(1);
        let (len_tx, len_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let session = Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            out_tx,
            ipc_tx,
            cancel: cancel.clone(),
        });
        ctx.registry.insert(session.clone());

        let (read_half, write_half) = tokio::io::split(stream);

        let receiver = Receiver {
            session_id: session.id,
            reader: BufReader::new(read_half),
            header_bytes: ctx.config.header_bytes,
            read_timeout: ctx.config.read_timeout(),
            max_body_size: ctx.config.max_body_size,
            pool: ctx.pool.clone(),
            cancel: cancel.clone(),
            head_tx,
            body_tx,
            len_rx,
        };
        let multiplexer = Multiplexer {
            session: session.clone(),
            handler: ctx.handler.clone(),
            registry: ctx.registry.clone(),
            pool: ctx.pool.clone(),
            writer: BufWriter::new(write_half),
            write_timeout: ctx.config.write_timeout(),
            head_rx,
            body_rx,
            ipc_rx,
            out_rx,
            len_tx,
            cancel,
            _shutdown_complete_tx: shutdown_complete_tx,
        };

        tokio::spawn(receiver.run());
        tokio::spawn(multiplexer.run());

        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Copies `data` and enqueues it for asynchronous writing, returning the
    /// number of bytes accepted. If the outgoing queue is full the session
    /// is closed and a queue-full error is returned: a connection that
    /// cannot drain its output is dropped rather than buffered without
    /// bound.
    ///
    /// Non-blocking and safe to call from any task, including concurrently
    /// with the multiplexer.
    pub fn write(&self, data: &[u8]) -> AppResult<usize> {
        if self.cancel.is_cancelled() {
            return Err(AppError::ConnectionClosed);
        }
        match self.out_tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => {
                // slow consumer
                self.close();
                Err(AppError::QueueFull("outgoing"))
            }
            Err(TrySendError::Closed(_)) => Err(AppError::ConnectionClosed),
        }
    }

    /// Enqueues an internal message for delivery to [`Handler::on_ipc`],
    /// with the same full-queue eviction contract as [`Session::write`].
    pub fn send_ipc(&self, message: IpcMessage) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::ConnectionClosed);
        }
        match self.ipc_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.close();
                Err(AppError::QueueFull("ipc"))
            }
            Err(TrySendError::Closed(_)) => Err(AppError::ConnectionClosed),
        }
    }

    /// Closes the connection. Idempotent; unblocks any in-flight read or
    /// write, after which both session tasks unwind through their normal
    /// exit paths and `on_closed` fires exactly once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The single task per session that executes all handler callbacks and all
/// stream writes, guaranteeing the handler never observes concurrent calls
/// for the same connection.
struct Multiplexer<S> {
    session: Arc<Session>,
    handler: Arc<dyn Handler>,
    registry: Arc<SessionRegistry>,
    pool: Arc<BufferPool>,
    writer: BufWriter<WriteHalf<S>>,
    write_timeout: Option<Duration>,
    head_rx: mpsc::Receiver<BytesMut>,
    body_rx: mpsc::Receiver<BytesMut>,
    ipc_rx: mpsc::Receiver<IpcMessage>,
    out_rx: mpsc::Receiver<Bytes>,
    len_tx: mpsc::Sender<usize>,
    cancel: CancellationToken,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<S> Multiplexer<S>
where
    S: AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        let connected = catch_handler_panic(|| {
            self.handler
                .on_connected(&self.session, self.session.peer_addr())
        });
        let result = match connected {
            Ok(()) => self.event_loop().await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => debug!("session {} closed", self.session.id()),
            Err(e) => warn!("session {} terminated: {}", self.session.id(), e),
        }
        self.finish().await;
    }

    /// Blocks until one of the four event sources is ready. Polling is
    /// biased, with the body queue ahead of the header queue: a buffered
    /// body belongs to the request before any buffered header, so the two
    /// callbacks of one request are never split by the header of the next.
    /// The length handshake admits at most one header and one body at a
    /// time, leaving the remaining sources a turn between frames.
    async fn event_loop(&mut self) -> AppResult<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                maybe_body = self.body_rx.recv() => match maybe_body {
                    Some(body) => self.handle_body(body)?,
                    None => {
                        self.drain_pending();
                        return Ok(());
                    }
                },
                maybe_head = self.head_rx.recv() => match maybe_head {
                    Some(head) => self.handle_header(head)?,
                    None => {
                        self.drain_pending();
                        return Ok(());
                    }
                },
                maybe_ipc = self.ipc_rx.recv() => match maybe_ipc {
                    Some(message) => self.handle_ipc(message)?,
                    None => return Ok(()),
                },
                maybe_out = self.out_rx.recv() => match maybe_out {
                    Some(data) => self.write_outgoing(data).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    fn handle_header(&mut self, head: BytesMut) -> AppResult<()> {
        let body_len =
            catch_handler_panic(|| self.handler.on_request_header(&self.session, &head))?;
        self.pool.release(head);
        match self.len_tx.try_send(body_len) {
            Ok(()) => Ok(()),
            // receiver already exited; the connection is coming down
            Err(TrySendError::Closed(_)) => Err(AppError::ConnectionClosed),
            // the receiver consumes the slot before sending the next header
            Err(TrySendError::Full(_)) => Err(AppError::IllegalState(
                "body length slot already occupied".into(),
            )),
        }
    }

    fn handle_body(&mut self, body: BytesMut) -> AppResult<()> {
        catch_handler_panic(|| self.handler.on_request_body(&self.session, &body))?;
        self.pool.release(body);
        Ok(())
    }

    fn handle_ipc(&mut self, message: IpcMessage) -> AppResult<()> {
        catch_handler_panic(|| self.handler.on_ipc(&self.session, message))
    }

    async fn write_outgoing(&mut self, data: Bytes) -> AppResult<()> {
        let limit = self.write_timeout;
        let io = async {
            self.writer.write_all(&data).await?;
            self.writer.flush().await
        };
        match limit {
            Some(limit) => time::timeout(limit, io)
                .await
                .map_err(|_| AppError::Timeout("write"))??,
            None => io.await?,
        }
        Ok(())
    }

    /// Delivers events still buffered in the incoming queues after the
    /// receiver has exited. A buffered body always belongs to a header that
    /// was already processed, so body events are drained first.
    fn drain_pending(&mut self) {
        while let Ok(body) = self.body_rx.try_recv() {
            if self.handle_body(body).is_err() {
                return;
            }
        }
        while let Ok(head) = self.head_rx.try_recv() {
            if self.handle_header(head).is_err() {
                return;
            }
        }
    }

    async fn finish(&mut self) {
        self.session.close();
        let _ = self.writer.shutdown().await;
        self.registry.remove(self.session.id());
        let _ = catch_handler_panic(|| {
            self.handler.on_closed(&self.session);
            Ok(())
        });
        // _shutdown_complete_tx drops with self, releasing Server::stop
    }
}

/// Runs a handler callback behind an unwind boundary. A panicking handler
/// terminates its own connection only: the payload is logged with a
/// backtrace and converted into a connection-terminating error.
fn catch_handler_panic<T>(f: impl FnOnce() -> AppResult<T>) -> AppResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(res) => res,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                "handler panicked: {}\n{}",
                message,
                Backtrace::force_capture()
            );
            Err(AppError::HandlerPanic(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseEcho;

    impl Handler for UppercaseEcho {
        fn on_connected(&self, _session: &Arc<Session>, _peer_addr: SocketAddr) -> AppResult<()> {
            Ok(())
        }

        fn on_request_header(&self, _session: &Arc<Session>, header: &[u8]) -> AppResult<usize> {
            Ok(header[0] as usize)
        }

        fn on_request_body(&self, session: &Arc<Session>, body: &[u8]) -> AppResult<()> {
            let reply = body.to_ascii_uppercase();
            session.write(&reply)?;
            Ok(())
        }

        fn on_ipc(&self, _session: &Arc<Session>, _message: IpcMessage) -> AppResult<()> {
            Ok(())
        }

        fn on_closed(&self, _session: &Arc<Session>) {}
    }

    // The session layer only needs a duplex byte stream, not a TCP socket.
    #[tokio::test]
    async fn session_runs_over_an_in_memory_stream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut client, server_side) = tokio::io::duplex(256);
        let ctx = Arc::new(SessionContext {
            config: ServerConfig::new("unused", 1),
            handler: Arc::new(UppercaseEcho),
            registry: Arc::new(SessionRegistry::new()),
            pool: Arc::new(BufferPool::new()),
        });
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        let session = Session::spawn(
            server_side,
            "127.0.0.1:0".parse().unwrap(),
            ctx.clone(),
            shutdown_complete_tx,
        );
        assert_eq!(ctx.registry.count(), 1);

        client.write_all(&[5u8]).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HELLO");

        session.close();
        assert!(shutdown_complete_rx.recv().await.is_none());
        assert_eq!(ctx.registry.count(), 0);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("kaboom")), "kaboom");
        assert_eq!(panic_message(&42usize), "unknown panic payload");
    }
}
