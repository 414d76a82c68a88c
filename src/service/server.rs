use std::io::{self, ErrorKind};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::{BufferPool, Handler, Session, SessionContext};
use crate::service::registry::SessionRegistry;
use crate::service::Shutdown;
use crate::ServerConfig;
use crate::{AppError, AppResult};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A framed TCP connection server.
///
/// The server owns the listener, the session registry, and the
/// configuration; parsed requests are dispatched to the supplied
/// [`Handler`]. Lifecycle is strictly `start` once, `stop` once: after
/// [`Server::stop`] returns, no connection task remains and the instance is
/// not restartable.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    registry: Arc<SessionRegistry>,
    pool: Arc<BufferPool>,
    state: ServerState,
}

enum ServerState {
    Created,
    Started(Running),
    Stopped,
}

struct Running {
    local_addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    accept_handle: JoinHandle<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Server {
        Server {
            config,
            handler,
            registry: Arc::new(SessionRegistry::new()),
            pool: Arc::new(BufferPool::new()),
            state: ServerState::Created,
        }
    }

    /// The address the listener is bound to, once started. Useful when the
    /// configured address has port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            ServerState::Started(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.count()
    }

    /// Validates the configuration, binds the listener, and launches the
    /// accept loop. Returns as soon as the loop is running.
    pub async fn start(&mut self) -> AppResult<()> {
        match self.state {
            ServerState::Created => {}
            ServerState::Started(_) => {
                return Err(AppError::IllegalState("server already started".into()))
            }
            ServerState::Stopped => {
                return Err(AppError::IllegalState(
                    "server is stopped and cannot be restarted".into(),
                ))
            }
        }
        self.config.validate()?;

        let listener = TcpListener::bind(&self.config.addr).await?;
        let local_addr = listener.local_addr()?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let ctx = Arc::new(SessionContext {
            config: self.config.clone(),
            handler: self.handler.clone(),
            registry: self.registry.clone(),
            pool: self.pool.clone(),
        });
        let acceptor = Acceptor {
            listener,
            ctx,
            shutdown: Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx: shutdown_complete_tx.clone(),
        };
        let accept_handle = tokio::spawn(acceptor.run());

        info!("server listening on {}", local_addr);
        self.state = ServerState::Started(Running {
            local_addr,
            notify_shutdown,
            accept_handle,
            shutdown_complete_tx,
            shutdown_complete_rx,
        });
        Ok(())
    }

    /// Gracefully stops the server: terminates the accept loop, closes
    /// every live session, and waits for all connection tasks to finish.
    /// When this returns, `on_closed` has fired for every accepted
    /// connection and no background task remains.
    pub async fn stop(&mut self) -> AppResult<()> {
        let running = match mem::replace(&mut self.state, ServerState::Stopped) {
            ServerState::Started(running) => running,
            ServerState::Created => {
                self.state = ServerState::Created;
                return Err(AppError::IllegalState("server was never started".into()))
            }
            ServerState::Stopped => {
                return Err(AppError::IllegalState("server already stopped".into()))
            }
        };
        let Running {
            notify_shutdown,
            accept_handle,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
            ..
        } = running;

        // Stop accepting first; awaiting the task drops the listener.
        let _ = notify_shutdown.send(());
        let _ = accept_handle.await;

        // Force-close every live session, then wait until each multiplexer
        // has dropped its completion sender.
        self.registry.close_all();
        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;

        info!("server stopped");
        Ok(())
    }
}

/// The single task blocking on the listener. Transient accept failures are
/// retried with capped exponential backoff; a fatal failure or the shutdown
/// signal ends the loop.
struct Acceptor {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Acceptor {
    async fn run(mut self) {
        let mut backoff: Option<Duration> = None;
        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
            };
            match accepted {
                Ok((socket, peer_addr)) => {
                    backoff = None;
                    debug!("accepted connection from {}", peer_addr);
                    Session::spawn(
                        socket,
                        peer_addr,
                        self.ctx.clone(),
                        self.shutdown_complete_tx.clone(),
                    );
                }
                Err(e) if is_transient_accept_error(&e) => {
                    let delay = next_backoff(&mut backoff);
                    warn!("accept error: {}; retrying in {:?}", e, delay);
                    time::sleep(delay).await;
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Recoverable accept failures, the closest tokio analogue of Go's
/// `net.Error.Temporary()` classification.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

fn next_backoff(current: &mut Option<Duration>) -> Duration {
    let delay = match *current {
        None => ACCEPT_BACKOFF_INITIAL,
        Some(previous) => (previous * 2).min(ACCEPT_BACKOFF_MAX),
    };
    *current = Some(delay);
    delay
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, 5)]
    #[case(Some(Duration::from_millis(5)), 10)]
    #[case(Some(Duration::from_millis(640)), 1000)]
    #[case(Some(Duration::from_secs(1)), 1000)]
    fn backoff_doubles_and_caps(#[case] current: Option<Duration>, #[case] expected_ms: u64) {
        let mut current = current;
        let delay = next_backoff(&mut current);
        assert_eq!(delay, Duration::from_millis(expected_ms));
        assert_eq!(current, Some(delay));
    }

    #[rstest]
    #[case(ErrorKind::ConnectionAborted, true)]
    #[case(ErrorKind::ConnectionReset, true)]
    #[case(ErrorKind::Interrupted, true)]
    #[case(ErrorKind::WouldBlock, true)]
    #[case(ErrorKind::AddrInUse, false)]
    #[case(ErrorKind::PermissionDenied, false)]
    fn accept_error_classification(#[case] kind: ErrorKind, #[case] transient: bool) {
        let err = io::Error::new(kind, "accept");
        assert_eq!(is_transient_accept_error(&err), transient);
    }
}
