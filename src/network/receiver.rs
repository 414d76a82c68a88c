use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadHalf};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::network::buffer_pool::{BufferPool, DEFAULT_BUFFER_LEN};
use crate::{AppError, AppResult};

/// The per-session task driving the framing state machine against the raw
/// stream.
///
/// It alternates between two states: read exactly `header_bytes` and publish
/// them on the incoming-header queue, then wait for the body length handed
/// back by the multiplexer and read exactly that many body bytes. The next
/// header read never starts before the previous body has been read in full,
/// so header/body pairs of distinct requests never interleave on one
/// connection.
pub(crate) struct Receiver<S> {
    pub(crate) session_id: u64,
    pub(crate) reader: BufReader<ReadHalf<S>>,
    pub(crate) header_bytes: usize,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) max_body_size: Option<usize>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) head_tx: mpsc::Sender<BytesMut>,
    pub(crate) body_tx: mpsc::Sender<BytesMut>,
    pub(crate) len_rx: mpsc::Receiver<usize>,
}

impl<S> Receiver<S>
where
    S: AsyncRead + Send + 'static,
{
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.read_loop().await {
            match &e {
                AppError::Io(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    debug!("session {}: peer closed connection", self.session_id)
                }
                AppError::ConnectionClosed => {
                    debug!("session {}: read aborted by close", self.session_id)
                }
                _ => warn!("session {}: read failed: {}", self.session_id, e),
            }
        }
        // Dropping head_tx/body_tx here closes the incoming queues, which is
        // the end-of-input signal to the multiplexer.
    }

    async fn read_loop(&mut self) -> AppResult<()> {
        loop {
            // AwaitHeader
            let mut head = self.pool.acquire();
            head.resize(self.header_bytes, 0);
            self.read_full(&mut head).await?;
            if self.head_tx.send(head).await.is_err() {
                return Ok(());
            }

            // AwaitBody: block for the handler-computed body length. A
            // closed slot means the multiplexer has already exited.
            let body_len = match self.len_rx.recv().await {
                Some(n) => n,
                None => return Ok(()),
            };
            if let Some(max) = self.max_body_size {
                if body_len > max {
                    return Err(AppError::BodyTooLarge(body_len, max));
                }
            }

            let mut body = if body_len <= DEFAULT_BUFFER_LEN {
                self.pool.acquire()
            } else {
                BytesMut::with_capacity(body_len)
            };
            body.resize(body_len, 0);
            self.read_full(&mut body).await?;
            if self.body_tx.send(body).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn read_full(&mut self, buf: &mut BytesMut) -> AppResult<()> {
        tokio::select! {
            res = read_exact_deadline(&mut self.reader, buf, self.read_timeout) => res,
            _ = self.cancel.cancelled() => Err(AppError::ConnectionClosed),
        }
    }
}

async fn read_exact_deadline<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    deadline: Option<Duration>,
) -> AppResult<()>
where
    R: AsyncRead + Unpin,
{
    match deadline {
        Some(limit) => match time::timeout(limit, reader.read_exact(buf)).await {
            Ok(res) => {
                res?;
                Ok(())
            }
            Err(_) => Err(AppError::Timeout("read")),
        },
        None => {
            reader.read_exact(buf).await?;
            Ok(())
        }
    }
}
