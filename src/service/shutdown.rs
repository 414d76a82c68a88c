use tokio::sync::broadcast;

/// Listens for the server-wide shutdown signal.
///
/// The accept loop holds one of these and selects on [`Shutdown::recv`]
/// while blocked on the listener; once the signal arrives, `recv` returns
/// immediately on every subsequent call.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
