use std::sync::Arc;
use tokio::sync::watch;

/// Raises the server-wide shutdown signal.
///
/// The signal is raised at most once per server lifecycle and stays raised
/// until the process exits. Late subscribers (e.g. a worker spawned in the
/// same scheduler tick as the raise) still observe it: the underlying
/// `watch` channel hands every receiver the current value, not just future
/// sends.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal {
    raised: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> ShutdownSignal {
        let (raised, _) = watch::channel(false);
        ShutdownSignal {
            raised: Arc::new(raised),
        }
    }

    /// Raise the signal. Idempotent.
    pub(crate) fn raise(&self) {
        self.raised.send_replace(true);
    }

    /// Returns `true` if the signal has been raised.
    pub(crate) fn is_raised(&self) -> bool {
        *self.raised.borrow()
    }

    /// Create a new receive-side [`Shutdown`] for a subordinate task.
    pub(crate) fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.raised.subscribe())
    }
}

/// Listens for the server shutdown signal.
///
/// The `Shutdown` struct listens for the signal and tracks that the signal
/// has been received. Callers may query for whether the shutdown signal has
/// been received or not.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` if the shutdown signal has been received.
    is_shutdown: bool,
    /// The receive half of the channel used to listen for the signal.
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    fn new(notify: watch::Receiver<bool>) -> Shutdown {
        let is_shutdown = *notify.borrow();
        Shutdown {
            is_shutdown,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub(crate) async fn recv(&mut self) {
        // If we've already received a shutdown signal, there's no need to
        // wait for another one.
        if self.is_shutdown {
            return;
        }

        // `wait_for` also covers a signal raised between subscription and
        // this call. The sender lives for the whole server lifetime, so a
        // closed-channel error cannot reach us before the signal does.
        let _ = self.notify.wait_for(|raised| *raised).await;

        // Remember that the signal has been received.
        self.is_shutdown = true;
    }
}
