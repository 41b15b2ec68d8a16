// ─── Cancellation ───
// One signal per orchestrator run, observed by every blocking call.

use tokio::sync::watch;

use crate::core::error::{UpdaterError, UpdaterResult};

/// Owning side, held by whoever may cancel (UI, Ctrl-C handler, tests).
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side, cheap to clone into every layer.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once the source has fired.
    pub fn check(&self) -> UpdaterResult<()> {
        if self.is_cancelled() {
            Err(UpdaterError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested. Pends forever if the
    /// source was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
