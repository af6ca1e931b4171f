//! Per-request cancellation.

use tokio::sync::watch;

/// Cancellation scope passed into every dock operation.
///
/// Cloning a context shares its cancellation state.
#[derive(Debug, Clone)]
pub struct Context {
    canceled: watch::Receiver<bool>,
}

/// Handle that cancels the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Context {
    /// A context that is never canceled.
    pub fn background() -> Self {
        let (_, rx) = watch::channel(false);
        Self { canceled: rx }
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { canceled: rx }, CancelHandle(tx))
    }

    pub fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    /// Resolves once the context is canceled; never resolves for
    /// [`Context::background`] or after the handle is dropped uncanceled.
    pub async fn canceled(&self) {
        let mut rx = self.canceled.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
