//! Per-send cancellation.
//!
//! One `AbortController` is created per send; its `AbortSignal` is attached
//! to every network call issued during that send. Firing it stops in-flight
//! HTTP work and surfaces as `ChatError::Cancelled`, which the orchestrator
//! maps to a silent UI reset with no partial persistence.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::ChatError;

pub struct AbortController {
    tx: watch::Sender<bool>,
    signal: AbortSignal,
}

#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
    // Keeps the sender alive for detached signals so `aborted()` never
    // resolves spuriously when no controller exists.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            signal: AbortSignal {
                rx,
                _keepalive: None,
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// A signal that never fires. Useful for non-interactive callers.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the controller fires. Pends forever if the controller
    /// was dropped without firing.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Race a fallible future against the abort signal.
pub async fn abortable<T, F>(signal: &AbortSignal, fut: F) -> Result<T, ChatError>
where
    F: Future<Output = Result<T, ChatError>>,
{
    tokio::select! {
        _ = signal.aborted() => Err(ChatError::Cancelled),
        result = fut => result,
    }
}
