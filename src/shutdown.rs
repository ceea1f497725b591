//! Cooperative cancellation shared by every pipeline task.
//!
//! A single [`Shutdown`] owns a `watch` channel; each task holds a
//! [`ShutdownListener`] and races it against its own suspension point (channel
//! receive or emitter sleep). Dropping the `Shutdown` counts as a trigger so a
//! task can never outlive its owner.

use tokio::sync::watch;

/// Sending half of the cancellation signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// New listener for a task about to be spawned.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal every listener. Calling it again is a no-op.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half held by each task.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Whether shutdown has been signalled.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered or the [`Shutdown`] is dropped.
    ///
    /// Cancel safe, so it can sit in a `tokio::select!` arm.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
