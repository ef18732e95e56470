//! Stopping virtual users when an experiment ends.
//!
//! The binary holds the root [`Shutdown`] and signals it on ctrl-c, when the
//! experiment timer fires or after a generator fails. Each virtual user checks
//! its clone between iterations and races it against publishing, so a user
//! blocked on a full publish channel still stops. A user that stops drops its
//! record sender, and once every sender is gone the publisher flushes its sink
//! and exits.

use std::sync::Arc;

use tokio::sync::broadcast;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Shutdown`]
pub enum Error {
    /// No handle was left subscribed when the signal was sent.
    #[error("No shutdown receivers remain: {0}")]
    Tokio(#[from] broadcast::error::SendError<()>),
}

#[derive(Debug)]
/// Shutdown handle shared by the binary and every virtual user of a run.
pub struct Shutdown {
    /// Shared by the root handle and all of its clones.
    sender: Arc<broadcast::Sender<()>>,
    /// This handle's subscription.
    notify: broadcast::Receiver<()>,
    /// Latched once the signal is observed.
    shutdown: bool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create the root handle of a run. Virtual users receive clones of it.
    #[must_use]
    pub fn new() -> Self {
        let (sender, notify) = broadcast::channel(1);

        Self {
            sender: Arc::new(sender),
            notify,
            shutdown: false,
        }
    }

    /// Wait for the end of the experiment. Returns at once if the signal was
    /// already observed.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // A single value is ever sent, so the receiver cannot lag.
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }

    /// Whether the experiment has ended. Checked by virtual users between
    /// iterations, never waits.
    pub fn is_signaled(&mut self) -> bool {
        if !self.shutdown {
            self.shutdown = !matches!(
                self.notify.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            );
        }
        self.shutdown
    }

    /// End the experiment for every virtual user. Returns how many handles,
    /// this one included, were still listening.
    ///
    /// # Errors
    ///
    /// Function will return an error if no handle remains to receive.
    pub fn signal(&self) -> Result<usize, Error> {
        Ok(self.sender.send(())?)
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown,
            notify: self.sender.subscribe(),
            sender: Arc::clone(&self.sender),
        }
    }
}
