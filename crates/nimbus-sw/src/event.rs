//! Extendable events.
//!
//! A handler returns as soon as it has an answer for the page. Work that
//! must finish afterwards (populate writes) is registered on the event with
//! [`ExtendableEvent::wait_until`], and the host awaits
//! [`ExtendableEvent::settled`] before it considers the event done.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::warn;

/// Lifetime handle for one dispatched event.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
    pending: JoinSet<()>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event alive until `work` completes. The work starts running
    /// immediately on the current runtime.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.spawn(work);
    }

    /// Number of registered tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for all registered work. A panicking task is logged, never
    /// propagated.
    pub async fn settled(mut self) {
        while let Some(result) = self.pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Extended event task did not complete");
            }
        }
    }
}
