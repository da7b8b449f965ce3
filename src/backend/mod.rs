//! Backend abstraction over OS-level watch primitives.
//!
//! A backend owns exactly one OS subscription rooted at one absolute
//! directory. It reports normalized [`ChangeEvent`] batches and runtime
//! errors over a channel handed to it at start. Everything above this
//! boundary is backend-agnostic.

mod notify;
mod null;

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::events::ChangeEvent;

pub use self::notify::NotifyBackend;
pub use self::null::NullBackend;

/// Messages a running backend pushes upstream.
#[derive(Debug)]
pub enum BackendMessage {
    /// A batch of filesystem changes, in observation order.
    Batch(Vec<ChangeEvent>),
    /// A non-fatal runtime error (e.g. queue overflow).
    Error(WatchError),
}

/// One OS watch subscription.
///
/// `start` must be called at most once per instance; wrappers construct a
/// fresh backend through a [`BackendFactory`] for every start.
#[async_trait]
pub trait WatchBackend: Send + Sync {
    /// Begin watching `root` recursively, pushing messages into `tx`.
    ///
    /// Resolves once the OS subscription is live. Dropping `tx` from the
    /// backend side signals that no further messages will arrive.
    async fn start(
        &mut self,
        root: &Path,
        tx: mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<(), WatchError>;

    /// Release the OS subscription. Best effort; errors are reported but
    /// the backend must end up inert either way.
    async fn stop(&mut self) -> Result<(), WatchError>;
}

/// Constructs a fresh backend per native watcher.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Box<dyn WatchBackend>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Box<dyn WatchBackend> + Send + Sync,
{
    fn create(&self) -> Box<dyn WatchBackend> {
        self()
    }
}
