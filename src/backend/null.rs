//! Inert backend: starts instantly, never emits.
//!
//! Useful in tests that only exercise tree and lifecycle behavior, and as
//! an explicit configuration choice when OS watching must be disabled.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WatchError;

use super::{BackendMessage, WatchBackend};

#[derive(Debug, Default)]
pub struct NullBackend {
    // The sender is held so the upstream channel stays open until stop.
    tx: Option<mpsc::UnboundedSender<BackendMessage>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatchBackend for NullBackend {
    async fn start(
        &mut self,
        _root: &Path,
        tx: mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<(), WatchError> {
        self.tx = Some(tx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), WatchError> {
        self.tx.take();
        Ok(())
    }
}
