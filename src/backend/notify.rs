//! Real OS backend built on `notify::RecommendedWatcher`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::WatchError;
use crate::events::{ChangeEvent, normalize};

use super::{BackendMessage, WatchBackend};

/// Watches one directory tree through the platform's recommended watcher.
///
/// Raw events are normalized and grouped into batches: once an event
/// arrives, everything observed within the batch window is coalesced into
/// a single upstream message.
pub struct NotifyBackend {
    batch_window: Duration,
    watcher: Option<RecommendedWatcher>,
    pump: Option<JoinHandle<()>>,
}

impl NotifyBackend {
    pub fn new(batch_window_ms: u64) -> Self {
        Self {
            batch_window: Duration::from_millis(batch_window_ms),
            watcher: None,
            pump: None,
        }
    }
}

#[async_trait]
impl WatchBackend for NotifyBackend {
    async fn start(
        &mut self,
        root: &Path,
        tx: mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<(), WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| WatchError::BackendStart {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::BackendStart {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        self.watcher = Some(watcher);
        self.pump = Some(tokio::spawn(pump(raw_rx, tx, self.batch_window)));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), WatchError> {
        // Dropping the notify watcher closes the raw channel; the pump
        // flushes its last batch and exits on its own.
        self.watcher.take();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        Ok(())
    }
}

/// Normalize raw events and coalesce them into batches.
async fn pump(
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    tx: mpsc::UnboundedSender<BackendMessage>,
    window: Duration,
) {
    let mut closed = false;

    while !closed {
        let mut pending: Vec<ChangeEvent> = Vec::new();

        match raw_rx.recv().await {
            Some(Ok(event)) => pending.extend(normalize(event)),
            Some(Err(e)) => {
                let _ = tx.send(BackendMessage::Error(e.into()));
                continue;
            }
            None => break,
        }

        // Batch window: keep absorbing until it elapses.
        let deadline = sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                msg = raw_rx.recv() => match msg {
                    Some(Ok(event)) => pending.extend(normalize(event)),
                    Some(Err(e)) => {
                        let _ = tx.send(BackendMessage::Error(e.into()));
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        if !pending.is_empty() && tx.send(BackendMessage::Batch(pending)).is_err() {
            // Upstream gone; nothing left to deliver to.
            break;
        }
    }
}
