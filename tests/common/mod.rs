//! Shared helpers for integration tests: a scripted backend that tests
//! drive by hand, and small synchronization utilities.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use pathwatch::{BackendFactory, BackendMessage, ChangeEvent, WatchBackend, WatchError};

/// Registry of live manual backends, keyed by watch root.
///
/// Tests hand the hub's factory to a manager, then push event batches into
/// whichever backend covers a given directory.
#[derive(Clone, Default)]
pub struct ManualHub {
    active: Arc<Mutex<HashMap<PathBuf, mpsc::UnboundedSender<BackendMessage>>>>,
}

impl ManualHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn BackendFactory> {
        let hub = self.clone();
        Arc::new(move || {
            Box::new(ManualBackend {
                hub: hub.clone(),
                root: None,
            }) as Box<dyn WatchBackend>
        })
    }

    /// Roots with a live OS-level subscription, sorted.
    pub fn active_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.active.lock().keys().cloned().collect();
        roots.sort();
        roots
    }

    /// Deliver a batch through the backend rooted at `root`.
    pub fn emit(&self, root: &Path, events: Vec<ChangeEvent>) -> bool {
        match self.active.lock().get(root) {
            Some(tx) => tx.send(BackendMessage::Batch(events)).is_ok(),
            None => false,
        }
    }

    /// Deliver a runtime error through the backend rooted at `root`.
    pub fn emit_error(&self, root: &Path, error: WatchError) -> bool {
        match self.active.lock().get(root) {
            Some(tx) => tx.send(BackendMessage::Error(error)).is_ok(),
            None => false,
        }
    }
}

struct ManualBackend {
    hub: ManualHub,
    root: Option<PathBuf>,
}

#[async_trait]
impl WatchBackend for ManualBackend {
    async fn start(
        &mut self,
        root: &Path,
        tx: mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<(), WatchError> {
        self.root = Some(root.to_path_buf());
        self.hub.active.lock().insert(root.to_path_buf(), tx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), WatchError> {
        if let Some(root) = self.root.take() {
            self.hub.active.lock().remove(&root);
        }
        Ok(())
    }
}

/// Backend whose start always fails; for rollback tests.
pub struct FailingBackend;

#[async_trait]
impl WatchBackend for FailingBackend {
    async fn start(
        &mut self,
        root: &Path,
        _tx: mpsc::UnboundedSender<BackendMessage>,
    ) -> Result<(), WatchError> {
        Err(WatchError::BackendStart {
            path: root.to_path_buf(),
            reason: "synthetic start failure".into(),
        })
    }

    async fn stop(&mut self) -> Result<(), WatchError> {
        Ok(())
    }
}

pub fn failing_factory() -> Arc<dyn BackendFactory> {
    Arc::new(|| Box::new(FailingBackend) as Box<dyn WatchBackend>)
}

/// Collects delivered events for assertions.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&[ChangeEvent]) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |batch| events.lock().extend(batch.iter().cloned())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    pub fn saw_path(&self, path: &Path) -> bool {
        self.events.lock().iter().any(|e| e.path == path)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
///
/// A backend only starts once every consumer it serves is subscribed, so a
/// single emission after the backend is live suffices; polling is needed
/// only for the asynchronous delivery and teardown paths.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return cond();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
