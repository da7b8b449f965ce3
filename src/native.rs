//! Native watcher: one backend subscription plus its lifecycle state.
//!
//! A `NativeWatcher` is created by the registry tree whenever new or split
//! coverage is needed, and stopped when its last subscriber lets go. It
//! rebroadcasts backend batches verbatim; per-consumer path filtering
//! happens in [`crate::watcher::PathWatcher`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{BackendFactory, BackendMessage, WatchBackend};
use crate::error::WatchError;
use crate::events::ChangeEvent;

/// A batch of normalized events, shared across all subscribers.
pub type EventBatch = Arc<Vec<ChangeEvent>>;

/// Lifecycle states of a native watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Lifecycle notifications broadcast to subscribers.
#[derive(Clone)]
pub enum Lifecycle {
    /// The backend is live; events will flow from here on.
    DidStart,
    /// Teardown is imminent; subscribers should detach or migrate now.
    WillStop,
    /// The backend has been released.
    DidStop,
    /// Non-fatal backend error; the watcher keeps running.
    DidError(Arc<WatchError>),
    /// Subscribers bound here should reattach to `replacement` instead,
    /// provided their own path is still covered by `root`.
    ShouldDetach {
        replacement: Arc<NativeWatcher>,
        root: PathBuf,
    },
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::DidStart => f.write_str("DidStart"),
            Lifecycle::WillStop => f.write_str("WillStop"),
            Lifecycle::DidStop => f.write_str("DidStop"),
            Lifecycle::DidError(e) => write!(f, "DidError({e})"),
            Lifecycle::ShouldDetach { root, .. } => {
                write!(f, "ShouldDetach({})", root.display())
            }
        }
    }
}

/// Observable start outcome, latched on the first transition.
#[derive(Clone)]
enum StartState {
    Pending,
    Running,
    Failed(Arc<WatchError>),
}

/// Registry-installed hook, invoked while entering Stopping and before
/// backend teardown. This is where tree removal and coverage splits happen,
/// so migrating subscribers observe `ShouldDetach` before `WillStop`.
pub type WillStopHook = Box<dyn Fn(&Arc<NativeWatcher>) + Send + Sync>;

pub struct NativeWatcher {
    path: PathBuf,
    factory: Arc<dyn BackendFactory>,
    state: Mutex<WatcherState>,
    backend: tokio::sync::Mutex<Option<Box<dyn WatchBackend>>>,
    events_tx: broadcast::Sender<EventBatch>,
    lifecycle_tx: broadcast::Sender<Lifecycle>,
    start_tx: watch::Sender<StartState>,
    subscribers: watch::Sender<usize>,
    will_stop_hook: Mutex<Option<WillStopHook>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
}

impl NativeWatcher {
    /// Create a watcher bound to one absolute directory.
    ///
    /// Must be called within a tokio runtime; events are not produced until
    /// [`NativeWatcher::start`].
    pub fn new(
        path: PathBuf,
        factory: Arc<dyn BackendFactory>,
        channel_capacity: usize,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(channel_capacity);
        let (lifecycle_tx, _) = broadcast::channel(channel_capacity);
        let (start_tx, _) = watch::channel(StartState::Pending);
        let (subscribers, _) = watch::channel(0usize);

        Arc::new(Self {
            path,
            factory,
            state: Mutex::new(WatcherState::Stopped),
            backend: tokio::sync::Mutex::new(None),
            events_tx,
            lifecycle_tx,
            start_tx,
            subscribers,
            will_stop_hook: Mutex::new(None),
            pump: Mutex::new(None),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    /// Install the registry's will-stop hook. At most one; later calls
    /// replace the previous hook.
    pub fn set_will_stop_hook(&self, hook: WillStopHook) {
        *self.will_stop_hook.lock() = Some(hook);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventBatch> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.lifecycle_tx.subscribe()
    }

    /// Record one consumer binding. Returns the new count.
    pub fn add_subscriber(&self) -> usize {
        let mut now = 0;
        self.subscribers.send_modify(|count| {
            *count += 1;
            now = *count;
        });
        now
    }

    /// Release one consumer binding; the last release stops the watcher.
    pub fn release_subscriber(self: &Arc<Self>) {
        let mut was_last = false;
        self.subscribers.send_modify(|count| {
            if *count > 0 {
                *count -= 1;
                was_last = *count == 0;
            }
        });
        if was_last {
            let this = Arc::clone(self);
            self.runtime.spawn(async move {
                let _ = this.stop().await;
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.borrow()
    }

    /// Resolve once no consumer is bound here. The registry defers starting
    /// a replacement's backend until the watchers it displaces are vacated;
    /// a migrating consumer subscribes to the replacement before it lets go
    /// of the old watcher, so vacated old watchers imply a listening
    /// audience.
    pub async fn vacated(&self) {
        let mut rx = self.subscribers.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Begin watching. No-op unless currently Stopped.
    ///
    /// On backend failure the watcher returns to Stopped, the failure is
    /// latched for [`NativeWatcher::started`] observers, and the error is
    /// returned to the caller; the registry rolls back the tree slot.
    pub async fn start(self: &Arc<Self>) -> Result<(), WatchError> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Stopped {
                return Ok(());
            }
            *state = WatcherState::Starting;
        }
        self.start_tx.send_replace(StartState::Pending);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = self.factory.create();
        match backend.start(&self.path, tx).await {
            Ok(()) => {
                *self.backend.lock().await = Some(backend);
                *self.pump.lock() = Some(self.runtime.spawn(pump(
                    rx,
                    self.events_tx.clone(),
                    self.lifecycle_tx.clone(),
                )));
                *self.state.lock() = WatcherState::Running;
                self.start_tx.send_replace(StartState::Running);
                let _ = self.lifecycle_tx.send(Lifecycle::DidStart);
                crate::debug_event!("native", "started", "{}", self.path.display());
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = WatcherState::Stopped;
                self.start_tx.send_replace(StartState::Failed(Arc::new(e.clone())));
                tracing::warn!("[native] start failed for {}: {e}", self.path.display());
                Err(e)
            }
        }
    }

    /// Resolve once the watcher has reached Running, or fail with the
    /// latched start error.
    pub async fn started(&self) -> Result<(), WatchError> {
        let mut rx = self.start_tx.subscribe();
        loop {
            {
                match &*rx.borrow() {
                    StartState::Running => return Ok(()),
                    StartState::Failed(e) => return Err((**e).clone()),
                    StartState::Pending => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(WatchError::ChannelClosed);
            }
        }
    }

    /// Prompt subscribers bound here to reattach to `replacement`.
    pub fn reattach_to(&self, replacement: Arc<NativeWatcher>, root: PathBuf) {
        let _ = self
            .lifecycle_tx
            .send(Lifecycle::ShouldDetach { replacement, root });
    }

    /// Stop watching and release the backend. No-op unless Running.
    ///
    /// Ordering contract: the will-stop hook (tree removal, splits, and the
    /// resulting `ShouldDetach` emissions) runs before the `WillStop`
    /// broadcast and before backend teardown, so migrating subscribers
    /// never observe a bare `WillStop`.
    pub async fn stop(self: &Arc<Self>) -> Result<(), WatchError> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Running {
                return Ok(());
            }
            *state = WatcherState::Stopping;
        }

        let hook = self.will_stop_hook.lock().take();
        if let Some(hook) = hook {
            hook(self);
        }
        let _ = self.lifecycle_tx.send(Lifecycle::WillStop);

        if let Some(mut backend) = self.backend.lock().await.take() {
            // Best-effort release; disposal errors are swallowed.
            if let Err(e) = backend.stop().await {
                crate::debug_event!("native", "stop error ignored", "{e}");
            }
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        *self.state.lock() = WatcherState::Stopped;
        let _ = self.lifecycle_tx.send(Lifecycle::DidStop);
        crate::debug_event!("native", "stopped", "{}", self.path.display());
        Ok(())
    }
}

impl fmt::Debug for NativeWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeWatcher")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Forward backend messages onto the broadcast streams.
async fn pump(
    mut rx: mpsc::UnboundedReceiver<BackendMessage>,
    events_tx: broadcast::Sender<EventBatch>,
    lifecycle_tx: broadcast::Sender<Lifecycle>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            BackendMessage::Batch(events) => {
                let _ = events_tx.send(Arc::new(events));
            }
            BackendMessage::Error(e) => {
                let _ = lifecycle_tx.send(Lifecycle::DidError(Arc::new(e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use async_trait::async_trait;

    struct FailingBackend;

    #[async_trait]
    impl WatchBackend for FailingBackend {
        async fn start(
            &mut self,
            root: &Path,
            _tx: mpsc::UnboundedSender<BackendMessage>,
        ) -> Result<(), WatchError> {
            Err(WatchError::BackendStart {
                path: root.to_path_buf(),
                reason: "no inotify instances left".into(),
            })
        }

        async fn stop(&mut self) -> Result<(), WatchError> {
            Ok(())
        }
    }

    fn null_factory() -> Arc<dyn BackendFactory> {
        Arc::new(|| Box::new(NullBackend::new()) as Box<dyn WatchBackend>)
    }

    #[tokio::test]
    async fn start_transitions_to_running() {
        let native = NativeWatcher::new("/tmp/a".into(), null_factory(), 16);
        assert_eq!(native.state(), WatcherState::Stopped);

        native.start().await.unwrap();
        assert_eq!(native.state(), WatcherState::Running);
        native.started().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let native = NativeWatcher::new("/tmp/a".into(), null_factory(), 16);
        native.start().await.unwrap();
        native.start().await.unwrap();
        assert_eq!(native.state(), WatcherState::Running);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let native = NativeWatcher::new("/tmp/a".into(), null_factory(), 16);
        native.stop().await.unwrap();
        assert_eq!(native.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn failed_start_returns_to_stopped_and_latches_error() {
        let factory: Arc<dyn BackendFactory> =
            Arc::new(|| Box::new(FailingBackend) as Box<dyn WatchBackend>);
        let native = NativeWatcher::new("/tmp/a".into(), factory, 16);

        let err = native.start().await.unwrap_err();
        assert!(matches!(err, WatchError::BackendStart { .. }));
        assert_eq!(native.state(), WatcherState::Stopped);

        let latched = native.started().await.unwrap_err();
        assert_eq!(latched, err);
    }

    #[tokio::test]
    async fn stop_emits_will_stop_then_did_stop() {
        let native = NativeWatcher::new("/tmp/a".into(), null_factory(), 16);
        native.start().await.unwrap();

        let mut lifecycle = native.subscribe_lifecycle();
        native.stop().await.unwrap();

        assert!(matches!(lifecycle.recv().await.unwrap(), Lifecycle::WillStop));
        assert!(matches!(lifecycle.recv().await.unwrap(), Lifecycle::DidStop));
        assert_eq!(native.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn vacated_resolves_once_the_last_subscriber_leaves() {
        let native = NativeWatcher::new("/tmp/a".into(), null_factory(), 16);
        native.start().await.unwrap();
        native.add_subscriber();

        let waiter = {
            let native = Arc::clone(&native);
            tokio::spawn(async move { native.vacated().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        native.release_subscriber();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn last_subscriber_release_stops_the_watcher() {
        let native = NativeWatcher::new("/tmp/a".into(), null_factory(), 16);
        native.start().await.unwrap();

        native.add_subscriber();
        native.add_subscriber();
        let mut lifecycle = native.subscribe_lifecycle();

        native.release_subscriber();
        // Still one subscriber left; no stop yet.
        assert_eq!(native.state(), WatcherState::Running);

        native.release_subscriber();
        assert!(matches!(lifecycle.recv().await.unwrap(), Lifecycle::WillStop));
        assert!(matches!(lifecycle.recv().await.unwrap(), Lifecycle::DidStop));
    }
}
