//! Consumer-facing path watcher.
//!
//! A `PathWatcher` is bound to one requested directory. It resolves to a
//! shared native watcher through the registry, filters incoming batches to
//! its own subtree, and transparently follows the native watcher across
//! consolidation merges and splits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::WatchError;
use crate::events::{ChangeEvent, EventAction};
use crate::manager::ManagerInner;
use crate::native::{EventBatch, Lifecycle, NativeWatcher};

pub type ChangeCallback = dyn Fn(&[ChangeEvent]) + Send + Sync;
pub type ErrorCallback = dyn Fn(&WatchError) + Send + Sync;

const DETACHED: u8 = 0;
const ATTACHING: u8 = 1;
const ATTACHED: u8 = 2;

/// Keep an event iff it concerns `root`'s subtree.
///
/// Renames are split at the boundary: a rename leaving the subtree is
/// re-emitted as a delete of the old path, one entering it as a create of
/// the new path. Renames entirely inside pass through; entirely outside
/// are dropped.
pub(crate) fn filter_events(root: &Path, events: &[ChangeEvent]) -> Vec<ChangeEvent> {
    let mut relevant = Vec::new();
    for event in events {
        match (&event.action, &event.old_path) {
            (EventAction::Renamed, Some(old_path)) => {
                let old_inside = old_path.starts_with(root);
                let new_inside = event.path.starts_with(root);
                match (old_inside, new_inside) {
                    (true, true) => relevant.push(event.clone()),
                    (true, false) => {
                        relevant.push(ChangeEvent::new(EventAction::Deleted, old_path.clone()));
                    }
                    (false, true) => {
                        relevant.push(ChangeEvent::new(EventAction::Created, event.path.clone()));
                    }
                    (false, false) => {}
                }
            }
            _ => {
                if event.path.starts_with(root) {
                    relevant.push(event.clone());
                }
            }
        }
    }
    relevant
}

struct AttachmentState {
    native: Arc<NativeWatcher>,
    generation: u64,
    task: JoinHandle<()>,
}

pub(crate) struct WatcherShared {
    requested: PathBuf,
    normalized: tokio::sync::OnceCell<Result<PathBuf, WatchError>>,
    manager: Weak<ManagerInner>,
    callbacks: Mutex<HashMap<u64, Arc<ChangeCallback>>>,
    error_callbacks: Mutex<HashMap<u64, Arc<ErrorCallback>>>,
    next_id: AtomicU64,
    generation: AtomicU64,
    attachment: Mutex<Option<AttachmentState>>,
    attach_state: AtomicU8,
    disposed: AtomicBool,
    start_tx: watch::Sender<Option<Result<(), WatchError>>>,
    runtime: tokio::runtime::Handle,
}

impl WatcherShared {
    fn new(requested: PathBuf, manager: Weak<ManagerInner>) -> Arc<Self> {
        let (start_tx, _) = watch::channel(None);
        Arc::new(Self {
            requested,
            normalized: tokio::sync::OnceCell::new(),
            manager,
            callbacks: Mutex::new(HashMap::new()),
            error_callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            attachment: Mutex::new(None),
            attach_state: AtomicU8::new(DETACHED),
            disposed: AtomicBool::new(false),
            start_tx,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    /// Resolve the symlink-free form of the requested path, once.
    pub(crate) async fn resolve_normalized(&self) -> Result<PathBuf, WatchError> {
        let requested = self.requested.clone();
        self.normalized
            .get_or_init(|| async move {
                match tokio::fs::canonicalize(&requested).await {
                    Ok(path) => Ok(path),
                    Err(e) => Err(WatchError::PathResolution {
                        path: requested,
                        reason: e.to_string(),
                    }),
                }
            })
            .await
            .clone()
    }

    fn normalized_cached(&self) -> Option<PathBuf> {
        match self.normalized.get() {
            Some(Ok(path)) => Some(path.clone()),
            _ => None,
        }
    }

    /// Claim the one-shot transition into attaching.
    pub(crate) fn claim_attach(&self) -> Result<(), WatchError> {
        match self.attach_state.compare_exchange(
            DETACHED,
            ATTACHING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(WatchError::AlreadyAttached),
        }
    }

    pub(crate) fn mark_attached(&self) {
        self.attach_state.store(ATTACHED, Ordering::SeqCst);
    }

    pub(crate) fn reset_attach_state(&self) {
        self.attach_state.store(DETACHED, Ordering::SeqCst);
    }

    /// Latch the start outcome; only the first latch wins.
    pub(crate) fn latch_start(&self, result: Result<(), WatchError>) {
        self.start_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Wire this watcher to a native watcher whose streams were subscribed
    /// by the caller. Replaces any previous binding. Returns false without
    /// binding if the watcher was disposed; the disposal check is repeated
    /// under the attachment lock so a racing `dispose` cannot slip between
    /// the check and the insert.
    pub(crate) fn bind(
        self: &Arc<Self>,
        native: Arc<NativeWatcher>,
        events: broadcast::Receiver<EventBatch>,
        lifecycle: broadcast::Receiver<Lifecycle>,
    ) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        native.add_subscriber();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task = self.runtime.spawn(forward(
            Arc::clone(self),
            Arc::clone(&native),
            events,
            lifecycle,
            generation,
        ));
        let previous = {
            let mut slot = self.attachment.lock();
            if self.disposed.load(Ordering::SeqCst) {
                drop(slot);
                task.abort();
                native.release_subscriber();
                return false;
            }
            slot.replace(AttachmentState {
                native: Arc::clone(&native),
                generation,
                task,
            })
        };
        if let Some(previous) = previous {
            previous.task.abort();
            previous.native.release_subscriber();
        }

        if self.start_tx.borrow().is_none() {
            let shared = Arc::clone(self);
            self.runtime.spawn(async move {
                let result = native.started().await;
                shared.latch_start(result);
            });
        }
        true
    }

    /// Follow a `ShouldDetach` to its replacement, rebinding through the
    /// registry in case coverage moved again before we subscribed.
    fn migrate(self: &Arc<Self>, mut candidate: Arc<NativeWatcher>) {
        loop {
            let events = candidate.subscribe_events();
            let lifecycle = candidate.subscribe_lifecycle();
            let current = self.manager.upgrade().and_then(|manager| {
                let normalized = self.normalized_cached()?;
                manager.current_covering(&normalized).map(|(native, _)| native)
            });
            match current {
                Some(current) if !Arc::ptr_eq(&current, &candidate) => candidate = current,
                _ => {
                    // A bind refused by disposal needs no cleanup here; the
                    // dispose path already released this consumer's claim.
                    let _ = self.bind(candidate, events, lifecycle);
                    return;
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attachment
            .lock()
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    /// The bound native watcher stopped underneath us; drop the binding so
    /// a later subscription re-attaches through the registry. The coverage
    /// claim is not released here: the registry already dissolved it when
    /// it removed the stopping watcher's leaf.
    fn detached(&self, generation: u64, _native: &Arc<NativeWatcher>) {
        let mut slot = self.attachment.lock();
        if slot.as_ref().is_some_and(|a| a.generation == generation) {
            if let Some(attachment) = slot.take() {
                attachment.native.release_subscriber();
            }
            self.reset_attach_state();
        }
    }

    fn deliver_changes(&self, batch: &[ChangeEvent]) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Some(root) = self.normalized_cached() else {
            return;
        };
        let relevant = filter_events(&root, batch);
        if relevant.is_empty() {
            return;
        }
        let callbacks: Vec<Arc<ChangeCallback>> = self.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(&relevant);
        }
    }

    fn deliver_error(&self, error: &WatchError) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<Arc<ErrorCallback>> =
            self.error_callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(error);
        }
    }

    fn add_change_callback(self: &Arc<Self>, callback: Arc<ChangeCallback>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().insert(id, callback);

        // First subscriber attaches lazily.
        if self.attach_state.load(Ordering::SeqCst) == DETACHED {
            if let Some(manager) = self.manager.upgrade() {
                let shared = Arc::clone(self);
                self.runtime.spawn(async move {
                    match manager.attach_shared(&shared).await {
                        Ok(()) | Err(WatchError::AlreadyAttached) => {}
                        Err(e) => {
                            tracing::debug!("[watcher] lazy attach failed: {e}");
                        }
                    }
                });
            }
        }
        id
    }

    fn remove_change_callback(&self, id: u64) {
        let emptied = {
            let mut callbacks = self.callbacks.lock();
            callbacks.remove(&id);
            callbacks.is_empty()
        };
        if emptied && !self.disposed.load(Ordering::SeqCst) {
            self.release_attachment();
        }
    }

    fn add_error_callback(&self, callback: Arc<ErrorCallback>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.error_callbacks.lock().insert(id, callback);
        id
    }

    fn remove_error_callback(&self, id: u64) {
        self.error_callbacks.lock().remove(&id);
    }

    /// Voluntarily leave the current binding: drop the coverage claim
    /// first, so the native watcher's stop (if this was the last
    /// subscriber) no longer splits for this consumer's path.
    fn release_attachment(&self) {
        let previous = self.attachment.lock().take();
        if let Some(attachment) = previous {
            attachment.task.abort();
            if let Some(manager) = self.manager.upgrade() {
                if let Some(root) = self.normalized_cached() {
                    manager.release_coverage(&root);
                }
            }
            attachment.native.release_subscriber();
        }
        self.reset_attach_state();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.callbacks.lock().clear();
        self.error_callbacks.lock().clear();
        self.release_attachment();
    }
}

/// Pump one native watcher's streams into this consumer until the binding
/// ends (migration, stop, or disposal).
async fn forward(
    shared: Arc<WatcherShared>,
    native: Arc<NativeWatcher>,
    mut events: broadcast::Receiver<EventBatch>,
    mut lifecycle: broadcast::Receiver<Lifecycle>,
    generation: u64,
) {
    loop {
        tokio::select! {
            batch = events.recv() => match batch {
                Ok(batch) => shared.deliver_changes(&batch),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    tracing::warn!("[watcher] lagged, {dropped} batches dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = lifecycle.recv() => match msg {
                Ok(Lifecycle::DidError(e)) => shared.deliver_error(&e),
                Ok(Lifecycle::ShouldDetach { replacement, root }) => {
                    let covered = shared
                        .normalized_cached()
                        .is_some_and(|normalized| normalized.starts_with(&root));
                    if shared.is_current(generation)
                        && covered
                        && !Arc::ptr_eq(&replacement, &native)
                    {
                        shared.migrate(replacement);
                        break;
                    }
                }
                Ok(Lifecycle::WillStop) => {
                    shared.detached(generation, &native);
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Handle for one filesystem watch subscription.
///
/// Acquire through [`crate::manager::PathWatcherManager::watch`]. Disposing
/// the handle stops event delivery immediately; OS resources are released
/// asynchronously once the last consumer of the underlying watcher is gone.
#[derive(Clone)]
pub struct PathWatcher {
    shared: Arc<WatcherShared>,
}

impl std::fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatcher")
            .field("requested", &self.shared.requested)
            .finish_non_exhaustive()
    }
}

impl PathWatcher {
    pub(crate) fn new(requested: PathBuf, manager: Weak<ManagerInner>) -> Self {
        let shared = WatcherShared::new(requested, manager);

        // Resolution starts at construction; a failure is latched so
        // `started()` rejects even before any attach attempt.
        let warm = Arc::clone(&shared);
        shared.runtime.spawn(async move {
            if let Err(e) = warm.resolve_normalized().await {
                warm.latch_start(Err(e));
            }
        });

        Self { shared }
    }

    pub fn requested_path(&self) -> &Path {
        &self.shared.requested
    }

    /// The symlink-free form of the requested path.
    pub async fn normalized_path(&self) -> Result<PathBuf, WatchError> {
        self.shared.resolve_normalized().await
    }

    /// Resolves once the underlying watcher is ready to deliver events;
    /// fails with the path-resolution or backend-start error. Await this
    /// before making filesystem changes you intend to assert about.
    pub async fn started(&self) -> Result<(), WatchError> {
        let mut rx = self.shared.start_tx.subscribe();
        loop {
            {
                if let Some(result) = rx.borrow().clone() {
                    return result;
                }
            }
            if rx.changed().await.is_err() {
                return Err(WatchError::ChannelClosed);
            }
        }
    }

    /// Invoke `callback` with each batch of events beneath this watcher's
    /// path. The first callback triggers attachment if needed.
    pub fn on_did_change(
        &self,
        callback: impl Fn(&[ChangeEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.add_change_callback(Arc::new(callback));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
            kind: SubscriptionKind::Change,
        }
    }

    /// Invoke `callback` with non-fatal errors from the underlying watcher.
    pub fn on_did_error(
        &self,
        callback: impl Fn(&WatchError) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.add_error_callback(Arc::new(callback));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
            kind: SubscriptionKind::Error,
        }
    }

    /// Unsubscribe every callback synchronously. If this was the underlying
    /// watcher's last consumer it stops and its tree slot is reclaimed.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub(crate) fn shared(&self) -> &Arc<WatcherShared> {
        &self.shared
    }
}

#[derive(Clone, Copy)]
enum SubscriptionKind {
    Change,
    Error,
}

/// Revokes one callback registration when dropped.
pub struct Subscription {
    shared: Weak<WatcherShared>,
    id: u64,
    kind: SubscriptionKind,
}

impl Subscription {
    /// Explicit form of dropping the subscription.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            match self.kind {
                SubscriptionKind::Change => shared.remove_change_callback(self.id),
                SubscriptionKind::Error => shared.remove_error_callback(self.id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename(old: &str, new: &str) -> ChangeEvent {
        ChangeEvent::renamed(old, new)
    }

    #[test]
    fn keeps_events_under_the_root() {
        let events = vec![
            ChangeEvent::new(EventAction::Created, "/root/a.txt"),
            ChangeEvent::new(EventAction::Modified, "/elsewhere/b.txt"),
        ];
        let filtered = filter_events(Path::new("/root"), &events);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].path, Path::new("/root/a.txt"));
    }

    #[test]
    fn prefix_matching_respects_segment_boundaries() {
        let events = vec![ChangeEvent::new(EventAction::Created, "/rootbeer/a.txt")];
        assert!(filter_events(Path::new("/root"), &events).is_empty());
    }

    #[test]
    fn rename_inside_passes_through() {
        let filtered = filter_events(Path::new("/root"), &[rename("/root/a", "/root/b")]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].action, EventAction::Renamed);
        assert_eq!(filtered[0].old_path.as_deref(), Some(Path::new("/root/a")));
    }

    #[test]
    fn rename_leaving_the_subtree_becomes_a_delete() {
        let filtered = filter_events(Path::new("/root"), &[rename("/root/a", "/other/a")]);
        assert_eq!(
            filtered,
            vec![ChangeEvent::new(EventAction::Deleted, "/root/a")]
        );
    }

    #[test]
    fn rename_entering_the_subtree_becomes_a_create() {
        let filtered = filter_events(Path::new("/root"), &[rename("/other/a", "/root/a")]);
        assert_eq!(
            filtered,
            vec![ChangeEvent::new(EventAction::Created, "/root/a")]
        );
    }

    #[test]
    fn rename_entirely_outside_is_dropped() {
        let filtered = filter_events(Path::new("/root"), &[rename("/x/a", "/y/a")]);
        assert!(filtered.is_empty());
    }

    #[test]
    fn one_rename_splits_differently_per_consumer() {
        // A rename from /root/x to /root/y crosses two consumers' scopes in
        // opposite directions.
        let events = [rename("/root/x/f", "/root/y/f")];

        let seen_by_x = filter_events(Path::new("/root/x"), &events);
        assert_eq!(
            seen_by_x,
            vec![ChangeEvent::new(EventAction::Deleted, "/root/x/f")]
        );

        let seen_by_y = filter_events(Path::new("/root/y"), &events);
        assert_eq!(
            seen_by_y,
            vec![ChangeEvent::new(EventAction::Created, "/root/y/f")]
        );

        let seen_by_root = filter_events(Path::new("/root"), &events);
        assert_eq!(seen_by_root, events.to_vec());
    }
}
