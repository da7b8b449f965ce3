//! Registry facade: owns the tree, constructs native watchers, and binds
//! consumers to them.
//!
//! The manager is an explicitly constructed service, not process-global
//! state: embedders hold one instance per backend configuration and, when
//! the configuration changes, build a replacement and migrate live
//! subscriptions with [`PathWatcherManager::transfer_to`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{BackendFactory, NotifyBackend, NullBackend, WatchBackend};
use crate::config::{BackendKind, Settings};
use crate::error::WatchError;
use crate::native::NativeWatcher;
use crate::tree::{Attachment, RegistryTree, path_segments};
use crate::watcher::{PathWatcher, WatcherShared};

/// Per-watch options. Reserved; no knobs yet.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {}

pub(crate) struct ManagerInner {
    tree: Mutex<RegistryTree>,
    factory: Arc<dyn BackendFactory>,
    channel_capacity: usize,
    /// Every native watcher ever created and possibly still live; pruned
    /// opportunistically. Only used for bulk stops.
    live: Mutex<Vec<Weak<NativeWatcher>>>,
    runtime: tokio::runtime::Handle,
}

impl ManagerInner {
    /// Construct a native watcher for a directory the tree claimed, wired
    /// back into this registry for slot reclamation.
    fn new_native(self: &Arc<Self>, path: &Path) -> Arc<NativeWatcher> {
        let native = NativeWatcher::new(
            path.to_path_buf(),
            Arc::clone(&self.factory),
            self.channel_capacity,
        );
        let registry = Arc::downgrade(self);
        native.set_will_stop_hook(Box::new(move |stopping| {
            if let Some(registry) = registry.upgrade() {
                registry.handle_will_stop(stopping);
            }
        }));
        let mut live = self.live.lock();
        live.retain(|w| w.strong_count() > 0);
        live.push(Arc::downgrade(&native));
        native
    }

    /// A stopping watcher surrenders its tree slot: leaves without adopted
    /// claims are deleted, leaves with claimed child paths are split into
    /// narrower coverage whose watchers are started here.
    fn handle_will_stop(self: &Arc<Self>, stopping: &Arc<NativeWatcher>) {
        let segments = path_segments(stopping.path());
        let created = {
            let mut tree = self.tree.lock();
            if tree.holds(&segments, stopping) {
                tree.remove(&segments, &|path| self.new_native(path))
            } else {
                Vec::new()
            }
        };
        for attachment in created {
            self.drive_start_after(attachment.native, vec![Arc::clone(stopping)]);
        }
    }

    /// Start a native watcher in the background, rolling its tree slot
    /// back if the backend refuses to come up.
    fn drive_start(self: &Arc<Self>, native: Arc<NativeWatcher>) {
        self.drive_start_after(native, Vec::new());
    }

    /// Start `native` once every watcher in `vacating` has lost its last
    /// subscriber. Migrating consumers subscribe to the replacement before
    /// releasing the watcher they leave, so no batch is broadcast before
    /// its audience is listening.
    fn drive_start_after(
        self: &Arc<Self>,
        native: Arc<NativeWatcher>,
        vacating: Vec<Arc<NativeWatcher>>,
    ) {
        let registry = Arc::clone(self);
        self.runtime.spawn(async move {
            for old in &vacating {
                old.vacated().await;
            }
            match native.start().await {
                Ok(()) => {
                    // Every intended consumer disposed while the start was
                    // in flight; the stop path returns the slot.
                    if native.subscriber_count() == 0 {
                        let _ = native.stop().await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "[registry] backend start failed for {}: {e}",
                        native.path().display()
                    );
                    registry.rollback(&native);
                }
            }
        });
    }

    /// Drop one consumer's coverage claim, reclaiming the leaf if nothing
    /// else holds it.
    pub(crate) fn release_coverage(self: &Arc<Self>, path: &Path) {
        let segments = path_segments(path);
        let reaped = {
            let mut tree = self.tree.lock();
            tree.release(&segments);
            tree.reap_idle(&segments)
        };
        if let Some(native) = reaped {
            self.runtime.spawn(async move {
                let _ = native.stop().await;
            });
        }
    }

    /// Undo a claimed slot after a failed start. The failure has already
    /// been latched on the native watcher for its consumers to observe.
    fn rollback(&self, native: &Arc<NativeWatcher>) {
        let segments = path_segments(native.path());
        if self.tree.lock().rollback(&segments, native) {
            crate::debug_event!("registry", "rolled back", "{}", native.path().display());
        }
    }

    pub(crate) fn current_covering(&self, path: &Path) -> Option<(Arc<NativeWatcher>, PathBuf)> {
        self.tree.lock().covering(&path_segments(path))
    }

    /// Bind a consumer to whichever native watcher should cover its path.
    ///
    /// The tree mutation and the stream subscriptions happen under one
    /// lock, so a consumer can never miss a reattach prompt emitted by a
    /// later restructuring. Attaching an already-attached watcher is a
    /// caller error and fails with [`WatchError::AlreadyAttached`].
    pub(crate) async fn attach_shared(
        self: &Arc<Self>,
        shared: &Arc<WatcherShared>,
    ) -> Result<(), WatchError> {
        shared.claim_attach()?;

        let normalized = match shared.resolve_normalized().await {
            Ok(path) => path,
            Err(e) => {
                shared.latch_start(Err(e.clone()));
                shared.reset_attach_state();
                return Err(e);
            }
        };

        let segments = path_segments(&normalized);
        let (attachment, events, lifecycle) = {
            let mut tree = self.tree.lock();
            let attachment = tree.add(&segments, &|path| self.new_native(path));
            let events = attachment.native.subscribe_events();
            let lifecycle = attachment.native.subscribe_lifecycle();
            (attachment, events, lifecycle)
        };

        // Displaced watchers already told their consumers to reattach;
        // release their OS resources off the attach path.
        for displaced in &attachment.displaced {
            let displaced = Arc::clone(displaced);
            self.runtime.spawn(async move {
                let _ = displaced.stop().await;
            });
        }

        let Attachment {
            native, displaced, ..
        } = attachment;
        if !shared.bind(Arc::clone(&native), events, lifecycle) {
            // Disposed while the attach was in flight; surrender the claim
            // and never start a watcher nobody listens to.
            let reaped = {
                let mut tree = self.tree.lock();
                tree.release(&segments);
                tree.reap_idle(&segments)
            };
            shared.reset_attach_state();
            if reaped.is_none() {
                self.drive_start_after(native, displaced);
            }
            return Ok(());
        }
        shared.mark_attached();
        self.drive_start_after(native, displaced);
        Ok(())
    }

    fn live_natives(&self) -> Vec<Arc<NativeWatcher>> {
        let mut live = self.live.lock();
        live.retain(|w| w.strong_count() > 0);
        live.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Consolidating watch service.
///
/// Consumers ask for paths; the manager maps overlapping requests onto the
/// smallest set of native watchers and keeps that mapping minimal as
/// subscriptions come and go.
#[derive(Clone)]
pub struct PathWatcherManager {
    inner: Arc<ManagerInner>,
}

impl PathWatcherManager {
    /// Build a manager from settings. Must be called within a tokio
    /// runtime.
    pub fn new(settings: &Settings) -> Self {
        let factory: Arc<dyn BackendFactory> = match settings.backend {
            BackendKind::Notify => {
                let window = settings.batch_window_ms;
                Arc::new(move || Box::new(NotifyBackend::new(window)) as Box<dyn WatchBackend>)
            }
            BackendKind::Null => {
                Arc::new(|| Box::new(NullBackend::new()) as Box<dyn WatchBackend>)
            }
        };
        Self::with_backend(factory, settings.channel_capacity)
    }

    /// Build a manager around a custom backend factory.
    pub fn with_backend(factory: Arc<dyn BackendFactory>, channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                tree: Mutex::new(RegistryTree::new()),
                factory,
                channel_capacity,
                live: Mutex::new(Vec::new()),
                runtime: tokio::runtime::Handle::current(),
            }),
        }
    }

    /// Create a watcher for `path` without attaching it. Path resolution
    /// begins immediately; attachment happens on [`Self::attach`] or
    /// lazily on the watcher's first change callback.
    pub fn create_watcher(&self, path: impl Into<PathBuf>) -> PathWatcher {
        PathWatcher::new(path.into(), Arc::downgrade(&self.inner))
    }

    /// Attach a watcher to whichever native watcher should cover its path.
    pub async fn attach(&self, watcher: &PathWatcher) -> Result<(), WatchError> {
        self.inner.attach_shared(watcher.shared()).await
    }

    /// Watch `path`: create, attach, and wait until events can flow.
    ///
    /// Watching the same path twice, or a child of a watched path, reuses
    /// the existing OS watch.
    pub async fn watch(
        &self,
        path: impl Into<PathBuf>,
        _options: WatchOptions,
    ) -> Result<PathWatcher, WatchError> {
        let watcher = self.create_watcher(path);
        self.attach(&watcher).await?;
        watcher.started().await?;
        Ok(watcher)
    }

    /// Stop every live native watcher. Intended for teardown, e.g. between
    /// tests; consumers see the usual will-stop notifications.
    pub async fn stop_all(&self) {
        for native in self.inner.live_natives() {
            let _ = native.stop().await;
        }
    }

    /// Migrate all live coverage to `replacement`, e.g. after a backend
    /// configuration change. Consumers follow through the same reattach
    /// protocol used for merges and splits; their watch handles keep
    /// working unchanged.
    pub async fn transfer_to(&self, replacement: &PathWatcherManager) {
        let leaves = self.inner.tree.lock().drain_leaves();
        let target = &replacement.inner;

        for leaf in leaves {
            let attachment = {
                let mut tree = target.tree.lock();
                let attachment =
                    tree.add_claims(&leaf.segments, &|path| target.new_native(path), leaf.direct);
                // Re-register adopted claims so a later split still knows
                // about the deeper consumers.
                for (child, count) in &leaf.child_paths {
                    let mut full = leaf.segments.clone();
                    full.extend(child.iter().cloned());
                    tree.add_claims(&full, &|path| target.new_native(path), *count);
                }
                attachment
            };

            leaf.native
                .reattach_to(Arc::clone(&attachment.native), attachment.root.clone());
            target.drive_start_after(attachment.native, vec![Arc::clone(&leaf.native)]);
            let _ = leaf.native.stop().await;
        }
    }

    /// Render the current coverage tree, one watched directory per leaf.
    pub fn dump_tree(&self) -> String {
        self.inner.tree.lock().to_string()
    }

    /// Number of active OS-level watches.
    pub fn native_count(&self) -> usize {
        self.inner.tree.lock().leaf_count()
    }
}
