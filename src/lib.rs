pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod native;
pub mod tree;
pub mod watcher;

pub use backend::{BackendFactory, BackendMessage, NotifyBackend, NullBackend, WatchBackend};
pub use config::{BackendKind, LoggingConfig, Settings};
pub use error::WatchError;
pub use events::{ChangeEvent, EventAction};
pub use manager::{PathWatcherManager, WatchOptions};
pub use native::{Lifecycle, NativeWatcher, WatcherState};
pub use watcher::{PathWatcher, Subscription};
