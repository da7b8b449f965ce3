//! Normalized filesystem event model.
//!
//! Backends report changes in their own vocabulary; everything past the
//! backend boundary speaks [`ChangeEvent`] batches. The mapping from
//! `notify` event kinds is total: anything the backend invents that we do
//! not recognize lands on [`EventAction::Unexpected`] instead of being
//! dropped on the floor.

use std::fmt;
use std::path::PathBuf;

use notify::event::{EventKind, ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};

/// Semantic action of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Created,
    Modified,
    Deleted,
    Renamed,
    /// Backend reported something outside the known vocabulary.
    Unexpected,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventAction::Created => "created",
            EventAction::Modified => "modified",
            EventAction::Deleted => "deleted",
            EventAction::Renamed => "renamed",
            EventAction::Unexpected => "unexpected",
        };
        f.write_str(name)
    }
}

/// One normalized filesystem change.
///
/// `old_path` is populated for renames only, holding the entry's former
/// absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: EventAction,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<PathBuf>,
}

impl ChangeEvent {
    pub fn new(action: EventAction, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn renamed(old_path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            action: EventAction::Renamed,
            path: new_path.into(),
            old_path: Some(old_path.into()),
        }
    }
}

/// Translate one `notify` event into normalized changes.
///
/// Rename reporting varies by platform: a coalesced rename carries both
/// paths, while split reports surface the disappearing side as a delete and
/// the appearing side as a create.
pub(crate) fn normalize(event: notify::Event) -> Vec<ChangeEvent> {
    match event.kind {
        EventKind::Create(_) => single(EventAction::Created, event.paths),
        EventKind::Remove(_) => single(EventAction::Deleted, event.paths),
        EventKind::Modify(ModifyKind::Name(mode)) => {
            let mut paths = event.paths.into_iter();
            match mode {
                RenameMode::Both => match (paths.next(), paths.next()) {
                    (Some(old), Some(new)) => vec![ChangeEvent::renamed(old, new)],
                    (Some(only), None) => vec![ChangeEvent::new(EventAction::Renamed, only)],
                    _ => Vec::new(),
                },
                RenameMode::From => paths
                    .map(|p| ChangeEvent::new(EventAction::Deleted, p))
                    .collect(),
                RenameMode::To => paths
                    .map(|p| ChangeEvent::new(EventAction::Created, p))
                    .collect(),
                RenameMode::Any | RenameMode::Other => paths
                    .map(|p| ChangeEvent::new(EventAction::Renamed, p))
                    .collect(),
            }
        }
        EventKind::Modify(_) => single(EventAction::Modified, event.paths),
        // Access events carry no content change; everything else is unknown.
        EventKind::Access(_) => Vec::new(),
        EventKind::Any | EventKind::Other => single(EventAction::Unexpected, event.paths),
    }
}

fn single(action: EventAction, paths: Vec<PathBuf>) -> Vec<ChangeEvent> {
    paths
        .into_iter()
        .map(|p| ChangeEvent::new(action, p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn notify_event(kind: EventKind, paths: Vec<&str>) -> notify::Event {
        let mut event = notify::Event::new(kind);
        event.paths = paths.into_iter().map(PathBuf::from).collect();
        event
    }

    #[test]
    fn create_and_remove_map_directly() {
        let created = normalize(notify_event(
            EventKind::Create(CreateKind::File),
            vec!["/a/b.txt"],
        ));
        assert_eq!(created, vec![ChangeEvent::new(EventAction::Created, "/a/b.txt")]);

        let removed = normalize(notify_event(
            EventKind::Remove(RemoveKind::File),
            vec!["/a/b.txt"],
        ));
        assert_eq!(removed, vec![ChangeEvent::new(EventAction::Deleted, "/a/b.txt")]);
    }

    #[test]
    fn coalesced_rename_keeps_both_paths() {
        let events = normalize(notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/a/old.txt", "/a/new.txt"],
        ));
        assert_eq!(events, vec![ChangeEvent::renamed("/a/old.txt", "/a/new.txt")]);
    }

    #[test]
    fn split_rename_becomes_delete_and_create() {
        let gone = normalize(notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec!["/a/old.txt"],
        ));
        assert_eq!(gone[0].action, EventAction::Deleted);

        let appeared = normalize(notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec!["/a/new.txt"],
        ));
        assert_eq!(appeared[0].action, EventAction::Created);
    }

    #[test]
    fn content_and_metadata_changes_are_modifications() {
        let content = normalize(notify_event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            vec!["/a/b.txt"],
        ));
        assert_eq!(content[0].action, EventAction::Modified);

        let meta = normalize(notify_event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            vec!["/a/b.txt"],
        ));
        assert_eq!(meta[0].action, EventAction::Modified);
    }

    #[test]
    fn unknown_kinds_land_on_unexpected() {
        let events = normalize(notify_event(EventKind::Other, vec!["/a/b.txt"]));
        assert_eq!(events[0].action, EventAction::Unexpected);
    }
}
