use std::path::PathBuf;

/// Kind of a dispatched watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// A file appeared that was not known when the root was armed.
    Add,
    /// A known file was rewritten.
    Change,
}

/// A settled file notification, ready to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Input root the watch was registered under.
    pub root: PathBuf,
}

/// A raw notification from the notifier: a path under a root that went quiet
/// after some write activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub root: PathBuf,
}
