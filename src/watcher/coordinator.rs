use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::bail;
use tokio::sync::mpsc as tokio_mpsc;

use crate::compiler::Compiler;
use crate::paths::absolute_normalized;
use crate::pipeline::{BuildPipeline, FileOutcome};
use crate::walker::{IgnorePolicy, walk_sources};

use super::event::{RawEvent, WatchEvent, WatchEventKind};
use super::{Notifier, WatcherHandle};

/// Capacity of the channel between notifier bridges and the dispatch loop.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An input root with a subscription on it.
struct WatchedRoot {
    /// The root as given on the command line.
    given: PathBuf,
    /// Absolute forms the notifier may report paths under.
    anchors: Vec<PathBuf>,
    is_file: bool,
    /// Ignore policy scoped to this root's ignore files.
    policy: IgnorePolicy,
}

/// Rebuilds single files as their writes settle.
///
/// Dispatches run one at a time on the task that drives [`WatchCoordinator::run`].
/// A failed rebuild is logged and the coordinator stays armed.
pub struct WatchCoordinator<'p, 'c, C> {
    pipeline: &'p BuildPipeline<'c, C>,
    roots: Vec<WatchedRoot>,
    /// Files seen so far, keyed by [`file_identity`], used to tell additions from changes.
    known: HashSet<PathBuf>,
    rx: tokio_mpsc::Receiver<RawEvent>,
    _handles: Vec<WatcherHandle>,
}

impl<'p, 'c, C: Compiler> WatchCoordinator<'p, 'c, C> {
    /// Subscribe to every existing input root.
    ///
    /// Missing roots are skipped with a warning. A subscription failure, or having
    /// nothing left to watch, is an error.
    pub fn arm<N: Notifier>(
        pipeline: &'p BuildPipeline<'c, C>,
        policy: IgnorePolicy,
        inputs: &[PathBuf],
        notifier: &N,
    ) -> anyhow::Result<Self> {
        let settings = pipeline.config().watch_settings;
        let (tx, rx) = tokio_mpsc::channel::<RawEvent>(EVENT_CHANNEL_CAPACITY);

        let mut roots = Vec::new();
        let mut handles = Vec::new();
        let mut known = HashSet::new();

        for input in inputs {
            if !input.exists() {
                tracing::warn!("not watching {}: path does not exist", input.display());
                continue;
            }

            let handle = notifier.subscribe(input, &settings, tx.clone())?;
            handles.push(handle);

            let is_file = input.is_file();
            if is_file {
                known.insert(file_identity(input));
            } else {
                known.extend(walk_sources(input, &policy).map(|e| file_identity(&e.source)));
            }

            let mut anchors = vec![absolute_normalized(input)];
            if let Ok(canonical) = input.canonicalize()
                && !anchors.contains(&canonical)
            {
                anchors.push(canonical);
            }

            tracing::info!("watching {}", input.display());
            roots.push(WatchedRoot {
                given: input.clone(),
                anchors,
                is_file,
                policy: policy.for_root(input),
            });
        }

        if roots.is_empty() {
            bail!("no input paths exist; nothing to watch");
        }

        Ok(Self {
            pipeline,
            roots,
            known,
            rx,
            _handles: handles,
        })
    }

    /// Number of roots with a live subscription.
    pub fn armed_roots(&self) -> usize {
        self.roots.len()
    }

    /// Wait for notifications and rebuild each settled file, until every notifier
    /// has gone away.
    pub async fn run(mut self) {
        while let Some(raw) = self.rx.recv().await {
            self.handle(raw);
        }
        tracing::debug!("all watchers closed");
    }

    /// Classify and dispatch one raw notification.
    pub fn handle(&mut self, raw: RawEvent) -> Option<FileOutcome> {
        let (event, relative) = self.classify(raw)?;
        self.dispatch(&event, &relative)
    }

    /// Turn a raw notification into a [`WatchEvent`] plus the relative name to build it
    /// under, or `None` if it should be ignored.
    ///
    /// Directories, vanished files, ignored paths and anything inside the output root
    /// are dropped.
    fn classify(&mut self, raw: RawEvent) -> Option<(WatchEvent, PathBuf)> {
        if !raw.path.is_file() {
            return None;
        }

        let root = self.roots.iter().find(|r| r.given == raw.root)?;
        let relative = relative_name(root, &raw.path);
        if !root.is_file && root.policy.is_ignored(&raw.path, &relative) {
            return None;
        }
        if root.policy.is_in_out_dir(&raw.path) {
            return None;
        }

        let kind = if self.known.insert(file_identity(&raw.path)) {
            WatchEventKind::Add
        } else {
            WatchEventKind::Change
        };

        Some((
            WatchEvent {
                kind,
                path: raw.path,
                root: raw.root,
            },
            relative,
        ))
    }

    /// Rebuild one file. Failures are logged here and never propagate.
    fn dispatch(&self, event: &WatchEvent, relative: &Path) -> Option<FileOutcome> {
        tracing::debug!("{:?} {}", event.kind, event.path.display());

        let root = self.roots.iter().find(|r| r.given == event.root);
        let result = match root {
            Some(r) if r.is_file => self.pipeline.compile_file(&event.path, relative),
            _ => self.pipeline.process_file(&event.path, relative),
        };

        match result {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::error!("{err:?}");
                None
            }
        }
    }
}

/// Key for the known-files set. Notifiers may report resolved paths, so symlinks are
/// followed when the file still exists.
fn file_identity(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| absolute_normalized(path))
}

/// Name of `path` relative to `root`; for a single-file root, the root as given.
/// Falls back to the raw path when it does not sit under the root.
fn relative_name(root: &WatchedRoot, path: &Path) -> PathBuf {
    if root.is_file {
        return root.given.clone();
    }

    let absolute = absolute_normalized(path);
    for anchor in &root.anchors {
        if let Ok(rel) = absolute.strip_prefix(anchor)
            && !rel.as_os_str().is_empty()
        {
            return rel.to_path_buf();
        }
    }
    path.to_path_buf()
}
