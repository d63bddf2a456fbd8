pub mod coordinator;
pub mod event;

use std::any::Any;
use std::ffi::OsString;
use std::path::Path;

use anyhow::Context;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, new_debouncer_opt};
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;

use crate::config::WatchSettings;

pub use coordinator::WatchCoordinator;
use event::RawEvent;

/// Source of settled file notifications for one root.
///
/// Implementations deliver every path whose writes have gone quiet for the
/// stability threshold, until the returned handle is dropped.
pub trait Notifier {
    fn subscribe(
        &self,
        root: &Path,
        settings: &WatchSettings,
        sink: tokio_mpsc::Sender<RawEvent>,
    ) -> anyhow::Result<WatcherHandle>;
}

/// Handle to a running subscription. Keeps the debouncer alive (dropping stops watching).
#[derive(Default)]
pub struct WatcherHandle {
    /// Keep alive: dropping the debouncer stops the OS watcher.
    _debouncer: Option<Box<dyn Any>>,
    /// The bridge task forwarding events from std channel to tokio channel.
    _bridge_task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// A handle that owns nothing, for notifiers that need no cleanup.
    pub fn detached() -> Self {
        Self::default()
    }
}

/// Notifier backed by `notify` with `notify-debouncer-mini` providing the stability window.
///
/// Must be used from inside a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebouncedNotifier;

impl Notifier for DebouncedNotifier {
    fn subscribe(
        &self,
        root: &Path,
        settings: &WatchSettings,
        sink: tokio_mpsc::Sender<RawEvent>,
    ) -> anyhow::Result<WatcherHandle> {
        if settings.poll {
            start_watcher::<notify::PollWatcher>(root, settings, sink)
        } else {
            start_watcher::<notify::RecommendedWatcher>(root, settings, sink)
        }
    }
}

/// Start a debounced file watcher on `root` using backend `W`.
///
/// Only settled paths are forwarded to `sink` as [`RawEvent`]s; the debouncer's
/// still-being-written notices are dropped. Classification and filtering happen in
/// the coordinator.
///
/// A file root is watched through its parent directory so that editors replacing the
/// file by rename do not silently end the watch.
fn start_watcher<W: Watcher + 'static>(
    root: &Path,
    settings: &WatchSettings,
    sink: tokio_mpsc::Sender<RawEvent>,
) -> anyhow::Result<WatcherHandle> {
    let metadata =
        std::fs::metadata(root).with_context(|| format!("cannot watch {}", root.display()))?;
    let (watch_path, mode, only_name): (&Path, _, Option<OsString>) = if metadata.is_dir() {
        (root, RecursiveMode::Recursive, None)
    } else {
        let parent = match root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        (parent, RecursiveMode::NonRecursive, root.file_name().map(|n| n.to_owned()))
    };

    let (std_tx, std_rx) = std::sync::mpsc::channel::<DebounceEventResult>();

    let config = notify_debouncer_mini::Config::default()
        .with_timeout(settings.stability_threshold)
        .with_notify_config(notify::Config::default().with_poll_interval(settings.poll_interval));
    let mut debouncer = new_debouncer_opt::<_, W>(config, move |res: DebounceEventResult| {
        let _ = std_tx.send(res);
    })?;

    debouncer.watcher().watch(watch_path, mode)?;

    // Bridge: spawn_blocking to receive from std channel and forward to tokio
    let root = root.to_path_buf();
    let bridge_task = tokio::task::spawn_blocking(move || {
        while let Ok(result) = std_rx.recv() {
            match result {
                Ok(events) => {
                    for debounced_event in events {
                        if !matches!(debounced_event.kind, DebouncedEventKind::Any) {
                            continue;
                        }
                        if let Some(name) = &only_name
                            && debounced_event.path.file_name() != Some(name.as_os_str())
                        {
                            continue;
                        }
                        let raw = RawEvent {
                            path: debounced_event.path,
                            root: root.clone(),
                        };
                        if sink.blocking_send(raw).is_err() {
                            return; // receiver dropped, shutdown
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("[watcher] error: {:?}", err);
                }
            }
        }
    });

    Ok(WatcherHandle {
        _debouncer: Some(Box::new(debouncer)),
        _bridge_task: Some(bridge_task),
    })
}
