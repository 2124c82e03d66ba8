// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).


use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, warn};
use notify::event::Flag;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use task_executor::Executor;

///
/// An InvalidationWatcher maintains a Thread that receives events from a notify Watcher.
///
/// If the spawned Thread exits for any reason, InvalidationWatcher::is_valid() will return False,
/// and the caller should create a new InvalidationWatcher (or shut down, in some cases).
///
pub struct InvalidationWatcher(Mutex<Inner>);

type WatcherTaskInputs = (Sender<()>, Receiver<notify::Result<Event>>);

struct Inner {
    watcher: RecommendedWatcher,
    executor: Executor,
    liveness: Receiver<()>,
    canonical_build_root: PathBuf,
    // Until the background task has started, contains the relevant inputs to launch it via
    // start_background_thread. The decoupling of creating the `InvalidationWatcher` and starting
    // it is to allow for testing of the background thread.
    background_task_inputs: Option<WatcherTaskInputs>,
}

impl InvalidationWatcher {
    pub fn new(
        executor: Executor,
        build_root: PathBuf,
    ) -> Result<Arc<InvalidationWatcher>, String> {
        // Inotify events contain canonical paths to the files being watched. If the build_root
        // contains a symlink the paths returned in notify events wouldn't have the build_root as a
        // prefix, and so we would miss invalidating certain nodes.
        let canonical_build_root =
            std::fs::canonicalize(build_root.as_path()).map_err(|e| format!("{e:?}"))?;
        let (watch_sender, watch_receiver) = crossbeam_channel::unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |ev: notify::Result<Event>| {
                if watch_sender.send(ev).is_err() {
                    // The background thread is gone.
                    debug!("Dropping a watch event after the watch thread exited.");
                }
            },
            Config::default(),
        )
        .map_err(|e| format!("Failed to begin watching the filesystem: {e}"))?;

        // On darwin the notify API is much more efficient if you watch the build root
        // recursively, so we set up that watch here and then return early when watch() is
        // called by nodes that are running.
        if cfg!(target_os = "macos") {
            watcher
                .watch(&canonical_build_root, RecursiveMode::Recursive)
                .map_err(|e| {
                    format!("Failed to begin recursively watching files in the build root: {e}")
                })?
        }

        let (liveness_sender, liveness_receiver) = crossbeam_channel::unbounded();
        Ok(Arc::new(InvalidationWatcher(Mutex::new(Inner {
            watcher,
            executor,
            liveness: liveness_receiver,
            canonical_build_root,
            background_task_inputs: Some((liveness_sender, watch_receiver)),
        }))))
    }

    ///
    /// Starts the background task that monitors watch events. Panics if called more than once.
    ///
    pub fn start<I: Invalidatable>(&self, invalidatable: &Arc<I>) -> Result<(), String> {
        let mut inner = self.0.lock();
        let (liveness_sender, watch_receiver) = inner
            .background_task_inputs
            .take()
            .expect("An InvalidationWatcher can only be started once.");

        InvalidationWatcher::start_background_thread(
            Arc::downgrade(invalidatable),
            inner.canonical_build_root.clone(),
            liveness_sender,
            watch_receiver,
        )?;
        Ok(())
    }

    // Public for testing purposes.
    pub(crate) fn start_background_thread<I: Invalidatable>(
        invalidatable: Weak<I>,
        canonical_build_root: PathBuf,
        liveness_sender: Sender<()>,
        watch_receiver: Receiver<notify::Result<Event>>,
    ) -> Result<thread::JoinHandle<()>, String> {
        thread::Builder::new()
            .name("fs-watcher".to_owned())
            .spawn(move || {
                let exit_msg = loop {
                    let event_res = watch_receiver.recv_timeout(Duration::from_millis(10));
                    let Some(invalidatable) = invalidatable.upgrade() else {
                        // The Invalidatable has been dropped: we're done.
                        break "The watcher was shut down.".to_string();
                    };
                    match event_res {
                        Ok(Ok(ev)) => {
                            Self::handle_event(&*invalidatable, ev, &canonical_build_root)
                        }
                        Ok(Err(err)) => {
                            if let notify::ErrorKind::PathNotFound = err.kind {
                                warn!("Path(s) did not exist: {:?}", err.paths);
                                continue;
                            } else {
                                break format!("Watch error: {err}");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            break "The watch provider exited.".to_owned();
                        }
                    };
                };

                // Log and invalidate everything, since we might have missed events.
                error!("File watcher exiting with: {exit_msg}");
                if let Some(invalidatable) = invalidatable.upgrade() {
                    invalidatable.invalidate_all(InvalidateCaller::FileWatcher);
                }
                // Signal that we're exiting (which we would also do by just dropping the channel).
                let _ = liveness_sender.send(());
            })
            .map_err(|e| format!("Failed to start the watch thread: {e}"))
    }

    fn handle_event<I: Invalidatable>(invalidatable: &I, ev: Event, canonical_build_root: &Path) {
        if matches!(ev.kind, EventKind::Access(_)) {
            // Reading a file does not change it.
            return;
        }
        if ev.flag() == Some(Flag::Rescan) {
            debug!("notify queue overflowed: invalidating all paths");
            invalidatable.invalidate_all(InvalidateCaller::FileWatcher);
            return;
        }

        let paths: HashSet<_> = ev
            .paths
            .into_iter()
            .filter_map(|path| {
                // Relativize paths to the build root: events outside of it are not relevant.
                path.strip_prefix(canonical_build_root)
                    .ok()
                    .map(|p| p.to_path_buf())
            })
            .flat_map(|path_relative_to_build_root| {
                let mut paths_to_invalidate: Vec<PathBuf> = vec![];
                if let Some(parent_dir) = path_relative_to_build_root.parent() {
                    paths_to_invalidate.push(parent_dir.to_path_buf());
                }
                paths_to_invalidate.push(path_relative_to_build_root);
                paths_to_invalidate
            })
            .collect();

        if !paths.is_empty() {
            debug!("notify invalidating {:?} because of {:?}", paths, ev.kind);
            invalidatable.invalidate(&paths, InvalidateCaller::FileWatcher);
        }
    }

    ///
    /// Add a watch for the given path (relative to the build root) and its parent directory.
    ///
    pub async fn watch(self: &Arc<Self>, path: PathBuf) -> Result<(), String> {
        if cfg!(target_os = "macos") {
            // Already watching the entire build root recursively.
            return Ok(());
        }

        let executor = self.0.lock().executor.clone();
        let watcher = self.clone();
        executor
            .spawn_blocking(
                move || {
                    let mut inner = watcher.0.lock();
                    let abs_path = inner.canonical_build_root.join(&path);
                    // Watch the parent directory, so that creation and deletion are observed.
                    let watch_target = match abs_path.parent() {
                        Some(parent) if !abs_path.is_dir() => parent.to_path_buf(),
                        _ => abs_path.clone(),
                    };
                    inner
                        .watcher
                        .watch(&watch_target, RecursiveMode::NonRecursive)
                        .map_err(|e| maybe_enrich_notify_error(&watch_target, e))
                },
                |e| Err(format!("Watch attempt failed: {e}")),
            )
            .await
    }

    ///
    /// Returns true if this InvalidationWatcher is still valid: if it is not valid, it will have
    /// already logged some sort of error, and will never restart on its own.
    ///
    pub fn is_valid(&self) -> bool {
        match self.0.lock().liveness.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => false,
            Err(TryRecvError::Empty) => true,
        }
    }
}

fn maybe_enrich_notify_error(path: &Path, e: notify::Error) -> String {
    match e.kind {
        notify::ErrorKind::MaxFilesWatch => format!(
            "Failed to watch {}: the maximum number of filesystem watches was reached. On Linux, \
             increase `fs.inotify.max_user_watches`.",
            path.display()
        ),
        _ => format!("Failed to watch {}: {e}", path.display()),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvalidateCaller {
    External,
    FileWatcher,
}

pub trait Invalidatable: Send + Sync + 'static {
    fn invalidate(&self, paths: &HashSet<PathBuf>, caller: InvalidateCaller) -> usize;
    fn invalidate_all(&self, caller: InvalidateCaller) -> usize;
}
