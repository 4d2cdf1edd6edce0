use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use common::{is_hidden, subtree_prefix, KindFilter};
use library::{Indexer, LibraryError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum WatchError {
    Notify(notify::Error),
    Library(LibraryError),
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Notify(err) => write!(f, "notify error: {}", err),
            WatchError::Library(err) => write!(f, "library error: {}", err),
        }
    }
}

impl std::error::Error for WatchError {}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        WatchError::Notify(err)
    }
}

impl From<LibraryError> for WatchError {
    fn from(err: LibraryError) -> Self {
        WatchError::Library(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchOrigin {
    Mount,
    Subtree(PathBuf),
}

#[derive(Debug)]
pub struct WatchEvent {
    pub origin: WatchOrigin,
    pub event: Event,
}

/// Keeps one recursive watch per indexed root plus a shallow watch on the
/// mount point that adds and drops roots as they appear and disappear.
pub struct WatchManager {
    mount_root: PathBuf,
    mount_watcher: Option<RecommendedWatcher>,
    subtrees: HashMap<PathBuf, RecommendedWatcher>,
    tx: UnboundedSender<WatchEvent>,
}

impl WatchManager {
    pub fn new(mount_root: PathBuf) -> (Self, UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let manager = Self {
            mount_root,
            mount_watcher: None,
            subtrees: HashMap::new(),
            tx,
        };
        (manager, rx)
    }

    /// Indexes every visible directory under the mount root and, when
    /// `watch_mounts` is set, starts following the mount root itself.
    pub fn setup(&mut self, indexer: &mut Indexer, watch_mounts: bool) -> Result<(), WatchError> {
        if !self.mount_root.is_dir() {
            warn!("Mount root {} is not a directory", self.mount_root.display());
            return Ok(());
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.mount_root)
            .map_err(LibraryError::from)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && !is_hidden(path))
            .collect();
        dirs.sort();
        for dir in dirs {
            if let Err(err) = self.add_dir(indexer, &dir) {
                warn!("Failed to add {}: {}", dir.display(), err);
            }
        }

        if watch_mounts {
            let mut watcher = self.spawn_watcher(WatchOrigin::Mount)?;
            watcher.watch(&self.mount_root, RecursiveMode::NonRecursive)?;
            info!("Watching {} for mounts", self.mount_root.display());
            self.mount_watcher = Some(watcher);
        } else {
            info!("Mount watcher disabled (watch_mounts=false)");
        }
        Ok(())
    }

    /// Scans `path` into the catalog and watches it. Returns false when the
    /// directory was already watched or is ignored.
    pub fn add_dir(&mut self, indexer: &mut Indexer, path: &Path) -> Result<bool, WatchError> {
        assert!(path.is_absolute(), "watched directories must be absolute: {:?}", path);
        if self.subtrees.contains_key(path) || indexer.is_ignored(path) {
            debug!("Not adding {}", path.display());
            return Ok(false);
        }
        indexer.read_files(path, KindFilter::All)?;
        let mut watcher = self.spawn_watcher(WatchOrigin::Subtree(path.to_path_buf()))?;
        watcher.watch(path, RecursiveMode::Recursive)?;
        self.subtrees.insert(path.to_path_buf(), watcher);
        info!("Watching {}", path.display());
        Ok(true)
    }

    /// Stops watching `path` and drops everything indexed below it.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not currently watched.
    pub fn remove_dir(&mut self, indexer: &mut Indexer, path: &Path) -> Result<(), WatchError> {
        assert!(
            self.subtrees.contains_key(path),
            "removing a directory that is not watched: {:?}",
            path
        );
        self.subtrees.remove(path);
        indexer.store_mut().remove_subtree(&subtree_prefix(path))?;
        info!("Stopped watching {}", path.display());
        Ok(())
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.subtrees.contains_key(path)
    }

    pub fn watched(&self) -> impl Iterator<Item = &PathBuf> {
        self.subtrees.keys()
    }

    pub fn is_watching_mounts(&self) -> bool {
        self.mount_watcher.is_some()
    }

    pub fn handle_event(
        &mut self,
        indexer: &mut Indexer,
        event: WatchEvent,
    ) -> Result<(), WatchError> {
        match event.origin {
            WatchOrigin::Mount => self.handle_mount_event(indexer, event.event),
            WatchOrigin::Subtree(root) => {
                if !self.subtrees.contains_key(&root) {
                    debug!("Dropping event for unwatched {}", root.display());
                    return Ok(());
                }
                handle_subtree_event(indexer, event.event)
            }
        }
    }

    fn handle_mount_event(
        &mut self,
        indexer: &mut Indexer,
        event: Event,
    ) -> Result<(), WatchError> {
        for (path, change) in changes(&event) {
            if path.parent() != Some(self.mount_root.as_path()) || is_hidden(&path) {
                continue;
            }
            match change {
                Change::Appeared if path.is_dir() => {
                    info!("Mounted {}", path.display());
                    self.add_dir(indexer, &path)?;
                }
                Change::Vanished if self.is_watched(&path) => {
                    info!("Unmounted {}", path.display());
                    self.remove_dir(indexer, &path)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn spawn_watcher(&self, origin: WatchOrigin) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.tx.clone();
        RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(WatchEvent {
                        origin: origin.clone(),
                        event,
                    });
                }
                Err(err) => warn!("Watch error: {}", err),
            },
            NotifyConfig::default(),
        )
    }
}

fn handle_subtree_event(indexer: &mut Indexer, event: Event) -> Result<(), WatchError> {
    for (path, change) in changes(&event) {
        if is_hidden(&path) || indexer.is_ignored(&path) {
            continue;
        }
        match change {
            Change::Appeared if path.is_dir() => {
                indexer.read_files(&path, KindFilter::All)?;
            }
            Change::Appeared | Change::Modified => {
                if path.is_file() {
                    let outcome = indexer.process_file(&path)?;
                    debug!("{} -> {:?}", path.display(), outcome);
                }
            }
            Change::Vanished => indexer.remove_path(&path)?,
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Change {
    Appeared,
    Modified,
    Vanished,
}

/// Flattens a notify event into per-path changes. Renames split into the
/// side leaving and the side arriving; a rename of unknown direction is
/// settled by whether the path still exists.
fn changes(event: &Event) -> Vec<(PathBuf, Change)> {
    let by_existence = |path: &PathBuf| {
        if path.exists() {
            Change::Appeared
        } else {
            Change::Vanished
        }
    };
    match event.kind {
        EventKind::Create(_) => tag(&event.paths, Change::Appeared),
        EventKind::Remove(_) => tag(&event.paths, Change::Vanished),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            tag(&event.paths, Change::Vanished)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            tag(&event.paths, Change::Appeared)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), Change::Vanished));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), Change::Appeared));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| (path.clone(), by_existence(path)))
            .collect(),
        EventKind::Modify(_) => tag(&event.paths, Change::Modified),
        _ => Vec::new(),
    }
}

fn tag(paths: &[PathBuf], change: Change) -> Vec<(PathBuf, Change)> {
    paths.iter().map(|path| (path.clone(), change)).collect()
}
