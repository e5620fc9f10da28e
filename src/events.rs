//! Filesystem change notification for followed paths.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

type Targets = Arc<RwLock<HashMap<PathBuf, Vec<Arc<Notify>>>>>;

struct State {
    inner: Option<notify::RecommendedWatcher>,
    watched_directories: HashMap<PathBuf, usize>,
}

/// Manages filesystem event watches shared by every followed file.
///
/// Internally, `FileEvents` keeps a single [`notify::RecommendedWatcher`]
/// (one inotify instance on Linux) and registers the parent directory of
/// each added path, so creations and renames that replace a file are seen as
/// well as writes to it. Directory watches are reference counted across
/// files. Notifications only shorten the wait between status checks; if the
/// OS watcher is unavailable every file simply falls back to polling.
///
/// Cloning is cheap and clones share the same watcher.
#[derive(Clone)]
pub struct FileEvents {
    state: Arc<Mutex<State>>,
    targets: Targets,
}

impl Debug for FileEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        let state = self.state.lock();
        f.debug_struct("FileEvents")
            .field("active", &state.inner.is_some())
            .field("watched_directories", &state.watched_directories)
            .field("watched_files", &self.targets.read().len())
            .finish()
    }
}

impl FileEvents {
    /// Starts the OS watcher. Never fails; see [`FileEvents::is_active`].
    pub fn new() -> Self {
        let targets: Targets = Arc::new(RwLock::new(HashMap::new()));

        let callback_targets = Arc::clone(&targets);
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Errors are not actionable here; the next status check covers them.
            if let Ok(event) = res {
                let targets = callback_targets.read();
                for path in &event.paths {
                    for changed in targets.get(path).into_iter().flatten() {
                        changed.notify_one();
                    }
                }
            }
        });

        let inner = match inner {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "change notification unavailable, polling only");
                None
            }
        };

        FileEvents {
            state: Arc::new(Mutex::new(State {
                inner,
                watched_directories: HashMap::new(),
            })),
            targets,
        }
    }

    /// Whether the OS watcher is running.
    pub fn is_active(&self) -> bool {
        self.state.lock().inner.is_some()
    }

    /// Number of distinct directories being watched.
    pub fn watched_directories(&self) -> usize {
        self.state.lock().watched_directories.len()
    }

    /// Adds `path` to the watch, whether or not it currently exists.
    ///
    /// The returned handle wakes when an event for the path arrives, and
    /// removes the watch when dropped.
    pub fn add_file(&self, path: impl AsRef<Path>) -> FileChanges {
        let changed = Arc::new(Notify::new());
        let original = path.as_ref();

        let path = match absolutify(original, true) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %original.display(), error = %e, "cannot resolve path, polling only");
                return FileChanges {
                    events: None,
                    path: original.to_path_buf(),
                    changed,
                };
            }
        };

        let registered = match path.parent() {
            Some(parent) => match self.add_directory(parent) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot watch parent directory, polling only");
                    false
                }
            },
            None => false,
        };

        if registered {
            self.targets
                .write()
                .entry(path.clone())
                .or_default()
                .push(Arc::clone(&changed));
        }

        FileChanges {
            events: registered.then(|| self.clone()),
            path,
            changed,
        }
    }

    fn add_directory(&self, dir: &Path) -> notify::Result<()> {
        let mut state = self.state.lock();
        let State {
            inner,
            watched_directories,
        } = &mut *state;

        let inner = inner
            .as_mut()
            .ok_or_else(|| notify::Error::generic("watcher is not running"))?;

        match watched_directories.get_mut(dir) {
            Some(count) => *count += 1,
            None => {
                notify::Watcher::watch(inner, dir, notify::RecursiveMode::NonRecursive)?;
                watched_directories.insert(dir.to_path_buf(), 1);
            }
        }

        Ok(())
    }

    fn remove_file(&self, path: &Path, changed: &Arc<Notify>) {
        {
            let mut targets = self.targets.write();
            if let Some(list) = targets.get_mut(path) {
                list.retain(|other| !Arc::ptr_eq(other, changed));
                if list.is_empty() {
                    targets.remove(path);
                }
            }
        }

        let parent = match path.parent() {
            Some(parent) => parent,
            None => return,
        };

        let mut state = self.state.lock();
        let State {
            inner,
            watched_directories,
        } = &mut *state;

        match watched_directories.get(parent).copied() {
            Some(1) => {
                // Remove from map first in case `unwatch` fails.
                watched_directories.remove(parent);
                if let Some(inner) = inner.as_mut() {
                    let _ = notify::Watcher::unwatch(inner, parent);
                }
            }
            Some(_) => {
                if let Some(count) = watched_directories.get_mut(parent) {
                    *count -= 1;
                }
            }
            None => {}
        }
    }
}

impl Default for FileEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// A single path's registration with [`FileEvents`].
pub struct FileChanges {
    /// `None` when no OS watch could be set up for the path.
    events: Option<FileEvents>,
    path: PathBuf,
    changed: Arc<Notify>,
}

impl Debug for FileChanges {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("FileChanges")
            .field("path", &self.path)
            .field("registered", &self.events.is_some())
            .finish()
    }
}

impl FileChanges {
    /// Whether an OS-level watch covers the path.
    pub fn is_registered(&self) -> bool {
        self.events.is_some()
    }

    /// The absolute path matched against incoming events.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Completes once an event for the path has arrived since the last call.
    ///
    /// Events are coalesced: a burst of writes wakes the caller once. Never
    /// completes if the path is not registered.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

impl Drop for FileChanges {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            events.remove_file(&self.path, &self.changed);
        }
    }
}

/// Makes `path` absolute with a canonical parent directory, to match against
/// the paths contained in each `notify::Event` received.
fn absolutify(path: impl Into<PathBuf>, is_file: bool) -> io::Result<PathBuf> {
    let path = path.into();

    let (dir, maybe_filename) = if is_file {
        let parent = match path.parent() {
            None => std::env::current_dir()?,
            Some(path) => {
                if path == Path::new("") {
                    std::env::current_dir()?
                } else {
                    path.to_path_buf()
                }
            }
        };
        let filename = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
            .to_os_string();

        (parent, Some(filename))
    } else {
        (path, None)
    };

    let dir = dir.canonicalize().unwrap_or(dir);

    let path = if let Some(filename) = maybe_filename {
        dir.join(filename)
    } else {
        dir
    };

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::{absolutify, FileEvents};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    #[test]
    fn test_absolutify_bad_filename() {
        let tmp_dir = tempdir().expect("Failed to create tempdir");

        // This is not okay
        let file_path = tmp_dir.path().join("..");
        assert!(absolutify(&file_path, true).is_err());
    }

    #[test]
    fn test_absolutify_relative() {
        let path = absolutify("some-file.log", true).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("some-file.log"));
    }

    #[tokio::test]
    async fn test_missing_file_is_watched_through_parent() {
        let tmp_dir = tempdir().expect("Failed to create tempdir");
        let file_path = tmp_dir.path().join("missing_file.txt");

        let events = FileEvents::new();
        let changes = events.add_file(&file_path);
        assert!(changes.is_registered());
        assert!(changes.path().ends_with("missing_file.txt"));

        // A sibling should not wake us
        std::fs::write(tmp_dir.path().join("other.txt"), b"x\n").unwrap();
        assert!(timeout(Duration::from_millis(200), changes.changed())
            .await
            .is_err());

        std::fs::write(&file_path, b"foo\n").unwrap();
        timeout(Duration::from_secs(2), changes.changed())
            .await
            .expect("no event for created file");
    }

    #[tokio::test]
    async fn test_files_share_one_watcher() {
        let tmp_dir = tempdir().expect("Failed to create tempdir");
        let sub_dir = tmp_dir.path().join("sub");
        std::fs::create_dir(&sub_dir).unwrap();

        let events = FileEvents::new();
        let a = events.add_file(tmp_dir.path().join("a.log"));
        let b = events.add_file(tmp_dir.path().join("b.log"));
        let c = events.add_file(sub_dir.join("c.log"));
        assert_eq!(events.watched_directories(), 2);

        std::fs::write(tmp_dir.path().join("b.log"), b"x\n").unwrap();
        timeout(Duration::from_secs(2), b.changed())
            .await
            .expect("no event for b.log");
        assert!(timeout(Duration::from_millis(100), a.changed())
            .await
            .is_err());

        drop(c);
        assert_eq!(events.watched_directories(), 1);
        drop(a);
        assert_eq!(events.watched_directories(), 1);
        drop(b);
        assert_eq!(events.watched_directories(), 0);
    }

    #[test]
    fn test_missing_parent_falls_back_to_polling() {
        let tmp_dir = tempdir().expect("Failed to create tempdir");
        let file_path = tmp_dir.path().join("nope").join("file.log");

        let events = FileEvents::new();
        let changes = events.add_file(&file_path);
        assert!(!changes.is_registered());
        assert_eq!(events.watched_directories(), 0);
    }
}
