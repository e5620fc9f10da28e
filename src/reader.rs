//! Everything related to following a single file and reading its new lines.

use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{metadata, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::{TailOptions, TailPosition};
use crate::error::{Error, Result};
use crate::events::{FileChanges, FileEvents};

/// A single line captured for a given source path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Line {
    /// The path from where the line was read, exactly as configured.
    source: PathBuf,
    /// The line without its terminator.
    line: String,
}

impl Line {
    pub fn new(source: impl Into<PathBuf>, line: impl Into<String>) -> Self {
        Line {
            source: source.into(),
            line: line.into(),
        }
    }

    /// Returns a reference to the file from where the line was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns a reference to the line.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Returns the internal components that make up a `Line`.
    pub fn into_inner(self) -> (PathBuf, String) {
        let Line { source, line } = self;

        (source, line)
    }
}

/// Identity of the file behind a path, used to notice it was replaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    Some(FileId {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<FileId> {
    // Without inode numbers only truncation can be detected.
    None
}

struct OpenFile {
    reader: BufReader<File>,
    id: Option<FileId>,
    /// Bytes consumed so far, including any buffered partial line.
    pos: u64,
}

/// Where to place the cursor of a newly opened handle.
#[derive(Clone, Copy, Debug)]
enum OpenAt {
    Position(TailPosition),
    Start,
    /// Continue at `pos` if the path still holds file `id` and it has not
    /// shrunk below `pos`, otherwise from the start.
    Resume { id: FileId, pos: u64 },
}

impl OpenAt {
    fn resolve(&self, meta: &Metadata) -> u64 {
        match *self {
            OpenAt::Position(position) => position.resolve(meta.len()),
            OpenAt::Start => 0,
            OpenAt::Resume { id, pos } => {
                if file_id(meta) == Some(id) && pos <= meta.len() {
                    pos
                } else {
                    0
                }
            }
        }
    }
}

async fn open_at(path: &Path, at: OpenAt) -> Result<OpenFile> {
    let open_err = |source| Error::Open {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).await.map_err(open_err)?;
    let meta = file.metadata().await.map_err(open_err)?;
    if meta.is_dir() {
        return Err(Error::Directory {
            path: path.to_path_buf(),
        });
    }
    let pos = file
        .seek(SeekFrom::Start(at.resolve(&meta)))
        .await
        .map_err(open_err)?;

    Ok(OpenFile {
        reader: BufReader::new(file),
        id: file_id(&meta),
        pos,
    })
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug, Eq, PartialEq)]
enum Status {
    Unchanged,
    /// Shrunk below what has already been read.
    Truncated,
    /// Another file now lives at the path.
    Replaced,
    /// Nothing is at the path right now.
    Missing,
}

/// Follows one file, sending every completed line to a channel.
///
/// The watcher keeps a single handle open on its path. Appended data is read
/// as it arrives; a trailing record without a newline is held back until the
/// rest of it is written. Every `poll_interval` (or sooner, when a change
/// notification arrives) the path is checked:
///
///   1. If it now points at a different file, whatever complete lines are
///      left in the old one are read out, and the new file is opened and read
///      from its start.
///   2. If the file shrank below the read offset it was truncated, so it is
///      reopened from the start without reading the old handle again.
///   3. If the path is gone, reopening is retried with capped exponential
///      backoff until it comes back or the watcher is stopped.
///
/// A read error closes the handle too. The reopened file continues after the
/// last complete line if it is still the same file, so nothing is repeated.
///
/// A line written in the instant a file is swapped out may be lost or read
/// twice.
pub struct FileWatcher {
    source: PathBuf,
    file: Option<OpenFile>,
    partial: Vec<u8>,
    /// Set after a read error, consumed by the next reopen.
    resume: Option<OpenAt>,
    events: FileChanges,
    options: TailOptions,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("source", &self.source)
            .field("pos", &self.file.as_ref().map(|file| file.pos))
            .field("partial", &self.partial.len())
            .field("events", &self.events)
            .finish()
    }
}

impl FileWatcher {
    /// Opens `path` and positions the read cursor per `position`.
    ///
    /// Failing to open here is fatal for the source, unlike failures after
    /// the watcher is running.
    pub async fn open(
        path: impl Into<PathBuf>,
        position: TailPosition,
        options: &TailOptions,
    ) -> Result<Self> {
        Self::open_with_events(path, position, options, &FileEvents::new()).await
    }

    /// Like [`FileWatcher::open`], registering for change notification with
    /// an existing, possibly shared, [`FileEvents`].
    pub async fn open_with_events(
        path: impl Into<PathBuf>,
        position: TailPosition,
        options: &TailOptions,
        events: &FileEvents,
    ) -> Result<Self> {
        let source = path.into();
        let file = open_at(&source, OpenAt::Position(position)).await?;
        let events = events.add_file(&source);

        tracing::debug!(
            source = %source.display(),
            pos = file.pos,
            whence = %position.whence,
            "opened file"
        );

        Ok(FileWatcher {
            source,
            file: Some(file),
            partial: Vec::new(),
            resume: None,
            events,
            options: options.clone(),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Follows the file until `stop` is cancelled or `tx` is closed.
    pub async fn run(mut self, tx: mpsc::Sender<Line>, stop: CancellationToken) {
        loop {
            if self.file.is_none() && !self.reopen(&stop).await {
                break;
            }

            match self.drain(&tx, &stop).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(source = %self.source.display(), error = %e, "read failed, reopening");
                    self.suspend();
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = sleep(self.options.reopen_backoff_initial) => continue,
                    }
                }
            }

            match self.status().await {
                Status::Unchanged => {}
                Status::Truncated => {
                    tracing::info!(source = %self.source.display(), "file truncated");
                    self.close();
                    continue;
                }
                status @ (Status::Replaced | Status::Missing) => {
                    tracing::info!(source = %self.source.display(), ?status, "file rotated");
                    // Pick up anything written to the old file since the last read.
                    if let Ok(false) = self.drain(&tx, &stop).await {
                        break;
                    }
                    self.close();
                    continue;
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.events.changed() => {}
                _ = sleep(self.options.poll_interval) => {}
            }
        }

        self.close();
        tracing::debug!(source = %self.source.display(), "stopped following");
    }

    fn close(&mut self) {
        self.file = None;
        self.partial.clear();
    }

    /// Closes the handle, remembering where the last complete line ended so
    /// the next reopen can pick up from there.
    fn suspend(&mut self) {
        self.resume = self.file.as_ref().and_then(|file| {
            let pos = file.pos - self.partial.len() as u64;
            file.id.map(|id| OpenAt::Resume { id, pos })
        });
        self.close();
    }

    /// Reads every complete line currently available. Returns `Ok(false)` if
    /// the watcher should stop.
    async fn drain(&mut self, tx: &mpsc::Sender<Line>, stop: &CancellationToken) -> io::Result<bool> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(true),
        };

        loop {
            let n = file.reader.read_until(b'\n', &mut self.partial).await?;
            if n == 0 {
                return Ok(true);
            }
            file.pos += n as u64;

            if self.partial.last() != Some(&b'\n') {
                // Hit the end of the file mid-line
                continue;
            }

            let line = Line::new(self.source.clone(), decode(&self.partial));
            self.partial.clear();

            tracing::trace!(source = %self.source.display(), line = line.line(), "read line");

            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(false),
                res = tx.send(line) => {
                    if res.is_err() {
                        // Nobody is listening anymore
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn status(&self) -> Status {
        let file = match self.file.as_ref() {
            Some(file) => file,
            None => return Status::Missing,
        };

        match metadata(&self.source).await {
            Err(_) => Status::Missing,
            Ok(meta) => {
                if file.id.is_some() && file_id(&meta) != file.id {
                    Status::Replaced
                } else if meta.len() < file.pos {
                    Status::Truncated
                } else {
                    Status::Unchanged
                }
            }
        }
    }

    /// Reopens the path from its start, or from the resume point left by
    /// [`FileWatcher::suspend`], retrying until it succeeds. Returns `false`
    /// if stopped first.
    async fn reopen(&mut self, stop: &CancellationToken) -> bool {
        let mut backoff = self.options.reopen_backoff_initial;
        let mut attempts = 0u32;
        let at = self.resume.take().unwrap_or(OpenAt::Start);

        loop {
            if stop.is_cancelled() {
                return false;
            }

            match open_at(&self.source, at).await {
                Ok(file) => {
                    tracing::info!(source = %self.source.display(), attempts, pos = file.pos, "reopened file");
                    self.partial.clear();
                    self.file = Some(file);
                    return true;
                }
                Err(e) if attempts == 0 => {
                    tracing::warn!(source = %self.source.display(), error = %e, "reopen failed, retrying");
                }
                Err(e) => {
                    tracing::debug!(source = %self.source.display(), error = %e, ?backoff, "reopen failed");
                }
            }
            attempts += 1;

            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = self.events.changed() => {}
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.options.reopen_backoff_max);
        }
    }
}
