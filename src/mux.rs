//! Fan-in of many file watchers into a single line stream.

use std::path::PathBuf;
use std::pin::Pin;
use std::task;

use futures_util::stream::Stream as FuturesStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{TailOptions, TailPosition};
use crate::error::Result;
use crate::events::FileEvents;
use crate::reader::{FileWatcher, Line};

/// Merges the lines of several [`FileWatcher`]s, and can be polled to receive
/// them.
///
/// Each watcher runs in its own task and pushes into a bounded channel shared
/// by all of them. Lines from one source come out in the order they were read;
/// lines from different sources interleave arbitrarily. When the channel is
/// full the watchers wait, which in turn stops them reading further into their
/// files until the consumer catches up.
///
/// Sources are fixed at construction. With no sources the stream ends
/// immediately.
pub struct MuxedLines {
    rx: mpsc::Receiver<Line>,
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for MuxedLines {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MuxedLines")
            .field("sources", &self.tasks.len())
            .field("buffered", &self.rx.len())
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl MuxedLines {
    /// Starts following every watcher. Must be called within a tokio runtime.
    pub fn new(watchers: impl IntoIterator<Item = FileWatcher>, options: &TailOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let stop = CancellationToken::new();

        let tasks = watchers
            .into_iter()
            .map(|watcher| {
                tracing::debug!(source = %watcher.source().display(), "spawning watcher");
                tokio::spawn(watcher.run(tx.clone(), stop.child_token()))
            })
            .collect();

        // Only the watchers hold senders now, so the channel closes once the
        // last of them exits.
        drop(tx);

        MuxedLines { rx, stop, tasks }
    }

    /// Opens every path, then starts following them.
    ///
    /// Nothing is spawned unless all paths open, so an unreadable file is
    /// reported before any line is produced. All the watchers share a single
    /// [`FileEvents`], so only one OS watcher is created however many paths
    /// are followed.
    pub async fn open<I, P>(paths: I, position: TailPosition, options: &TailOptions) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let events = FileEvents::new();
        let mut watchers = Vec::new();
        for path in paths {
            watchers.push(FileWatcher::open_with_events(path, position, options, &events).await?);
        }
        tracing::debug!(?events, "registered sources");

        Ok(Self::new(watchers, options))
    }

    /// Number of sources being followed.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// A token that stops every watcher when cancelled, usable from another
    /// task such as a signal handler.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Signals every watcher to stop. Lines not yet received are discarded.
    pub fn stop(&mut self) {
        self.stop.cancel();
        self.rx.close();
    }

    /// Stops every watcher and waits for them to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "watcher task failed");
            }
        }
    }

    /// Waits for the next line from any source.
    ///
    /// Returns `None` once stopped, or once every watcher has exited.
    pub async fn next_line(&mut self) -> Option<Line> {
        if self.stop.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                self.rx.close();
                None
            }
            line = self.rx.recv() => line,
        }
    }
}

impl FuturesStream for MuxedLines {
    type Item = Line;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        if self.stop.is_cancelled() {
            self.rx.close();
            return task::Poll::Ready(None);
        }

        // Stopped watchers drop their senders, which wakes us with `None`.
        self.rx.poll_recv(cx)
    }
}

impl Drop for MuxedLines {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
