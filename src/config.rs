//! Configuration shared by the watchers and the multiplexer.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Reference point for the initial read position of a freshly opened file.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, clap::ValueEnum)]
pub enum Whence {
    Start,
    /// Relative to the cursor of the new handle, which sits at the start.
    Current,
    #[default]
    End,
}

impl FromStr for Whence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Whence::Start),
            "current" => Ok(Whence::Current),
            "end" => Ok(Whence::End),
            other => Err(Error::InvalidWhence(other.to_string())),
        }
    }
}

impl fmt::Display for Whence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Whence::Start => "start",
            Whence::Current => "current",
            Whence::End => "end",
        };
        f.write_str(name)
    }
}

/// Where a watcher starts reading when it first opens its file.
///
/// Only applies to the initial open. After a rotation the watcher always
/// resumes from the start of the new file.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TailPosition {
    pub whence: Whence,
    pub offset: i64,
}

impl TailPosition {
    pub fn new(whence: Whence, offset: i64) -> Self {
        TailPosition { whence, offset }
    }

    pub fn start() -> Self {
        Self::new(Whence::Start, 0)
    }

    pub fn end() -> Self {
        Self::new(Whence::End, 0)
    }

    /// Byte offset to start reading at in a file of `len` bytes.
    ///
    /// Always within `0..=len`, so a watcher never starts out past the end
    /// of its file and mistakes that for a truncation.
    pub(crate) fn resolve(&self, len: u64) -> u64 {
        let base = match self.whence {
            Whence::Start | Whence::Current => 0,
            Whence::End => len as i128,
        };

        (base + self.offset as i128).clamp(0, len as i128) as u64
    }
}

impl From<Whence> for TailPosition {
    fn from(whence: Whence) -> Self {
        TailPosition::new(whence, 0)
    }
}

/// How a source path is shown next to each emitted line.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, clap::ValueEnum)]
pub enum FileStyle {
    None,
    #[default]
    Base,
    Full,
}

impl FileStyle {
    pub fn display(&self, path: &Path) -> String {
        match self {
            FileStyle::None => String::new(),
            FileStyle::Base => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            FileStyle::Full => path.display().to_string(),
        }
    }
}

impl FromStr for FileStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(FileStyle::None),
            "base" => Ok(FileStyle::Base),
            "full" => Ok(FileStyle::Full),
            other => Err(Error::InvalidFileStyle(other.to_string())),
        }
    }
}

impl fmt::Display for FileStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileStyle::None => "none",
            FileStyle::Base => "base",
            FileStyle::Full => "full",
        };
        f.write_str(name)
    }
}

/// Tunables for following files.
#[derive(Clone, Debug)]
pub struct TailOptions {
    /// Lines buffered between the watchers and the consumer before
    /// producers block.
    pub channel_capacity: usize,
    /// How often a watcher checks its path for growth or rotation when no
    /// change notification arrives.
    pub poll_interval: Duration,
    pub reopen_backoff_initial: Duration,
    pub reopen_backoff_max: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        TailOptions {
            channel_capacity: 256,
            poll_interval: Duration::from_millis(250),
            reopen_backoff_initial: Duration::from_millis(50),
            reopen_backoff_max: Duration::from_secs(2),
        }
    }
}

impl TailOptions {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        // tokio's bounded channel panics on zero
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reopen_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reopen_backoff_initial = initial;
        self.reopen_backoff_max = max.max(initial);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_whence_from_str() {
        assert_eq!("start".parse::<Whence>().unwrap(), Whence::Start);
        assert_eq!("current".parse::<Whence>().unwrap(), Whence::Current);
        assert_eq!("end".parse::<Whence>().unwrap(), Whence::End);

        let err = "middle".parse::<Whence>().unwrap_err();
        assert!(matches!(err, Error::InvalidWhence(ref s) if s == "middle"));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(TailPosition::start().resolve(10), 0);
        assert_eq!(TailPosition::end().resolve(10), 10);
        assert_eq!(TailPosition::new(Whence::Current, 3).resolve(10), 3);
        assert_eq!(TailPosition::new(Whence::End, -4).resolve(10), 6);

        // Clamped to the file
        assert_eq!(TailPosition::new(Whence::Start, -5).resolve(10), 0);
        assert_eq!(TailPosition::new(Whence::End, -50).resolve(10), 0);
        assert_eq!(TailPosition::new(Whence::Start, 100).resolve(10), 10);
        assert_eq!(TailPosition::new(Whence::Current, 11).resolve(10), 10);
        assert_eq!(TailPosition::new(Whence::End, 5).resolve(10), 10);
        assert_eq!(TailPosition::new(Whence::End, i64::MAX).resolve(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_file_style_display() {
        let path = PathBuf::from("/var/log/app/a.log");

        assert_eq!(FileStyle::None.display(&path), "");
        assert_eq!(FileStyle::Base.display(&path), "a.log");
        assert_eq!(FileStyle::Full.display(&path), "/var/log/app/a.log");
        assert!("short".parse::<FileStyle>().is_err());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let options = TailOptions::default().with_channel_capacity(0);
        assert_eq!(options.channel_capacity, 1);
    }
}
