//! Follow many (namely log) files at once and grep their new lines.
//!
//! Each file is followed by a [`FileWatcher`] that survives rotation and
//! truncation. [`MuxedLines`] merges every watcher into a single stream, and an
//! [`Evaluator`] compiled from a [`FilterSpec`] decides which lines get through.
//!
//! ## Example
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use mtailgrep::{Evaluator, FilterSpec, MuxedLines, TailOptions, TailPosition};
//!
//! #[tokio::main]
//! async fn main() -> mtailgrep::Result<()> {
//!     let spec = FilterSpec::new()
//!         .with_substring("ERROR")
//!         .with_expression_str(r#"not ikeyword("healthcheck")"#)?;
//!     let evaluator = Evaluator::compile(spec)?;
//!
//!     let options = TailOptions::default();
//!     let lines = MuxedLines::open(["some/file.log", "/some/other/file.log"], TailPosition::end(), &options).await?;
//!
//!     let mut lines = evaluator.filter(lines);
//!     while let Some(line) = lines.next().await {
//!         println!("{}:{}", line.source().display(), line.line());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Rotation is detected by checking the path every poll interval, woken early
//! by filesystem notifications. A line written in the instant a file is swapped
//! out may be lost or read twice. Read offsets are not persisted.

mod cache;
mod config;
mod error;
mod events;
mod expr;
mod filter;
mod mux;
mod reader;

pub use cache::PatternCache;
pub use config::{FileStyle, TailOptions, TailPosition, Whence};
pub use error::{Error, Result};
pub use events::{FileChanges, FileEvents};
pub use expr::FilterExpr;
pub use filter::{Evaluator, FilterSpec, FilteredLines, Method};
pub use mux::MuxedLines;
pub use reader::{FileWatcher, Line};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
