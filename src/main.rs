use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use crossterm::style::Stylize;
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};

use mtailgrep::{Evaluator, FileStyle, FilterSpec, Line, MuxedLines, TailOptions, Whence};

/// Follow files and print their new lines that pass the filters
#[derive(Parser, Debug)]
#[command(name = "mtailgrep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Only print lines containing this keyword (repeatable, all must match)
    #[arg(long = "keyword", value_name = "KW")]
    keywords: Vec<String>,

    /// Only print lines matching this regex (repeatable, all must match)
    #[arg(long = "re", value_name = "REGEX")]
    patterns: Vec<String>,

    /// Filter expression, e.g. 'keyword("ERROR") and not imatch("health")'
    #[arg(long, value_name = "EXPR")]
    filter: Option<String>,

    /// Where to start reading each file
    #[arg(long, value_enum, default_value_t = Whence::End)]
    whence: Whence,

    /// How to show the file name in front of each line
    #[arg(long = "filestyle", value_enum, default_value_t = FileStyle::Base)]
    file_style: FileStyle,

    /// Colour the file name
    #[arg(long = "color-name", default_value_t = true, action = ArgAction::Set)]
    color_name: bool,

    /// Milliseconds between checks for growth and rotation
    #[arg(long, default_value = "250")]
    poll_interval_ms: u64,

    /// Lines buffered before slowing down the file readers
    #[arg(long, default_value = "256")]
    buffer_size: usize,

    /// Files to follow
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // stdout carries the lines, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let spec = FilterSpec {
        substrings: args.keywords,
        patterns: args.patterns,
        expression: None,
    }
    .with_expression_str(args.filter.as_deref().unwrap_or(""))
    .context("Invalid --filter expression")?;
    let evaluator = Evaluator::compile(spec).context("Invalid filter")?;

    let options = TailOptions::default()
        .with_channel_capacity(args.buffer_size)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    let lines = MuxedLines::open(&args.files, args.whence.into(), &options)
        .await
        .context("Failed to start following files")?;

    let stop = lines.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            stop.cancel();
        }
    });

    let color = args.color_name && args.file_style != FileStyle::None;
    let mut out = BufWriter::new(tokio::io::stdout());
    let mut lines = evaluator.filter(lines);

    while let Some(line) = lines.next().await {
        let record = format_line(&line, args.file_style, color);
        let res = async {
            out.write_all(record.as_bytes()).await?;
            out.flush().await
        }
        .await;

        match res {
            Ok(()) => {}
            // Reader went away, e.g. piped into `head`
            Err(e) if e.kind() == ErrorKind::BrokenPipe => break,
            Err(e) => return Err(e).context("Failed to write output"),
        }
    }

    lines.into_inner().shutdown().await;

    Ok(())
}

fn format_line(line: &Line, style: FileStyle, color: bool) -> String {
    // Always `name:line`, the name being empty for `FileStyle::None`
    let name = style.display(line.source());

    if color && !name.is_empty() {
        format!("{}:{}\n", name.green(), line.line())
    } else {
        format!("{}:{}\n", name, line.line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "mtailgrep",
            "--keyword",
            "ERROR",
            "--keyword",
            "db",
            "--re",
            "[0-9]+ms",
            "--whence",
            "start",
            "--filestyle",
            "full",
            "--color-name",
            "false",
            "a.log",
            "b.log",
        ])
        .unwrap();

        assert_eq!(args.keywords, vec!["ERROR", "db"]);
        assert_eq!(args.patterns, vec!["[0-9]+ms"]);
        assert_eq!(args.whence, Whence::Start);
        assert_eq!(args.file_style, FileStyle::Full);
        assert!(!args.color_name);
        assert_eq!(args.files.len(), 2);
    }

    #[test]
    fn test_args_defaults_and_validation() {
        let args = Args::try_parse_from(["mtailgrep", "a.log"]).unwrap();
        assert_eq!(args.whence, Whence::End);
        assert_eq!(args.file_style, FileStyle::Base);
        assert!(args.color_name);

        assert!(Args::try_parse_from(["mtailgrep"]).is_err());
        assert!(Args::try_parse_from(["mtailgrep", "--whence", "middle", "a.log"]).is_err());
        assert!(Args::try_parse_from(["mtailgrep", "--filestyle", "short", "a.log"]).is_err());
    }

    #[test]
    fn test_format_line() {
        let line = Line::new("/var/log/a.log", "hello");

        assert_eq!(format_line(&line, FileStyle::Base, false), "a.log:hello\n");
        assert_eq!(format_line(&line, FileStyle::Full, false), "/var/log/a.log:hello\n");
        assert_eq!(format_line(&line, FileStyle::None, false), ":hello\n");
        assert_eq!(format_line(&line, FileStyle::None, true), ":hello\n");
        assert_eq!(
            format_line(&Line::new("/var/log/a.log", "x:y"), FileStyle::None, false),
            ":x:y\n"
        );

        let colored = format_line(&line, FileStyle::Base, true);
        assert!(colored.contains("a.log"));
        assert!(colored.ends_with(":hello\n"));
    }
}
