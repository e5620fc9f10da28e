use futures_util::future::FutureExt;
use mtailgrep::{MuxedLines, TailOptions, TailPosition};
use std::io::Write;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time;

#[tokio::test]
pub async fn test_newline() {
    let expected_line = "foo bar".to_string();

    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("foo.log");
    std::fs::write(&logfile, "").unwrap();

    let options = TailOptions::default().with_poll_interval(Duration::from_millis(20));
    let mut lines = MuxedLines::open([&logfile], TailPosition::end(), &options)
        .await
        .unwrap();

    let writer = tokio::spawn({
        let logfile = logfile.clone();
        async move {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&logfile)
                .unwrap();
            file.write_all(b"foo").unwrap();
            file.sync_all().unwrap();
            time::sleep(Duration::from_millis(200)).await;
            file.write_all(b" bar\n").unwrap();
            file.sync_all().unwrap();
        }
    });

    let line_val_fut = lines
        .next_line()
        .map(|line| line.unwrap().into_inner().1);

    const TIMEOUT_2_SEC: Duration = Duration::from_millis(2000);

    let (line_val, status) = tokio::try_join!(
        time::timeout(TIMEOUT_2_SEC, line_val_fut),
        time::timeout(TIMEOUT_2_SEC, writer),
    )
    .unwrap();

    assert!(status.is_ok());
    assert_eq!(expected_line, line_val);
}
