//! End-to-end replication through a real shell.
//!
//! The "remote" is a local `bash` reading from stdin, so every test drives
//! the same receiver loop a real `ssh host bash` would run. Tests are skipped
//! when GNU tar is not installed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use tarpipe::sync::{replicate_all, ChangeWatcher, IgnoreMatcher, WatchExit, WatcherState};
use tarpipe::transport::{ReplicationSession, SessionOptions};
use tarpipe::{CopyFile, Error, Settings, TarChoice, TarFlavor};

fn gnu_tar_available() -> bool {
    Command::new("tar")
        .arg("--version")
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains("GNU tar"))
        .unwrap_or(false)
}

macro_rules! require_gnu_tar {
    () => {
        if !gnu_tar_available() {
            eprintln!("skipping: GNU tar not installed");
            return;
        }
    };
}

struct Fixture {
    source_parent: TempDir,
    dest_parent: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let source_parent = TempDir::new().unwrap();
        fs::create_dir(source_parent.path().join("project")).unwrap();
        Self {
            source_parent,
            dest_parent: TempDir::new().unwrap(),
        }
    }

    fn source(&self) -> PathBuf {
        self.source_parent.path().join("project")
    }

    fn dest(&self) -> PathBuf {
        self.dest_parent.path().join("project")
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.source().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn options(&self) -> SessionOptions {
        SessionOptions {
            local: TarFlavor::gnu(),
            remote: TarFlavor::gnu(),
            source_dir: self.source(),
            dest_parent_dir: self.dest_parent.path().to_path_buf(),
            shell_command: vec!["bash".to_string()],
            clean_first: false,
        }
    }

    async fn open(&self) -> ReplicationSession {
        ReplicationSession::open(self.options()).await.unwrap()
    }

    fn remote(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.dest().join(relative)).ok()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_copy_single_file() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let file = fx.write("a.txt", "hello");

    let session = fx.open().await;
    assert_eq!(session.dest_dir(), fx.dest());
    session.copier().copy_file(&file).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(fx.remote("a.txt").as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_filename_with_shell_metacharacters() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let name = "test ~$@%-file.txt";
    let file = fx.write(name, "odd name");

    let session = fx.open().await;
    session.copier().copy_file(&file).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(fx.remote(name).as_deref(), Some("odd name"));
}

#[tokio::test]
async fn test_nested_file_creates_parents() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let file = fx.write("a/b/c/d/e/f.txt", "deep");

    let session = fx.open().await;
    session.copier().copy_file(&file).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(fx.remote("a/b/c/d/e/f.txt").as_deref(), Some("deep"));
}

#[tokio::test]
async fn test_copying_twice_keeps_latest_content() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let file = fx.write("a.txt", "first");

    let session = fx.open().await;
    let copier = session.copier();
    copier.copy_file(&file).await.unwrap();
    copier.copy_file(&file).await.unwrap();
    fs::write(&file, "second").unwrap();
    copier.copy_file(&file).await.unwrap();
    assert_eq!(copier.files_sent(), 3);
    session.close().await.unwrap();

    assert_eq!(fx.remote("a.txt").as_deref(), Some("second"));
}

#[tokio::test]
async fn test_vanished_file_does_not_break_the_stream() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let gone = fx.source().join("gone.txt");
    let kept = fx.write("kept.txt", "still here");

    let session = fx.open().await;
    let copier = session.copier();
    copier.copy_file(&gone).await.unwrap();
    copier.copy_file(&kept).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(fx.remote("gone.txt"), None);
    assert_eq!(fx.remote("kept.txt").as_deref(), Some("still here"));
}

#[tokio::test]
async fn test_path_outside_source_is_rejected() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let outside = fx.source_parent.path().join("elsewhere.txt");
    fs::write(&outside, "nope").unwrap();

    let session = fx.open().await;
    let err = session.copier().copy_file(&outside).await.unwrap_err();
    assert!(matches!(err, Error::OutsideSource { .. }));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_bulk_replication_respects_ignore_rules() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write(".gitignore", "*.log\nbuild/\n");
    fx.write("a.txt", "a");
    fx.write("src/main.rs", "fn main() {}");
    fx.write("src/debug.log", "noise");
    fx.write("build/out.bin", "binary");
    fs::create_dir_all(fx.source().join("empty/inner")).unwrap();

    let session = fx.open().await;
    let matcher = IgnoreMatcher::from_root(&fx.source(), ".gitignore").unwrap();
    let stats = replicate_all(&fx.source(), &session.copier(), &matcher)
        .await
        .unwrap();
    session.close().await.unwrap();

    assert_eq!(stats.files_copied, 3);
    assert_eq!(stats.ignored, 2);
    assert_eq!(fx.remote("a.txt").as_deref(), Some("a"));
    assert_eq!(fx.remote("src/main.rs").as_deref(), Some("fn main() {}"));
    assert!(fx.dest().join(".gitignore").is_file());
    assert!(!fx.dest().join("src/debug.log").exists());
    assert!(!fx.dest().join("build").exists());
    assert!(!fx.dest().join("empty").exists());
}

#[tokio::test]
async fn test_clean_first_wipes_destination() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fs::create_dir_all(fx.dest().join("stale")).unwrap();
    fs::write(fx.dest().join("stale/old.txt"), "old").unwrap();
    fs::write(fx.dest().join("old.txt"), "old").unwrap();
    let file = fx.write("new.txt", "new");

    let session = ReplicationSession::open(SessionOptions {
        clean_first: true,
        ..fx.options()
    })
    .await
    .unwrap();
    session.copier().copy_file(&file).await.unwrap();
    session.close().await.unwrap();

    assert!(!fx.dest().join("stale").exists());
    assert!(!fx.dest().join("old.txt").exists());
    assert_eq!(fx.remote("new.txt").as_deref(), Some("new"));
}

#[tokio::test]
async fn test_nonzero_shell_exit_is_reported() {
    let fx = Fixture::new();
    let session = ReplicationSession::open(SessionOptions {
        shell_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat > /dev/null; exit 3".to_string(),
        ],
        ..fx.options()
    })
    .await
    .unwrap();

    let err = session.close().await.unwrap_err();
    assert!(matches!(err, Error::SessionExit { code: Some(3) }));
}

#[tokio::test]
async fn test_remote_exit_mid_archive_fails_the_copy() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let big = fx.write("big.bin", &"x".repeat(1024 * 1024));

    let session = ReplicationSession::open(SessionOptions {
        shell_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "exec head -c 1 >/dev/null".to_string(),
        ],
        ..fx.options()
    })
    .await
    .unwrap();
    let copier = session.copier();

    let outcome = tokio::time::timeout(Duration::from_secs(10), copier.copy_file(&big))
        .await
        .expect("copy_file hung after the remote shell exited");
    assert!(matches!(outcome, Err(Error::Stream(_))), "got {outcome:?}");

    let next = copier.copy_file(&big).await.unwrap_err();
    assert!(matches!(next, Error::SessionClosed));
    let _ = session.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_copies_do_not_interleave() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let files: Vec<(PathBuf, String)> = (0..16)
        .map(|i| {
            let content = format!("file {i} ").repeat(4096);
            (fx.write(&format!("f{i:02}.txt"), &content), content)
        })
        .collect();

    let session = fx.open().await;
    let tasks: Vec<_> = files
        .iter()
        .map(|(path, _)| {
            let copier = session.copier();
            let path = path.clone();
            tokio::spawn(async move { copier.copy_file(&path).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    session.close().await.unwrap();

    for (i, (_, content)) in files.iter().enumerate() {
        assert_eq!(
            fx.remote(&format!("f{i:02}.txt")).as_deref(),
            Some(content.as_str()),
            "f{i:02}.txt differs at the destination"
        );
    }
}

#[tokio::test]
async fn test_watch_alone_leaves_untouched_files_behind() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write("a.txt", "hello");

    let session = fx.open().await;
    let watcher = ChangeWatcher::new(fx.source(), IgnoreMatcher::empty())
        .unwrap()
        .poll_interval(Duration::from_millis(20));
    let mut state = watcher.state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = {
        let copier = session.copier();
        tokio::spawn(async move { watcher.run(&copier, stop_rx).await })
    };
    state
        .wait_for(|s| *s == WatcherState::Active)
        .await
        .unwrap();

    fx.write("b.txt", "goodbye");
    let dest = fx.dest();
    let arrived = eventually(|| {
        fs::read_to_string(dest.join("b.txt")).ok().as_deref() == Some("goodbye")
    })
    .await;

    stop_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    session.close().await.unwrap();

    assert!(arrived, "b.txt never reached the destination");
    assert_eq!(fx.remote("a.txt"), None);
}

#[tokio::test]
async fn test_watch_replicates_new_and_modified_files() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write(".gitignore", "*.tmp\n");
    let existing = fx.write("a.txt", "hello");

    let session = fx.open().await;
    let copier = session.copier();
    copier.copy_file(&existing).await.unwrap();

    let matcher = IgnoreMatcher::from_root(&fx.source(), ".gitignore").unwrap();
    let watcher = ChangeWatcher::new(fx.source(), matcher)
        .unwrap()
        .poll_interval(Duration::from_millis(20));
    let mut state = watcher.state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = {
        let copier = copier.clone();
        tokio::spawn(async move { watcher.run(&copier, stop_rx).await })
    };
    state
        .wait_for(|s| *s == WatcherState::Active)
        .await
        .unwrap();

    fx.write("b.txt", "goodbye");
    fx.write("scratch.tmp", "ignored");
    fx.write("a/b/c/d/e/f.txt", "deep");
    fs::create_dir_all(fx.source().join("empty_dir")).unwrap();
    fs::write(&existing, "hello again").unwrap();

    let dest = fx.dest();
    let arrived = eventually(|| {
        fs::read_to_string(dest.join("b.txt")).ok().as_deref() == Some("goodbye")
            && fs::read_to_string(dest.join("a/b/c/d/e/f.txt")).ok().as_deref() == Some("deep")
            && fs::read_to_string(dest.join("a.txt")).ok().as_deref() == Some("hello again")
    })
    .await;

    stop_tx.send(true).unwrap();
    let (exit, stats) = task.await.unwrap().unwrap();
    session.close().await.unwrap();

    assert!(arrived, "watched changes never reached the destination");
    assert_eq!(exit, WatchExit::Cancelled);
    assert!(stats.files_copied >= 3);
    assert!(!fx.dest().join("scratch.tmp").exists());
    assert!(!fx.dest().join("empty_dir").exists());
}

#[tokio::test]
async fn test_deletions_are_not_propagated() {
    require_gnu_tar!();
    let fx = Fixture::new();
    let file = fx.write("keep.txt", "kept remotely");

    let session = fx.open().await;
    let copier = session.copier();
    copier.copy_file(&file).await.unwrap();

    let watcher = ChangeWatcher::new(fx.source(), IgnoreMatcher::empty())
        .unwrap()
        .idle_timeout(Some(Duration::from_millis(500)))
        .poll_interval(Duration::from_millis(20));
    let mut state = watcher.state();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let task = {
        let copier = copier.clone();
        tokio::spawn(async move { watcher.run(&copier, stop_rx).await })
    };
    state
        .wait_for(|s| *s == WatcherState::Active)
        .await
        .unwrap();

    fs::remove_file(&file).unwrap();
    let (exit, stats) = task.await.unwrap().unwrap();
    session.close().await.unwrap();

    assert_eq!(exit, WatchExit::TimedOut);
    assert_eq!(stats.files_copied, 0);
    assert_eq!(fx.remote("keep.txt").as_deref(), Some("kept remotely"));
}

fn settings(fx: &Fixture) -> Settings {
    let mut settings = Settings::from_config(
        &tarpipe::Config::default(),
        fx.source(),
        fx.dest_parent.path().to_path_buf(),
        vec!["bash".to_string()],
    );
    settings.local_tar = TarChoice::Gnu;
    settings.remote_tar = TarChoice::Gnu;
    settings
}

#[tokio::test]
async fn test_run_without_watch() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    fx.write("dir/b.txt", "b");
    let mut settings = settings(&fx);
    settings.watch = false;

    let (_stop_tx, stop_rx) = watch::channel(false);
    let summary = tarpipe::run(&settings, stop_rx).await.unwrap();

    assert_eq!(summary.bulk.map(|b| b.files_copied), Some(2));
    assert!(summary.watch.is_none());
    assert_eq!(summary.files_sent, 2);
    assert!(summary.bytes_sent > 0);
    assert_eq!(fx.remote("a.txt").as_deref(), Some("a"));
    assert_eq!(fx.remote("dir/b.txt").as_deref(), Some("b"));
}

#[tokio::test]
async fn test_run_detects_remote_gnu_tar() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    let mut settings = settings(&fx);
    settings.remote_tar = TarChoice::Detect;
    settings.watch = false;

    let (_stop_tx, stop_rx) = watch::channel(false);
    let summary = tarpipe::run(&settings, stop_rx).await.unwrap();

    assert_eq!(summary.remote, Some(TarFlavor::gnu()));
    assert_eq!(fx.remote("a.txt").as_deref(), Some("a"));
}

#[tokio::test]
async fn test_run_stopped_before_start_copies_nothing() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    let settings = settings(&fx);

    let (_stop_tx, stop_rx) = watch::channel(true);
    let summary = tarpipe::run(&settings, stop_rx).await.unwrap();

    assert!(summary.bulk.is_some_and(|b| b.interrupted));
    assert!(summary.watch.is_none());
    assert_eq!(summary.files_sent, 0);
    assert!(fx.dest().is_dir());
    assert!(!fx.dest().join("a.txt").exists());
}

#[tokio::test]
async fn test_run_idle_timeout_ends_watch() {
    require_gnu_tar!();
    let fx = Fixture::new();
    fx.write("a.txt", "a");
    let mut settings = settings(&fx);
    settings.idle_timeout = Some(Duration::from_millis(300));
    settings.poll_interval = Duration::from_millis(20);

    let (_stop_tx, stop_rx) = watch::channel(false);
    let summary = tarpipe::run(&settings, stop_rx).await.unwrap();

    let (exit, _) = summary.watch.unwrap();
    assert_eq!(exit, WatchExit::TimedOut);
    assert_eq!(fx.remote("a.txt").as_deref(), Some("a"));
}

#[tokio::test]
async fn test_run_rejects_bad_destination_before_spawning() {
    let fx = Fixture::new();
    let mut settings = settings(&fx);
    settings.dest_parent_dir = Path::new("relative").to_path_buf();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let err = tarpipe::run(&settings, stop_rx).await.unwrap_err();
    assert!(err.is_configuration());
}
