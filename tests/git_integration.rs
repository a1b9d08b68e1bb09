//! Exercises `ProcessGit` against real `git` subprocesses over a throwaway
//! local repository, covering the clone → checkout → tag-discovery path
//! end to end.

use std::process::Command;
use std::sync::Mutex;

use molior_core::git::{pick_latest_valid_tag, GitClient, ProcessGit};
use molior_core::notifier::BuildLog;
use tempfile::tempdir;

#[derive(Default)]
struct CapturingLog {
    lines: Mutex<Vec<String>>,
}

impl BuildLog for CapturingLog {
    fn log(&self, _build_id: i64, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn log_title(&self, _build_id: i64, _title: &str) {}
}

fn run(cwd: &std::path::Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("git binary must be available for this test");
    assert!(status.success(), "git {:?} failed", args);
}

fn build_upstream_repo(dir: &std::path::Path) {
    run(dir, &["init", "-q"]);
    std::fs::write(dir.join("README"), "hello\n").unwrap();
    run(dir, &["add", "."]);
    run(dir, &["commit", "-q", "-m", "initial"]);
    run(dir, &["tag", "v1.0"]);

    std::fs::write(dir.join("README"), "hello again\n").unwrap();
    run(dir, &["add", "."]);
    run(dir, &["commit", "-q", "-m", "second"]);
    run(dir, &["tag", "v1.1"]);
    run(dir, &["tag", "nightly"]);
}

#[tokio::test]
async fn clone_checkout_and_tag_discovery_round_trip() {
    let upstream_dir = tempdir().unwrap();
    build_upstream_repo(upstream_dir.path());

    let workdir = tempdir().unwrap();
    let dest = workdir.path().join("checkout");
    let log = CapturingLog::default();
    let git = ProcessGit;

    let upstream_url = upstream_dir.path().to_string_lossy().to_string();
    git.clone_repo(&upstream_url, &dest, 1, &log)
        .await
        .expect("clone should succeed");
    assert!(dest.join("README").exists());

    let tags = git.list_tags(&dest).await.expect("list_tags should succeed");
    assert!(tags.contains(&"v1.0".to_string()));
    assert!(tags.contains(&"v1.1".to_string()));

    let mut tags_with_ts = Vec::new();
    for tag in &tags {
        let ts = git
            .tag_timestamp(&dest, tag)
            .await
            .expect("tag_timestamp should succeed");
        tags_with_ts.push((tag.clone(), ts));
    }

    let is_release = |tag: &str| {
        tag.strip_prefix('v')
            .map(|rest| rest.split('.').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())))
            .unwrap_or(false)
    };
    let latest = pick_latest_valid_tag(&tags_with_ts, is_release);
    assert_eq!(latest, Some("v1.1".to_string()));

    git.checkout(&dest, "v1.0", 1, &log)
        .await
        .expect("checkout should succeed");
    assert_eq!(std::fs::read_to_string(dest.join("README")).unwrap(), "hello\n");

    let (hash, email, _name) = git.show_head(&dest).await.expect("show_head should succeed");
    assert_eq!(hash.len(), 40);
    assert_eq!(email, "test@example.com");

    assert!(
        !log.lines.lock().unwrap().is_empty(),
        "git subprocess output should have been streamed to the log sink"
    );
}
