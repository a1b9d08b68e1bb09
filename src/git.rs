//! Git collaborator wrapper: the `clone`/`checkout`/tag-discovery contract
//! the core depends on, implemented as subprocess invocations with
//! stdout/stderr streamed line-by-line to the driving Build's log sink.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::GitError;
use crate::notifier::BuildLog;

/// Everything the core needs from Git, expressed as a trait so handlers
/// can be tested against a fake without shelling out.
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path, build_id: i64, log: &dyn BuildLog) -> Result<(), GitError>;
    async fn checkout(&self, path: &Path, git_ref: &str, build_id: i64, log: &dyn BuildLog) -> Result<(), GitError>;
    async fn clean(&self, path: &Path, build_id: i64, log: &dyn BuildLog) -> Result<(), GitError>;
    async fn fetch_tags(&self, path: &Path, build_id: i64, log: &dyn BuildLog) -> Result<(), GitError>;
    async fn list_tags(&self, path: &Path) -> Result<Vec<String>, GitError>;
    async fn tag_timestamp(&self, path: &Path, tag: &str) -> Result<i64, GitError>;
    async fn show_head(&self, path: &Path) -> Result<(String, String, String), GitError>;
    async fn set_remote_url(&self, path: &Path, url: &str) -> Result<(), GitError>;
}

/// Real `git` subprocess implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGit;

impl ProcessGit {
    /// Runs a git command with its stdout/stderr streamed line-by-line into
    /// `log` as they arrive, rather than buffered to completion first.
    async fn run_logged(
        &self,
        cwd: Option<&Path>,
        args: &[&str],
        tls_insecure: bool,
        build_id: i64,
        log: &dyn BuildLog,
    ) -> Result<(), GitError> {
        let mut command = Command::new("git");
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        if tls_insecure {
            command.env("GIT_SSL_NO_VERIFY", "1");
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = out_lines.next_line() => match line {
                    Ok(Some(line)) => log.log(build_id, &line),
                    Ok(None) => {}
                    Err(_) => {}
                },
                line = err_lines.next_line() => match line {
                    Ok(Some(line)) => log.log(build_id, &line),
                    Ok(None) => {}
                    Err(_) => {}
                },
                status = child.wait() => {
                    let status = status?;
                    // Drain anything buffered after the process exited.
                    while let Ok(Some(line)) = out_lines.next_line().await {
                        log.log(build_id, &line);
                    }
                    while let Ok(Some(line)) = err_lines.next_line().await {
                        log.log(build_id, &line);
                    }
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(GitError::CommandFailed {
                            command: format!("git {}", args.join(" ")),
                            status: status.code().unwrap_or(-1),
                        })
                    };
                }
            }
        }
    }

    async fn run_capture(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git").args(args).current_dir(cwd).output().await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitClient for ProcessGit {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        build_id: i64,
        log: &dyn BuildLog,
    ) -> Result<(), GitError> {
        let dest_str = dest.to_string_lossy().to_string();
        self.run_logged(
            None,
            &["clone", "--config", "http.sslVerify=false", url, &dest_str],
            true,
            build_id,
            log,
        )
        .await?;
        self.run_logged(
            Some(dest),
            &["config", "http.sslverify", "false"],
            false,
            build_id,
            log,
        )
        .await?;
        // Best-effort: a host without git-lfs installed should not fail clone.
        let _ = self.run_logged(Some(dest), &["lfs", "install"], false, build_id, log).await;
        Ok(())
    }

    async fn checkout(
        &self,
        path: &Path,
        git_ref: &str,
        build_id: i64,
        log: &dyn BuildLog,
    ) -> Result<(), GitError> {
        self.run_logged(Some(path), &["reset", "--hard", "origin"], false, build_id, log)
            .await?;
        self.run_logged(
            Some(path),
            &["fetch", "--tags", "--prune", "--prune-tags", "--force"],
            true,
            build_id,
            log,
        )
        .await?;
        self.run_logged(Some(path), &["checkout", "--force", git_ref], false, build_id, log)
            .await?;
        self.run_logged(
            Some(path),
            &["submodule", "sync", "--recursive"],
            false,
            build_id,
            log,
        )
        .await?;
        self.run_logged(
            Some(path),
            &["submodule", "update", "--init", "--recursive"],
            false,
            build_id,
            log,
        )
        .await?;
        self.run_logged(Some(path), &["clean", "-dffx"], false, build_id, log)
            .await?;
        // Best-effort: a repo without Git LFS objects should not fail checkout.
        let _ = self.run_logged(Some(path), &["lfs", "pull"], false, build_id, log).await;
        Ok(())
    }

    async fn clean(&self, path: &Path, build_id: i64, log: &dyn BuildLog) -> Result<(), GitError> {
        self.run_logged(Some(path), &["reset", "--hard"], false, build_id, log)
            .await?;
        self.run_logged(Some(path), &["clean", "-dffx"], false, build_id, log)
            .await?;
        self.run_logged(Some(path), &["fetch", "-p"], true, build_id, log)
            .await
    }

    async fn fetch_tags(&self, path: &Path, build_id: i64, log: &dyn BuildLog) -> Result<(), GitError> {
        self.run_logged(
            Some(path),
            &["fetch", "--tags", "--prune-tags", "--force"],
            true,
            build_id,
            log,
        )
        .await
    }

    async fn list_tags(&self, path: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run_capture(path, &["tag"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn tag_timestamp(&self, path: &Path, tag: &str) -> Result<i64, GitError> {
        let out = self
            .run_capture(path, &["log", "-1", "--format=%ct", tag])
            .await?;
        out.trim()
            .parse()
            .map_err(|_| GitError::CommandFailed { command: format!("git log {tag}"), status: -1 })
    }

    async fn show_head(&self, path: &Path) -> Result<(String, String, String), GitError> {
        let out = self
            .run_capture(path, &["show", "-s", "--format=%H%x09%ae%x09%an"])
            .await?;
        let mut parts = out.splitn(3, '\t');
        let hash = parts.next().unwrap_or_default().to_string();
        let email = parts.next().unwrap_or_default().to_string();
        let name = parts.next().unwrap_or_default().to_string();
        Ok((hash, email, name))
    }

    async fn set_remote_url(&self, path: &Path, url: &str) -> Result<(), GitError> {
        Command::new("git")
            .args(["remote", "set-url", "origin", url])
            .current_dir(path)
            .status()
            .await?;
        Ok(())
    }
}

/// Picks the tag with the maximum commit timestamp among those whose name
/// passes `is_valid_format`. `None` if no tag qualifies.
pub fn pick_latest_valid_tag<F>(tags_with_ts: &[(String, i64)], is_valid_format: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    tags_with_ts
        .iter()
        .filter(|(tag, _)| is_valid_format(tag))
        .max_by_key(|(_, ts)| *ts)
        .map(|(tag, _)| tag.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semver_like(tag: &str) -> bool {
        tag.chars().next().map(|c| c == 'v').unwrap_or(false)
            && tag[1..].split('.').all(|part| part.chars().all(|c| c.is_ascii_digit()))
    }

    #[test]
    fn picks_tag_with_max_timestamp_among_valid_ones() {
        let tags = vec![
            ("v1.0".to_string(), 100),
            ("v1.1".to_string(), 300),
            ("nightly".to_string(), 500),
        ];
        assert_eq!(pick_latest_valid_tag(&tags, semver_like), Some("v1.1".to_string()));
    }

    #[test]
    fn no_valid_tag_yields_none() {
        let tags = vec![("nightly".to_string(), 500), ("unstable".to_string(), 600)];
        assert_eq!(pick_latest_valid_tag(&tags, semver_like), None);
    }
}
