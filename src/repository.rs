//! `SourceRepository` lifecycle: the per-repository state flag that acts as
//! an advisory mutex serializing mutating operations (clone, merge, delete)
//! against a repository's on-disk checkout.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;

/// Lifecycle flag for a `SourceRepository`. `busy` is the exclusive right
/// to mutate the repository's on-disk tree; at most one handler may hold
/// it at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoState {
    New,
    Cloning,
    Ready,
    Busy,
    Error,
}

impl RepoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoState::New => "new",
            RepoState::Cloning => "cloning",
            RepoState::Ready => "ready",
            RepoState::Busy => "busy",
            RepoState::Error => "error",
        }
    }
}

impl std::fmt::Display for RepoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RepoState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => RepoState::New,
            "cloning" => RepoState::Cloning,
            "ready" => RepoState::Ready,
            "busy" => RepoState::Busy,
            "error" => RepoState::Error,
            other => return Err(format!("unknown repository state: {other}")),
        })
    }
}

/// A Git-hosted source repository tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRepository {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub state: RepoState,
}

impl SourceRepository {
    /// `/var/lib/molior/repositories/<id>`.
    pub fn path(&self, repositories_root: &std::path::Path) -> std::path::PathBuf {
        repositories_root.join(self.id.to_string())
    }

    /// `path/<name>`, the actual checkout directory.
    pub fn src_path(&self, repositories_root: &std::path::Path) -> Option<std::path::PathBuf> {
        self.name
            .as_ref()
            .map(|name| self.path(repositories_root).join(name))
    }
}

/// Storage contract the lifecycle manager needs.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<SourceRepository, RepositoryError>;
    async fn save(&self, repo: &SourceRepository) -> Result<(), RepositoryError>;
    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;
    async fn build_count(&self, repo_id: i64) -> Result<i64, RepositoryError>;
    async fn projectversion_attachment_count(&self, repo_id: i64) -> Result<i64, RepositoryError>;
    async fn reassign_builds(&self, from_id: i64, to_id: i64) -> Result<(), RepositoryError>;
    /// Where the kept repository already has a row for the same project
    /// version, reassigns the duplicate's row onto the kept repository and
    /// leaves the duplicate behind (it cannot be safely deleted). Returns
    /// `true` if no such conflicts were found, meaning the duplicate's rows
    /// were left untouched and it's safe for the caller to delete it.
    async fn merge_projectversion_attachments(
        &self,
        keep_id: i64,
        dup_id: i64,
    ) -> Result<bool, RepositoryError>;
    /// Repositories still awaiting a backfilled `name`, for the Startup
    /// Reconciler.
    async fn list_with_null_name(&self) -> Result<Vec<SourceRepository>, RepositoryError>;
}

/// Derives a repository's display name from its clone URL, the way the
/// upstream startup reconciler backfills `SourceRepository.name` for rows
/// with no name yet (`owner/repo` style hosts, SSH or HTTPS, trailing
/// `.git` stripped).
pub fn derive_name_from_url(url: &str) -> Result<String, RepositoryError> {
    let pattern = Regex::new(r"(?:/|:)([^/:]+?)(?:\.git)?/?$")
        .expect("static repository-name pattern is valid");
    pattern
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RepositoryError::UrlParse(url.to_string()))
}

/// Drives `SourceRepository` transitions and the repository-scoped
/// operations (`merge_duplicate_repo`, `delete_repo`) that require a
/// coherent view of both the repo row and its dependents.
pub struct RepositoryManager<'a> {
    pub store: &'a dyn RepositoryStore,
}

impl<'a> RepositoryManager<'a> {
    pub fn new(store: &'a dyn RepositoryStore) -> Self {
        Self { store }
    }

    pub async fn set_cloning(&self, repo_id: i64) -> Result<(), RepositoryError> {
        let mut repo = self.store.get(repo_id).await?;
        repo.state = RepoState::Cloning;
        self.store.save(&repo).await
    }

    pub async fn set_ready(&self, repo_id: i64) -> Result<(), RepositoryError> {
        let mut repo = self.store.get(repo_id).await?;
        repo.state = RepoState::Ready;
        self.store.save(&repo).await
    }

    pub async fn set_error(&self, repo_id: i64) -> Result<(), RepositoryError> {
        let mut repo = self.store.get(repo_id).await?;
        repo.state = RepoState::Error;
        self.store.save(&repo).await
    }

    /// Acquires the exclusive `busy` flag. Fails if the repository isn't
    /// currently `ready` — callers are expected to requeue on this error
    /// rather than retry in place.
    pub async fn set_busy(&self, repo_id: i64) -> Result<(), RepositoryError> {
        let mut repo = self.store.get(repo_id).await?;
        if repo.state != RepoState::Ready {
            return Err(RepositoryError::WrongState(
                repo_id,
                repo.state.to_string(),
            ));
        }
        repo.state = RepoState::Busy;
        self.store.save(&repo).await
    }

    /// Merges `dup_id` into `keep_id`. Both repositories must be `ready`.
    /// Every `Build` row is reassigned to the kept repository; the
    /// duplicate row (and its on-disk checkout) is deleted by the caller
    /// only if no project-version attachments had to be left behind.
    pub async fn merge_duplicate_repo(
        &self,
        keep_id: i64,
        dup_id: i64,
    ) -> Result<bool, RepositoryError> {
        let keep = self.store.get(keep_id).await?;
        let dup = self.store.get(dup_id).await?;
        if keep.state != RepoState::Ready || dup.state != RepoState::Ready {
            return Err(RepositoryError::WrongState(dup_id, dup.state.to_string()));
        }

        self.set_busy(keep_id).await?;
        self.set_busy(dup_id).await?;

        let no_conflicts = self
            .store
            .merge_projectversion_attachments(keep_id, dup_id)
            .await?;
        self.store.reassign_builds(dup_id, keep_id).await?;

        if no_conflicts {
            self.store.delete(dup_id).await?;
        } else {
            self.set_ready(dup_id).await?;
        }
        self.set_ready(keep_id).await?;
        Ok(no_conflicts)
    }

    /// Deletes a repository iff it has no project-version attachments and
    /// no builds; otherwise a no-op (callers log and drop).
    pub async fn delete_repo(&self, repo_id: i64) -> Result<bool, RepositoryError> {
        let repo = self.store.get(repo_id).await?;
        if repo.state != RepoState::Ready {
            return Ok(false);
        }
        if self.store.build_count(repo_id).await? > 0 {
            return Ok(false);
        }
        if self.store.projectversion_attachment_count(repo_id).await? > 0 {
            return Ok(false);
        }
        self.store.delete(repo_id).await?;
        Ok(true)
    }
}
