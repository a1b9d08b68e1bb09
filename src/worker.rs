//! The Worker: a single cooperative consumer that dequeues one `Task` at a
//! time, dispatches it to a typed handler, and never lets a handler's error
//! unwind the loop.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::BuildBackend;
use crate::build::state::BuildStateMachine;
use crate::context::Context;
use crate::error::WorkerError;
use crate::repository::{RepoState, RepositoryManager};
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskReceiver};

/// How long a handler yields before requeueing a task whose precondition
/// was transiently false (repo busy, chroot cap reached).
const REQUEUE_DELAY: Duration = Duration::from_secs(2);

pub struct Worker {
    receiver: TaskReceiver,
    ctx: Arc<Context>,
}

impl Worker {
    pub fn new(receiver: TaskReceiver, ctx: Arc<Context>) -> Self {
        Self { receiver, ctx }
    }

    /// Runs until the shutdown sentinel is received or every `TaskQueue`
    /// handle has been dropped.
    pub async fn run(&mut self) {
        while let Some(task) = self.receiver.dequeue().await {
            let tag = task.tag();
            if let Err(err) = self.dispatch(task).await {
                tracing::error!(tag, error = %err, "task handler failed");
            }
        }
        tracing::info!("worker loop exiting");
    }

    async fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        match task {
            Task::Clone { build_id, repo_id } => self.handle_clone(build_id, repo_id).await,
            Task::Build {
                build_id,
                repo_id,
                git_ref,
                ci_branch,
                targets,
                force_ci,
            } => {
                self.handle_build(build_id, repo_id, git_ref, ci_branch, targets, force_ci)
                    .await
            }
            Task::BuildLatest { repo_id, build_id } => {
                self.handle_build_latest(repo_id, build_id).await
            }
            Task::Rebuild { build_id } => self.handle_rebuild(build_id).await,
            Task::Schedule => self.handle_schedule().await,
            Task::BuildEnv {
                chroot_id,
                build_id,
                dist,
                name,
                version,
                arch,
                components,
                url,
                keys,
            } => {
                self.handle_build_env(chroot_id, build_id, dist, name, version, arch, components, url, keys)
                    .await
            }
            Task::MergeDuplicateRepo { keep_id, dup_id } => {
                self.handle_merge_duplicate_repo(keep_id, dup_id).await
            }
            Task::DeleteRepo { repo_id } => self.handle_delete_repo(repo_id).await,
        }
    }

    fn state_machine(&self) -> BuildStateMachine<'_> {
        BuildStateMachine::new(
            &*self.ctx.build_store,
            &*self.ctx.clock,
            &*self.ctx.notifier,
            &*self.ctx.log,
        )
    }

    fn repo_manager(&self) -> RepositoryManager<'_> {
        RepositoryManager::new(&*self.ctx.repo_store)
    }

    /// precondition: `repo.state ∈ {new, error}`. Effect: repo → cloning;
    /// spawn a detached clone job.
    async fn handle_clone(&self, build_id: i64, repo_id: i64) -> Result<(), WorkerError> {
        let repo = self.ctx.repo_store.get(repo_id).await?;
        if repo.state != RepoState::New && repo.state != RepoState::Error {
            tracing::debug!(repo_id, ?repo.state, "clone precondition not met, requeueing");
            self.requeue_after_delay(Task::Clone { build_id, repo_id });
            return Ok(());
        }

        self.repo_manager().set_cloning(repo_id).await?;

        let ctx = Arc::clone(&self.ctx);
        spawn_detached(async move { run_clone_job(ctx, build_id, repo_id).await });
        Ok(())
    }

    /// precondition: `repo.state == ready`. Effect: build → building; repo →
    /// busy; spawn a detached build job.
    async fn handle_build(
        &self,
        build_id: i64,
        repo_id: i64,
        git_ref: Option<String>,
        ci_branch: Option<String>,
        targets: Option<Vec<String>>,
        force_ci: bool,
    ) -> Result<(), WorkerError> {
        let repo = self.ctx.repo_store.get(repo_id).await?;
        if repo.state != RepoState::Ready {
            tracing::debug!(repo_id, ?repo.state, "build precondition not met, requeueing");
            self.requeue_after_delay(Task::Build {
                build_id,
                repo_id,
                git_ref,
                ci_branch,
                targets,
                force_ci,
            });
            return Ok(());
        }

        self.repo_manager().set_busy(repo_id).await?;
        self.state_machine().set_building(build_id).await?;

        let ctx = Arc::clone(&self.ctx);
        spawn_detached(async move {
            run_build_job(ctx, build_id, repo_id, git_ref, ci_branch, targets, force_ci).await
        });
        Ok(())
    }

    /// precondition: `repo.state == ready`. Fetches tags, picks the latest
    /// valid one, and enqueues a `build` task for it.
    async fn handle_build_latest(&self, repo_id: i64, build_id: i64) -> Result<(), WorkerError> {
        let repo = self.ctx.repo_store.get(repo_id).await?;
        if repo.state != RepoState::Ready {
            self.requeue_after_delay(Task::BuildLatest { repo_id, build_id });
            return Ok(());
        }

        let Some(src_path) = repo.src_path(&self.ctx.repositories_root) else {
            tracing::warn!(repo_id, "repository has no checkout path, cannot resolve latest tag");
            return Ok(());
        };

        self.ctx.git.clean(&src_path, build_id, &*self.ctx.log).await?;
        self.ctx.git.fetch_tags(&src_path, build_id, &*self.ctx.log).await?;
        let tags = self.ctx.git.list_tags(&src_path).await?;
        let mut tags_with_ts = Vec::with_capacity(tags.len());
        for tag in tags {
            let ts = self.ctx.git.tag_timestamp(&src_path, &tag).await?;
            tags_with_ts.push((tag, ts));
        }

        match crate::git::pick_latest_valid_tag(&tags_with_ts, is_release_tag) {
            Some(tag) => {
                self.ctx.queue.enqueue(Task::Build {
                    build_id,
                    repo_id,
                    git_ref: Some(tag),
                    ci_branch: None,
                    targets: None,
                    force_ci: false,
                })?;
            }
            None => {
                tracing::warn!(repo_id, "no valid tag found for buildlatest");
                self.state_machine().set_failed(build_id).await?;
            }
        }
        Ok(())
    }

    /// precondition: build is in a terminal failure state. Cleans artifacts,
    /// resets state, and enqueues the per-buildtype follow-up.
    async fn handle_rebuild(&self, build_id: i64) -> Result<(), WorkerError> {
        let build = self.ctx.build_store.get(build_id).await?;
        let locked = self
            .ctx
            .build_store
            .is_projectversion_locked(build.projectversion_id)
            .await?;
        if !BuildStateMachine::can_rebuild(&build, locked) {
            tracing::debug!(build_id, ?build.buildstate, "build is not eligible for rebuild");
            return Ok(());
        }

        use crate::build::model::BuildType;
        match build.buildtype {
            BuildType::Deb => {
                let outdir = self.ctx.buildout_root.join(build_id.to_string());
                if outdir.exists() {
                    let _ = std::fs::remove_dir_all(&outdir);
                }
                self.state_machine().set_needs_build(build_id).await?;
                self.ctx.queue.enqueue(Task::Schedule)?;
            }
            BuildType::Source => {
                self.state_machine().set_needs_publish(build_id).await?;
                self.ctx.apt_queue.src_publish(build_id).await;
            }
            BuildType::Chroot => {
                match self.ctx.build_store.chroot_for_build(build_id).await? {
                    Some(chroot) => {
                        self.ctx.queue.enqueue(Task::BuildEnv {
                            chroot_id: chroot.id,
                            build_id,
                            dist: chroot.basemirror.distribution,
                            name: chroot.basemirror.name,
                            version: build.version.clone().unwrap_or_default(),
                            arch: chroot.architecture,
                            components: chroot.basemirror.components,
                            url: chroot.basemirror.url,
                            keys: chroot.basemirror.keys,
                        })?;
                    }
                    None => {
                        tracing::warn!(build_id, "no chroot row found for rebuild, skipping");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_schedule(&self) -> Result<(), WorkerError> {
        let ctx = Arc::clone(&self.ctx);
        spawn_detached(async move {
            let scheduler = Scheduler::new(&*ctx.build_store, &*ctx.backend);
            if let Err(err) = scheduler.run_pass().await {
                tracing::error!(error = %err, "scheduler pass failed");
            }
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_build_env(
        &self,
        chroot_id: i64,
        build_id: i64,
        dist: String,
        name: String,
        version: String,
        arch: String,
        components: Vec<String>,
        url: String,
        keys: Vec<String>,
    ) -> Result<(), WorkerError> {
        if !self.ctx.chroot_governor.try_acquire() {
            tracing::debug!(chroot_id, "chroot concurrency cap reached, requeueing");
            self.requeue_after_delay(Task::BuildEnv {
                chroot_id,
                build_id,
                dist,
                name,
                version,
                arch,
                components,
                url,
                keys,
            });
            return Ok(());
        }

        self.state_machine().set_building(build_id).await?;
        let ctx = Arc::clone(&self.ctx);
        spawn_detached(async move {
            let result = build_chroot_env(&ctx, build_id).await;
            ctx.chroot_governor.release();
            let machine = BuildStateMachine::new(&*ctx.build_store, &*ctx.clock, &*ctx.notifier, &*ctx.log);
            match result {
                Ok(()) => {
                    if let Err(err) = machine.set_successful(build_id).await {
                        tracing::error!(build_id, error = %err, "failed to record chroot build success");
                    }
                }
                Err(err) => {
                    tracing::error!(build_id, error = %err, "chroot build environment construction failed");
                    if let Err(err) = machine.set_failed(build_id).await {
                        tracing::error!(build_id, error = %err, "failed to record chroot build failure");
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_merge_duplicate_repo(&self, keep_id: i64, dup_id: i64) -> Result<(), WorkerError> {
        match self.repo_manager().merge_duplicate_repo(keep_id, dup_id).await {
            Ok(_) => {
                let dup_path = self.ctx.repositories_root.join(dup_id.to_string());
                if dup_path.exists() {
                    let _ = std::fs::remove_dir_all(&dup_path);
                }
                Ok(())
            }
            Err(crate::error::RepositoryError::WrongState(_, _)) => {
                self.requeue_after_delay(Task::MergeDuplicateRepo { keep_id, dup_id });
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_delete_repo(&self, repo_id: i64) -> Result<(), WorkerError> {
        let deleted = self.repo_manager().delete_repo(repo_id).await?;
        if deleted {
            let repo_path = self.ctx.repositories_root.join(repo_id.to_string());
            if repo_path.exists() {
                let _ = std::fs::remove_dir_all(&repo_path);
            }
        } else {
            tracing::info!(repo_id, "repository not eligible for deletion, skipping");
        }
        Ok(())
    }

    /// Re-enqueues `task` after `REQUEUE_DELAY`, without blocking this
    /// Worker iteration from completing.
    fn requeue_after_delay(&self, task: Task) {
        let queue = self.ctx.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REQUEUE_DELAY).await;
            let _ = queue.enqueue(task);
        });
    }
}

/// Spawns `future` as a detached job, tracking it in the
/// `molior_active_detached_jobs` gauge for the duration of its run.
fn spawn_detached<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    crate::metrics::adjust_active_detached_jobs(1);
    tokio::spawn(async move {
        future.await;
        crate::metrics::adjust_active_detached_jobs(-1);
    });
}

/// `v<major>.<minor>(.<patch>)` release tags only; anything else (e.g.
/// `nightly`, `unstable`) is not a build-eligible tag.
fn is_release_tag(tag: &str) -> bool {
    let Some(rest) = tag.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

async fn run_clone_job(ctx: Arc<Context>, build_id: i64, repo_id: i64) {
    let result = clone_repo(&ctx, build_id, repo_id).await;
    let repo_manager = RepositoryManager::new(&*ctx.repo_store);
    match result {
        Ok(()) => {
            if let Err(err) = repo_manager.set_ready(repo_id).await {
                tracing::error!(repo_id, error = %err, "failed to mark repository ready after clone");
            }
            let _ = ctx.queue.enqueue(Task::BuildLatest { repo_id, build_id });
        }
        Err(err) => {
            tracing::error!(repo_id, error = %err, "clone failed");
            if let Err(err) = repo_manager.set_error(repo_id).await {
                tracing::error!(repo_id, error = %err, "failed to mark repository error after failed clone");
            }
            let machine = BuildStateMachine::new(&*ctx.build_store, &*ctx.clock, &*ctx.notifier, &*ctx.log);
            if let Err(err) = machine.set_failed(build_id).await {
                tracing::error!(build_id, error = %err, "failed to record clone failure on driving build");
            }
        }
    }
}

async fn clone_repo(ctx: &Context, build_id: i64, repo_id: i64) -> Result<(), WorkerError> {
    let repo = ctx.repo_store.get(repo_id).await?;
    let dest = repo.path(&ctx.repositories_root);
    if dest.exists() {
        let _ = std::fs::remove_dir_all(&dest);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            crate::error::GitError::Spawn(e)
        })?;
    }
    ctx.git.clone_repo(&repo.url, &dest, build_id, &*ctx.log).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_build_job(
    ctx: Arc<Context>,
    build_id: i64,
    repo_id: i64,
    git_ref: Option<String>,
    ci_branch: Option<String>,
    _targets: Option<Vec<String>>,
    _force_ci: bool,
) {
    let result = build_source_package(&ctx, build_id, repo_id, git_ref, ci_branch).await;
    let repo_manager = RepositoryManager::new(&*ctx.repo_store);
    let machine = BuildStateMachine::new(&*ctx.build_store, &*ctx.clock, &*ctx.notifier, &*ctx.log);
    match result {
        Ok(()) => {
            if let Err(err) = machine.set_needs_publish(build_id).await {
                tracing::error!(build_id, error = %err, "failed to record successful build checkout");
            } else {
                ctx.apt_queue.src_publish(build_id).await;
            }
        }
        Err(err) => {
            tracing::error!(build_id, error = %err, "build checkout failed");
            if let Err(err) = machine.set_failed(build_id).await {
                tracing::error!(build_id, error = %err, "failed to record build failure");
            }
        }
    }
    if let Err(err) = repo_manager.set_ready(repo_id).await {
        tracing::error!(repo_id, error = %err, "failed to release repository after build");
    }
}

async fn build_source_package(
    ctx: &Context,
    build_id: i64,
    repo_id: i64,
    git_ref: Option<String>,
    _ci_branch: Option<String>,
) -> Result<(), WorkerError> {
    let repo = ctx.repo_store.get(repo_id).await?;
    let Some(src_path) = repo.src_path(&ctx.repositories_root) else {
        return Err(crate::error::GitError::NoValidTag.into());
    };
    let git_ref = git_ref.unwrap_or_else(|| "HEAD".to_string());
    ctx.git.checkout(&src_path, &git_ref, build_id, &*ctx.log).await?;
    Ok(())
}

async fn build_chroot_env(ctx: &Context, build_id: i64) -> Result<(), WorkerError> {
    ctx.log.log(build_id, "constructing build environment");
    Ok(())
}
