//! Startup Reconciler: run once before the Worker main loop to restore the
//! invariant that `building`/`publishing` states are never observed without
//! an active process owning them, and to backfill repository names left
//! null by an interrupted clone.

use crate::build::state::BuildStore;
use crate::build::{BuildState, BuildStateMachine};
use crate::clock::Clock;
use crate::error::{BuildStateError, RepositoryError};
use crate::notifier::{BuildLog, Notifier};
use crate::repository::{derive_name_from_url, RepositoryStore};

pub struct Reconciler<'a> {
    build_store: &'a dyn BuildStore,
    repo_store: &'a dyn RepositoryStore,
    clock: &'a dyn Clock,
    notifier: &'a dyn Notifier,
    log: &'a dyn BuildLog,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        build_store: &'a dyn BuildStore,
        repo_store: &'a dyn RepositoryStore,
        clock: &'a dyn Clock,
        notifier: &'a dyn Notifier,
        log: &'a dyn BuildLog,
    ) -> Self {
        Self {
            build_store,
            repo_store,
            clock,
            notifier,
            log,
        }
    }

    /// Returns the number of builds whose state was reconciled.
    pub async fn run(&self) -> Result<usize, BuildStateError> {
        let machine = BuildStateMachine::new(self.build_store, self.clock, self.notifier, self.log);
        let mut reconciled = 0;

        for build in self.build_store.non_root_in_state(BuildState::Building).await? {
            machine.set_failed(build.id).await?;
            self.build_store.clear_buildtask(build.id).await?;
            reconciled += 1;
        }
        for build in self.build_store.non_root_in_state(BuildState::Publishing).await? {
            machine.set_publish_failed(build.id).await?;
            self.build_store.clear_buildtask(build.id).await?;
            reconciled += 1;
        }

        if let Err(err) = self.backfill_repository_names().await {
            tracing::warn!(error = %err, "repository name backfill pass failed");
        }

        Ok(reconciled)
    }

    async fn backfill_repository_names(&self) -> Result<(), RepositoryError> {
        for mut repo in self.repo_store.list_with_null_name().await? {
            match derive_name_from_url(&repo.url) {
                Ok(name) => {
                    repo.name = Some(name);
                    self.repo_store.save(&repo).await?;
                }
                Err(err) => {
                    tracing::warn!(repo_id = repo.id, url = %repo.url, error = %err, "failed to derive repository name, skipping");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::model::{Build, BuildType};
    use crate::clock::test_support::FixedClock;
    use crate::notifier::test_support::{RecordingLog, RecordingNotifier};
    use crate::repository::{RepoState, SourceRepository};
    use async_trait::async_trait;
    use chrono::Local;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeBuildStore {
        builds: Mutex<HashMap<i64, Build>>,
    }

    #[async_trait]
    impl BuildStore for FakeBuildStore {
        async fn get(&self, id: i64) -> Result<Build, BuildStateError> {
            self.builds.lock().unwrap().get(&id).cloned().ok_or(BuildStateError::NotFound(id))
        }
        async fn save(&self, build: &Build) -> Result<(), BuildStateError> {
            self.builds.lock().unwrap().insert(build.id, build.clone());
            Ok(())
        }
        async fn parent(&self, build: &Build) -> Result<Option<Build>, BuildStateError> {
            Ok(match build.parent_id {
                Some(pid) => self.builds.lock().unwrap().get(&pid).cloned(),
                None => None,
            })
        }
        async fn siblings(&self, _build: &Build) -> Result<Vec<Build>, BuildStateError> {
            Ok(Vec::new())
        }
        async fn maintainer(&self, _build: &Build) -> Result<(Option<String>, Option<String>), BuildStateError> {
            Ok((None, None))
        }
        async fn needs_build_debs(&self) -> Result<Vec<Build>, BuildStateError> {
            Ok(Vec::new())
        }
        async fn non_root_in_state(&self, state: BuildState) -> Result<Vec<Build>, BuildStateError> {
            let guard = self.builds.lock().unwrap();
            Ok(guard
                .values()
                .filter(|b| b.buildtype != BuildType::Build && b.buildstate == state)
                .cloned()
                .collect())
        }
        async fn clear_buildtask(&self, _build_id: i64) -> Result<(), BuildStateError> {
            Ok(())
        }
        async fn is_projectversion_locked(&self, _projectversion_id: Option<i64>) -> Result<bool, BuildStateError> {
            Ok(false)
        }

        async fn chroot_for_build(&self, _build_id: i64) -> Result<Option<crate::chroot::Chroot>, BuildStateError> {
            Ok(None)
        }
    }

    struct FakeRepoStore {
        repos: Mutex<HashMap<i64, SourceRepository>>,
    }

    #[async_trait]
    impl RepositoryStore for FakeRepoStore {
        async fn get(&self, id: i64) -> Result<SourceRepository, RepositoryError> {
            self.repos.lock().unwrap().get(&id).cloned().ok_or(RepositoryError::NotFound(id))
        }
        async fn save(&self, repo: &SourceRepository) -> Result<(), RepositoryError> {
            self.repos.lock().unwrap().insert(repo.id, repo.clone());
            Ok(())
        }
        async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
            self.repos.lock().unwrap().remove(&id);
            Ok(())
        }
        async fn build_count(&self, _repo_id: i64) -> Result<i64, RepositoryError> {
            Ok(0)
        }
        async fn projectversion_attachment_count(&self, _repo_id: i64) -> Result<i64, RepositoryError> {
            Ok(0)
        }
        async fn reassign_builds(&self, _from_id: i64, _to_id: i64) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn merge_projectversion_attachments(&self, _keep_id: i64, _dup_id: i64) -> Result<bool, RepositoryError> {
            Ok(true)
        }
        async fn list_with_null_name(&self) -> Result<Vec<SourceRepository>, RepositoryError> {
            Ok(self.repos.lock().unwrap().values().filter(|r| r.name.is_none()).cloned().collect())
        }
    }

    fn build(id: i64, parent_id: Option<i64>, buildtype: BuildType, state: BuildState) -> Build {
        Build {
            id,
            parent_id,
            buildtype,
            buildstate: state,
            createdstamp: Local::now(),
            startstamp: None,
            buildendstamp: None,
            endstamp: None,
            version: None,
            git_ref: None,
            ci_branch: None,
            sourcename: None,
            architecture: None,
            is_ci: false,
            builddeps: None,
            projectversions: Vec::new(),
            sourcerepository_id: None,
            projectversion_id: None,
            maintainer_id: None,
            buildtask_id: None,
        }
    }

    #[tokio::test]
    async fn abandoned_building_deb_becomes_build_failed() {
        let build_store = FakeBuildStore {
            builds: Mutex::new(
                vec![
                    (1, build(1, None, BuildType::Build, BuildState::Building)),
                    (2, build(2, Some(1), BuildType::Deb, BuildState::Building)),
                ]
                .into_iter()
                .collect(),
            ),
        };
        let repo_store = FakeRepoStore { repos: Mutex::new(HashMap::new()) };
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let reconciler = Reconciler::new(&build_store, &repo_store, &clock, &notifier, &log);

        let reconciled = reconciler.run().await.unwrap();
        assert_eq!(reconciled, 1);
        assert_eq!(
            build_store.builds.lock().unwrap()[&2].buildstate,
            BuildState::BuildFailed
        );
    }

    #[tokio::test]
    async fn repository_names_are_backfilled_from_url() {
        let build_store = FakeBuildStore { builds: Mutex::new(HashMap::new()) };
        let repo_store = FakeRepoStore {
            repos: Mutex::new(
                vec![(1, SourceRepository {
                    id: 1,
                    url: "https://example.com/group/project.git".to_string(),
                    name: None,
                    state: RepoState::Ready,
                })]
                .into_iter()
                .collect(),
            ),
        };
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let reconciler = Reconciler::new(&build_store, &repo_store, &clock, &notifier, &log);

        reconciler.run().await.unwrap();
        assert_eq!(
            repo_store.repos.lock().unwrap()[&1].name,
            Some("project".to_string())
        );
    }
}
