//! Build state machine: transitions, timestamp side effects, and
//! parent/child aggregation across the build→source→deb tree.

use async_trait::async_trait;

use crate::chroot::Chroot;
use crate::clock::Clock;
use crate::error::BuildStateError;
use crate::notifier::{BuildLog, Event, Notifier, Subject};

use super::model::{Build, BuildState, BuildType};

/// Storage contract the state machine needs: fetch/persist a `Build`, and
/// walk the parent/sibling edges of its tree. Kept separate from the
/// concrete `storage::Database` so the aggregation logic is testable
/// against an in-memory fake without a live database session.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Build, BuildStateError>;
    async fn save(&self, build: &Build) -> Result<(), BuildStateError>;
    async fn parent(&self, build: &Build) -> Result<Option<Build>, BuildStateError>;
    /// Children of `build`'s parent, excluding `build` itself.
    async fn siblings(&self, build: &Build) -> Result<Vec<Build>, BuildStateError>;
    async fn maintainer(
        &self,
        build: &Build,
    ) -> Result<(Option<String>, Option<String>), BuildStateError>;
    /// All `deb` builds currently in `needs_build`, for the Scheduler pass.
    async fn needs_build_debs(&self) -> Result<Vec<Build>, BuildStateError>;
    /// Every non-`build`-type build currently in `state`, for the Startup
    /// Reconciler.
    async fn non_root_in_state(&self, state: BuildState) -> Result<Vec<Build>, BuildStateError>;
    /// Deletes the `buildtask` row associated with `build_id`, if any.
    async fn clear_buildtask(&self, build_id: i64) -> Result<(), BuildStateError>;
    /// Whether `projectversion_id` is locked against rebuilds. `None`
    /// (no project version attached) is always unlocked.
    async fn is_projectversion_locked(&self, projectversion_id: Option<i64>) -> Result<bool, BuildStateError>;
    /// The `Chroot` row driven by `build_id`, if any, for reconstructing a
    /// `buildenv` task's arguments on rebuild.
    async fn chroot_for_build(&self, build_id: i64) -> Result<Option<Chroot>, BuildStateError>;
}

/// `deb` transitions that qualify for outbound hook delivery.
fn qualifies_for_hooks(buildtype: BuildType, state: BuildState) -> bool {
    buildtype == BuildType::Deb
        && matches!(
            state,
            BuildState::Building
                | BuildState::Successful
                | BuildState::BuildFailed
                | BuildState::PublishFailed
        )
}

/// Drives state transitions for a single `Build`, including the
/// notifications, hook fires, and parent/child aggregation each transition
/// entails.
pub struct BuildStateMachine<'a> {
    pub store: &'a dyn BuildStore,
    pub clock: &'a dyn Clock,
    pub notifier: &'a dyn Notifier,
    pub log: &'a dyn BuildLog,
}

impl<'a> BuildStateMachine<'a> {
    pub fn new(
        store: &'a dyn BuildStore,
        clock: &'a dyn Clock,
        notifier: &'a dyn Notifier,
        log: &'a dyn BuildLog,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            log,
        }
    }

    async fn persist_and_notify(&self, build: &Build) -> Result<(), BuildStateError> {
        self.store.save(build).await?;
        crate::metrics::record_build_state(build.buildstate.as_str());
        let (name, email) = self.store.maintainer(build).await?;
        self.notifier
            .notify(Subject::Build, Event::Changed, build.data(name, email))
            .await;
        if qualifies_for_hooks(build.buildtype, build.buildstate) {
            self.notifier.run_hooks(build.id).await;
        }
        Ok(())
    }

    /// Entered when a build is queued for (re)building. Clears the
    /// terminal/build-end timestamps and, for a `deb` build, ensures its
    /// grandparent reflects that the overall task is building again.
    pub async fn set_needs_build(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::NeedsBuild;
        build.endstamp = None;
        build.buildendstamp = None;
        self.persist_and_notify(&build).await?;

        if build.buildtype == BuildType::Deb {
            if let Some(parent) = self.store.parent(&build).await? {
                if let Some(grandparent) = self.store.parent(&parent).await? {
                    if grandparent.buildstate != BuildState::Building {
                        self.set_building(grandparent.id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn set_scheduled(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::Scheduled;
        self.persist_and_notify(&build).await
    }

    pub async fn set_building(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::Building;
        build.startstamp = Some(self.clock.now());
        build.endstamp = None;
        self.persist_and_notify(&build).await
    }

    pub async fn set_needs_publish(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::NeedsPublish;
        build.buildendstamp = Some(self.clock.now());
        self.persist_and_notify(&build).await
    }

    pub async fn set_publishing(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::Publishing;
        self.persist_and_notify(&build).await
    }

    /// Enters `build_failed`. A `deb` failure escalates the grandparent
    /// (root `build`) to `build_failed` and closes its log with a `"Done"`
    /// title; a `source` failure propagates to its `build` parent.
    pub fn set_failed<'f>(
        &'f self,
        build_id: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BuildStateError>> + Send + 'f>>
    {
        Box::pin(async move {
            let mut build = self.store.get(build_id).await?;
            build.buildstate = BuildState::BuildFailed;
            let now = self.clock.now();
            build.buildendstamp = Some(now);
            build.endstamp = Some(now);
            self.persist_and_notify(&build).await?;

            match build.buildtype {
                BuildType::Deb => {
                    if let Some(parent) = self.store.parent(&build).await? {
                        if let Some(grandparent) = self.store.parent(&parent).await? {
                            if grandparent.buildstate != BuildState::BuildFailed {
                                self.set_failed(grandparent.id).await?;
                                self.log.log_title(grandparent.id, "Done");
                            }
                        }
                    }
                }
                BuildType::Source => {
                    if let Some(parent) = self.store.parent(&build).await? {
                        self.set_failed(parent.id).await?;
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Enters `publish_failed`. Reproduces the upstream escalation check
    /// against `build_failed` rather than `publish_failed` on the
    /// grandparent (see DESIGN.md for why this is kept as-is).
    pub fn set_publish_failed<'f>(
        &'f self,
        build_id: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BuildStateError>> + Send + 'f>>
    {
        Box::pin(async move {
            let mut build = self.store.get(build_id).await?;
            build.buildstate = BuildState::PublishFailed;
            build.endstamp = Some(self.clock.now());
            self.persist_and_notify(&build).await?;

            if build.buildtype == BuildType::Deb {
                if let Some(parent) = self.store.parent(&build).await? {
                    if let Some(grandparent) = self.store.parent(&parent).await? {
                        if grandparent.buildstate != BuildState::BuildFailed {
                            self.set_failed(grandparent.id).await?;
                            self.log.log_title(grandparent.id, "Done");
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Enters `successful`. A `deb` build whose siblings are now all
    /// `successful` promotes the grandparent to `successful` too, closing
    /// its log with a `"Done"` title.
    pub async fn set_successful(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::Successful;
        build.endstamp = Some(self.clock.now());
        self.persist_and_notify(&build).await?;

        if build.buildtype == BuildType::Deb {
            let siblings = self.store.siblings(&build).await?;
            let all_successful = siblings
                .iter()
                .all(|s| s.buildstate == BuildState::Successful);
            if all_successful {
                if let Some(parent) = self.store.parent(&build).await? {
                    if let Some(grandparent) = self.store.parent(&parent).await? {
                        self.set_successful_leaf(grandparent.id).await?;
                        self.log.log_title(grandparent.id, "Done");
                    }
                }
            }
        }
        Ok(())
    }

    /// `set_successful` without the sibling-aggregation recursion, used
    /// when promoting a `build` root which has no deb siblings of its own.
    async fn set_successful_leaf(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::Successful;
        build.endstamp = Some(self.clock.now());
        self.persist_and_notify(&build).await
    }

    pub async fn set_already_exists(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::AlreadyExists;
        build.endstamp = Some(self.clock.now());
        self.persist_and_notify(&build).await
    }

    pub async fn set_nothing_done(&self, build_id: i64) -> Result<(), BuildStateError> {
        let mut build = self.store.get(build_id).await?;
        build.buildstate = BuildState::NothingDone;
        build.endstamp = Some(self.clock.now());
        self.persist_and_notify(&build).await
    }

    /// A build is rebuildable iff it's in a failure terminal state and its
    /// project-version, if any, is not locked.
    pub fn can_rebuild(build: &Build, projectversion_locked: bool) -> bool {
        build.buildstate.is_failed() && !projectversion_locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::notifier::test_support::{RecordingLog, RecordingNotifier};
    use chrono::Local;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeStore {
        builds: Mutex<HashMap<i64, Build>>,
    }

    impl FakeStore {
        fn new(builds: Vec<Build>) -> Self {
            Self {
                builds: Mutex::new(builds.into_iter().map(|b| (b.id, b)).collect()),
            }
        }

        fn get_sync(&self, id: i64) -> Build {
            self.builds.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildStore for FakeStore {
        async fn get(&self, id: i64) -> Result<Build, BuildStateError> {
            self.builds
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(BuildStateError::NotFound(id))
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

        async fn siblings(&self, build: &Build) -> Result<Vec<Build>, BuildStateError> {
            let guard = self.builds.lock().unwrap();
            Ok(guard
                .values()
                .filter(|b| b.parent_id == build.parent_id && b.id != build.id)
                .cloned()
                .collect())
        }

        async fn maintainer(
            &self,
            _build: &Build,
        ) -> Result<(Option<String>, Option<String>), BuildStateError> {
            Ok((None, None))
        }

        async fn needs_build_debs(&self) -> Result<Vec<Build>, BuildStateError> {
            let guard = self.builds.lock().unwrap();
            Ok(guard
                .values()
                .filter(|b| b.buildtype == BuildType::Deb && b.buildstate == BuildState::NeedsBuild)
                .cloned()
                .collect())
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

        async fn chroot_for_build(&self, _build_id: i64) -> Result<Option<Chroot>, BuildStateError> {
            Ok(None)
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

    fn tree() -> FakeStore {
        FakeStore::new(vec![
            build(1, None, BuildType::Build, BuildState::Building),
            build(2, Some(1), BuildType::Source, BuildState::Building),
            build(3, Some(2), BuildType::Deb, BuildState::Building),
            build(4, Some(2), BuildType::Deb, BuildState::Building),
        ])
    }

    #[tokio::test]
    async fn sibling_aggregation_promotes_grandparent_when_all_succeed() {
        let store = tree();
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_successful(3).await.unwrap();
        assert_eq!(store.get_sync(1).buildstate, BuildState::Building);
        assert!(log.titles.lock().unwrap().is_empty());

        machine.set_successful(4).await.unwrap();
        assert_eq!(store.get_sync(1).buildstate, BuildState::Successful);
        assert_eq!(log.titles.lock().unwrap(), vec![(1, "Done".to_string())]);
    }

    #[tokio::test]
    async fn deb_failure_escalates_to_grandparent() {
        let store = tree();
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_failed(3).await.unwrap();
        assert_eq!(store.get_sync(1).buildstate, BuildState::BuildFailed);
        assert_eq!(store.get_sync(3).buildstate, BuildState::BuildFailed);
        assert_eq!(store.get_sync(4).buildstate, BuildState::Building);
        assert_eq!(log.titles.lock().unwrap(), vec![(1, "Done".to_string())]);
    }

    #[tokio::test]
    async fn deb_failure_does_not_re_escalate_already_failed_grandparent() {
        let store = tree();
        store.builds.lock().unwrap().get_mut(&1).unwrap().buildstate = BuildState::BuildFailed;
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_failed(3).await.unwrap();
        assert!(log.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_failure_propagates_to_build_parent_without_done_title() {
        let store = tree();
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_failed(2).await.unwrap();
        assert_eq!(store.get_sync(1).buildstate, BuildState::BuildFailed);
        assert!(log.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn entering_building_sets_startstamp() {
        let store = tree();
        let now = Local::now();
        let clock = FixedClock::new(now);
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_building(3).await.unwrap();
        assert_eq!(store.get_sync(3).startstamp, Some(now));
    }

    #[tokio::test]
    async fn entering_needs_build_clears_terminal_timestamps() {
        let store = tree();
        store.builds.lock().unwrap().get_mut(&3).unwrap().endstamp = Some(Local::now());
        store
            .builds
            .lock()
            .unwrap()
            .get_mut(&3)
            .unwrap()
            .buildendstamp = Some(Local::now());
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_needs_build(3).await.unwrap();
        let reloaded = store.get_sync(3);
        assert_eq!(reloaded.endstamp, None);
        assert_eq!(reloaded.buildendstamp, None);
    }

    #[tokio::test]
    async fn deb_hooks_fire_only_for_qualifying_transitions() {
        let store = tree();
        let clock = FixedClock::new(Local::now());
        let notifier = RecordingNotifier::default();
        let log = RecordingLog::default();
        let machine = BuildStateMachine::new(&store, &clock, &notifier, &log);

        machine.set_scheduled(3).await.unwrap();
        assert!(notifier.hooks_fired.lock().unwrap().is_empty());

        machine.set_building(3).await.unwrap();
        assert_eq!(*notifier.hooks_fired.lock().unwrap(), vec![3]);
    }

    #[test]
    fn can_rebuild_requires_failed_state_and_unlocked_projectversion() {
        let failed = build(9, None, BuildType::Deb, BuildState::BuildFailed);
        assert!(BuildStateMachine::can_rebuild(&failed, false));
        assert!(!BuildStateMachine::can_rebuild(&failed, true));

        let building = build(9, None, BuildType::Deb, BuildState::Building);
        assert!(!BuildStateMachine::can_rebuild(&building, false));
    }
}
