//! The `Build` entity: one recorded attempt at producing an artifact, or the
//! top-level task aggregating those attempts.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Kind of artifact a build produces, or `Build` for the top-level task that
/// aggregates a source build and its per-architecture deb children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    Build,
    Source,
    Deb,
    Chroot,
    Mirror,
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Build => "build",
            BuildType::Source => "source",
            BuildType::Deb => "deb",
            BuildType::Chroot => "chroot",
            BuildType::Mirror => "mirror",
        }
    }
}

impl std::fmt::Display for BuildType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a `Build`. See `build::state` for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    New,
    NeedsBuild,
    Scheduled,
    Building,
    BuildFailed,
    NeedsPublish,
    Publishing,
    PublishFailed,
    Successful,
    AlreadyExists,
    NothingDone,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::New => "new",
            BuildState::NeedsBuild => "needs_build",
            BuildState::Scheduled => "scheduled",
            BuildState::Building => "building",
            BuildState::BuildFailed => "build_failed",
            BuildState::NeedsPublish => "needs_publish",
            BuildState::Publishing => "publishing",
            BuildState::PublishFailed => "publish_failed",
            BuildState::Successful => "successful",
            BuildState::AlreadyExists => "already_exists",
            BuildState::NothingDone => "nothing_done",
        }
    }

    /// `build_failed` or `publish_failed`.
    pub fn is_failed(&self) -> bool {
        matches!(self, BuildState::BuildFailed | BuildState::PublishFailed)
    }

    /// States with no further outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::BuildFailed
                | BuildState::PublishFailed
                | BuildState::Successful
                | BuildState::AlreadyExists
                | BuildState::NothingDone
        )
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => BuildState::New,
            "needs_build" => BuildState::NeedsBuild,
            "scheduled" => BuildState::Scheduled,
            "building" => BuildState::Building,
            "build_failed" => BuildState::BuildFailed,
            "needs_publish" => BuildState::NeedsPublish,
            "publishing" => BuildState::Publishing,
            "publish_failed" => BuildState::PublishFailed,
            "successful" => BuildState::Successful,
            "already_exists" => BuildState::AlreadyExists,
            "nothing_done" => BuildState::NothingDone,
            other => return Err(format!("unknown buildstate: {other}")),
        })
    }
}

impl std::str::FromStr for BuildType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "build" => BuildType::Build,
            "source" => BuildType::Source,
            "deb" => BuildType::Deb,
            "chroot" => BuildType::Chroot,
            "mirror" => BuildType::Mirror,
            other => return Err(format!("unknown buildtype: {other}")),
        })
    }
}

/// One row of the Build tree: a top `build`, a `source`, or a per-architecture
/// `deb` (plus `chroot`/`mirror` for environment and index builds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub buildtype: BuildType,
    pub buildstate: BuildState,
    pub createdstamp: DateTime<Local>,
    pub startstamp: Option<DateTime<Local>>,
    pub buildendstamp: Option<DateTime<Local>>,
    pub endstamp: Option<DateTime<Local>>,
    pub version: Option<String>,
    pub git_ref: Option<String>,
    pub ci_branch: Option<String>,
    pub sourcename: Option<String>,
    pub architecture: Option<String>,
    pub is_ci: bool,
    pub builddeps: Option<String>,
    pub projectversions: Vec<String>,
    pub sourcerepository_id: Option<i64>,
    pub projectversion_id: Option<i64>,
    pub maintainer_id: Option<i64>,
    pub buildtask_id: Option<i64>,
}

/// An immutable projection of a `Build` handed to the notifier. Computed
/// once at the point of the state change, never a live handle, so the
/// notifier cannot observe a build mid-transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub buildstate: BuildState,
    pub buildtype: BuildType,
    pub startstamp: Option<String>,
    pub endstamp: Option<String>,
    pub version: Option<String>,
    pub sourcename: Option<String>,
    pub maintainer_name: Option<String>,
    pub maintainer_email: Option<String>,
    pub git_ref: Option<String>,
    pub branch: Option<String>,
    pub architecture: Option<String>,
    pub sourcerepository_id: Option<i64>,
}

impl Build {
    /// Projects the persisted row into the snapshot handed to the notifier.
    pub fn data(
        &self,
        maintainer_name: Option<String>,
        maintainer_email: Option<String>,
    ) -> BuildSnapshot {
        const FMT: &str = "%Y-%m-%d %H:%M:%S%z";
        BuildSnapshot {
            id: self.id,
            parent_id: self.parent_id,
            buildstate: self.buildstate,
            buildtype: self.buildtype,
            startstamp: self.startstamp.map(|t| t.format(FMT).to_string()),
            endstamp: self.endstamp.map(|t| t.format(FMT).to_string()),
            version: self.version.clone(),
            sourcename: self.sourcename.clone(),
            maintainer_name,
            maintainer_email,
            git_ref: self.git_ref.clone(),
            branch: self.ci_branch.clone(),
            architecture: self.architecture.clone(),
            sourcerepository_id: self.sourcerepository_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buildstate_round_trips_through_str() {
        for state in [
            BuildState::New,
            BuildState::NeedsBuild,
            BuildState::Scheduled,
            BuildState::Building,
            BuildState::BuildFailed,
            BuildState::NeedsPublish,
            BuildState::Publishing,
            BuildState::PublishFailed,
            BuildState::Successful,
            BuildState::AlreadyExists,
            BuildState::NothingDone,
        ] {
            let parsed: BuildState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn is_failed_covers_both_failure_states() {
        assert!(BuildState::BuildFailed.is_failed());
        assert!(BuildState::PublishFailed.is_failed());
        assert!(!BuildState::Successful.is_failed());
    }

    #[test]
    fn terminal_states_have_no_further_transitions() {
        assert!(BuildState::Successful.is_terminal());
        assert!(BuildState::AlreadyExists.is_terminal());
        assert!(!BuildState::Building.is_terminal());
    }
}
