//! The shared-service bundle built once at startup and handed to every
//! handler and detached job as an `Arc` clone, rather than reached for
//! through hidden globals.

use std::path::PathBuf;
use std::sync::Arc;

use crate::apt::AptQueue;
use crate::backend::BuildBackend;
use crate::build::BuildStore;
use crate::chroot::ChrootGovernor;
use crate::clock::Clock;
use crate::git::GitClient;
use crate::notifier::{BuildLog, Notifier};
use crate::repository::RepositoryStore;
use crate::task::TaskQueue;

/// Collaborators a handler needs, bundled so constructing one is a single
/// `Arc::clone` rather than threading seven parameters through every call.
pub struct Context {
    pub queue: TaskQueue,
    pub build_store: Arc<dyn BuildStore>,
    pub repo_store: Arc<dyn RepositoryStore>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub log: Arc<dyn BuildLog>,
    pub git: Arc<dyn GitClient>,
    pub backend: Arc<dyn BuildBackend>,
    pub apt_queue: Arc<dyn AptQueue>,
    pub chroot_governor: Arc<ChrootGovernor>,
    pub repositories_root: PathBuf,
    pub buildout_root: PathBuf,
}

#[allow(clippy::too_many_arguments)]
impl Context {
    pub fn new(
        queue: TaskQueue,
        build_store: Arc<dyn BuildStore>,
        repo_store: Arc<dyn RepositoryStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        log: Arc<dyn BuildLog>,
        git: Arc<dyn GitClient>,
        backend: Arc<dyn BuildBackend>,
        apt_queue: Arc<dyn AptQueue>,
        chroot_governor: Arc<ChrootGovernor>,
        repositories_root: PathBuf,
        buildout_root: PathBuf,
    ) -> Self {
        Self {
            queue,
            build_store,
            repo_store,
            clock,
            notifier,
            log,
            git,
            backend,
            apt_queue,
            chroot_governor,
            repositories_root,
            buildout_root,
        }
    }
}
