//! The task queue and the tagged `Task` variants it carries.
//!
//! The upstream shape is "a dict with exactly one recognized key"; here
//! that's a single enum matched exhaustively by the Worker.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::QueueError;

/// A unit of work consumed by the Worker. Distinct tagged variants replace
/// the upstream dynamic single-key-dict dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Clone {
        build_id: i64,
        repo_id: i64,
    },
    Build {
        build_id: i64,
        repo_id: i64,
        git_ref: Option<String>,
        ci_branch: Option<String>,
        targets: Option<Vec<String>>,
        force_ci: bool,
    },
    BuildLatest {
        repo_id: i64,
        build_id: i64,
    },
    Rebuild {
        build_id: i64,
    },
    Schedule,
    BuildEnv {
        chroot_id: i64,
        build_id: i64,
        dist: String,
        name: String,
        version: String,
        arch: String,
        components: Vec<String>,
        url: String,
        keys: Vec<String>,
    },
    MergeDuplicateRepo {
        keep_id: i64,
        dup_id: i64,
    },
    DeleteRepo {
        repo_id: i64,
    },
}

impl Task {
    /// The tag a log line or metric would group this task under.
    pub fn tag(&self) -> &'static str {
        match self {
            Task::Clone { .. } => "clone",
            Task::Build { .. } => "build",
            Task::BuildLatest { .. } => "buildlatest",
            Task::Rebuild { .. } => "rebuild",
            Task::Schedule => "schedule",
            Task::BuildEnv { .. } => "buildenv",
            Task::MergeDuplicateRepo { .. } => "merge_duplicate_repo",
            Task::DeleteRepo { .. } => "delete_repo",
        }
    }
}

/// Producer handle for the in-process FIFO. Cheaply `Clone`, so handlers
/// and detached jobs can requeue without borrowing the Worker.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Option<Task>>,
    depth: Arc<AtomicI64>,
}

/// Consumer handle. Owned exclusively by the Worker.
pub struct TaskReceiver {
    receiver: mpsc::UnboundedReceiver<Option<Task>>,
    depth: Arc<AtomicI64>,
}

/// Creates a connected queue/receiver pair.
pub fn channel() -> (TaskQueue, TaskReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicI64::new(0));
    (
        TaskQueue { sender, depth: depth.clone() },
        TaskReceiver { receiver, depth },
    )
}

impl TaskQueue {
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.sender
            .send(Some(task))
            .map_err(|_| QueueError::ShutDown)?;
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_queue_depth(depth);
        Ok(())
    }

    /// Sends the sentinel that requests graceful Worker shutdown after the
    /// current iteration.
    pub fn shutdown(&self) -> Result<(), QueueError> {
        self.sender.send(None).map_err(|_| QueueError::ShutDown)
    }
}

impl TaskReceiver {
    /// Blocks until an item is available. Returns `None` on the shutdown
    /// sentinel or once every `TaskQueue` handle has been dropped.
    pub async fn dequeue(&mut self) -> Option<Task> {
        match self.receiver.recv().await {
            Some(Some(task)) => {
                let depth = (self.depth.fetch_sub(1, Ordering::SeqCst) - 1).max(0);
                crate::metrics::set_queue_depth(depth);
                Some(task)
            }
            Some(None) | None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let (queue, mut rx) = channel();
        queue.enqueue(Task::Schedule).unwrap();
        queue
            .enqueue(Task::DeleteRepo { repo_id: 1 })
            .unwrap();

        assert_eq!(rx.dequeue().await, Some(Task::Schedule));
        assert_eq!(
            rx.dequeue().await,
            Some(Task::DeleteRepo { repo_id: 1 })
        );
    }

    #[tokio::test]
    async fn sentinel_signals_shutdown() {
        let (queue, mut rx) = channel();
        queue.enqueue(Task::Schedule).unwrap();
        queue.shutdown().unwrap();

        assert_eq!(rx.dequeue().await, Some(Task::Schedule));
        assert_eq!(rx.dequeue().await, None);
    }

    #[tokio::test]
    async fn dropping_every_sender_ends_the_queue() {
        let (queue, mut rx) = channel();
        drop(queue);
        assert_eq!(rx.dequeue().await, None);
    }

    #[test]
    fn tag_names_match_task_dispatch_keys() {
        assert_eq!(Task::Schedule.tag(), "schedule");
        assert_eq!(
            Task::Clone {
                build_id: 1,
                repo_id: 2
            }
            .tag(),
            "clone"
        );
    }
}
