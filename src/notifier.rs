//! Notification and build-log collaborators.
//!
//! Out of scope per the purpose statement: actual webhook transport and
//! log-file persistence. What's in scope is the contract the state machine
//! calls into, plus a logging-backed default so the contract is exercised
//! and testable without standing up real delivery.

use async_trait::async_trait;

use crate::build::model::BuildSnapshot;

/// Subject of a notification. Only `Build` is produced by this core; the
/// variant set mirrors what the upstream event bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Build,
}

impl Subject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Build => "build",
        }
    }
}

/// Kind of change being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Added,
    Changed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Added => "added",
            Event::Changed => "changed",
        }
    }
}

/// Delivery is at-least-once; callers must not depend on a notification
/// arriving exactly once or in order relative to others.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: Subject, event: Event, payload: BuildSnapshot);

    /// Fires project-configured outbound hooks for a qualifying build.
    async fn run_hooks(&self, build_id: i64);
}

/// Writes every notification and hook fire as a structured `tracing` event.
/// Stands in for real webhook delivery, which is an external collaborator.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, subject: Subject, event: Event, payload: BuildSnapshot) {
        tracing::info!(
            subject = subject.as_str(),
            event = event.as_str(),
            build_id = payload.id,
            buildstate = payload.buildstate.as_str(),
            "build notification"
        );
    }

    async fn run_hooks(&self, build_id: i64) {
        tracing::debug!(build_id, "firing build hooks");
    }
}

/// The per-build plain-text log sink. `logtitle` emits a structural marker
/// line; a terminal `"Done"` title closes the log for a finished build.
pub trait BuildLog: Send + Sync {
    fn log(&self, build_id: i64, line: &str);
    fn log_title(&self, build_id: i64, title: &str);
}

/// Writes build log lines through `tracing` rather than a per-build file.
/// File-backed persistence of build logs is an external concern (the
/// on-disk buildout tree is owned by whatever serves them back to users).
#[derive(Debug, Default)]
pub struct TracingBuildLog;

impl BuildLog for TracingBuildLog {
    fn log(&self, build_id: i64, line: &str) {
        tracing::info!(build_id, "{}", line);
    }

    fn log_title(&self, build_id: i64, title: &str) {
        tracing::info!(build_id, title, "build log title");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub notifications: Mutex<Vec<(Subject, Event, BuildSnapshot)>>,
        pub hooks_fired: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, subject: Subject, event: Event, payload: BuildSnapshot) {
            self.notifications
                .lock()
                .unwrap()
                .push((subject, event, payload));
        }

        async fn run_hooks(&self, build_id: i64) {
            self.hooks_fired.lock().unwrap().push(build_id);
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingLog {
        pub lines: Mutex<Vec<(i64, String)>>,
        pub titles: Mutex<Vec<(i64, String)>>,
    }

    impl BuildLog for RecordingLog {
        fn log(&self, build_id: i64, line: &str) {
            self.lines.lock().unwrap().push((build_id, line.to_string()));
        }

        fn log_title(&self, build_id: i64, title: &str) {
            self.titles
                .lock()
                .unwrap()
                .push((build_id, title.to_string()));
        }
    }
}
