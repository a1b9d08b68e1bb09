//! APT/publish queue: where a `source` build's publish request and a
//! successful `deb` build's follow-up are handed off.
//!
//! Delivery and completion semantics belong to the external APT backend;
//! the core only enqueues.

use async_trait::async_trait;

/// The subset of the APT backend's queue the core depends on.
#[async_trait]
pub trait AptQueue: Send + Sync {
    /// Enqueues a `src_publish` item for `build_id`.
    async fn src_publish(&self, build_id: i64);
}

/// Writes every publish request as a structured `tracing` event. Stands in
/// for the real APT backend, which is an external collaborator.
#[derive(Debug, Default)]
pub struct LoggingAptQueue;

#[async_trait]
impl AptQueue for LoggingAptQueue {
    async fn src_publish(&self, build_id: i64) {
        tracing::info!(build_id, "src_publish enqueued");
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every `src_publish` call for assertions.
    #[derive(Default)]
    pub struct RecordingAptQueue {
        pub published: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl AptQueue for RecordingAptQueue {
        async fn src_publish(&self, build_id: i64) {
            self.published.lock().unwrap().push(build_id);
        }
    }
}
