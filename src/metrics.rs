//! Prometheus metrics registration and export.
//!
//! Mirrors the OnceLock-registry pattern: a process-wide `Registry` plus one
//! `OnceLock` per metric, initialized once at startup, exported as plain
//! Prometheus text. HTTP transport for `/metrics` is out of scope; callers
//! embed `export_metrics()` in whatever surface they expose.

use prometheus::{CounterVec, Gauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global registry for all molior-core metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Depth of the in-process task queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of detached jobs currently running (clone, build, chroot, scheduler).
pub static ACTIVE_DETACHED_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Chroot builds currently in flight, gated by the concurrency governor.
pub static CHROOT_BUILD_COUNT: OnceLock<Gauge> = OnceLock::new();

/// Times a `buildenv` task was requeued because the chroot cap was reached.
pub static CHROOT_THROTTLED_TOTAL: OnceLock<Gauge> = OnceLock::new();

/// Builds observed entering each `buildstate`, labeled by state.
pub static BUILDS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initializes every metric and registers it with the global registry.
/// Call once at startup; a second call is a no-op rather than an error,
/// since `OnceLock::set` on an already-initialized lock is harmless here.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let queue_depth = Gauge::new("molior_queue_depth", "Depth of the task queue")?;
    registry.register(Box::new(queue_depth.clone()))?;

    let active_jobs = Gauge::new(
        "molior_active_detached_jobs",
        "Detached jobs currently running",
    )?;
    registry.register(Box::new(active_jobs.clone()))?;

    let chroot_count = Gauge::new(
        "molior_chroot_build_count",
        "Chroot builds currently in flight",
    )?;
    registry.register(Box::new(chroot_count.clone()))?;

    let chroot_throttled = Gauge::new(
        "molior_chroot_throttled_total",
        "buildenv tasks requeued due to the concurrency cap",
    )?;
    registry.register(Box::new(chroot_throttled.clone()))?;

    let builds_total = CounterVec::new(
        Opts::new("molior_builds_total", "Builds observed entering each state"),
        &["buildstate"],
    )?;
    registry.register(Box::new(builds_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_DETACHED_JOBS.set(active_jobs);
    let _ = CHROOT_BUILD_COUNT.set(chroot_count);
    let _ = CHROOT_THROTTLED_TOTAL.set(chroot_throttled);
    let _ = BUILDS_TOTAL.set(builds_total);
    Ok(())
}

/// Renders the registry in Prometheus text exposition format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# metrics not initialized, call init_metrics() first\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# error encoding metrics: {e}\n");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| format!("# error converting metrics to utf-8: {e}\n"))
}

/// Wires a `ChrootGovernor`'s `on_change` callback into the
/// `molior_chroot_build_count` gauge.
pub fn chroot_gauge_callback() -> impl Fn(i64) + Send + Sync + 'static {
    |value: i64| {
        if let Some(gauge) = CHROOT_BUILD_COUNT.get() {
            gauge.set(value as f64);
        }
    }
}

/// Records a Build entering `buildstate`, labeled for `molior_builds_total`.
pub fn record_build_state(buildstate: &str) {
    if let Some(counter) = BUILDS_TOTAL.get() {
        counter.with_label_values(&[buildstate]).inc();
    }
}

/// Sets the current depth of the in-process task queue.
pub fn set_queue_depth(depth: i64) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as f64);
    }
}

/// Adjusts the count of detached jobs currently running.
pub fn adjust_active_detached_jobs(delta: i64) {
    if let Some(gauge) = ACTIVE_DETACHED_JOBS.get() {
        gauge.add(delta as f64);
    }
}

/// Records a `buildenv` task requeue due to the chroot concurrency cap.
pub fn record_chroot_throttled() {
    if let Some(gauge) = CHROOT_THROTTLED_TOTAL.get() {
        gauge.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_before_init_is_informative_not_a_panic() {
        // Registry may already be initialized by another test in this binary;
        // either branch must produce non-empty, non-panicking output.
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn init_then_export_contains_no_error_marker() {
        let _ = init_metrics();
        let metrics = export_metrics();
        assert!(!metrics.starts_with("# error"));
    }
}
